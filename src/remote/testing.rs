use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::anyhow;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{LiveQuery, NotePatch, RemoteStore, StoreError, StoreEvent, SubscriptionError, WatchId};
use crate::model::{NoteDraft, NoteId, NoteRecord, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Watch(UserId),
    Unwatch(WatchId),
    Insert(UserId),
    Patch(NoteId),
    Delete(NoteId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Backend,
    PermissionDenied,
}

/// In-memory store that pushes a snapshot to matching watchers on every
/// write and records every call it receives.
#[derive(Default)]
pub struct MockStore {
    docs: Mutex<Vec<NoteRecord>>,
    watchers: Mutex<Vec<(WatchId, UserId, Sender<StoreEvent>)>>,
    calls: Mutex<Vec<Call>>,
    next_watch: AtomicU64,
    refuse_watch: AtomicBool,
    defer_timestamps: AtomicBool,
    fail_writes: Mutex<Option<Failure>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Insert(_) | Call::Patch(_) | Call::Delete(_)))
            .count()
    }

    pub fn refuse_watch(&self, refuse: bool) {
        self.refuse_watch.store(refuse, Ordering::SeqCst);
    }

    pub fn defer_timestamps(&self, defer: bool) {
        self.defer_timestamps.store(defer, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, failure: Option<Failure>) {
        *self.fail_writes.lock() = failure;
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn docs(&self) -> Vec<NoteRecord> {
        self.docs.lock().clone()
    }

    /// Drops every live query with a failure event.
    pub fn fail_live_queries(&self, reason: &str) {
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for (_, _, tx) in watchers {
            let _ = tx.send(StoreEvent::Failed(reason.to_owned()));
        }
    }

    fn snapshot_for(&self, owner: &UserId) -> Vec<NoteRecord> {
        let mut notes: Vec<NoteRecord> = self
            .docs
            .lock()
            .iter()
            .filter(|note| &note.owner_id == owner)
            .cloned()
            .collect();
        notes.sort_by(|a, b| match (a.created_at, b.created_at) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => b.cmp(&a),
        });
        notes
    }

    fn publish(&self, owner: &UserId) {
        let snapshot = self.snapshot_for(owner);
        self.watchers.lock().retain(|(_, watched, tx)| {
            watched != owner || tx.send(StoreEvent::Snapshot(snapshot.clone())).is_ok()
        });
    }

    fn check_failure(&self, id: &NoteId) -> Result<(), StoreError> {
        match *self.fail_writes.lock() {
            Some(Failure::Backend) => Err(StoreError::Backend(anyhow!("quota exceeded"))),
            Some(Failure::PermissionDenied) => Err(StoreError::PermissionDenied(id.clone())),
            None => Ok(()),
        }
    }

    fn owned_index(&self, owner: &UserId, id: &NoteId) -> Result<usize, StoreError> {
        let docs = self.docs.lock();
        let index = docs
            .iter()
            .position(|note| &note.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if &docs[index].owner_id != owner {
            return Err(StoreError::PermissionDenied(id.clone()));
        }
        Ok(index)
    }
}

impl RemoteStore for MockStore {
    fn watch_owner(&self, owner: &UserId) -> Result<LiveQuery, SubscriptionError> {
        self.calls.lock().push(Call::Watch(owner.clone()));
        if self.refuse_watch.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Unavailable {
                owner: owner.clone(),
                reason: "auth not ready".into(),
            });
        }
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = unbounded();
        let _ = tx.send(StoreEvent::Snapshot(self.snapshot_for(owner)));
        self.watchers.lock().push((id, owner.clone(), tx));
        Ok(LiveQuery::new(id, rx))
    }

    fn unwatch(&self, id: WatchId) {
        self.calls.lock().push(Call::Unwatch(id));
        self.watchers.lock().retain(|(watch, _, _)| *watch != id);
    }

    fn insert(&self, owner: &UserId, draft: &NoteDraft) -> Result<NoteId, StoreError> {
        self.calls.lock().push(Call::Insert(owner.clone()));
        let id = NoteId::generate();
        self.check_failure(&id)?;
        let created_at = if self.defer_timestamps.load(Ordering::SeqCst) {
            None
        } else {
            Some(OffsetDateTime::now_utc())
        };
        self.docs.lock().push(NoteRecord {
            id: id.clone(),
            owner_id: owner.clone(),
            title: draft.title.clone(),
            content: draft.content.clone(),
            category: draft.category.clone(),
            color: draft.color,
            deadline: draft.deadline,
            completed: false,
            created_at,
        });
        self.publish(owner);
        Ok(id)
    }

    fn patch(&self, owner: &UserId, id: &NoteId, patch: &NotePatch) -> Result<(), StoreError> {
        self.calls.lock().push(Call::Patch(id.clone()));
        self.check_failure(id)?;
        let index = self.owned_index(owner, id)?;
        {
            let mut docs = self.docs.lock();
            let note = &mut docs[index];
            match patch {
                NotePatch::Fields(draft) => {
                    note.title = draft.title.clone();
                    note.content = draft.content.clone();
                    note.category = draft.category.clone();
                    note.color = draft.color;
                    note.deadline = draft.deadline;
                }
                NotePatch::Completed(completed) => note.completed = *completed,
            }
        }
        self.publish(owner);
        Ok(())
    }

    fn delete(&self, owner: &UserId, id: &NoteId) -> Result<(), StoreError> {
        self.calls.lock().push(Call::Delete(id.clone()));
        self.check_failure(id)?;
        let index = self.owned_index(owner, id)?;
        self.docs.lock().remove(index);
        self.publish(owner);
        Ok(())
    }
}
