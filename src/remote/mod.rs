//! Boundary to the remote document store.
//!
//! The store owns durable note documents and pushes full result sets for
//! live queries. Everything above this trait treats it as a black box that
//! eventually reflects successful writes in some later push.

use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::model::{NoteDraft, NoteId, NoteRecord, UserId};

#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// One push from a live query.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The complete current set of matching documents, newest first.
    Snapshot(Vec<NoteRecord>),
    /// The query was dropped by the store; no further events follow.
    Failed(String),
}

pub struct LiveQuery {
    pub id: WatchId,
    pub events: Receiver<StoreEvent>,
    held: Arc<()>,
}

impl LiveQuery {
    pub fn new(id: WatchId, events: Receiver<StoreEvent>) -> Self {
        Self {
            id,
            events,
            held: Arc::new(()),
        }
    }

    /// Lets the store notice a query whose consumer went away without
    /// calling `unwatch`.
    pub fn holder(&self) -> QueryHolder {
        QueryHolder(Arc::downgrade(&self.held))
    }
}

#[derive(Debug, Clone)]
pub struct QueryHolder(Weak<()>);

impl QueryHolder {
    pub fn is_held(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotePatch {
    Fields(NoteDraft),
    Completed(bool),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("note {0} does not exist")]
    NotFound(NoteId),

    #[error("note {0} belongs to another user")]
    PermissionDenied(NoteId),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("live query for {owner} could not be established: {reason}")]
    Unavailable { owner: UserId, reason: String },
}

pub trait RemoteStore: Send + Sync {
    /// Opens a live query for every note owned by `owner`, ordered by
    /// creation time descending. The current set is pushed right away.
    fn watch_owner(&self, owner: &UserId) -> Result<LiveQuery, SubscriptionError>;

    /// Deregisters a live query. Unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// Inserts a new document; the store assigns the id and creation time.
    fn insert(&self, owner: &UserId, draft: &NoteDraft) -> Result<NoteId, StoreError>;

    fn patch(&self, owner: &UserId, id: &NoteId, patch: &NotePatch) -> Result<(), StoreError>;

    fn delete(&self, owner: &UserId, id: &NoteId) -> Result<(), StoreError>;
}
