//! Explicit open/close wrapper around one live query.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::model::{NoteRecord, UserId};
use crate::remote::{LiveQuery, RemoteStore, StoreEvent};

/// A live query for one user's notes, yielding coalesced full snapshots.
///
/// Opening never fails: with no user, or when the store refuses the query,
/// the subscription is simply closed and yields nothing.
pub struct RemoteSubscription {
    store: Arc<dyn RemoteStore>,
    owner: Option<UserId>,
    live: Option<LiveQuery>,
}

impl RemoteSubscription {
    pub fn open(store: Arc<dyn RemoteStore>, user: Option<&UserId>) -> Self {
        let live = match user {
            None => {
                tracing::debug!("no signed-in user; subscription left closed");
                None
            }
            Some(owner) => match store.watch_owner(owner) {
                Ok(live) => {
                    tracing::debug!(watch = live.id.0, owner = %owner, "subscription opened");
                    Some(live)
                }
                Err(err) => {
                    tracing::warn!(%err, "live query unavailable; treating as closed");
                    None
                }
            },
        };
        Self {
            store,
            owner: user.cloned(),
            live,
        }
    }

    pub fn owner(&self) -> Option<&UserId> {
        self.owner.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// The raw event channel, for callers multiplexing several sources.
    pub fn receiver(&self) -> Option<&Receiver<StoreEvent>> {
        self.live.as_ref().map(|live| &live.events)
    }

    /// Latest full snapshot queued since the last call, if any.
    pub fn try_next(&mut self) -> Option<Vec<NoteRecord>> {
        self.coalesce(None)
    }

    /// Waits up to `timeout` for a push, then behaves like `try_next`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Vec<NoteRecord>> {
        let live = self.live.as_ref()?;
        match live.events.recv_timeout(timeout) {
            Ok(event) => self.coalesce(Some(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.close();
                None
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(live) = self.live.take() {
            self.store.unwatch(live.id);
            tracing::debug!(watch = live.id.0, "subscription closed");
        }
    }

    fn coalesce(&mut self, first: Option<StoreEvent>) -> Option<Vec<NoteRecord>> {
        let live = self.live.as_ref()?;
        let mut latest = None;
        let mut ended = false;
        let mut pending = first;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match live.events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        ended = true;
                        break;
                    }
                },
            };
            match event {
                StoreEvent::Snapshot(notes) => latest = Some(notes),
                StoreEvent::Failed(reason) => {
                    tracing::warn!(%reason, "live query dropped by store");
                    latest = Some(Vec::new());
                    ended = true;
                    break;
                }
            }
        }
        if ended {
            self.close();
        }
        if let Some(notes) = &latest {
            tracing::debug!(notes = notes.len(), "snapshot received");
        }
        latest
    }
}

impl Iterator for RemoteSubscription {
    type Item = Vec<NoteRecord>;

    /// Blocks for the next push. Ends once the subscription is closed.
    fn next(&mut self) -> Option<Self::Item> {
        let live = self.live.as_ref()?;
        match live.events.recv() {
            Ok(event) => self.coalesce(Some(event)),
            Err(_) => {
                self.close();
                None
            }
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
