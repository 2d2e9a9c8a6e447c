use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::Connection;

use super::{fetch_owner_notes_on, open_connection};
use crate::config::StorageOptions;
use crate::model::{NoteRecord, UserId};
use crate::remote::{LiveQuery, QueryHolder, StoreEvent, SubscriptionError, WatchId};

struct Watcher {
    id: WatchId,
    owner: UserId,
    holder: QueryHolder,
    tx: Sender<StoreEvent>,
    // Second handle on the one-slot queue, used to drop an unread snapshot.
    stale: Receiver<StoreEvent>,
    delivered: Vec<NoteRecord>,
}

impl Watcher {
    /// Queues `event`, replacing whatever the consumer has not read yet.
    fn replace_pending(&self, mut event: StoreEvent) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.stale.try_recv();
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

struct HubInner {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
    watchers: Mutex<Vec<Watcher>>,
    next_id: AtomicU64,
    poller_running: Mutex<bool>,
}

/// Registry of live queries plus the poller that notices commits.
///
/// The poller holds its own connection and watches `PRAGMA data_version`,
/// which moves whenever any other connection commits. One change seen by
/// the poller refetches each watched owner and queues a snapshot only for
/// watchers whose set actually changed. Each watcher holds at most one
/// unread snapshot, so a consumer that falls behind only ever sees the
/// latest set.
#[derive(Clone)]
pub(crate) struct LiveQueryHub {
    inner: Arc<HubInner>,
}

impl LiveQueryHub {
    pub(crate) fn new(db_path: Arc<PathBuf>, options: Arc<StorageOptions>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                db_path,
                options,
                watchers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                poller_running: Mutex::new(false),
            }),
        }
    }

    pub(crate) fn register(&self, owner: &UserId) -> Result<LiveQuery, SubscriptionError> {
        let unavailable = |err: anyhow::Error| SubscriptionError::Unavailable {
            owner: owner.clone(),
            reason: format!("{err:#}"),
        };
        self.ensure_poller().map_err(unavailable)?;
        let conn = open_connection(&self.inner.db_path, &self.inner.options).map_err(unavailable)?;

        // Held across the initial fetch so a concurrent publish cannot slip
        // a newer set in ahead of this one.
        let mut watchers = self.inner.watchers.lock();
        let notes = fetch_owner_notes_on(&conn, owner).map_err(unavailable)?;
        let (tx, rx) = bounded(1);
        let id = WatchId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(watch = id.0, owner = %owner, notes = notes.len(), "live query opened");
        let query = LiveQuery::new(id, rx.clone());
        let watcher = Watcher {
            id,
            owner: owner.clone(),
            holder: query.holder(),
            tx,
            stale: rx,
            delivered: notes.clone(),
        };
        watcher.replace_pending(StoreEvent::Snapshot(notes));
        watchers.push(watcher);
        Ok(query)
    }

    pub(crate) fn unregister(&self, id: WatchId) {
        let mut watchers = self.inner.watchers.lock();
        let before = watchers.len();
        watchers.retain(|watcher| watcher.id != id);
        if watchers.len() != before {
            tracing::debug!(watch = id.0, "live query closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn queued_for(&self, id: WatchId) -> Option<usize> {
        self.inner
            .watchers
            .lock()
            .iter()
            .find(|watcher| watcher.id == id)
            .map(|watcher| watcher.tx.len())
    }

    fn ensure_poller(&self) -> Result<()> {
        let mut running = self.inner.poller_running.lock();
        if *running {
            return Ok(());
        }
        let conn = open_connection(&self.inner.db_path, &self.inner.options)
            .context("opening live query connection")?;
        let baseline = data_version(&conn)?;
        let interval = self.inner.options.live_poll_interval();
        let hub = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("live-query-poller".into())
            .spawn(move || run_poller(hub, conn, baseline, interval))
            .context("spawning live query poller")?;
        *running = true;
        Ok(())
    }
}

impl HubInner {
    fn publish(&self, conn: &Connection) {
        let mut watchers = self.watchers.lock();
        if watchers.is_empty() {
            return;
        }
        let mut results: IndexMap<UserId, Result<Vec<NoteRecord>, String>> = IndexMap::new();
        for watcher in watchers.iter() {
            if !results.contains_key(&watcher.owner) {
                let fetched = fetch_owner_notes_on(conn, &watcher.owner)
                    .map_err(|err| format!("{err:#}"));
                results.insert(watcher.owner.clone(), fetched);
            }
        }
        watchers.retain_mut(|watcher| {
            if !watcher.holder.is_held() {
                tracing::debug!(watch = watcher.id.0, "pruning abandoned live query");
                return false;
            }
            match &results[&watcher.owner] {
                Ok(notes) if *notes == watcher.delivered => true,
                Ok(notes) => {
                    watcher.delivered = notes.clone();
                    watcher.replace_pending(StoreEvent::Snapshot(notes.clone()));
                    true
                }
                Err(reason) => {
                    tracing::warn!(watch = watcher.id.0, owner = %watcher.owner, %reason, "live query dropped");
                    watcher.replace_pending(StoreEvent::Failed(reason.clone()));
                    false
                }
            }
        });
    }
}

fn run_poller(hub: Weak<HubInner>, conn: Connection, mut last_version: i64, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(inner) = hub.upgrade() else {
            break;
        };
        let version = match data_version(&conn) {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!(?err, "reading data_version failed");
                continue;
            }
        };
        if version == last_version {
            continue;
        }
        last_version = version;
        inner.publish(&conn);
    }
    tracing::debug!("live query poller stopped");
}

fn data_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA data_version", [], |row| row.get(0))
        .context("reading data_version")
}
