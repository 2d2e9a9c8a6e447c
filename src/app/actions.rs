use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use strum::IntoStaticStr;
use thiserror::Error;

use crate::auth::AuthProvider;
use crate::model::{NoteDraft, NoteId, UserId, ValidationError};
use crate::remote::{NotePatch, RemoteStore, StoreError};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("sign in before changing notes")]
    AuthRequired,

    #[error("remote write failed: {0}")]
    RemoteWrite(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum MutationIntent {
    Create(NoteDraft),
    Update { id: NoteId, draft: NoteDraft },
    MarkCompleted(NoteId),
    Delete(NoteId),
}

impl MutationIntent {
    fn validated(self) -> Result<Self, ValidationError> {
        Ok(match self {
            MutationIntent::Create(draft) => MutationIntent::Create(draft.normalized()?),
            MutationIntent::Update { id, draft } => MutationIntent::Update {
                id,
                draft: draft.normalized()?,
            },
            other => other,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Created(NoteId),
    Updated(NoteId),
    Completed(NoteId),
    Deleted(NoteId),
}

impl MutationOutcome {
    pub fn note_id(&self) -> &NoteId {
        match self {
            MutationOutcome::Created(id)
            | MutationOutcome::Updated(id)
            | MutationOutcome::Completed(id)
            | MutationOutcome::Deleted(id) => id,
        }
    }
}

/// A write in flight. Its outcome is delivered once.
pub struct PendingMutation {
    kind: &'static str,
    rx: Receiver<Result<MutationOutcome, StoreError>>,
}

impl PendingMutation {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn wait(self) -> Result<MutationOutcome, MutationError> {
        match self.rx.recv() {
            Ok(result) => result.map_err(MutationError::from),
            Err(_) => Err(worker_vanished()),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<MutationOutcome, MutationError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result.map_err(MutationError::from)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_vanished())),
        }
    }

    pub fn try_outcome(&self) -> Option<Result<MutationOutcome, MutationError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result.map_err(MutationError::from)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(worker_vanished())),
        }
    }
}

fn worker_vanished() -> MutationError {
    MutationError::RemoteWrite(StoreError::Backend(anyhow!(
        "mutation worker exited without reporting"
    )))
}

/// Validates write intents and hands them to the remote store.
///
/// Never touches the local snapshot: a successful write shows up through a
/// later push of the live query.
#[derive(Clone)]
pub struct MutationGateway {
    store: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
}

impl MutationGateway {
    pub fn new(store: Arc<dyn RemoteStore>, auth: Arc<dyn AuthProvider>) -> Self {
        Self { store, auth }
    }

    pub fn submit(&self, intent: MutationIntent) -> Result<PendingMutation, MutationError> {
        let intent = intent.validated()?;
        let owner = self
            .auth
            .current_user_id()
            .ok_or(MutationError::AuthRequired)?;
        let kind: &'static str = (&intent).into();
        let (tx, rx) = bounded(1);
        let store = Arc::clone(&self.store);
        thread::Builder::new()
            .name(format!("note-{kind}"))
            .spawn(move || {
                let result = apply(store.as_ref(), &owner, intent);
                match &result {
                    Ok(outcome) => tracing::debug!(kind, note = %outcome.note_id(), "write committed"),
                    Err(err) => tracing::debug!(kind, %err, "write rejected"),
                }
                let _ = tx.send(result);
            })
            .map_err(|err| {
                StoreError::Backend(anyhow::Error::new(err).context("spawning mutation worker"))
            })?;
        tracing::debug!(kind, "mutation submitted");
        Ok(PendingMutation { kind, rx })
    }

    pub fn create(&self, draft: NoteDraft) -> Result<NoteId, MutationError> {
        self.submit(MutationIntent::Create(draft))?
            .wait()
            .map(|outcome| outcome.note_id().clone())
    }

    pub fn update(&self, id: &NoteId, draft: NoteDraft) -> Result<(), MutationError> {
        self.submit(MutationIntent::Update {
            id: id.clone(),
            draft,
        })?
        .wait()
        .map(drop)
    }

    pub fn mark_completed(&self, id: &NoteId) -> Result<(), MutationError> {
        self.submit(MutationIntent::MarkCompleted(id.clone()))?
            .wait()
            .map(drop)
    }

    pub fn delete(&self, id: &NoteId) -> Result<(), MutationError> {
        self.submit(MutationIntent::Delete(id.clone()))?
            .wait()
            .map(drop)
    }
}

fn apply(
    store: &dyn RemoteStore,
    owner: &UserId,
    intent: MutationIntent,
) -> Result<MutationOutcome, StoreError> {
    match intent {
        MutationIntent::Create(draft) => store.insert(owner, &draft).map(MutationOutcome::Created),
        MutationIntent::Update { id, draft } => {
            store.patch(owner, &id, &NotePatch::Fields(draft))?;
            Ok(MutationOutcome::Updated(id))
        }
        MutationIntent::MarkCompleted(id) => {
            store.patch(owner, &id, &NotePatch::Completed(true))?;
            Ok(MutationOutcome::Completed(id))
        }
        MutationIntent::Delete(id) => {
            store.delete(owner, &id)?;
            Ok(MutationOutcome::Deleted(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionHub;
    use crate::model::NoteColor;
    use crate::remote::testing::{Failure, MockStore};
    use assert_matches::assert_matches;

    fn gateway(user: Option<&str>) -> (Arc<MockStore>, Arc<SessionHub>, MutationGateway) {
        let store = Arc::new(MockStore::new());
        let auth = Arc::new(SessionHub::new(user.map(UserId::new)));
        let gateway = MutationGateway::new(store.clone(), auth.clone());
        (store, auth, gateway)
    }

    #[test]
    fn empty_title_is_rejected_before_any_remote_call() {
        let (store, _auth, gateway) = gateway(Some("u1"));
        assert_matches!(
            gateway.create(NoteDraft::new("", "x")),
            Err(MutationError::Validation(_))
        );
        assert_matches!(
            gateway.update(&NoteId::new("n1"), NoteDraft::new("t", "  ")),
            Err(MutationError::Validation(_))
        );
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn validation_is_reported_before_missing_session() {
        let (store, _auth, gateway) = gateway(None);
        assert_matches!(
            gateway.create(NoteDraft::new(" ", "x")),
            Err(MutationError::Validation(_))
        );
        assert_matches!(
            gateway.create(NoteDraft::new("t", "x")),
            Err(MutationError::AuthRequired)
        );
        assert_matches!(
            gateway.delete(&NoteId::new("n1")),
            Err(MutationError::AuthRequired)
        );
        assert!(store.calls().is_empty());
    }

    #[test]
    fn create_assigns_session_owner_and_trims_category() -> anyhow::Result<()> {
        let (store, _auth, gateway) = gateway(Some("u1"));
        let draft = NoteDraft::new("Groceries", "milk, eggs")
            .with_category("  Errands ")
            .with_color(NoteColor::Mint);
        let id = gateway.create(draft)?;

        let docs = store.docs();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);
        assert_eq!(docs[0].owner_id, UserId::new("u1"));
        assert_eq!(docs[0].category, "Errands");
        assert_eq!(docs[0].color, NoteColor::Mint);
        assert!(!docs[0].completed);
        Ok(())
    }

    #[test]
    fn mark_completed_only_flips_the_flag() -> anyhow::Result<()> {
        let (store, _auth, gateway) = gateway(Some("u1"));
        let id = gateway.create(NoteDraft::new("Title", "Body").with_category("Work"))?;
        gateway.mark_completed(&id)?;

        let note = store.docs().into_iter().next().expect("note stored");
        assert!(note.completed);
        assert_eq!(note.title, "Title");
        assert_eq!(note.category, "Work");
        Ok(())
    }

    #[test]
    fn remote_failures_surface_as_remote_write() -> anyhow::Result<()> {
        let (store, auth, gateway) = gateway(Some("u1"));
        let id = gateway.create(NoteDraft::new("Title", "Body"))?;

        auth.sign_in(UserId::new("intruder"));
        assert_matches!(
            gateway.update(&id, NoteDraft::new("Mine", "now")),
            Err(MutationError::RemoteWrite(StoreError::PermissionDenied(_)))
        );
        assert_matches!(
            gateway.delete(&NoteId::new("missing")),
            Err(MutationError::RemoteWrite(StoreError::NotFound(_)))
        );

        store.fail_writes(Some(Failure::Backend));
        assert_matches!(
            gateway.create(NoteDraft::new("Title", "Body")),
            Err(MutationError::RemoteWrite(StoreError::Backend(_)))
        );
        assert_eq!(store.docs().len(), 1);
        Ok(())
    }

    #[test]
    fn rejected_write_leaves_the_note_untouched() -> anyhow::Result<()> {
        let (store, _auth, gateway) = gateway(Some("u1"));
        let id = gateway.create(NoteDraft::new("Title", "Body"))?;

        store.fail_writes(Some(Failure::PermissionDenied));
        assert_matches!(
            gateway.mark_completed(&id),
            Err(MutationError::RemoteWrite(StoreError::PermissionDenied(denied))) if denied == id
        );
        let note = store.docs().into_iter().next().expect("note stored");
        assert!(!note.completed);
        Ok(())
    }

    #[test]
    fn submit_returns_pending_handle() -> anyhow::Result<()> {
        let (_store, _auth, gateway) = gateway(Some("u1"));
        let pending = gateway.submit(MutationIntent::Create(NoteDraft::new("a", "b")))?;
        assert_eq!(pending.kind(), "create");
        let outcome = pending
            .wait_timeout(Duration::from_secs(5))
            .expect("worker finished")?;
        assert_matches!(outcome, MutationOutcome::Created(_));
        Ok(())
    }
}
