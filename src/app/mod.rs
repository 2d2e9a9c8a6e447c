use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{never, Receiver, Select, TryRecvError};

use crate::auth::{AuthProvider, SessionEvent};
use crate::config::SortDirection;
use crate::model::UserId;
use crate::remote::RemoteStore;
use crate::search::{derive, DerivedView};
use crate::subscription::RemoteSubscription;

pub mod actions;
pub mod state;

pub use actions::{MutationError, MutationGateway, MutationIntent, MutationOutcome, PendingMutation};
pub use state::{CategoryFilter, LocalStore, StatusFilter, ViewError, ViewState};

/// Ties the session, the live query and the view together on one thread.
///
/// Snapshots and session changes are applied only when the owner calls
/// `pump` or `wait_for_change`; view setters re-derive immediately. Each
/// derivation therefore sees one consistent (snapshot, view state) pair.
pub struct NoteFeed {
    store: Arc<dyn RemoteStore>,
    session_events: Receiver<SessionEvent>,
    subscription: RemoteSubscription,
    local: LocalStore,
    view_state: ViewState,
    derived: DerivedView,
    gateway: MutationGateway,
    closed: bool,
}

impl NoteFeed {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        view_state: ViewState,
    ) -> Self {
        // Listen first so a sign-in racing this constructor is not lost.
        let session_events = auth.session_events();
        let user = auth.current_user_id();
        let subscription = RemoteSubscription::open(Arc::clone(&store), user.as_ref());
        let gateway = MutationGateway::new(Arc::clone(&store), auth);
        let local = LocalStore::new();
        let derived = derive(local.notes(), &view_state);
        Self {
            store,
            session_events,
            subscription,
            local,
            view_state,
            derived,
            gateway,
            closed: false,
        }
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    pub fn view(&self) -> &DerivedView {
        &self.derived
    }

    pub fn view_state(&self) -> &ViewState {
        &self.view_state
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// The user whose notes are being followed, if any.
    pub fn user(&self) -> Option<&UserId> {
        self.subscription.owner()
    }

    pub fn is_live(&self) -> bool {
        self.subscription.is_open()
    }

    /// Applies queued session changes and the latest queued snapshot.
    /// Returns `true` when the view was re-derived.
    pub fn pump(&mut self) -> bool {
        if self.closed {
            return false;
        }
        loop {
            match self.session_events.try_recv() {
                Ok(event) => self.apply_session_event(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("session source went away");
                    self.session_events = never();
                    break;
                }
            }
        }
        if let Some(notes) = self.subscription.try_next() {
            self.local.replace(notes);
        }
        if self.local.take_change().is_none() {
            return false;
        }
        self.rederive();
        true
    }

    /// Blocks until a session change or a push arrives, or `timeout`
    /// passes, then pumps.
    pub fn wait_for_change(&mut self, timeout: Duration) -> bool {
        if self.pump() {
            return true;
        }
        if self.closed {
            return false;
        }
        let idle = never();
        let ready = {
            let events = self.subscription.receiver().unwrap_or(&idle);
            let mut select = Select::new();
            select.recv(&self.session_events);
            select.recv(events);
            select.ready_timeout(timeout).is_ok()
        };
        ready && self.pump()
    }

    pub fn set_search_text(&mut self, text: impl Into<String>) {
        self.view_state.set_search_text(text);
        self.rederive();
    }

    /// Accepts `All` or a category present in the current view.
    pub fn select_category(&mut self, filter: CategoryFilter) -> Result<(), ViewError> {
        self.view_state
            .select_category(filter, &self.derived.categories)?;
        self.rederive();
        Ok(())
    }

    pub fn set_status_filter(&mut self, status: StatusFilter) {
        self.view_state.set_status_filter(status);
        self.rederive();
    }

    pub fn set_sort_direction(&mut self, direction: SortDirection) {
        self.view_state.set_sort_direction(direction);
        self.rederive();
    }

    pub fn toggle_sort(&mut self) {
        self.view_state.toggle_sort();
        self.rederive();
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.subscription.close();
        self.session_events = never();
        self.closed = true;
    }

    fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SignedIn(user) => {
                if self.subscription.is_open() && self.subscription.owner() == Some(&user) {
                    return;
                }
                tracing::debug!(user = %user, "following new session");
                self.subscription = RemoteSubscription::open(Arc::clone(&self.store), Some(&user));
                self.local.replace(Vec::new());
            }
            SessionEvent::SignedOut => {
                tracing::debug!("session ended; clearing notes");
                self.subscription = RemoteSubscription::open(Arc::clone(&self.store), None);
                self.local.replace(Vec::new());
            }
        }
    }

    fn rederive(&mut self) {
        self.derived = derive(self.local.notes(), &self.view_state);
        tracing::trace!(
            revision = self.local.revision(),
            visible = self.derived.notes.len(),
            "view derived"
        );
    }
}

impl Drop for NoteFeed {
    fn drop(&mut self) {
        self.close();
    }
}
