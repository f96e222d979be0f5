//! One tab's session: the five components wired together.
//!
//! `TabSession` is what the rest of the client talks to. It owns the
//! credential store for this tab, decides ownership at startup, routes every
//! protected request through the refresh coordinator and reacts to sibling
//! tabs through the notifier.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{
    CredentialStore, CrossTabNotifier, EndReason, OwnershipArbiter, OwnershipState,
    RefreshCoordinator, SessionEnded, SessionError, TabId, TabIdentity, WindowSignal,
};
use crate::api::{ApiError, ApiRequest, ApiResponse, AuthBackend, Transport};
use crate::storage::{SharedStorage, StorageEvent};

const ME_PATH: &str = "/users/me/";

pub struct TabSession {
    tab_id: TabId,
    store: Arc<CredentialStore>,
    arbiter: Arc<OwnershipArbiter>,
    coordinator: RefreshCoordinator,
    notifier: Arc<CrossTabNotifier>,
    backend: Arc<dyn AuthBackend>,
    events: Mutex<Option<broadcast::Receiver<StorageEvent>>>,
}

impl TabSession {
    /// Open this tab's session over `shared` (visible to every tab of the
    /// client) and `tab_local` (visible to this tab only), then run startup
    /// arbitration.
    pub fn open(
        shared: Arc<dyn SharedStorage>,
        tab_local: Arc<dyn SharedStorage>,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let tab_id = TabIdentity::new(tab_local).current()?;
        let store = Arc::new(CredentialStore::new(shared));

        // Subscribe before startup so nothing a sibling writes meanwhile is lost
        let events = store.subscribe();

        let arbiter = Arc::new(OwnershipArbiter::new(Arc::clone(&store), tab_id.clone()));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&arbiter),
            Arc::clone(&backend),
            transport,
        );
        let notifier = Arc::new(CrossTabNotifier::new(store.context()));

        {
            let store = Arc::clone(&store);
            let arbiter = Arc::clone(&arbiter);
            notifier.on_credential_or_owner_changed(move |_change| {
                if let Err(e) = store.refresh_status() {
                    warn!(error = %e, "Failed to re-read session status");
                }
                if let Err(e) = arbiter.reconcile() {
                    warn!(error = %e, "Failed to reconcile session ownership");
                }
            });
        }
        {
            let arbiter = Arc::clone(&arbiter);
            notifier.on_window_closing(move |_signal| {
                if let Err(e) = arbiter.logout(EndReason::WindowClosing) {
                    warn!(error = %e, "Failed to end session on window close");
                }
            });
        }

        let state = arbiter.startup()?;
        info!(tab_id = %tab_id, ?state, "Tab session opened");

        Ok(Self {
            tab_id,
            store,
            arbiter,
            coordinator,
            notifier,
            backend,
            events: Mutex::new(Some(events)),
        })
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn state(&self) -> OwnershipState {
        self.arbiter.state()
    }

    /// Like `state`, but reports `OwnedByOther` when a sibling holds the session.
    pub fn view(&self) -> Result<OwnershipState, SessionError> {
        self.arbiter.view()
    }

    pub fn is_authenticated(&self) -> Result<bool, SessionError> {
        Ok(self.store.is_authenticated()?)
    }

    pub fn access_token(&self) -> Result<Option<String>, SessionError> {
        Ok(self.store.access_token()?)
    }

    pub fn status(&self) -> watch::Receiver<bool> {
        self.store.status()
    }

    pub fn session_ended(&self) -> broadcast::Receiver<SessionEnded> {
        self.arbiter.subscribe()
    }

    /// Log in and take the session for this tab. Any other tab holding the
    /// session demotes itself when it sees the new owner marker.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SessionError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(SessionError::InvalidCredentials);
        }

        let pair = self
            .backend
            .login(username.trim(), password)
            .await
            .map_err(SessionError::from_login)?;
        // A pair with an empty half reads back as absent; never claim on it
        if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
            return Err(ApiError::InvalidResponse("Login returned an empty token".to_string()).into());
        }

        self.store.save(&pair)?;
        self.arbiter.claim()?;
        info!(tab_id = %self.tab_id, "Logged in");
        Ok(())
    }

    pub fn logout(&self) -> Result<(), SessionError> {
        self.arbiter.logout(EndReason::UserLogout)
    }

    /// The only sanctioned way to call a protected endpoint.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.coordinator.send(request).await
    }

    /// The account this session belongs to.
    pub async fn me(&self) -> Result<Value, SessionError> {
        let response = self.send(ApiRequest::get(ME_PATH)).await?;
        Ok(response.error_for_status()?.json()?)
    }

    pub fn window_closing(&self, signal: WindowSignal) {
        self.notifier.window_closing(signal);
    }

    /// Feed one storage change in by hand. Returns whether it concerned the session.
    pub fn handle_storage_event(&self, event: &StorageEvent) -> bool {
        self.notifier.dispatch(event)
    }

    /// Handle every storage change already queued, without waiting.
    /// Does nothing once `run_notifications` has taken the queue.
    pub fn process_pending(&self) -> usize {
        match self.lock_events().as_mut() {
            Some(events) => self.notifier.drain(events),
            None => 0,
        }
    }

    /// Move the storage change queue onto a background task.
    /// Returns `None` if it was already moved.
    pub fn run_notifications(&self) -> Option<JoinHandle<()>> {
        let events = self.lock_events().take()?;
        Some(tokio::spawn(Arc::clone(&self.notifier).run(events)))
    }

    fn lock_events(&self) -> MutexGuard<'_, Option<broadcast::Receiver<StorageEvent>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Tests
// ============================================================================
