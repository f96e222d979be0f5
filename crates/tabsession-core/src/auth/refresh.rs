//! Authenticated request wrapper with single-flight token refresh.
//!
//! Every request is stamped with the current access token. A 401 on a stamped
//! request triggers at most one refresh for the whole failure chain, shared by
//! every request that failed with the same pair, and one replay with the new
//! token. A rejected refresh or a rejected replay ends the session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use super::{CredentialStore, EndReason, OwnershipArbiter, SessionError};
use crate::api::{ApiError, ApiRequest, ApiResponse, AuthBackend, Transport};

#[derive(Debug, Clone)]
enum RefreshFailure {
    /// The refresh endpoint answered and said no.
    Rejected(ApiError),
    /// No answer at all; credentials stay as they are.
    Network(String),
}

impl From<ApiError> for RefreshFailure {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(msg) => RefreshFailure::Network(msg),
            other => RefreshFailure::Rejected(other),
        }
    }
}

type RefreshHandle = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

struct PendingRefresh {
    refresh_token: String,
    handle: RefreshHandle,
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    arbiter: Arc<OwnershipArbiter>,
    backend: Arc<dyn AuthBackend>,
    transport: Arc<dyn Transport>,
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        arbiter: Arc<OwnershipArbiter>,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            arbiter,
            backend,
            transport,
            pending: Mutex::new(None),
        }
    }

    /// Stamp `request` with the current access token, if this tab has one.
    pub fn authorize(&self, request: ApiRequest) -> Result<ApiRequest, SessionError> {
        Ok(match self.store.access_token()? {
            Some(token) => request.with_bearer(token),
            None => request,
        })
    }

    /// Execute `request` through the transport, recovering from one expired
    /// access token transparently.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let stamped = self.authorize(request)?;
        let response = self.transport.execute(&stamped).await?;

        if response.is_unauthorized() && stamped.bearer.is_some() {
            return self.on_unauthorized(stamped).await;
        }
        Ok(response)
    }

    /// Recover from a 401 on `original`: refresh (or join a refresh already in
    /// flight), persist, and replay exactly once.
    pub async fn on_unauthorized(&self, original: ApiRequest) -> Result<ApiResponse, SessionError> {
        let Some(stamped) = original.bearer.as_deref() else {
            return Err(ApiError::Unauthorized.into());
        };
        let Some(pair) = self.store.read()? else {
            // Logged out while the request was in flight
            return Err(SessionError::SessionEnded);
        };

        let access = if pair.access_token != stamped {
            debug!(path = %original.path, "Access token already rotated, replaying");
            pair.access_token
        } else {
            let handle = self.join_or_start(&pair.refresh_token);
            let outcome = self.settle(&pair.refresh_token, handle.clone().await);
            // Until the slot is released, later failures stamped with the old
            // token join this refresh; after it, they see the new token
            self.release(&handle);
            outcome?
        };

        let response = self.transport.execute(&original.with_bearer(access)).await?;
        if response.is_unauthorized() {
            warn!(path = %original.path, "Request rejected again after refresh");
            return Err(self.end_session());
        }
        Ok(response)
    }

    /// The refresh in flight for `refresh_token`, or a new one.
    fn join_or_start(&self, refresh_token: &str) -> RefreshHandle {
        let mut pending = self.lock_pending();
        if let Some(p) = pending.as_ref().filter(|p| p.refresh_token == refresh_token) {
            debug!("Joining token refresh in flight");
            return p.handle.clone();
        }

        info!("Refreshing access token");
        let backend = Arc::clone(&self.backend);
        let token = refresh_token.to_string();
        let handle = async move { backend.refresh(&token).await.map_err(RefreshFailure::from) }
            .boxed()
            .shared();
        *pending = Some(PendingRefresh {
            refresh_token: refresh_token.to_string(),
            handle: handle.clone(),
        });
        handle
    }

    /// Persist a refresh outcome, or end the session on a terminal failure.
    fn settle(
        &self,
        refresh_token: &str,
        outcome: Result<String, RefreshFailure>,
    ) -> Result<String, SessionError> {
        match outcome {
            Ok(access) => {
                if !self.store.replace_access_if_current(refresh_token, &access)? {
                    // A logout landed during the refresh; its result is void
                    return Err(SessionError::SessionEnded);
                }
                Ok(access)
            }
            Err(RefreshFailure::Network(msg)) => {
                warn!(error = %msg, "Token refresh unreachable");
                Err(SessionError::NetworkFailure(msg))
            }
            Err(RefreshFailure::Rejected(e)) => {
                warn!(error = %e, "Token refresh rejected");
                Err(self.end_session())
            }
        }
    }

    fn release(&self, handle: &RefreshHandle) {
        let mut pending = self.lock_pending();
        if pending.as_ref().is_some_and(|p| p.handle.ptr_eq(handle)) {
            *pending = None;
        }
    }

    /// Terminal authentication failure: full logout and the unified signal.
    fn end_session(&self) -> SessionError {
        if self.store.is_adopted() {
            if let Err(e) = self.arbiter.logout(EndReason::RefreshRejected) {
                error!(error = %e, "Failed to clear credentials after refresh failure");
            }
        }
        SessionError::SessionEnded
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingRefresh>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Tests
// ============================================================================
