//! Scripted fakes for the authentication server and protected API.
//!
//! `ScriptedBackend` issues predictable tokens (`access-N`/`refresh-N` on
//! login, `refreshed-N` on refresh) and counts calls, so tests can assert how
//! many refreshes actually went out. `ScriptedTransport` answers 200 for
//! requests stamped with an accepted token and 401 for everything else.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, ApiRequest, ApiResponse, AuthBackend, Transport};
use crate::auth::CredentialPair;

pub const TEST_USERNAME: &str = "alice";
pub const TEST_PASSWORD: &str = "hunter2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Issue `refreshed-N`.
    Issue,
    /// Answer 401, as for an expired refresh token.
    Reject,
    /// Fail without an answer.
    Offline,
}

pub struct ScriptedBackend {
    refresh_mode: Mutex<RefreshMode>,
    refresh_delay: Duration,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            refresh_mode: Mutex::new(RefreshMode::Issue),
            refresh_delay: Duration::ZERO,
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_refresh_mode(self, mode: RefreshMode) -> Self {
        self.set_refresh_mode(mode);
        self
    }

    /// Hold every refresh open this long, so concurrent failures overlap.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn set_refresh_mode(&self, mode: RefreshMode) {
        *self.refresh_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthBackend for ScriptedBackend {
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let n = self.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if username != TEST_USERNAME || password != TEST_PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        Ok(CredentialPair::new(format!("access-{}", n), format!("refresh-{}", n)))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<String, ApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let mode = *self.refresh_mode.lock().unwrap_or_else(PoisonError::into_inner);
        match mode {
            RefreshMode::Issue => Ok(format!("refreshed-{}", n)),
            RefreshMode::Reject => Err(ApiError::Unauthorized),
            RefreshMode::Offline => Err(ApiError::Network("connection refused".to_string())),
        }
    }
}

pub struct ScriptedTransport {
    accepted: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            accepted: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn accept(&self, token: &str) {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).insert(token.to_string());
    }

    pub fn revoke(&self, token: &str) {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).remove(token);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection refused".to_string()));
        }
        let accepted = request
            .bearer
            .as_ref()
            .is_some_and(|token| self.accepted.lock().unwrap_or_else(PoisonError::into_inner).contains(token));
        if accepted {
            Ok(ApiResponse::new(
                200,
                serde_json::json!({ "path": request.path }).to_string(),
            ))
        } else {
            Ok(ApiResponse::new(
                401,
                r#"{"detail":"Given token not valid for any token type"}"#,
            ))
        }
    }
}
