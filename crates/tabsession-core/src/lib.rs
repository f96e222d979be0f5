//! tabsession-core - session lifecycle for a multi-tab client.
//!
//! This crate provides:
//! - Shared and tab-local key-value storage with change notifications
//! - The authentication API client and the protected-request transport
//! - Single-owner session arbitration between tabs
//! - Bearer stamping with single-flight token refresh
//! - Client configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthBackend, AuthClient, HttpTransport, Transport};
pub use auth::{
    CredentialPair, EndReason, OwnershipState, SessionEnded, SessionError, TabId, TabSession,
    WindowSignal,
};
pub use config::Config;
pub use storage::{ContextId, FileStorage, MemoryStorage, SharedStorage, StorageError, StorageEvent};
