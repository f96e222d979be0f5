//! Session lifecycle for one browser-like client with many tabs.
//!
//! At most one tab owns the session at a time. The pieces:
//! - `CredentialStore`: the shared access/refresh pair and owner marker
//! - `TabIdentity`: this tab's id, stable across reloads
//! - `OwnershipArbiter`: startup decision, demotion and logout
//! - `RefreshCoordinator`: bearer stamping and single-flight refresh
//! - `CrossTabNotifier`: sibling storage changes and window closing
//!
//! `TabSession` wires them together for one tab.

pub mod arbiter;
pub mod credentials;
pub mod error;
pub mod notifier;
pub mod refresh;
pub mod session;
pub mod tab;

pub use arbiter::{EndReason, OwnershipArbiter, OwnershipState, SessionEnded};
pub use credentials::{CredentialPair, CredentialStore};
pub use error::SessionError;
pub use notifier::{CrossTabNotifier, SessionChange, WindowSignal};
pub use refresh::RefreshCoordinator;
pub use session::TabSession;
pub use tab::{TabId, TabIdentity};
