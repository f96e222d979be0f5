//! Origin-scoped key-value storage shared by every tab of one client.
//!
//! This module provides:
//! - `SharedStorage`: synchronous, last-write-wins single-key storage with
//!   change notifications
//! - `MemoryStorage`: in-process backend (tests, tab-local storage)
//! - `FileStorage`: durable JSON backend shared between processes
//!
//! Every handle writes as one execution context. Change events carry the
//! writer's `ContextId` so a tab can tell its own writes from a sibling's.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::broadcast;

/// Buffer size for storage change channels.
/// A session touches at most three keys per operation, 64 leaves ample headroom
/// for a slow subscriber before it lags.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Identifies the execution context that performed a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Writes observed from another process, attributed on file sync.
    pub const EXTERNAL: ContextId = ContextId(0);

    /// Allocate a context id unique within this process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EXTERNAL {
            write!(f, "external")
        } else {
            write!(f, "ctx-{}", self.0)
        }
    }
}

/// A single-key mutation, as seen by every subscriber of the storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage document is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Durable key-value storage shared between execution contexts.
///
/// Writes are last-write-wins per key; there is no multi-key transaction.
/// A write that leaves the stored value unchanged publishes no event.
pub trait SharedStorage: Send + Sync {
    /// The execution context this handle writes as.
    fn context(&self) -> ContextId;

    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Receive every change made through any handle on this storage area,
    /// including this handle's own writes.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
