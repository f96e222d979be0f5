//! In-process storage backend.
//!
//! All handles created from one `MemoryStorage` share the same entries and
//! the same change channel; each handle writes as its own execution context.
//! Data is lost when the process exits, which is exactly the lifetime wanted
//! for tab-local storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::{ContextId, SharedStorage, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

struct Area {
    entries: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// Handle onto an in-memory storage area.
/// Clone is cheap and keeps the same context; use `handle()` for a sibling context.
#[derive(Clone)]
pub struct MemoryStorage {
    area: Arc<Area>,
    context: ContextId,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            area: Arc::new(Area {
                entries: Mutex::new(HashMap::new()),
                events,
            }),
            context: ContextId::next(),
        }
    }

    /// Another handle onto the same entries, writing as a new execution context.
    pub fn handle(&self) -> Self {
        Self {
            area: Arc::clone(&self.area),
            context: ContextId::next(),
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.area.entries.lock().map_err(|_| StorageError::Poisoned)
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // No subscribers is fine
        let _ = self.area.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.context,
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStorage for MemoryStorage {
    fn context(&self) -> ContextId {
        self.context
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = {
            let mut entries = self.entries()?;
            let old = entries.insert(key.to_string(), value.to_string());
            if old.as_deref() == Some(value) {
                return Ok(());
            }
            old
        };
        self.publish(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old = self.entries()?.remove(key);
        if old.is_some() {
            self.publish(key, old, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.area.events.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================
