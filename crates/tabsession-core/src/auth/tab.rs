//! Per-tab identity.
//!
//! The id lives in the tab's own storage area, which outlives a reload but
//! not the tab itself. It is generated on first use and never shared.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{SharedStorage, StorageError};

/// Key for the id in tab-local storage
const TAB_ID_KEY: &str = "tab_id";

/// 128 bits keeps collisions between concurrently open tabs negligible.
const TAB_ID_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct TabIdentity {
    local: Arc<dyn SharedStorage>,
    cached: OnceLock<TabId>,
}

impl TabIdentity {
    /// `local` must be storage no other tab can see.
    pub fn new(local: Arc<dyn SharedStorage>) -> Self {
        Self {
            local,
            cached: OnceLock::new(),
        }
    }

    pub fn current(&self) -> Result<TabId, StorageError> {
        if let Some(id) = self.cached.get() {
            return Ok(id.clone());
        }

        let id = match self.local.get(TAB_ID_KEY)?.filter(|v| !v.is_empty()) {
            Some(existing) => {
                debug!(tab_id = %existing, "Reusing tab id");
                TabId(existing)
            }
            None => {
                let id = generate_tab_id();
                self.local.set(TAB_ID_KEY, id.as_str())?;
                debug!(tab_id = %id, "Generated tab id");
                id
            }
        };
        Ok(self.cached.get_or_init(|| id).clone())
    }
}

fn generate_tab_id() -> TabId {
    let mut bytes = [0u8; TAB_ID_BYTES];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => TabId(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        Err(e) => {
            warn!(error = %e, "OS randomness unavailable, falling back to timestamp id");
            fallback_tab_id()
        }
    }
}

fn fallback_tab_id() -> TabId {
    let suffix: u64 = rand::thread_rng().gen();
    TabId(format!("{:x}-{:016x}", Utc::now().timestamp_millis(), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_current_is_stable() {
        let identity = TabIdentity::new(Arc::new(MemoryStorage::new()));
        let first = identity.current().unwrap();
        assert_eq!(identity.current().unwrap(), first);
        assert_eq!(first.as_str().len(), TAB_ID_BYTES * 2);
    }

    #[test]
    fn test_reload_reuses_id() {
        let local = MemoryStorage::new();
        let before = TabIdentity::new(Arc::new(local.clone())).current().unwrap();

        // A reload rebuilds everything except tab-local storage
        let after = TabIdentity::new(Arc::new(local)).current().unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_new_tabs_get_distinct_ids() {
        let a = TabIdentity::new(Arc::new(MemoryStorage::new())).current().unwrap();
        let b = TabIdentity::new(Arc::new(MemoryStorage::new())).current().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_is_lazy() {
        let local = MemoryStorage::new();
        let identity = TabIdentity::new(Arc::new(local.clone()));
        assert_eq!(local.get(TAB_ID_KEY).unwrap(), None);

        let id = identity.current().unwrap();
        assert_eq!(local.get(TAB_ID_KEY).unwrap().as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_fallback_ids_differ() {
        assert_ne!(fallback_tab_id(), fallback_tab_id());
        assert!(fallback_tab_id().as_str().contains('-'));
    }
}
