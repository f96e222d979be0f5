//! Credential pair and owner-marker persistence.
//!
//! The pair and the owner marker live in shared storage under three keys. Each
//! tab wraps the shared area in its own `CredentialStore`, which also tracks
//! whether this tab has adopted the stored pair: a tab only sees credentials
//! it logged in with or inherited at startup as the legitimate owner. The
//! authenticated flag is always derived from that view, never stored.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::TabId;
use crate::storage::{ContextId, SharedStorage, StorageError, StorageEvent};

pub const ACCESS_KEY: &str = "access";
pub const REFRESH_KEY: &str = "refresh";
pub const OWNER_KEY: &str = "owner_tab_id";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

pub struct CredentialStore {
    storage: Arc<dyn SharedStorage>,
    adopted: AtomicBool,
    status: watch::Sender<bool>,
}

impl CredentialStore {
    /// Wrap a shared storage area. The stored pair is not adopted yet.
    pub fn new(storage: Arc<dyn SharedStorage>) -> Self {
        let (status, _) = watch::channel(false);
        Self {
            storage,
            adopted: AtomicBool::new(false),
            status,
        }
    }

    pub fn context(&self) -> ContextId {
        self.storage.context()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.storage.subscribe()
    }

    /// Observable authenticated flag; changes on every write through this store
    /// and whenever `refresh_status` sees a sibling's change.
    pub fn status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    /// Persist a fresh pair and adopt it.
    pub fn save(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        self.storage.set(ACCESS_KEY, &pair.access_token)?;
        self.storage.set(REFRESH_KEY, &pair.refresh_token)?;
        self.adopted.store(true, Ordering::SeqCst);
        self.refresh_status()
    }

    /// The pair as this tab sees it: absent unless adopted and complete.
    pub fn read(&self) -> Result<Option<CredentialPair>, StorageError> {
        if !self.adopted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.read_stored()
    }

    /// The pair in shared storage, whoever put it there.
    /// A half-written or half-cleared pair counts as absent.
    pub fn read_stored(&self) -> Result<Option<CredentialPair>, StorageError> {
        let access = self.storage.get(ACCESS_KEY)?.filter(|v| !v.is_empty());
        let refresh = self.storage.get(REFRESH_KEY)?.filter(|v| !v.is_empty());
        Ok(match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Some(CredentialPair {
                access_token,
                refresh_token,
            }),
            _ => None,
        })
    }

    /// Whether this tab holds the stored pair as its own.
    pub fn is_adopted(&self) -> bool {
        self.adopted.load(Ordering::SeqCst)
    }

    pub fn access_token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.read()?.map(|pair| pair.access_token))
    }

    pub fn is_authenticated(&self) -> Result<bool, StorageError> {
        Ok(self.read()?.is_some())
    }

    /// Store a refreshed access token, but only if the pair it was refreshed
    /// from is still the one this tab holds. Returns whether it was written.
    pub fn replace_access_if_current(
        &self,
        refresh_token: &str,
        access_token: &str,
    ) -> Result<bool, StorageError> {
        match self.read()? {
            Some(pair) if pair.refresh_token == refresh_token => {
                self.storage.set(ACCESS_KEY, access_token)?;
                self.refresh_status()?;
                Ok(true)
            }
            _ => {
                debug!("Discarding refresh result for a pair that is gone");
                Ok(false)
            }
        }
    }

    /// Remove the pair from shared storage and drop this tab's view of it.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.adopted.store(false, Ordering::SeqCst);
        self.storage.remove(ACCESS_KEY)?;
        self.storage.remove(REFRESH_KEY)?;
        self.refresh_status()
    }

    /// Take the stored pair as this tab's own (startup as owner).
    pub fn adopt(&self) -> Result<(), StorageError> {
        self.adopted.store(true, Ordering::SeqCst);
        self.refresh_status()
    }

    /// Drop this tab's view of the pair without touching shared storage.
    pub fn detach(&self) -> Result<(), StorageError> {
        self.adopted.store(false, Ordering::SeqCst);
        self.refresh_status()
    }

    /// Claim the session. Always overwrites.
    pub fn set_owner(&self, tab_id: &TabId) -> Result<(), StorageError> {
        self.storage.set(OWNER_KEY, tab_id.as_str())
    }

    pub fn read_owner(&self) -> Result<Option<TabId>, StorageError> {
        Ok(self
            .storage
            .get(OWNER_KEY)?
            .filter(|v| !v.is_empty())
            .map(TabId::from))
    }

    /// Remove the owner marker only if it still names `tab_id`, so a tab never
    /// destroys a claim another tab has taken since. Returns whether it cleared.
    pub fn clear_owner_if_matches(&self, tab_id: &TabId) -> Result<bool, StorageError> {
        match self.read_owner()? {
            Some(owner) if owner == *tab_id => {
                self.storage.remove(OWNER_KEY)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Re-derive the authenticated flag from storage and publish it if it changed.
    pub fn refresh_status(&self) -> Result<(), StorageError> {
        let authenticated = self.is_authenticated()?;
        self.status.send_if_modified(|current| {
            if *current != authenticated {
                *current = authenticated;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
