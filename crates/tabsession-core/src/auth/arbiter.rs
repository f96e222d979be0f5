//! Single-owner arbitration between tabs.
//!
//! There is no lock shared between tabs. Ownership is claimed by overwriting
//! the owner marker and given up with compare-and-clear; a tab that observes a
//! rival claim demotes itself. Two tabs may both believe they own the session
//! until the loser's notification arrives.
//!
//! Every transition re-reads the marker and pair from storage rather than
//! trusting notification payloads.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{CredentialStore, SessionError, TabId};

/// Buffer size for the logout signal channel
const SIGNAL_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    /// Not evaluated yet.
    Unclaimed,
    OwnedBySelf,
    /// A sibling holds the session. Reported by `view`, never held.
    OwnedByOther,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserLogout,
    /// Silent logout while the tab is closed, reloaded or navigated away.
    WindowClosing,
    /// Another tab claimed the session.
    OwnershipConflict,
    /// Another tab cleared the credential pair.
    RemoteLogout,
    /// The refresh token was rejected, or the replayed request was.
    RefreshRejected,
}

impl EndReason {
    /// Silent logouts end the session without sending the user anywhere.
    pub fn is_silent(&self) -> bool {
        matches!(self, EndReason::WindowClosing)
    }
}

/// Fired on the logout channel; the navigation layer should show the login surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnded {
    pub reason: EndReason,
}

pub struct OwnershipArbiter {
    store: Arc<CredentialStore>,
    tab_id: TabId,
    state: Mutex<OwnershipState>,
    ended: broadcast::Sender<SessionEnded>,
}

impl OwnershipArbiter {
    pub fn new(store: Arc<CredentialStore>, tab_id: TabId) -> Self {
        let (ended, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            store,
            tab_id,
            state: Mutex::new(OwnershipState::Unclaimed),
            ended,
        }
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn state(&self) -> OwnershipState {
        *self.lock_state()
    }

    /// This tab's state, except that a logged-out tab looking at a live
    /// session claimed by a sibling reports `OwnedByOther`.
    pub fn view(&self) -> Result<OwnershipState, SessionError> {
        let state = self.state();
        if state == OwnershipState::OwnedBySelf {
            return Ok(state);
        }
        match (self.store.read_stored()?, self.store.read_owner()?) {
            (Some(_), Some(owner)) if owner != self.tab_id => Ok(OwnershipState::OwnedByOther),
            _ => Ok(state),
        }
    }

    /// Logout signal. Not fired for silent logouts.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEnded> {
        self.ended.subscribe()
    }

    /// Decide at tab startup whether this tab continues the stored session.
    pub fn startup(&self) -> Result<OwnershipState, SessionError> {
        let mut state = self.lock_state();

        let next = match (self.store.read_stored()?, self.store.read_owner()?) {
            (None, _) => {
                debug!(tab_id = %self.tab_id, "No stored session");
                self.store.detach()?;
                OwnershipState::LoggedOut
            }
            (Some(_), None) => {
                self.store.set_owner(&self.tab_id)?;
                self.store.adopt()?;
                info!(tab_id = %self.tab_id, "Claimed unowned session");
                OwnershipState::OwnedBySelf
            }
            (Some(_), Some(owner)) if owner == self.tab_id => {
                self.store.adopt()?;
                info!(tab_id = %self.tab_id, "Resumed own session after reload");
                OwnershipState::OwnedBySelf
            }
            (Some(_), Some(owner)) => {
                // Duplicate tab: invalidate the session so one tab must log in again.
                // The rival's marker is left for the rival to clear.
                warn!(tab_id = %self.tab_id, owner = %owner, "Session owned by another tab, forcing fresh login");
                self.store.clear()?;
                self.store.clear_owner_if_matches(&self.tab_id)?;
                OwnershipState::LoggedOut
            }
        };

        *state = next;
        Ok(next)
    }

    /// Take the session after a successful login in this tab.
    pub fn claim(&self) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        self.store.set_owner(&self.tab_id)?;
        self.store.adopt()?;
        *state = OwnershipState::OwnedBySelf;
        info!(tab_id = %self.tab_id, "Claimed session");
        Ok(())
    }

    /// Re-evaluate ownership after a sibling changed the pair or the marker.
    /// Only an owning tab can be demoted; calling this repeatedly is harmless.
    pub fn reconcile(&self) -> Result<OwnershipState, SessionError> {
        let mut state = self.lock_state();
        if *state != OwnershipState::OwnedBySelf {
            return Ok(*state);
        }

        let pair = self.store.read_stored()?;
        let owner = self.store.read_owner()?;

        let demotion = match (pair, owner) {
            (None, _) => Some(EndReason::RemoteLogout),
            (Some(_), Some(owner)) if owner != self.tab_id => {
                warn!(tab_id = %self.tab_id, owner = %owner, "Another tab claimed the session");
                Some(EndReason::OwnershipConflict)
            }
            (Some(_), None) => {
                // The marker vanished under a live session; it must be claimed
                self.store.set_owner(&self.tab_id)?;
                debug!(tab_id = %self.tab_id, "Re-claimed session with missing owner marker");
                None
            }
            (Some(_), Some(_)) => None,
        };

        match demotion {
            Some(reason) => {
                self.store.detach()?;
                self.store.clear_owner_if_matches(&self.tab_id)?;
                *state = OwnershipState::LoggedOut;
                drop(state);
                self.signal(reason);
                Ok(OwnershipState::LoggedOut)
            }
            None => {
                self.store.refresh_status()?;
                Ok(*state)
            }
        }
    }

    /// End the session from this tab: clear the pair if this tab holds it and
    /// give up the marker if it is still ours. A tab that never adopted the
    /// stored pair leaves it alone, so closing a stale tab cannot log out the
    /// tab that owns the session now.
    pub fn logout(&self, reason: EndReason) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        let was = *state;

        if self.store.is_adopted() {
            self.store.clear()?;
        } else {
            self.store.detach()?;
        }
        let released = self.store.clear_owner_if_matches(&self.tab_id)?;
        *state = OwnershipState::LoggedOut;
        drop(state);

        info!(tab_id = %self.tab_id, ?reason, ?was, released, "Logged out");
        if !reason.is_silent() {
            self.signal(reason);
        }
        Ok(())
    }

    fn signal(&self, reason: EndReason) {
        // No subscribers is fine
        let _ = self.ended.send(SessionEnded { reason });
    }

    fn lock_state(&self) -> MutexGuard<'_, OwnershipState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::OWNER_KEY;
    use crate::auth::CredentialPair;
    use crate::storage::{MemoryStorage, SharedStorage};

    fn arbiter_on(shared: &MemoryStorage, tab: &str) -> (Arc<CredentialStore>, OwnershipArbiter) {
        let store = Arc::new(CredentialStore::new(Arc::new(shared.handle())));
        let arbiter = OwnershipArbiter::new(Arc::clone(&store), TabId::from(tab));
        (store, arbiter)
    }

    fn seed_pair(shared: &MemoryStorage) {
        let store = CredentialStore::new(Arc::new(shared.handle()));
        store.save(&CredentialPair::new("a1", "r1")).unwrap();
    }

    #[test]
    fn test_startup_without_pair_is_logged_out() {
        let shared = MemoryStorage::new();
        let (store, arbiter) = arbiter_on(&shared, "tab-a");

        assert_eq!(arbiter.startup().unwrap(), OwnershipState::LoggedOut);
        assert!(!store.is_authenticated().unwrap());
        assert_eq!(store.read_owner().unwrap(), None);
    }

    #[test]
    fn test_startup_claims_unowned_pair() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        let (store, arbiter) = arbiter_on(&shared, "tab-a");

        assert_eq!(arbiter.startup().unwrap(), OwnershipState::OwnedBySelf);
        assert_eq!(store.read_owner().unwrap(), Some(TabId::from("tab-a")));
        assert!(store.is_authenticated().unwrap());
    }

    #[test]
    fn test_startup_resumes_own_session() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        shared.set(OWNER_KEY, "tab-a").unwrap();
        let (store, arbiter) = arbiter_on(&shared, "tab-a");

        assert_eq!(arbiter.startup().unwrap(), OwnershipState::OwnedBySelf);
        assert!(store.is_authenticated().unwrap());
    }

    #[test]
    fn test_startup_with_foreign_owner_forces_fresh_login() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        shared.set(OWNER_KEY, "tab-a").unwrap();
        let (store, arbiter) = arbiter_on(&shared, "tab-b");

        assert_eq!(arbiter.startup().unwrap(), OwnershipState::LoggedOut);
        assert_eq!(store.read_stored().unwrap(), None);
        // The rival's marker survives; only the rival clears it
        assert_eq!(store.read_owner().unwrap(), Some(TabId::from("tab-a")));
    }

    #[test]
    fn test_reconcile_demotes_on_foreign_claim() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        let (store, arbiter) = arbiter_on(&shared, "tab-a");
        arbiter.startup().unwrap();
        let mut ended = arbiter.subscribe();

        shared.set(OWNER_KEY, "tab-b").unwrap();

        assert_eq!(arbiter.reconcile().unwrap(), OwnershipState::LoggedOut);
        assert!(!store.is_authenticated().unwrap());
        // The rival's claim and pair are untouched
        assert!(store.read_stored().unwrap().is_some());
        assert_eq!(store.read_owner().unwrap(), Some(TabId::from("tab-b")));
        assert_eq!(ended.try_recv().unwrap().reason, EndReason::OwnershipConflict);
    }

    #[test]
    fn test_view_reports_sibling_owner() {
        let shared = MemoryStorage::new();
        let (_store, arbiter) = arbiter_on(&shared, "tab-a");
        arbiter.startup().unwrap();
        assert_eq!(arbiter.view().unwrap(), OwnershipState::LoggedOut);

        seed_pair(&shared);
        shared.set(OWNER_KEY, "tab-b").unwrap();

        assert_eq!(arbiter.state(), OwnershipState::LoggedOut);
        assert_eq!(arbiter.view().unwrap(), OwnershipState::OwnedByOther);
    }

    #[test]
    fn test_reconcile_demotes_when_pair_cleared_elsewhere() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        let (store, arbiter) = arbiter_on(&shared, "tab-a");
        arbiter.startup().unwrap();
        let mut ended = arbiter.subscribe();

        CredentialStore::new(Arc::new(shared.handle())).clear().unwrap();

        assert_eq!(arbiter.reconcile().unwrap(), OwnershipState::LoggedOut);
        assert_eq!(store.read_owner().unwrap(), None);
        assert_eq!(ended.try_recv().unwrap().reason, EndReason::RemoteLogout);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        let (_store, arbiter) = arbiter_on(&shared, "tab-a");
        arbiter.startup().unwrap();
        let mut ended = arbiter.subscribe();

        shared.set(OWNER_KEY, "tab-b").unwrap();
        arbiter.reconcile().unwrap();
        arbiter.reconcile().unwrap();

        assert!(ended.try_recv().is_ok());
        assert!(ended.try_recv().is_err());
    }

    #[test]
    fn test_reconcile_reclaims_missing_marker() {
        let shared = MemoryStorage::new();
        seed_pair(&shared);
        let (store, arbiter) = arbiter_on(&shared, "tab-a");
        arbiter.startup().unwrap();

        shared.remove(OWNER_KEY).unwrap();

        assert_eq!(arbiter.reconcile().unwrap(), OwnershipState::OwnedBySelf);
        assert_eq!(store.read_owner().unwrap(), Some(TabId::from("tab-a")));
    }

    #[test]
    fn test_logout_keeps_foreign_marker() {
        let shared = MemoryStorage::new();
        let (store, arbiter) = arbiter_on(&shared, "tab-a");
        store.save(&CredentialPair::new("a1", "r1")).unwrap();
        arbiter.claim().unwrap();

        shared.set(OWNER_KEY, "tab-b").unwrap();
        arbiter.logout(EndReason::UserLogout).unwrap();

        assert_eq!(arbiter.state(), OwnershipState::LoggedOut);
        assert_eq!(store.read_stored().unwrap(), None);
        assert_eq!(store.read_owner().unwrap(), Some(TabId::from("tab-b")));
    }

    #[test]
    fn test_logout_from_stale_tab_leaves_owner_session() {
        let shared = MemoryStorage::new();
        let (stale_store, stale) = arbiter_on(&shared, "tab-a");
        let (owner_store, owner) = arbiter_on(&shared, "tab-b");
        stale.startup().unwrap();
        owner_store.save(&CredentialPair::new("a1", "r1")).unwrap();
        owner.claim().unwrap();

        stale.logout(EndReason::WindowClosing).unwrap();

        assert!(owner_store.is_authenticated().unwrap());
        assert_eq!(stale_store.read_owner().unwrap(), Some(TabId::from("tab-b")));
    }

    #[test]
    fn test_logout_signals_unless_silent() {
        let shared = MemoryStorage::new();
        let (store, arbiter) = arbiter_on(&shared, "tab-a");
        let mut ended = arbiter.subscribe();

        store.save(&CredentialPair::new("a1", "r1")).unwrap();
        arbiter.claim().unwrap();
        arbiter.logout(EndReason::WindowClosing).unwrap();
        assert!(ended.try_recv().is_err());
        assert_eq!(store.read_owner().unwrap(), None);

        store.save(&CredentialPair::new("a2", "r2")).unwrap();
        arbiter.claim().unwrap();
        arbiter.logout(EndReason::UserLogout).unwrap();
        assert_eq!(ended.try_recv().unwrap().reason, EndReason::UserLogout);
    }
}
