//! Cross-tab notifications and window lifecycle.
//!
//! Storage changes made by sibling tabs are turned into `SessionChange`s and
//! handed to the registered handlers; this tab's own writes are dropped so a
//! handler never reacts to its own side effects. Window-closing signals go to
//! their own handlers. Delivery can be duplicated or reordered, so handlers
//! must re-read storage instead of trusting the change payload.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::credentials::{ACCESS_KEY, OWNER_KEY, REFRESH_KEY};
use crate::storage::{ContextId, StorageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSignal {
    /// The page is being hidden for good (mobile browsers, bfcache).
    PageHide,
    /// The tab is closing, reloading or navigating away.
    BeforeUnload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    OwnerChanged { owner: Option<String> },
    CredentialsChanged { cleared: bool },
    /// Notifications were dropped; re-read everything.
    Resync,
}

type ChangeHandler = Box<dyn Fn(&SessionChange) + Send + Sync>;
type ClosingHandler = Box<dyn Fn(WindowSignal) + Send + Sync>;

pub struct CrossTabNotifier {
    context: ContextId,
    change_handlers: Mutex<Vec<ChangeHandler>>,
    closing_handlers: Mutex<Vec<ClosingHandler>>,
}

impl CrossTabNotifier {
    /// `context` is the execution context whose writes are ignored.
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            change_handlers: Mutex::new(Vec::new()),
            closing_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_credential_or_owner_changed(
        &self,
        handler: impl Fn(&SessionChange) + Send + Sync + 'static,
    ) {
        lock(&self.change_handlers).push(Box::new(handler));
    }

    pub fn on_window_closing(&self, handler: impl Fn(WindowSignal) + Send + Sync + 'static) {
        lock(&self.closing_handlers).push(Box::new(handler));
    }

    /// Map a storage mutation to a session change, if it concerns the session.
    pub fn classify(event: &StorageEvent) -> Option<SessionChange> {
        match event.key.as_str() {
            OWNER_KEY => Some(SessionChange::OwnerChanged {
                owner: event.new_value.clone(),
            }),
            ACCESS_KEY | REFRESH_KEY => Some(SessionChange::CredentialsChanged {
                cleared: event.new_value.is_none(),
            }),
            _ => None,
        }
    }

    /// Deliver a sibling's storage change. Returns whether any handler ran.
    pub fn dispatch(&self, event: &StorageEvent) -> bool {
        if event.origin == self.context {
            return false;
        }
        match Self::classify(event) {
            Some(change) => {
                debug!(?change, origin = %event.origin, "Cross-tab change");
                self.notify(&change);
                true
            }
            None => false,
        }
    }

    pub fn window_closing(&self, signal: WindowSignal) {
        debug!(?signal, "Window closing");
        for handler in lock(&self.closing_handlers).iter() {
            handler(signal);
        }
    }

    /// Pump `events` into the handlers until the storage area goes away.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<StorageEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.dispatch(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed storage notifications, resyncing");
                    self.notify(&SessionChange::Resync);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Drain whatever is already queued on `events` without waiting.
    pub fn drain(&self, events: &mut broadcast::Receiver<StorageEvent>) -> usize {
        let mut handled = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if self.dispatch(&event) {
                        handled += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed storage notifications, resyncing");
                    self.notify(&SessionChange::Resync);
                    handled += 1;
                }
                Err(_) => return handled,
            }
        }
    }

    fn notify(&self, change: &SessionChange) {
        for handler in lock(&self.change_handlers).iter() {
            handler(change);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
