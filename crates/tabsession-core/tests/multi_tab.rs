//! Multi-tab session scenarios, end to end through `TabSession`.
//!
//! Tabs in one process share a `MemoryStorage` area through sibling handles;
//! tabs in different processes are simulated with two `FileStorage` handles
//! on the same directory.

use std::sync::Arc;
use std::time::Duration;

use tabsession_core::api::ApiRequest;
use tabsession_core::testing::{
    RefreshMode, ScriptedBackend, ScriptedTransport, TEST_PASSWORD, TEST_USERNAME,
};
use tabsession_core::{
    EndReason, FileStorage, MemoryStorage, OwnershipState, SessionEnded, SessionError,
    SharedStorage, TabSession, WindowSignal,
};
use tokio::sync::broadcast;

const OWNER_KEY: &str = "owner_tab_id";
const ORIGIN: &str = "http://127.0.0.1:8000";

struct Browser {
    shared: MemoryStorage,
    backend: Arc<ScriptedBackend>,
    transport: Arc<ScriptedTransport>,
}

impl Browser {
    fn new(backend: ScriptedBackend) -> Self {
        Self {
            shared: MemoryStorage::new(),
            backend: Arc::new(backend),
            transport: Arc::new(ScriptedTransport::new()),
        }
    }

    fn open_tab(&self) -> TabSession {
        TabSession::open(
            Arc::new(self.shared.handle()),
            Arc::new(MemoryStorage::new()),
            self.backend.clone(),
            self.transport.clone(),
        )
        .unwrap()
    }
}

async fn next_end(ended: &mut broadcast::Receiver<SessionEnded>) -> EndReason {
    tokio::time::timeout(Duration::from_secs(2), ended.recv())
        .await
        .expect("no session end within timeout")
        .unwrap()
        .reason
}

fn assert_flag_matches_pair(tab: &TabSession) {
    assert_eq!(*tab.status().borrow(), tab.is_authenticated().unwrap());
    assert_eq!(tab.is_authenticated().unwrap(), tab.access_token().unwrap().is_some());
}

#[tokio::test]
async fn test_authenticated_flag_tracks_pair() {
    let browser = Browser::new(ScriptedBackend::new());
    browser.transport.accept("refreshed-1");
    let tab = browser.open_tab();
    assert_flag_matches_pair(&tab);

    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    assert_flag_matches_pair(&tab);

    tab.send(ApiRequest::get("/wallets/")).await.unwrap();
    assert_flag_matches_pair(&tab);

    tab.logout().unwrap();
    assert_flag_matches_pair(&tab);
    assert!(!tab.is_authenticated().unwrap());
}

#[tokio::test]
async fn test_duplicate_tab_starts_logged_out_without_clobbering_owner() {
    let browser = Browser::new(ScriptedBackend::new());
    let a = browser.open_tab();
    a.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();

    let b = browser.open_tab();

    assert_eq!(b.state(), OwnershipState::LoggedOut);
    assert!(!b.is_authenticated().unwrap());
    // B cleared the pair but left A's marker for A to release
    assert_eq!(
        browser.shared.get(OWNER_KEY).unwrap().as_deref(),
        Some(a.tab_id().as_str())
    );

    // A re-logs in and is the legitimate owner; B's stale view must not undo that
    a.process_pending();
    a.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    b.process_pending();
    b.window_closing(WindowSignal::BeforeUnload);

    assert!(a.is_authenticated().unwrap());
    assert_eq!(
        browser.shared.get(OWNER_KEY).unwrap().as_deref(),
        Some(a.tab_id().as_str())
    );
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let backend = ScriptedBackend::new().with_refresh_delay(Duration::from_millis(20));
    let browser = Browser::new(backend);
    browser.transport.accept("refreshed-1");
    let tab = Arc::new(browser.open_tab());
    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();

    let requests: Vec<_> = (0..8)
        .map(|i| {
            let tab = Arc::clone(&tab);
            tokio::spawn(async move { tab.send(ApiRequest::get(format!("/prices/{}/", i))).await })
        })
        .collect();

    for request in requests {
        assert_eq!(request.await.unwrap().unwrap().status, 200);
    }
    assert_eq!(browser.backend.refresh_calls(), 1);
}

#[tokio::test]
async fn test_refresh_then_retry_ok() {
    let browser = Browser::new(ScriptedBackend::new());
    browser.transport.accept("access-1");
    browser.transport.accept("refreshed-1");
    let tab = browser.open_tab();
    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    tab.send(ApiRequest::get("/wallets/")).await.unwrap();
    assert_eq!(browser.backend.refresh_calls(), 0);

    // The access token expires
    browser.transport.revoke("access-1");
    let response = tab.send(ApiRequest::get("/wallets/")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(browser.backend.refresh_calls(), 1);
    assert_eq!(browser.transport.calls(), 3);
    assert_eq!(tab.access_token().unwrap().as_deref(), Some("refreshed-1"));
}

#[tokio::test]
async fn test_failed_retry_logs_out_without_second_refresh() {
    let browser = Browser::new(ScriptedBackend::new());
    let tab = browser.open_tab();
    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    let mut ended = tab.session_ended();

    let err = tab.send(ApiRequest::get("/wallets/")).await.unwrap_err();

    assert!(matches!(err, SessionError::SessionEnded));
    assert_eq!(next_end(&mut ended).await, EndReason::RefreshRejected);
    assert_eq!(browser.backend.refresh_calls(), 1);
    assert!(!tab.is_authenticated().unwrap());
}

#[tokio::test]
async fn test_failed_refresh_logs_out_without_retry() {
    let browser = Browser::new(ScriptedBackend::new().with_refresh_mode(RefreshMode::Reject));
    let tab = browser.open_tab();
    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    let mut ended = tab.session_ended();

    let err = tab.send(ApiRequest::get("/wallets/")).await.unwrap_err();

    assert!(matches!(err, SessionError::SessionEnded));
    assert_eq!(next_end(&mut ended).await, EndReason::RefreshRejected);
    assert_eq!(browser.transport.calls(), 1);
    assert_eq!(browser.shared.get("access").unwrap(), None);
    assert_eq!(browser.shared.get("refresh").unwrap(), None);
}

#[tokio::test]
async fn test_closing_owner_tab_logs_out_next_tab() {
    let browser = Browser::new(ScriptedBackend::new());
    let tab = browser.open_tab();
    tab.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();

    tab.window_closing(WindowSignal::BeforeUnload);
    drop(tab);

    assert_eq!(browser.shared.get(OWNER_KEY).unwrap(), None);
    let next = browser.open_tab();
    assert_eq!(next.state(), OwnershipState::LoggedOut);
}

#[tokio::test]
async fn test_owner_observes_sibling_clear() {
    let browser = Browser::new(ScriptedBackend::new());
    let a = browser.open_tab();
    a.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    let mut ended = a.session_ended();
    let pump = a.run_notifications().unwrap();

    // B opens as a duplicate and clears the pair
    let _b = browser.open_tab();

    assert_eq!(next_end(&mut ended).await, EndReason::RemoteLogout);
    assert_eq!(a.state(), OwnershipState::LoggedOut);
    assert!(!*a.status().borrow());
    pump.abort();
}

#[tokio::test]
async fn test_login_in_other_process_demotes_owner() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new());
    let transport = Arc::new(ScriptedTransport::new());

    let shared_a = FileStorage::open(dir.path(), ORIGIN).unwrap();
    let shared_b = FileStorage::open(dir.path(), ORIGIN).unwrap();
    let a = TabSession::open(
        Arc::new(shared_a.clone()),
        Arc::new(MemoryStorage::new()),
        backend.clone(),
        transport.clone(),
    )
    .unwrap();
    let b = TabSession::open(
        Arc::new(shared_b.clone()),
        Arc::new(MemoryStorage::new()),
        backend.clone(),
        transport.clone(),
    )
    .unwrap();

    a.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    let mut ended = a.session_ended();
    shared_b.sync().unwrap();
    b.process_pending();
    assert_eq!(b.view().unwrap(), OwnershipState::OwnedByOther);

    b.login(TEST_USERNAME, TEST_PASSWORD).await.unwrap();
    assert!(shared_a.sync().unwrap() > 0);
    a.process_pending();

    assert_eq!(next_end(&mut ended).await, EndReason::OwnershipConflict);
    assert!(!a.is_authenticated().unwrap());
    assert!(b.is_authenticated().unwrap());
    assert_eq!(b.access_token().unwrap().as_deref(), Some("access-2"));
}
