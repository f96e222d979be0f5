//! tabsession - one interactive tab of a multi-tab client.
//!
//! Every running process is one tab. Tabs started with the same origin share
//! the session stored under the cache directory; at most one of them owns it.

mod app;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tabsession_core::{AuthClient, Config, FileStorage, MemoryStorage, TabSession};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

// ============================================================================
// Constants
// ============================================================================

/// Log file name in the cache directory
const LOG_FILE: &str = "tabsession.log";

/// Environment overrides
const ENV_API_URL: &str = "TABSESSION_API_URL";
const ENV_USERNAME: &str = "TABSESSION_USERNAME";
const ENV_PASSWORD: &str = "TABSESSION_PASSWORD";

/// Initialize the tracing subscriber for logging.
/// Logs go to a file so they never interleave with the prompt.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: {:#}, using defaults", e);
            Config::default()
        }
    };
    if let Ok(url) = std::env::var(ENV_API_URL) {
        config.api_base_url = url;
    }

    let cache_dir = config.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create {}", cache_dir.display()))?;
    let _log_guard = init_tracing(&cache_dir);
    info!(origin = %config.origin, api = %config.api_base_url, "tabsession starting");

    let client = AuthClient::new(&config.api_base_url, config.request_timeout())
        .context("Failed to build HTTP client")?;
    let shared = FileStorage::open(&cache_dir, &config.origin)
        .context("Failed to open shared session storage")?;
    let watcher = shared.spawn_watcher(config.watch_interval());

    // Tab-local storage lives exactly as long as this process
    let session = TabSession::open(
        Arc::new(shared),
        Arc::new(MemoryStorage::new()),
        Arc::new(client.clone()),
        Arc::new(client.transport()),
    )?;
    let pump = session.run_notifications();

    let username = std::env::var(ENV_USERNAME)
        .ok()
        .or_else(|| config.last_username.clone());
    let password = std::env::var(ENV_PASSWORD).ok();

    let mut app = App::new(config, client, Arc::new(session), username, password);
    let result = app.run().await;

    if let Some(pump) = pump {
        pump.abort();
    }
    watcher.abort();
    info!("tabsession shutting down");
    result
}
