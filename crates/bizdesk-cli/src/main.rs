//! bizdesk - a console client for the bizdesk business backend.
//!
//! Sign in, issue API calls, and get signed out automatically after a
//! period of inactivity.

mod app;
mod command;
mod notifier;

use anyhow::{Context, Result};
use bizdesk_core::{ApiClient, Config, SessionLifecycle};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

/// Log directory under the cache directory
const LOG_DIR: &str = "logs";

/// Log file name prefix (rotated daily)
const LOG_FILE: &str = "bizdesk.log";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to a rolling file so they never interleave with the console.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match Config::cache_dir() {
        Ok(cache_dir) => {
            let appender = tracing_appender::rolling::daily(cache_dir.join(LOG_DIR), LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    info!("bizdesk starting");

    let config = Config::load().context("Failed to load configuration")?;
    let lifecycle = SessionLifecycle::new(config.credential_store()?, config.idle_config());
    let client = ApiClient::new(config.api_settings(), lifecycle.clone())
        .context("Failed to create API client")?;

    if lifecycle.restore() {
        println!("Resumed your previous session.");
    }

    let notifier = notifier::spawn(lifecycle.clone());
    let result = App::new(config, client).run().await;
    notifier.abort();

    if let Err(ref e) = result {
        eprintln!("Error: {:#}", e);
    }

    info!("bizdesk shutting down");
    result
}
