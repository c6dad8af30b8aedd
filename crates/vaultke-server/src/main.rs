//! # vaultke-server
//!
//! End-to-end encrypted messaging backend for VaultKe savings groups.
//!
//! This binary provides:
//! - **Key directory** for device registration, signed pre-key rotation and
//!   one-time pre-key bundle draws
//! - **Pairwise and group ciphers** driven against the session store, so
//!   chama rooms and private chats stay encrypted at rest
//! - **Relay hub** that fans encrypted messages out to room subscribers
//!   over WebSocket
//! - **REST API** (axum) for rooms, the message archive and safety numbers
//! - **Per-IP and per-user rate limiting** to protect against abuse

mod api;
mod auth;
mod config;
mod error;
mod hub;
mod rate_limit;
mod service;
mod ws;

use tracing::info;
use tracing_subscriber::EnvFilter;

use vaultke_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vaultke_server=debug")),
        )
        .init();

    info!(
        "Starting VaultKe messaging server v{}",
        env!("CARGO_PKG_VERSION")
    );

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // SQLite store (creates the file and runs migrations if needed)
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::open_default()?,
    };
    if let Some(path) = db.path() {
        info!(path = %path.display(), "Database ready");
    }

    // Relay hub director
    let (hub, hub_handle) = Hub::spawn();

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, db, hub.clone());

    // Local development convenience: with the default secret, print a
    // ready-to-use bearer token.
    if app_state.config.auth_secret == ServerConfig::default().auth_secret {
        let token = auth::mint_token(&app_state.config.auth_secret, "dev", 86_400);
        info!(%token, "Development bearer token for user 'dev'");
    }

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_limiter = app_state.http_limiter.clone();
    let submit_limiter = app_state.submit_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_stale(600.0).await;
            submit_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 6. Graceful shutdown: close every connection's send channel
    // -----------------------------------------------------------------------
    hub.shutdown();
    let _ = hub_handle.await;

    Ok(())
}
