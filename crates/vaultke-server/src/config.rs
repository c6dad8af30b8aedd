//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use vaultke_shared::constants::{DEFAULT_HTTP_PORT, MALFORMED_FRAME_LIMIT, SEND_QUEUE_CAPACITY};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database. When unset the store picks
    /// the platform data directory.
    /// Env: `DATABASE_PATH`
    /// Default: unset
    pub database_path: Option<PathBuf>,

    /// Secret used to mint and verify bearer tokens.
    /// Env: `AUTH_SECRET`
    /// Default: a fixed string (development only).
    pub auth_secret: String,

    /// Capacity of each connection's outbound frame queue. A client that
    /// falls this many frames behind is evicted.
    /// Env: `SEND_QUEUE_CAPACITY`
    /// Default: `256`
    pub send_queue_capacity: usize,

    /// Number of malformed frames tolerated on a socket before the
    /// connection is closed.
    /// Env: `MALFORMED_FRAME_LIMIT`
    /// Default: `8`
    pub malformed_frame_limit: u32,

    /// Sustained HTTP requests per second allowed per client IP.
    /// Env: `HTTP_RATE_PER_SEC`
    /// Default: `10.0`
    pub http_rate: f64,

    /// HTTP request burst capacity per client IP.
    /// Env: `HTTP_RATE_BURST`
    /// Default: `30.0`
    pub http_burst: f64,

    /// Sustained message submissions per second allowed per user.
    /// Env: `SUBMIT_RATE_PER_SEC`
    /// Default: `5.0`
    pub submit_rate: f64,

    /// Message submission burst capacity per user.
    /// Env: `SUBMIT_RATE_BURST`
    /// Default: `20.0`
    pub submit_burst: f64,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("auth_secret", &"[REDACTED]")
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("malformed_frame_limit", &self.malformed_frame_limit)
            .field("http_rate", &self.http_rate)
            .field("http_burst", &self.http_burst)
            .field("submit_rate", &self.submit_rate)
            .field("submit_burst", &self.submit_burst)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            auth_secret: "vaultke-dev-secret".to_string(),
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            malformed_frame_limit: MALFORMED_FRAME_LIMIT,
            http_rate: 10.0,
            http_burst: 30.0,
            submit_rate: 5.0,
            submit_burst: 20.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        match std::env::var("AUTH_SECRET") {
            Ok(secret) if !secret.is_empty() => config.auth_secret = secret,
            _ => {
                tracing::warn!("AUTH_SECRET not set, using development secret");
            }
        }

        if let Ok(val) = std::env::var("SEND_QUEUE_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.send_queue_capacity = n,
                _ => {
                    tracing::warn!(
                        value = %val,
                        "Invalid SEND_QUEUE_CAPACITY, using default"
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("MALFORMED_FRAME_LIMIT") {
            if let Ok(n) = val.parse::<u32>() {
                config.malformed_frame_limit = n;
            }
        }

        if let Ok(val) = std::env::var("HTTP_RATE_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.http_rate = n;
            }
        }

        if let Ok(val) = std::env::var("HTTP_RATE_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.http_burst = n;
            }
        }

        if let Ok(val) = std::env::var("SUBMIT_RATE_PER_SEC") {
            if let Ok(n) = val.parse::<f64>() {
                config.submit_rate = n;
            }
        }

        if let Ok(val) = std::env::var("SUBMIT_RATE_BURST") {
            if let Ok(n) = val.parse::<f64>() {
                config.submit_burst = n;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
