//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL of the user store
    pub database_url: String,
    /// Maximum size of one inbound text frame in bytes
    pub max_frame_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Seconds to wait for an `authenticate` envelope before dropping the
    /// connection
    pub auth_timeout_seconds: u64,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
    /// Seconds before a ringing call is rejected as unanswered.
    /// None (the default) never times a ringing call out, matching the
    /// original protocol; enabling this is a deliberate extension.
    pub call_ring_timeout_seconds: Option<u64>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("CW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("CW_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid CW_PORT")?,
            database_url: env::var("CW_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/chatwire.db".to_string()),
            max_frame_size: env::var("CW_MAX_FRAME_SIZE")
                .unwrap_or_else(|_| "65536".to_string()) // 64KB
                .parse()
                .context("Invalid CW_MAX_FRAME_SIZE")?,
            ws_ping_interval: env::var("CW_WS_PING_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid CW_WS_PING_INTERVAL")?,
            auth_timeout_seconds: env::var("CW_AUTH_TIMEOUT")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("Invalid CW_AUTH_TIMEOUT")?,
            max_connections: env::var("CW_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid CW_MAX_CONNECTIONS")?,
            max_connections_per_ip: env::var("CW_MAX_CONNECTIONS_PER_IP")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid CW_MAX_CONNECTIONS_PER_IP")?,
            cors_origins: env::var("CW_CORS_ORIGINS").ok(),
            admin_token: env::var("CW_ADMIN_TOKEN").ok(),
            call_ring_timeout_seconds: match env::var("CW_CALL_RING_TIMEOUT") {
                Ok(raw) => Some(raw.parse().context("Invalid CW_CALL_RING_TIMEOUT")?),
                Err(_) => None,
            },
        };

        Ok(config)
    }
}
