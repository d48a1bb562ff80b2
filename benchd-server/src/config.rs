use std::env;
use std::path::PathBuf;

/// Transport-side settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    /// Server → client ping cadence.
    pub heartbeat_interval_ms: u64,
    /// Missing a pong for this long closes the connection.
    pub heartbeat_timeout_ms: u64,
    pub layouts_path: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            heartbeat_interval_ms: env::var("WS_HEARTBEAT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15_000),
            heartbeat_timeout_ms: env::var("WS_HEARTBEAT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(45_000),
            layouts_path: env::var("LAYOUTS_PATH")
                .unwrap_or_else(|_| "./layouts.json".to_string())
                .into(),
        }
    }
}
