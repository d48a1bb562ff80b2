//! Environment-driven configuration.
//!
//! Every tunable is loaded once into a plain struct and passed down
//! explicitly; no module reads the environment after startup.

use std::env;
use std::path::PathBuf;

use crate::device::DeviceSpec;
use crate::error::{BenchError, Result};

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Discovery + serial handshake settings (`SERIAL_*`).
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub required_devices: Vec<DeviceSpec>,
    pub rescan_ms: u64,
    pub default_baud: u32,
    pub identify_request: String,
    pub identify_completion: String,
    pub parser_delim: String,
    pub write_eol: String,
    pub identify_timeout_ms: u64,
    pub retries: u32,
    pub fail_on_missing: bool,
    pub startup_timeout_ms: u64,
}

impl SerialConfig {
    pub fn from_env() -> Result<Self> {
        let required_devices = match env::var("SERIAL_REQUIRED_DEVICES_JSON") {
            Ok(raw) => serde_json::from_str::<Vec<DeviceSpec>>(&raw).map_err(|e| {
                BenchError::Config(format!("SERIAL_REQUIRED_DEVICES_JSON did not parse: {e}"))
            })?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            required_devices,
            // Poll floor guards against hammering the USB bus.
            rescan_ms: env_u64("SERIAL_RESCAN_MS", 3000).max(1000),
            default_baud: env_u32("SERIAL_DEFAULT_BAUD", 9600),
            identify_request: env_string("SERIAL_IDENTIFY_REQUEST", "identify"),
            identify_completion: env_string("SERIAL_IDENTIFY_COMPLETION", "identify_complete"),
            parser_delim: env_string("SERIAL_PARSER_DELIM", "\n"),
            write_eol: env_string("SERIAL_WRITE_EOL", "\n"),
            identify_timeout_ms: env_u64("SERIAL_TIMEOUT_MS", 3000),
            retries: env_u32("SERIAL_RETRIES", 3).max(1),
            fail_on_missing: env_bool("SERIAL_FAIL_ON_MISSING", false),
            startup_timeout_ms: env_u64("SERIAL_STARTUP_TIMEOUT_MS", 30_000),
        })
    }
}

/// Reconnect backoff bounds shared by all supervised links.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 1000,
            max_delay_ms: 15_000,
            max_attempts: 0,
        }
    }
}

/// PS/2 keyboard emulator settings (`PS2_KB_*`).
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    pub kind: String,
    pub id_token: String,
    pub baud: u32,
    pub reconnect: ReconnectConfig,
    pub inter_command_delay_ms: u64,
    pub queue_max_depth: usize,
}

impl KeyboardConfig {
    pub fn from_env() -> Self {
        Self {
            kind: env_string("PS2_KB_KIND", "ps2-keyboard"),
            id_token: env_string("PS2_KB_ID_TOKEN", "KB"),
            baud: env_u32("PS2_KB_BAUD", 9600),
            reconnect: ReconnectConfig {
                enabled: true,
                base_delay_ms: env_u64("PS2_KB_RECONNECT_BASE_MS", 1000),
                max_delay_ms: env_u64("PS2_KB_RECONNECT_MAX_MS", 15_000),
                max_attempts: env_u32("PS2_KB_RECONNECT_MAX_ATTEMPTS", 0),
            },
            inter_command_delay_ms: env_u64("PS2_KB_INTER_COMMAND_DELAY_MS", 25),
            queue_max_depth: env_usize("PS2_KB_QUEUE_MAX_DEPTH", 500),
        }
    }
}

/// Front-panel power sense settings (`FRONT_PANEL_*`).
#[derive(Debug, Clone)]
pub struct FrontPanelConfig {
    pub kind: String,
    pub id_token: String,
    pub baud: u32,
    pub reconnect: ReconnectConfig,
}

impl FrontPanelConfig {
    pub fn from_env() -> Self {
        Self {
            kind: env_string("FRONT_PANEL_KIND", "front-panel"),
            id_token: env_string("FRONT_PANEL_ID_TOKEN", "FP"),
            baud: env_u32("FRONT_PANEL_BAUD", 9600),
            reconnect: ReconnectConfig {
                enabled: true,
                base_delay_ms: env_u64("FRONT_PANEL_RECONNECT_BASE_MS", 1000),
                max_delay_ms: env_u64("FRONT_PANEL_RECONNECT_MAX_MS", 15_000),
                max_attempts: env_u32("FRONT_PANEL_RECONNECT_MAX_ATTEMPTS", 0),
            },
        }
    }
}

/// CompactFlash imager settings (`CF_IMAGER_*`). `CF_IMAGER_ROOT` is the one
/// required variable in the whole config surface.
#[derive(Debug, Clone)]
pub struct ImagerConfig {
    pub kind: String,
    pub root_dir: PathBuf,
    pub read_script: PathBuf,
    pub write_script: PathBuf,
    pub max_entries: usize,
    pub fs_poll_ms: u64,
    /// Lowercase, no dots. Empty means no filter.
    pub visible_extensions: Vec<String>,
}

impl ImagerConfig {
    pub fn from_env() -> Result<Self> {
        let root_dir = env::var("CF_IMAGER_ROOT")
            .map(PathBuf::from)
            .map_err(|_| BenchError::Config("CF_IMAGER_ROOT is required".into()))?;

        Ok(Self {
            kind: env_string("CF_IMAGER_KIND", "cf-reader"),
            root_dir,
            read_script: env_string("CF_IMAGER_READ_SCRIPT", "cf-read.sh").into(),
            write_script: env_string("CF_IMAGER_WRITE_SCRIPT", "cf-write.sh").into(),
            max_entries: env_usize("CF_IMAGER_MAX_ENTRIES", 500),
            fs_poll_ms: env_u64("CF_IMAGER_FS_POLL_MS", 3000),
            visible_extensions: env::var("CF_IMAGER_VISIBLE_EXTENSIONS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

/// Everything the orchestrator needs, loaded in one shot.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub serial: SerialConfig,
    pub keyboard: KeyboardConfig,
    pub front_panel: FrontPanelConfig,
    pub imager: ImagerConfig,
}

impl BenchConfig {
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Ok(Self {
            serial: SerialConfig::from_env()?,
            keyboard: KeyboardConfig::from_env(),
            front_panel: FrontPanelConfig::from_env(),
            imager: ImagerConfig::from_env()?,
        })
    }
}
