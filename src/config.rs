//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags** — `--port`, `--baud`, `--apn` (applied by the binary)
//! 2. **Environment variables** — `SIM800CTL_PORT`, `SIM800CTL_APN`
//! 3. **Config file** — path via `--config <path>`, or `sim800ctl.toml`
//!    in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! path = "/dev/ttyUSB0"
//! baudrate = 115200
//! read_timeout_ms = 100   # termios VTIME granularity
//!
//! [lock]
//! file = "/tmp/sim800ctl.lock"
//! enabled = true
//!
//! [gprs]
//! apn = "internet"
//! cid = 1
//! # user = "wap"
//! # password = "wap"
//! keep_bearer_open = false
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::lock::DEFAULT_LOCKFILE;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModemConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub gprs: GprsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device node (default `/dev/ttyUSB0`).
    #[serde(default = "default_serial_path")]
    pub path: String,
    /// Baudrate (default 115200; SIM800 boards often ship at 9600).
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Per-read idle window in milliseconds, mapped to termios VTIME
    /// deciseconds (default 100).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: default_serial_path(),
            baudrate: default_baudrate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Inter-process lockfile settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Lockfile path (default `/tmp/sim800ctl.lock`).
    #[serde(default = "default_lockfile")]
    pub file: String,
    /// Set false to disable the inter-process layer entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            file: default_lockfile(),
            enabled: true,
        }
    }
}

impl LockConfig {
    /// Effective lockfile path, `None` when disabled.
    #[must_use]
    pub fn lockfile(&self) -> Option<PathBuf> {
        self.enabled.then(|| PathBuf::from(&self.file))
    }
}

/// GPRS bearer settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GprsConfig {
    /// Access point name. Required for sessions; no sane default exists.
    pub apn: Option<String>,
    /// PDP context id (default 1).
    #[serde(default = "default_cid")]
    pub cid: u8,
    /// APN username.
    pub user: Option<String>,
    /// APN password.
    pub password: Option<String>,
    /// Leave the bearer up when a session ends (default false).
    #[serde(default)]
    pub keep_bearer_open: bool,
}

/// Log verbosity.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Tracing filter (default `info`); `RUST_LOG` overrides.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_serial_path() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_lockfile() -> String {
    DEFAULT_LOCKFILE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_cid() -> u8 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ModemConfig {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure).
    /// Otherwise looks for `sim800ctl.toml` in the current directory,
    /// falling back to compiled defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sim800ctl.toml").exists() {
            let content = std::fs::read_to_string("sim800ctl.toml")
                .expect("Failed to read sim800ctl.toml");
            toml::from_str(&content).expect("Failed to parse sim800ctl.toml")
        } else {
            ModemConfig::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("SIM800CTL_PORT") {
            config.serial.path = port;
        }
        if let Ok(apn) = std::env::var("SIM800CTL_APN") {
            config.gprs.apn = Some(apn);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModemConfig::default();
        assert_eq!(config.serial.path, "/dev/ttyUSB0");
        assert_eq!(config.serial.baudrate, 115_200);
        assert_eq!(config.gprs.cid, 1);
        assert!(config.gprs.apn.is_none());
        assert!(!config.gprs.keep_bearer_open);
        assert_eq!(config.lock.lockfile(), Some(PathBuf::from(DEFAULT_LOCKFILE)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ModemConfig = toml::from_str(
            r#"
            [serial]
            path = "/dev/serial0"
            baudrate = 9600

            [gprs]
            apn = "internet"
            keep_bearer_open = true
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.path, "/dev/serial0");
        assert_eq!(config.serial.baudrate, 9600);
        assert_eq!(config.serial.read_timeout_ms, 100);
        assert_eq!(config.gprs.apn.as_deref(), Some("internet"));
        assert!(config.gprs.keep_bearer_open);
        assert_eq!(config.gprs.cid, 1);
    }

    #[test]
    fn test_lock_can_be_disabled() {
        let config: ModemConfig = toml::from_str("[lock]\nenabled = false\n").unwrap();
        assert_eq!(config.lock.lockfile(), None);
    }
}
