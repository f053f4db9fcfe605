//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DEFAULT_CONNECT_TIMEOUT;
use crate::device::routeros::{DEFAULT_IO_TIMEOUT, DEFAULT_PORT};
use crate::poller::{
    DEFAULT_CONCURRENCY, DEFAULT_DEVICE_TIMEOUT, DEFAULT_GRACE_PERIOD, PollerSettings, Schedule,
};
use crate::storage::db::{DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

use super::device::{DeviceConfig, load_devices_from_dir, validate_devices};
use super::validation::{ConfigError, validate_bind_address};

// =============================================================================
// Constants
// =============================================================================

/// Default sweep interval when neither `interval` nor `cron` is set.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default days samples and events are kept.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_busy_timeout() -> Duration {
    DEFAULT_BUSY_TIMEOUT
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_device_timeout() -> Duration {
    DEFAULT_DEVICE_TIMEOUT
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_io_timeout() -> Duration {
    DEFAULT_IO_TIMEOUT
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path, or `:memory:`.
    pub path: String,

    /// Connection pool size (default: 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a statement waits on a locked database (default: "5s").
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Days samples and events are kept; 0 keeps everything (default: 30).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/routerwatch.db".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

// =============================================================================
// Key Configuration
// =============================================================================

/// Secret key ring location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Directory holding `v{N}.key` files.
    pub path: String,

    /// Pin the active key version instead of using the newest.
    #[serde(default)]
    pub active_version: Option<u32>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            path: "data/keys".to_string(),
            active_version: None,
        }
    }
}

// =============================================================================
// Poller Configuration
// =============================================================================

/// Sweep scheduling and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Run the scheduler under `serve` (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed interval between sweeps (e.g. "60s").
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// 6-field cron expression; mutually exclusive with `interval`.
    #[serde(default)]
    pub cron: Option<String>,

    /// Devices polled at once (default: 16).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for one device (default: "30s").
    #[serde(default = "default_device_timeout", with = "humantime_serde")]
    pub device_timeout: Duration,

    /// Time in-flight devices get on shutdown (default: "10s").
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            cron: None,
            concurrency: DEFAULT_CONCURRENCY,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl PollerConfig {
    /// Resolve the sweep schedule.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        match (&self.interval, &self.cron) {
            (Some(_), Some(_)) => Err(ConfigError::ValidationError(
                "poller: cannot specify both interval and cron".to_string(),
            )),
            (_, Some(expr)) => {
                Schedule::cron(expr).map_err(|e| ConfigError::ValidationError(format!("poller: {e}")))
            }
            (Some(interval), None) => Ok(Schedule::interval(*interval)),
            (None, None) => Ok(Schedule::interval(DEFAULT_POLL_INTERVAL)),
        }
    }

    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            concurrency: self.concurrency,
            device_timeout: self.device_timeout,
            grace_period: self.grace_period,
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// RouterOS API transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Port used when a device address has none (default: 8728).
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Handshake deadline (default: "10s").
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Per-command deadline (default: "30s").
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Allow only one live session per device (default: false).
    #[serde(default)]
    pub exclusive_sessions: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            exclusive_sessions: false,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub keys: KeysConfig,

    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Devices registered at startup if missing.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Path to a directory with additional device files.
    #[serde(default)]
    pub device_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration including the `device_path` directory.
    ///
    /// A relative `device_path` is resolved against the config file's directory.
    pub fn load_with_device_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::load(path)?;

        if let Some(ref device_dir) = config.device_path {
            let dir = resolve_relative(path, device_dir);
            let additional = load_devices_from_dir(&dir.to_string_lossy())?;
            config.devices.extend(additional);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bind_address(&self.server.bind)?;

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database path cannot be empty".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database max_connections must be positive".to_string(),
            ));
        }

        if self.keys.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "keys path cannot be empty".to_string(),
            ));
        }

        if self.keys.active_version == Some(0) {
            return Err(ConfigError::ValidationError(
                "keys active_version starts at 1".to_string(),
            ));
        }

        self.poller.schedule()?;

        if self.poller.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "poller concurrency must be positive".to_string(),
            ));
        }

        if self.poller.device_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "poller device_timeout must be positive".to_string(),
            ));
        }

        if self.transport.default_port == 0 {
            return Err(ConfigError::ValidationError(
                "transport default_port must be non-zero".to_string(),
            ));
        }

        validate_devices(&self.devices)?;

        Ok(())
    }
}

fn resolve_relative(config_path: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    match config_path.parent() {
        Some(parent) => parent.join(target),
        None => target.to_path_buf(),
    }
}
