//! Configuration module for routerwatch.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database and key ring locations
//! - Poller schedule and transport tuning
//! - Seeded devices, inline or from an include directory

mod app;
mod device;
mod validation;

pub use app::{
    AppConfig, DEFAULT_POLL_INTERVAL, DEFAULT_RETENTION_DAYS, DatabaseConfig, KeysConfig, PollerConfig, ServerConfig,
    TransportConfig,
};
pub use device::{DeviceConfig, load_devices_from_dir};
pub use validation::{ConfigError, expand_env_vars};
