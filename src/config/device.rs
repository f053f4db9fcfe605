//! Seeded device definitions.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::NewDevice;

use super::validation::{ConfigError, expand_env_vars};

/// A device registered at startup if not already present.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Host, `host:port` or IP.
    #[serde(alias = "ip")]
    pub address: String,

    #[serde(alias = "user")]
    pub username: String,

    /// Plaintext or `${VAR}` / `${VAR:-default}`.
    pub password: String,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DeviceConfig {
    /// Registry input with environment references in the password resolved.
    pub fn to_new_device(&self) -> NewDevice {
        NewDevice::new(
            &self.name,
            &self.address,
            &self.username,
            expand_env_vars(&self.password),
        )
    }
}

/// File layout for `device_path` includes.
#[derive(Debug, Default, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

/// Validate seeded devices: required fields present, names unique.
pub fn validate_devices(devices: &[DeviceConfig]) -> Result<(), ConfigError> {
    let mut seen_names = HashSet::new();

    for device in devices {
        if device.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "device name cannot be empty".to_string(),
            ));
        }
        if !seen_names.insert(device.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate device name: '{}'",
                device.name
            )));
        }
        device.to_new_device().validate().map_err(|e| {
            ConfigError::ValidationError(format!("device '{}': {}", device.name, e))
        })?;
    }

    Ok(())
}

/// Load device definitions from all YAML files in a directory.
pub fn load_devices_from_dir(dir_path: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let dir = Path::new(dir_path);
    if !dir.exists() {
        return Err(ConfigError::ValidationError(format!(
            "device_path '{}' does not exist",
            dir_path
        )));
    }
    if !dir.is_dir() {
        return Err(ConfigError::ValidationError(format!(
            "device_path '{}' is not a directory",
            dir_path
        )));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if path.is_file() && (ext == "yaml" || ext == "yml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut devices = Vec::new();
    for path in paths {
        tracing::debug!("Loading device config from: {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        let file: DeviceFile = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ValidationError(format!("failed to parse '{}': {}", path.display(), e))
        })?;
        devices.extend(file.devices);
    }

    Ok(devices)
}
