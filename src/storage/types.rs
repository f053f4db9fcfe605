//! Core data types for the storage layer.
//!
//! - [`Event`]: Structured event records for poll failures, sweeps, and audit logs
//! - [`EventKind`]: Classification of event nature/handling
//! - [`EventSeverity`]: Priority levels for event delivery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Well-known event sources.
pub mod sources {
    pub const SYSTEM: &str = "system";
    pub const POLLER: &str = "poller";
    pub const SCHEDULER: &str = "poller.scheduler";
    pub const REGISTRY: &str = "registry";
}

/// An event record stored in the `events` table.
///
/// Events represent discrete occurrences in the system, such as per-device
/// poll failures, sweep summaries, or audit logs. Each event has a source
/// identifier, type classification, and severity level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated event identifier.
    pub id: Option<i64>,
    /// Event timestamp (UTC).
    pub ts: DateTime<Utc>,
    /// Event origin (e.g., "poller", "registry").
    pub source: String,
    /// Event nature/handling class.
    pub kind: EventKind,
    /// Delivery priority/urgency.
    pub severity: EventSeverity,
    /// Short human-readable description.
    pub message: String,
    /// Context snapshot as a JSON object.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(
        source: impl Into<String>,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            ts: Utc::now(),
            source: source.into(),
            kind,
            severity,
            message: message.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Add a payload field.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.payload {
            map.insert(key.into(), value.into());
        }
        self
    }
}

/// Event kind classification.
///
/// Categorizes events by their nature and intended handling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventKind {
    /// Condition needing operator attention (e.g., key drift).
    Alert,
    /// Per-device or system error.
    Error,
    /// Internal system event (e.g., startup, sweep summary).
    System,
    /// Audit trail entry (registrations, key rotations).
    Audit,
}

/// Event severity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    /// Verbose diagnostic information.
    Debug,
    /// Normal operational information.
    Info,
    /// Potential issue that may require attention.
    Warn,
    /// Error condition requiring investigation.
    Error,
    /// Severe failure requiring immediate action.
    Critical,
}
