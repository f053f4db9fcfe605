//! Metrics sink abstraction.
//!
//! The poller hands every successful collection to a [`MetricsSink`]. The
//! sink is an injected capability: the SQLite-backed
//! [`MetricWriter`](crate::storage::MetricWriter) is the default, tests
//! substitute recording sinks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// One telemetry reading for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub device_id: i64,
    pub collected_at: DateTime<Utc>,
    /// The device-reported document, passed through unchanged.
    pub payload: serde_json::Value,
}

impl MetricsSample {
    /// Create a sample stamped with the current time.
    pub fn new(device_id: i64, payload: serde_json::Value) -> Self {
        Self {
            device_id,
            collected_at: Utc::now(),
            payload,
        }
    }
}

/// Sink write failure.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for collected telemetry.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Record one sample. Implementations must be safe under concurrent use.
    async fn write(&self, sample: MetricsSample) -> Result<(), SinkError>;
}
