//! Storage Layer
//!
//! Async SQLite storage on a sqlx pool, WAL mode with durable commits.
//!
//! # Components
//!
//! - [`DeviceStore`]: Device registry with sealed credentials
//! - [`MetricWriter`] / [`MetricReader`]: Metrics sink and sample queries
//! - [`EventWriter`] / [`EventReader`]: Operational event log
//! - [`StorageAdmin`]: Retention cleanup
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod builder;
pub mod db;
mod device_store;
mod error;
mod facades;
mod schema;
mod types;

pub use builder::{MEMORY_PATH, StorageBuilder, StorageHandles};
pub use device_store::{DeviceRecord, DeviceStore, DeviceSummary, NewDevice, RegistryError};
pub use error::StorageError;
pub use facades::{
    EventQuery, EventReader, EventWriter, MetricQuery, MetricReader, MetricWriter, SortOrder,
    StorageAdmin,
};
pub use types::{Event, EventKind, EventSeverity, sources};
