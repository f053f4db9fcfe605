//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cipher::SecretCipher;
use crate::storage::db::{DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_CONNECTIONS, SqlitePool};
use crate::storage::schema::init_schema;
use crate::storage::{
    DeviceStore, EventReader, EventWriter, MetricReader, MetricWriter, StorageAdmin, StorageError,
};

/// Path value selecting a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_path: PathBuf,
    max_connections: u32,
    busy_timeout: Duration,
}

impl StorageBuilder {
    /// Create a new storage builder for a database file.
    ///
    /// Pass [`MEMORY_PATH`] for a throwaway in-memory database.
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Set the connection pool size.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set how long a statement waits on a locked database.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn url(&self) -> String {
        if self.db_path.as_os_str() == MEMORY_PATH {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", self.db_path.display())
        }
    }

    /// Open the database, apply the schema and return handles.
    pub async fn build(self, cipher: Arc<SecretCipher>) -> Result<StorageHandles, StorageError> {
        if self.db_path.as_os_str() != MEMORY_PATH
            && let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = SqlitePool::connect(&self.url(), self.max_connections, self.busy_timeout).await?;
        init_schema(&pool).await?;

        tracing::info!(path = %self.db_path.display(), "Storage opened");

        Ok(StorageHandles {
            device_store: DeviceStore::new(pool.clone(), cipher),
            metric_writer: MetricWriter::new(pool.clone()),
            metric_reader: MetricReader::new(pool.clone()),
            event_writer: EventWriter::new(pool.clone()),
            event_reader: EventReader::new(pool.clone()),
            storage_admin: StorageAdmin::new(pool.clone()),
            pool,
        })
    }
}

/// Handles to all storage layer facades.
#[derive(Clone)]
pub struct StorageHandles {
    /// Device registry.
    pub device_store: DeviceStore,
    /// Default metrics sink.
    pub metric_writer: MetricWriter,
    /// Facade for reading stored samples.
    pub metric_reader: MetricReader,
    /// Facade for recording events.
    pub event_writer: EventWriter,
    /// Facade for reading events.
    pub event_reader: EventReader,
    /// Retention cleanup.
    pub storage_admin: StorageAdmin,
    pool: SqlitePool,
}

impl StorageHandles {
    /// Close the pool, waiting for in-flight statements to finish.
    pub async fn shutdown(self) {
        self.pool.close().await;
        tracing::info!("Storage closed");
    }
}
