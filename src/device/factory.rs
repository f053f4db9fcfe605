//! Device Client Factory.
//!
//! Turns a registry record into a live session: load, decrypt, connect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use super::query::DeviceQuery;
use super::traits::{Credentials, DeviceConnector, DeviceError, DeviceSession, Record};
use crate::cipher::CipherError;
use crate::error::ErrorKind;
use crate::storage::{DeviceRecord, DeviceStore, RegistryError, StorageError};

/// Default handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while opening or using a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device {0} not found")]
    NotFound(i64),

    /// Stored secret does not open under the loaded keys.
    #[error("device {device_id}: cannot decrypt stored secret: {source}")]
    Decryption {
        device_id: i64,
        #[source]
        source: CipherError,
    },

    #[error("device {device_id}: {source}")]
    Connection {
        device_id: i64,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Decryption { .. } => ErrorKind::Decryption,
            Self::Connection { source, .. } => source.kind(),
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            RegistryError::Storage(e) => Self::Storage(e),
            other => Self::Storage(StorageError::Internal(other.to_string())),
        }
    }
}

/// Opens sessions for registered devices.
///
/// When the transport permits only one session per device, opens for the
/// same id queue behind each other; different devices never wait on each other.
#[derive(Clone)]
pub struct SessionFactory {
    devices: DeviceStore,
    connector: Arc<dyn DeviceConnector>,
    connect_timeout: Duration,
    exclusive: bool,
    locks: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("transport", &self.connector.transport())
            .field("connect_timeout", &self.connect_timeout)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    /// Create a factory over a registry and a transport.
    pub fn new(devices: DeviceStore, connector: Arc<dyn DeviceConnector>) -> Self {
        let exclusive = connector.exclusive_sessions();
        Self {
            devices,
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            exclusive,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the handshake deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Force one live session per device, regardless of what the transport reports.
    pub fn with_exclusive_sessions(mut self, exclusive: bool) -> Self {
        self.exclusive = self.exclusive || exclusive;
        self
    }

    /// Registry backing this factory.
    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    /// Open a session for a device id.
    pub async fn open(&self, device_id: i64) -> Result<OpenSession, SessionError> {
        let record = self.devices.get_device(device_id).await?;
        self.open_record(&record).await
    }

    /// Open a session for an already-loaded record.
    pub async fn open_record(&self, record: &DeviceRecord) -> Result<OpenSession, SessionError> {
        let password = self
            .devices
            .open_secret(&record.secret)
            .map_err(|source| {
                tracing::error!(
                    device_id = record.id,
                    device = %record.name,
                    key_version = record.secret.key_version,
                    error = %source,
                    "Stored secret does not decrypt; key ring and registry have drifted"
                );
                SessionError::Decryption {
                    device_id: record.id,
                    source,
                }
            })?;

        let credentials = Credentials {
            address: record.address.clone(),
            username: record.username.clone(),
            password,
        };

        let exclusive = match self.device_lock(record.id) {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };

        let connection_err = |source| SessionError::Connection {
            device_id: record.id,
            source,
        };
        let session = tokio::time::timeout(self.connect_timeout, self.connector.connect(&credentials))
            .await
            .map_err(|_| connection_err(DeviceError::Timeout))?
            .map_err(connection_err)?;

        tracing::debug!(
            device_id = record.id,
            transport = self.connector.transport(),
            "Session opened"
        );

        Ok(OpenSession {
            device_id: record.id,
            session,
            _exclusive: exclusive,
        })
    }

    /// Open, run one query, close.
    pub async fn query<Q: DeviceQuery>(
        &self,
        device_id: i64,
        query: &Q,
    ) -> Result<Q::Output, SessionError> {
        let record = self.devices.get_device(device_id).await?;
        self.query_record(&record, query).await
    }

    /// Open, run one query, close, for an already-loaded record.
    ///
    /// The session is closed whether or not the query succeeded.
    pub async fn query_record<Q: DeviceQuery>(
        &self,
        record: &DeviceRecord,
        query: &Q,
    ) -> Result<Q::Output, SessionError> {
        let mut session = self.open_record(record).await?;
        let result = session.query(query).await;
        session.close().await;
        result.map_err(|source| SessionError::Connection {
            device_id: record.id,
            source,
        })
    }

    fn device_lock(&self, device_id: i64) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if !self.exclusive {
            return None;
        }
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Some(Arc::clone(locks.entry(device_id).or_default()))
    }
}

/// A live session handed out by [`SessionFactory`].
///
/// Holds the per-device slot, if any, until dropped. Call [`close`](Self::close)
/// for an orderly shutdown; dropping still releases the transport.
pub struct OpenSession {
    device_id: i64,
    session: Box<dyn DeviceSession>,
    _exclusive: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for OpenSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSession")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl OpenSession {
    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    /// Issue a typed query.
    pub async fn query<Q: DeviceQuery>(&mut self, query: &Q) -> Result<Q::Output, DeviceError> {
        self.session.query(query).await
    }

    /// Issue a raw command.
    pub async fn run_command(
        &mut self,
        command: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<Record>, DeviceError> {
        self.session.run_command(command, args).await
    }

    /// Close the session and release the device slot.
    pub async fn close(mut self) {
        self.session.close().await;
        tracing::debug!(device_id = self.device_id, "Session closed");
    }
}
