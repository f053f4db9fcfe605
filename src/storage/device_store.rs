//! Device registry storage.
//!
//! Durable store of device records. Secrets are sealed by the
//! [`SecretCipher`] before they reach the database and are never held here in
//! plaintext.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{CipherError, SealedSecret, SecretCipher};
use crate::error::ErrorKind;
use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

// =============================================================================
// Types
// =============================================================================

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Caller supplied invalid input.
    #[error("validation error: {0}")]
    Validation(String),

    /// No device with this id.
    #[error("device {0} not found")]
    NotFound(i64),

    /// Sealing or re-sealing a secret failed.
    #[error("device {device_id}: {source}")]
    Cipher {
        device_id: i64,
        #[source]
        source: CipherError,
    },

    /// Encrypting a new secret failed.
    #[error("encryption error: {0}")]
    Encrypt(#[source] CipherError),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RegistryError {
    /// Failure category. Only a stored secret that cannot be opened counts as
    /// decryption; failing to seal a new one is a storage fault.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cipher {
                source: CipherError::Decryption { .. } | CipherError::UnknownKeyVersion(_),
                ..
            } => ErrorKind::Decryption,
            Self::Cipher { .. } | Self::Encrypt(_) | Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(e))
    }
}

/// Input for registering a device. The password is plaintext and is wiped on drop.
#[derive(Clone)]
pub struct NewDevice {
    pub name: String,
    pub address: String,
    pub username: String,
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for NewDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewDevice")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl NewDevice {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Reject empty required fields.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let fields = [
            ("name", self.name.as_str()),
            ("address", self.address.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(RegistryError::Validation(format!("{field} is required")));
            }
        }
        if self.address.trim().chars().any(char::is_whitespace) {
            return Err(RegistryError::Validation(format!(
                "address '{}' must not contain whitespace",
                self.address.trim()
            )));
        }
        Ok(())
    }
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub username: String,
    /// Sealed credential, never plaintext.
    pub secret: SealedSecret,
    pub created_at: DateTime<Utc>,
}

/// Public view of a device, without the credential.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub username: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&DeviceRecord> for DeviceSummary {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            address: record.address.clone(),
            username: record.username.clone(),
            key_version: record.secret.key_version,
            created_at: record.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    name: String,
    address: String,
    username: String,
    secret_ciphertext: Vec<u8>,
    key_version: i64,
    created_at: i64,
}

impl TryFrom<DeviceRow> for DeviceRecord {
    type Error = StorageError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let key_version = u32::try_from(row.key_version).map_err(|_| {
            StorageError::InvalidData(format!(
                "device {}: invalid key_version {}",
                row.id, row.key_version
            ))
        })?;

        Ok(Self {
            id: row.id,
            name: row.name,
            address: row.address,
            username: row.username,
            secret: SealedSecret {
                key_version,
                ciphertext: row.secret_ciphertext,
            },
            created_at: DateTime::from_timestamp_millis(row.created_at)
                .unwrap_or(DateTime::UNIX_EPOCH),
        })
    }
}

const SELECT_DEVICE: &str =
    "SELECT id, name, address, username, secret_ciphertext, key_version, created_at FROM devices";

// =============================================================================
// Device Store
// =============================================================================

/// Device registry facade.
///
/// Clones share one cipher slot, so a key reload seen by one handle is seen
/// by all of them.
#[derive(Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
    cipher: Arc<RwLock<Arc<SecretCipher>>>,
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore").finish_non_exhaustive()
    }
}

impl DeviceStore {
    /// Create a new device store.
    pub fn new(pool: SqlitePool, cipher: Arc<SecretCipher>) -> Self {
        Self {
            pool,
            cipher: Arc::new(RwLock::new(cipher)),
        }
    }

    /// Cipher currently used to seal secrets.
    pub fn cipher(&self) -> Arc<SecretCipher> {
        let guard = self.cipher.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Open a stored secret.
    ///
    /// A record sealed under a version this process has not loaded means the
    /// key ring was rotated by another process; the key directory is re-read
    /// once before giving up.
    pub fn open_secret(&self, sealed: &SealedSecret) -> Result<Zeroizing<String>, CipherError> {
        match self.cipher().decrypt(sealed) {
            Err(CipherError::UnknownKeyVersion(version)) => {
                self.reload_keys(version)?.decrypt(sealed)
            }
            result => result,
        }
    }

    fn reload_keys(&self, wanted: u32) -> Result<Arc<SecretCipher>, CipherError> {
        let mut slot = self.cipher.write().unwrap_or_else(|e| e.into_inner());
        if slot.has_version(wanted) {
            return Ok(Arc::clone(&*slot));
        }

        let previous = slot.active_version();
        let fresh = Arc::new(slot.reload()?);
        tracing::info!(
            wanted,
            previous_active = previous,
            active = fresh.active_version(),
            "Key ring reloaded from disk"
        );
        *slot = Arc::clone(&fresh);
        Ok(fresh)
    }

    /// Register a device and return its id.
    ///
    /// The secret is sealed under the active key before it is written.
    pub async fn add_device(&self, device: &NewDevice) -> Result<i64, RegistryError> {
        device.validate()?;
        let sealed = self
            .cipher()
            .encrypt(&device.password)
            .map_err(RegistryError::Encrypt)?;

        let result = sqlx::query(
            "INSERT INTO devices (name, address, username, secret_ciphertext, key_version, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(device.name.trim())
        .bind(device.address.trim())
        .bind(device.username.trim())
        .bind(&sealed.ciphertext)
        .bind(i64::from(sealed.key_version))
        .bind(Utc::now().timestamp_millis())
        .execute(self.pool.inner())
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!(device_id = id, device = %device.name, "Device registered");
        Ok(id)
    }

    /// Register a device unless one with the same name and address exists.
    ///
    /// Returns the new id, or `None` if the device was already registered.
    pub async fn insert_if_not_exists(
        &self,
        device: &NewDevice,
    ) -> Result<Option<i64>, RegistryError> {
        device.validate()?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM devices WHERE name = ? AND address = ? LIMIT 1")
                .bind(device.name.trim())
                .bind(device.address.trim())
                .fetch_optional(self.pool.inner())
                .await?;

        if existing.is_some() {
            return Ok(None);
        }
        self.add_device(device).await.map(Some)
    }

    /// Fetch one device.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` if no record has this id.
    pub async fn get_device(&self, id: i64) -> Result<DeviceRecord, RegistryError> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!("{SELECT_DEVICE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;

        match row {
            Some(row) => Ok(DeviceRecord::try_from(row)?),
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// Snapshot of all devices in insertion order.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, RegistryError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!("{SELECT_DEVICE} ORDER BY id"))
            .fetch_all(self.pool.inner())
            .await?;

        rows.into_iter()
            .map(|row| DeviceRecord::try_from(row).map_err(RegistryError::from))
            .collect()
    }

    /// Number of registered devices.
    pub async fn count(&self) -> Result<i64, RegistryError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.0)
    }

    /// Re-seal every secret that is not under the active key version.
    ///
    /// Runs in a single transaction: either every stale record is re-sealed
    /// or none is. Returns the number of records updated.
    pub async fn reencrypt_all(&self) -> Result<usize, RegistryError> {
        let cipher = self.cipher();
        let active = cipher.active_version();
        let mut tx = self.pool.inner().begin().await?;

        let rows: Vec<DeviceRow> =
            sqlx::query_as(&format!("{SELECT_DEVICE} WHERE key_version != ? ORDER BY id"))
                .bind(i64::from(active))
                .fetch_all(&mut *tx)
                .await?;

        let mut updated = 0;
        for row in rows {
            let record = DeviceRecord::try_from(row)?;
            let cipher_err = |source| RegistryError::Cipher {
                device_id: record.id,
                source,
            };

            let plaintext = cipher.decrypt(&record.secret).map_err(cipher_err)?;
            let sealed = cipher.encrypt(&plaintext).map_err(cipher_err)?;

            sqlx::query("UPDATE devices SET secret_ciphertext = ?, key_version = ? WHERE id = ?")
                .bind(&sealed.ciphertext)
                .bind(i64::from(sealed.key_version))
                .bind(record.id)
                .execute(&mut *tx)
                .await?;
            updated += 1;
        }

        tx.commit().await?;
        tracing::info!(updated, active_version = active, "Device secrets re-sealed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KeyRing;
    use crate::storage::db::{DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
    use crate::storage::schema::init_schema;
    use tempfile::{TempDir, tempdir};

    async fn create_test_store() -> (DeviceStore, TempDir) {
        let keys = tempdir().unwrap();
        let ring = KeyRing::load_or_init(keys.path()).unwrap();
        let cipher = Arc::new(SecretCipher::new(&ring).unwrap());

        let pool = SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS, DEFAULT_BUSY_TIMEOUT)
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        (DeviceStore::new(pool, cipher), keys)
    }

    fn edge1() -> NewDevice {
        NewDevice::new("edge-1", "10.0.0.1", "admin", "s3cr3t")
    }

    #[tokio::test]
    async fn test_add_and_get_device() {
        let (store, _keys) = create_test_store().await;

        let id = store.add_device(&edge1()).await.unwrap();
        assert_eq!(id, 1);

        let record = store.get_device(id).await.unwrap();
        assert_eq!(record.name, "edge-1");
        assert_eq!(record.address, "10.0.0.1");
        assert_eq!(record.username, "admin");
        assert_eq!(record.secret.key_version, 1);
        assert_ne!(record.secret.ciphertext, b"s3cr3t".to_vec());

        let plaintext = store.cipher().decrypt(&record.secret).unwrap();
        assert_eq!(plaintext.as_str(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_get_missing_device() {
        let (store, _keys) = create_test_store().await;
        let err = store.get_device(2).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(2)));
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_fields() {
        let (store, _keys) = create_test_store().await;

        let cases = [
            NewDevice::new("", "10.0.0.1", "admin", "pw"),
            NewDevice::new("edge", "  ", "admin", "pw"),
            NewDevice::new("edge", "10.0.0.1", "", "pw"),
            NewDevice::new("edge", "10.0.0.1", "admin", ""),
            NewDevice::new("edge", "10.0 .0.1", "admin", "pw"),
        ];
        for case in cases {
            let err = store.add_device(&case).await.unwrap_err();
            assert!(matches!(err, RegistryError::Validation(_)), "{case:?}");
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_devices_in_insertion_order() {
        let (store, _keys) = create_test_store().await;
        for name in ["b", "a", "c"] {
            store
                .add_device(&NewDevice::new(name, "10.0.0.1", "admin", "pw"))
                .await
                .unwrap();
        }

        let names: Vec<_> = store
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_insert_if_not_exists() {
        let (store, _keys) = create_test_store().await;

        assert_eq!(store.insert_if_not_exists(&edge1()).await.unwrap(), Some(1));
        assert_eq!(store.insert_if_not_exists(&edge1()).await.unwrap(), None);

        let other = NewDevice::new("edge-1", "10.0.0.9", "admin", "pw");
        assert_eq!(store.insert_if_not_exists(&other).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_reencrypt_after_rotation() {
        let keys = tempdir().unwrap();
        let mut ring = KeyRing::load_or_init(keys.path()).unwrap();
        let pool = SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS, DEFAULT_BUSY_TIMEOUT)
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let v1 = DeviceStore::new(pool.clone(), Arc::new(SecretCipher::new(&ring).unwrap()));
        v1.add_device(&edge1()).await.unwrap();
        v1.add_device(&NewDevice::new("edge-2", "10.0.0.2", "admin", "other"))
            .await
            .unwrap();

        ring.rotate().unwrap();
        let v2 = DeviceStore::new(pool, Arc::new(SecretCipher::new(&ring).unwrap()));

        assert_eq!(v2.reencrypt_all().await.unwrap(), 2);
        assert_eq!(v2.reencrypt_all().await.unwrap(), 0);

        for record in v2.list_devices().await.unwrap() {
            assert_eq!(record.secret.key_version, 2);
        }
        let record = v2.get_device(1).await.unwrap();
        assert_eq!(v2.cipher().decrypt(&record.secret).unwrap().as_str(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_stale_store_reloads_rotated_keys() {
        let keys = tempdir().unwrap();
        let pool = SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS, DEFAULT_BUSY_TIMEOUT)
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let ring = KeyRing::load_or_init(keys.path()).unwrap();
        let running = DeviceStore::new(pool.clone(), Arc::new(SecretCipher::new(&ring).unwrap()));
        let id = running.add_device(&edge1()).await.unwrap();

        // Rotation done through a separate ring and store, as `rotate-key` does.
        let mut rotated = KeyRing::load(keys.path()).unwrap();
        rotated.rotate().unwrap();
        let rotator = DeviceStore::new(pool, Arc::new(SecretCipher::new(&rotated).unwrap()));
        assert_eq!(rotator.reencrypt_all().await.unwrap(), 1);

        let record = running.get_device(id).await.unwrap();
        assert_eq!(record.secret.key_version, 2);
        assert_eq!(running.open_secret(&record.secret).unwrap().as_str(), "s3cr3t");

        // New secrets now go out under the reloaded active version.
        assert_eq!(running.cipher().active_version(), 2);
        let clone = running.clone();
        let second = clone
            .add_device(&NewDevice::new("edge-2", "10.0.0.2", "admin", "pw"))
            .await
            .unwrap();
        assert_eq!(running.get_device(second).await.unwrap().secret.key_version, 2);
    }

    #[tokio::test]
    async fn test_open_secret_unknown_version_after_reload() {
        let (store, _keys) = create_test_store().await;
        let id = store.add_device(&edge1()).await.unwrap();

        let mut record = store.get_device(id).await.unwrap();
        record.secret.key_version = 7;
        assert!(matches!(
            store.open_secret(&record.secret),
            Err(CipherError::UnknownKeyVersion(7))
        ));
    }

    #[test]
    fn test_new_device_debug_redacts_password() {
        let debug = format!("{:?}", edge1());
        assert!(debug.contains("edge-1"));
        assert!(!debug.contains("s3cr3t"));
    }
}
