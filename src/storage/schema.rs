//! Database schema definitions.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Device registry table.
///
/// `AUTOINCREMENT` guarantees ids are never reused, even after deletes.
/// Secrets are stored sealed, tagged with the key version used.
pub const DEVICES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    name              TEXT NOT NULL,
    address           TEXT NOT NULL,
    username          TEXT NOT NULL,
    secret_ciphertext BLOB NOT NULL,
    key_version       INTEGER NOT NULL,
    created_at        INTEGER NOT NULL
);
"#;

/// Time-series samples written by the SQLite metrics sink.
///
/// Payload is the device's reported document as a JSON string.
pub const METRIC_SAMPLES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metric_samples (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id    INTEGER NOT NULL,
    collected_at INTEGER NOT NULL,
    payload      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metric_samples_device_ts
    ON metric_samples (device_id, collected_at);
CREATE INDEX IF NOT EXISTS idx_metric_samples_ts
    ON metric_samples (collected_at);
"#;

/// Operational event log (wide table, JSON payload).
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    ts        INTEGER NOT NULL,
    source    TEXT NOT NULL,
    kind      TEXT NOT NULL,
    severity  TEXT NOT NULL,
    message   TEXT NOT NULL,
    payload   TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [DEVICES_TABLE_DDL, METRIC_SAMPLES_TABLE_DDL, EVENTS_TABLE_DDL] {
        sqlx::raw_sql(ddl).execute(pool.inner()).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::{DEFAULT_BUSY_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

    async fn memory_pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS, DEFAULT_BUSY_TIMEOUT)
            .await
            .unwrap()
    }

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(pool.inner())
                .await
                .unwrap();
        row.0 == 1
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();

        assert!(table_exists(&pool, "devices").await);
        assert!(table_exists(&pool, "metric_samples").await);
        assert!(table_exists(&pool, "events").await);
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
        assert!(table_exists(&pool, "devices").await);
    }

    #[tokio::test]
    async fn test_device_ids_not_reused() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();

        let insert = "INSERT INTO devices (name, address, username, secret_ciphertext, key_version, created_at)
                      VALUES ('a', '10.0.0.1', 'admin', x'00', 1, 0)";
        let first = sqlx::query(insert).execute(pool.inner()).await.unwrap();
        sqlx::query("DELETE FROM devices")
            .execute(pool.inner())
            .await
            .unwrap();
        let second = sqlx::query(insert).execute(pool.inner()).await.unwrap();

        assert_eq!(first.last_insert_rowid(), 1);
        assert_eq!(second.last_insert_rowid(), 2);
    }
}
