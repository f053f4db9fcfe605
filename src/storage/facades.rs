//! User-facing storage facades.
//!
//! Provides ergonomic APIs for storage operations:
//! - `MetricWriter`: SQLite-backed [`MetricsSink`]
//! - `MetricReader`: Query stored samples
//! - `EventWriter` / `EventReader`: Operational event log
//! - `StorageAdmin`: Retention cleanup

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite};
use strum_macros::{AsRefStr, EnumString};

use crate::sink::{MetricsSample, MetricsSink, SinkError};
use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{Event, EventKind, EventSeverity};

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;
const DEFAULT_RANGE_DAYS: i64 = 30;

// =============================================================================
// Query Types
// =============================================================================

/// Sort order for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Query for stored metric samples.
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub device_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

/// Query for events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub kind: Option<EventKind>,
    pub severity: Option<EventSeverity>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

/// Resolve the time window and limit shared by all queries.
fn window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<u32>,
) -> (i64, i64, u32) {
    let now = Utc::now();
    let start = start.unwrap_or_else(|| now - Duration::days(DEFAULT_RANGE_DAYS));
    let end = end.unwrap_or(now);
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    (start.timestamp_millis(), end.timestamp_millis(), limit)
}

// =============================================================================
// Metrics
// =============================================================================

/// SQLite metrics sink.
#[derive(Clone)]
pub struct MetricWriter {
    pool: SqlitePool,
}

impl std::fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricWriter").finish_non_exhaustive()
    }
}

impl MetricWriter {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist one sample.
    pub async fn insert(&self, sample: &MetricsSample) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&sample.payload)?;
        sqlx::query("INSERT INTO metric_samples (device_id, collected_at, payload) VALUES (?, ?, ?)")
            .bind(sample.device_id)
            .bind(sample.collected_at.timestamp_millis())
            .bind(payload)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricsSink for MetricWriter {
    async fn write(&self, sample: MetricsSample) -> Result<(), SinkError> {
        self.insert(&sample).await.map_err(SinkError::from)
    }
}

/// Reader for stored metric samples.
#[derive(Clone)]
pub struct MetricReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for MetricReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricReader").finish_non_exhaustive()
    }
}

impl MetricReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query samples with filters.
    pub async fn query(&self, q: MetricQuery) -> Result<Vec<MetricsSample>, StorageError> {
        let (start, end, limit) = window(q.start, q.end, q.limit);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT device_id, collected_at, payload FROM metric_samples WHERE collected_at >= ",
        );
        qb.push_bind(start);
        qb.push(" AND collected_at <= ");
        qb.push_bind(end);

        if let Some(device_id) = q.device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(device_id);
        }

        qb.push(format!(
            " ORDER BY collected_at {}, id {} LIMIT {}",
            order.as_sql(),
            order.as_sql(),
            limit
        ));

        let rows: Vec<(i64, i64, String)> = qb.build_query_as().fetch_all(self.pool.inner()).await?;

        rows.into_iter()
            .map(|(device_id, collected_at, payload)| {
                Ok(MetricsSample {
                    device_id,
                    collected_at: DateTime::from_timestamp_millis(collected_at)
                        .unwrap_or(DateTime::UNIX_EPOCH),
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    /// Total number of stored samples.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metric_samples")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(row.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event log writer.
#[derive(Clone)]
pub struct EventWriter {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter").finish_non_exhaustive()
    }
}

impl EventWriter {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a single event.
    pub async fn insert_event(&self, event: Event) -> Result<i64, StorageError> {
        let payload = serde_json::to_string(&event.payload)?;
        let result = sqlx::query(
            "INSERT INTO events (ts, source, kind, severity, message, payload) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.ts.timestamp_millis())
        .bind(&event.source)
        .bind(event.kind.as_ref())
        .bind(event.severity.as_ref())
        .bind(&event.message)
        .bind(payload)
        .execute(self.pool.inner())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert an event, logging instead of failing.
    pub async fn emit(&self, event: Event) {
        if let Err(e) = self.insert_event(event).await {
            tracing::warn!(error = %e, "Failed to record event");
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    ts: i64,
    source: String,
    kind: String,
    severity: String,
    message: String,
    payload: String,
}

/// Event log reader.
#[derive(Clone)]
pub struct EventReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader").finish_non_exhaustive()
    }
}

impl EventReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query events with filters.
    pub async fn query(&self, q: EventQuery) -> Result<Vec<Event>, StorageError> {
        let (start, end, limit) = window(q.start, q.end, q.limit);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, ts, source, kind, severity, message, payload FROM events WHERE ts >= ",
        );
        qb.push_bind(start);
        qb.push(" AND ts <= ");
        qb.push_bind(end);

        if let Some(source) = q.source {
            qb.push(" AND source = ");
            qb.push_bind(source);
        }
        if let Some(kind) = q.kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_ref().to_string());
        }
        if let Some(severity) = q.severity {
            qb.push(" AND severity = ");
            qb.push_bind(severity.as_ref().to_string());
        }

        qb.push(format!(
            " ORDER BY ts {}, id {} LIMIT {}",
            order.as_sql(),
            order.as_sql(),
            limit
        ));

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(self.pool.inner()).await?;

        rows.into_iter()
            .map(|row| {
                Ok(Event {
                    id: Some(row.id),
                    ts: DateTime::from_timestamp_millis(row.ts).unwrap_or(DateTime::UNIX_EPOCH),
                    source: row.source,
                    kind: row.kind.parse().map_err(|_| {
                        StorageError::InvalidData(format!("unknown event kind '{}'", row.kind))
                    })?,
                    severity: row.severity.parse().map_err(|_| {
                        StorageError::InvalidData(format!(
                            "unknown event severity '{}'",
                            row.severity
                        ))
                    })?,
                    message: row.message,
                    payload: serde_json::from_str(&row.payload)?,
                })
            })
            .collect()
    }
}

// =============================================================================
// Admin
// =============================================================================

/// Storage administration.
#[derive(Clone)]
pub struct StorageAdmin {
    pool: SqlitePool,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete samples collected more than `retention_days` ago.
    pub async fn cleanup_metric_samples(&self, retention_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let deleted = sqlx::query("DELETE FROM metric_samples WHERE collected_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(self.pool.inner())
            .await?
            .rows_affected();
        tracing::debug!(deleted, retention_days, "Metric samples cleaned up");
        Ok(deleted)
    }

    /// Delete events recorded more than `retention_days` ago.
    pub async fn cleanup_events(&self, retention_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let deleted = sqlx::query("DELETE FROM events WHERE ts < ?")
            .bind(cutoff.timestamp_millis())
            .execute(self.pool.inner())
            .await?
            .rows_affected();
        tracing::debug!(deleted, retention_days, "Events cleaned up");
        Ok(deleted)
    }
}
