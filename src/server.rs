//! Web server module for routerwatch.
//!
//! JSON API over the device registry, on-demand device queries, stored
//! samples and the event log.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::device::{Interfaces, SessionError, SessionFactory, SystemResources};
use crate::error::ErrorKind;
use crate::sink::MetricsSample;
use crate::storage::{
    DeviceSummary, Event, EventKind, EventQuery, EventReader, EventSeverity, EventWriter,
    MetricQuery, MetricReader, NewDevice, RegistryError, SortOrder, StorageError, sources,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionFactory,
    pub metric_reader: MetricReader,
    pub event_reader: EventReader,
    pub event_writer: EventWriter,
}

// =============================================================================
// Errors
// =============================================================================

/// Error response: `{"error": kind, "message": text}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn status_for(kind: ErrorKind) -> StatusCode {
        match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Connection | ErrorKind::Timeout => StatusCode::BAD_GATEWAY,
            ErrorKind::Decryption | ErrorKind::Sink | ErrorKind::Storage | ErrorKind::Panic => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(Self::status_for(kind), kind, message)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = %self.kind, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.kind,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::from_kind(e.kind(), e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::from_kind(e.kind(), e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::from_kind(ErrorKind::Storage, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::from_kind(ErrorKind::Validation, e.body_text())
    }
}

// =============================================================================
// Request / Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Body of `POST /devices`. Missing fields are reported as validation errors.
#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    pub name: Option<String>,
    #[serde(alias = "ip")]
    pub address: Option<String>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RegisterDeviceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterDeviceRequest")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RegisterDeviceResponse {
    id: i64,
}

/// Query parameters for stored samples.
#[derive(Debug, Deserialize)]
pub struct MetricsQueryParams {
    pub limit: Option<u32>,
    pub order: Option<String>,
    pub range: Option<String>,
}

/// Query parameters for events API.
#[derive(Debug, Deserialize)]
pub struct EventsQueryParams {
    pub source: Option<String>,
    pub kind: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<u32>,
    pub order: Option<String>,
    pub range: Option<String>,
}

/// Parse sort order from string.
fn parse_sort_order(s: Option<String>) -> Option<SortOrder> {
    s.and_then(|order| order.parse().ok())
}

/// Parse filtered time range from string.
/// Supports: 1h, 6h, 12h, 24h, 7d, 30d.
fn parse_range(range: Option<String>) -> Option<chrono::DateTime<chrono::Utc>> {
    let range = range?;
    let now = chrono::Utc::now();
    match range.as_str() {
        "1h" => Some(now - chrono::Duration::hours(1)),
        "6h" => Some(now - chrono::Duration::hours(6)),
        "12h" => Some(now - chrono::Duration::hours(12)),
        "24h" => Some(now - chrono::Duration::hours(24)),
        "7d" => Some(now - chrono::Duration::days(7)),
        "30d" => Some(now - chrono::Duration::days(30)),
        _ => None,
    }
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/devices", get(list_devices_handler).post(register_device_handler))
        .route("/devices/{id}", get(get_device_handler))
        .route("/devices/{id}/resources", get(resources_handler))
        .route("/devices/{id}/interfaces", get(interfaces_handler))
        .route("/devices/{id}/metrics", get(device_metrics_handler))
        .route("/events", get(events_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness check.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness check that checks the database.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.sessions.devices().count().await {
        Ok(_) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let devices = state.sessions.devices().list_devices().await?;
    Ok(Json(devices.iter().map(DeviceSummary::from).collect()))
}

async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterDeviceResponse>), ApiError> {
    let Json(req) = body?;
    let device = NewDevice::new(
        req.name.unwrap_or_default(),
        req.address.unwrap_or_default(),
        req.username.unwrap_or_default(),
        req.password.unwrap_or_default(),
    );

    let id = state.sessions.devices().add_device(&device).await?;

    state
        .event_writer
        .emit(
            Event::new(
                sources::REGISTRY,
                EventKind::Audit,
                EventSeverity::Info,
                format!("Device '{}' registered", device.name.trim()),
            )
            .with_payload("device_id", id)
            .with_payload("address", device.address.trim()),
        )
        .await;

    Ok((StatusCode::CREATED, Json(RegisterDeviceResponse { id })))
}

async fn get_device_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeviceSummary>, ApiError> {
    let record = state.sessions.devices().get_device(id).await?;
    Ok(Json(DeviceSummary::from(&record)))
}

/// On-demand system resources.
async fn resources_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resources = state
        .sessions
        .query(id, &SystemResources)
        .await
        .inspect_err(|e| log_session_error(id, e))?;
    Ok(Json(resources))
}

/// On-demand interface list.
async fn interfaces_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let interfaces = state
        .sessions
        .query(id, &Interfaces)
        .await
        .inspect_err(|e| log_session_error(id, e))?;
    Ok(Json(interfaces))
}

fn log_session_error(device_id: i64, error: &SessionError) {
    if error.kind() != ErrorKind::NotFound {
        tracing::warn!(device_id, kind = %error.kind(), error = %error, "On-demand query failed");
    }
}

/// Stored samples for one device.
async fn device_metrics_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<MetricsQueryParams>,
) -> Result<Json<Vec<MetricsSample>>, ApiError> {
    state.sessions.devices().get_device(id).await?;

    let query = MetricQuery {
        device_id: Some(id),
        start: parse_range(params.range),
        end: None,
        limit: params.limit,
        order: parse_sort_order(params.order),
    };
    Ok(Json(state.metric_reader.query(query).await?))
}

/// Event log.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQueryParams>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let query = EventQuery {
        source: params.source.filter(|s| !s.is_empty()),
        kind: params.kind.as_ref().and_then(|k| k.parse().ok()),
        severity: params.severity.as_ref().and_then(|s| s.parse().ok()),
        start: parse_range(params.range),
        end: None,
        limit: params.limit,
        order: parse_sort_order(params.order),
    };
    Ok(Json(state.event_reader.query(query).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherError, KeyRing, SecretCipher};
    use crate::device::RouterOsConnector;
    use crate::storage::{MEMORY_PATH, StorageBuilder, StorageHandles};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    async fn create_test_state() -> (AppState, StorageHandles, TempDir) {
        let dir = tempdir().unwrap();
        let ring = KeyRing::load_or_init(dir.path()).unwrap();
        let cipher = Arc::new(SecretCipher::new(&ring).unwrap());
        let handles = StorageBuilder::new(MEMORY_PATH).build(cipher).await.unwrap();

        let state = AppState {
            sessions: SessionFactory::new(
                handles.device_store.clone(),
                Arc::new(RouterOsConnector::new()),
            ),
            metric_reader: handles.metric_reader.clone(),
            event_reader: handles.event_reader.clone(),
            event_writer: handles.event_writer.clone(),
        };

        // Return handles AND dir to keep tempdir alive
        (state, handles, dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_and_readyz() {
        let (state, _handles, _dir) = create_test_state().await;
        let app = create_router(state);

        for uri in ["/healthz", "/readyz"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_register_emits_audit_event() {
        let (state, _handles, _dir) = create_test_state().await;
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name":"edge-1","ip":"10.0.0.1","user":"admin","password":"s3cr3t"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await, serde_json::json!({"id": 1}));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events?kind=audit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = body_json(response).await;
        assert_eq!(events.as_array().unwrap().len(), 1);
        assert_eq!(events[0]["payload"]["device_id"], 1);
        assert!(!events.to_string().contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_error() {
        let (state, _handles, _dir) = create_test_state().await;
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "validation");
    }

    #[tokio::test]
    async fn test_unreachable_device_is_bad_gateway() {
        let (state, handles, _dir) = create_test_state().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let id = handles
            .device_store
            .add_device(&NewDevice::new("edge-1", addr.to_string(), "admin", "pw"))
            .await
            .unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/devices/{id}/resources"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["error"], "connection");
    }

    #[tokio::test]
    async fn test_metrics_for_unknown_device() {
        let (state, _handles, _dir) = create_test_state().await;
        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/devices/9/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_seal_failure_is_storage_error() {
        let err = ApiError::from(RegistryError::Encrypt(CipherError::Encryption));
        assert_eq!(err.kind, ErrorKind::Storage);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);

        let err = ApiError::from(RegistryError::Cipher {
            device_id: 1,
            source: CipherError::UnknownKeyVersion(3),
        });
        assert_eq!(err.kind, ErrorKind::Decryption);
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_sort_order(Some("ASC".into())), Some(SortOrder::Asc));
        assert_eq!(parse_sort_order(Some("up".into())), None);
        assert!(parse_range(Some("24h".into())).is_some());
        assert!(parse_range(Some("2w".into())).is_none());
    }
}
