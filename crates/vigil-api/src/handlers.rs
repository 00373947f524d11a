//! REST API handlers.
//!
//! Each handler calls into the shared `Engine` and returns a JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_anomaly::{AnomalyFilter, LifecycleError, ResolveOutcome};
use vigil_autoscale::PolicyError;
use vigil_engine::{EngineError, epoch_secs};
use vigil_metrics::{WindowError, WindowStats, render_prometheus};
use vigil_state::{MetricSample, ScalingPolicy};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Policy(PolicyError::Duplicate(_)) => StatusCode::CONFLICT,
        EngineError::Policy(PolicyError::NotFound(_))
        | EngineError::Lifecycle(LifecycleError::NotFound(_))
        | EngineError::Window(WindowError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Policy(_) | EngineError::Ingest(_) => StatusCode::BAD_REQUEST,
        EngineError::Config(_) | EngineError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(err: EngineError) -> Response {
    error_response(&err.to_string(), status_for(&err)).into_response()
}

// ── Ingestion ──────────────────────────────────────────────────

/// Ingest request body. `timestamp` defaults to the server clock.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub stream_id: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
    pub value: f64,
}

/// POST /api/v1/ingest
pub async fn ingest(State(state): State<ApiState>, Json(req): Json<IngestRequest>) -> Response {
    let sample = MetricSample::new(
        req.stream_id,
        req.timestamp.unwrap_or_else(epoch_secs),
        req.value,
    );
    let accepted = serde_json::json!({
        "stream_id": sample.stream_id,
        "timestamp": sample.timestamp,
    });
    match state.engine.ingest(sample).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(accepted)).into_response(),
        Err(e) => {
            debug!(error = %e, "sample rejected");
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
    }
}

// ── Anomalies ──────────────────────────────────────────────────

/// GET /api/v1/anomalies
pub async fn list_anomalies(
    State(state): State<ApiState>,
    Query(filter): Query<AnomalyFilter>,
) -> Response {
    ApiResponse::ok(state.engine.anomalies(&filter).await).into_response()
}

/// GET /api/v1/anomalies/summary
pub async fn anomaly_summary(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.engine.anomaly_summary().await).into_response()
}

/// GET /api/v1/anomalies/:id
pub async fn get_anomaly(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.anomaly(&id).await {
        Some(anomaly) => ApiResponse::ok(anomaly).into_response(),
        None => error_response("anomaly not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// POST /api/v1/anomalies/:id/resolve
///
/// Resolving an already resolved anomaly returns it unchanged.
pub async fn resolve_anomaly(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.resolve_anomaly(&id, epoch_secs()).await {
        Ok(outcome) => {
            let already = matches!(outcome, ResolveOutcome::AlreadyResolved(_));
            ApiResponse::ok(serde_json::json!({
                "anomaly": outcome.into_anomaly(),
                "already_resolved": already,
            }))
            .into_response()
        }
        Err(e) => engine_error(e),
    }
}

// ── Scaling ────────────────────────────────────────────────────

/// GET /api/v1/scaling/state
pub async fn scaling_state(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.engine.scaling_state().await).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/scaling/events
pub async fn scaling_events(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    ApiResponse::ok(state.engine.scaling_events(query.limit).await).into_response()
}

/// GET /api/v1/scaling/policies
pub async fn list_policies(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.engine.policies().await).into_response()
}

/// POST /api/v1/scaling/policies
pub async fn create_policy(
    State(state): State<ApiState>,
    Json(policy): Json<ScalingPolicy>,
) -> Response {
    match state.engine.create_policy(policy).await {
        Ok(policy) => (StatusCode::CREATED, ApiResponse::ok(policy)).into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /api/v1/scaling/policies/:id
pub async fn get_policy(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.policy(&id).await {
        Some(policy) => ApiResponse::ok(policy).into_response(),
        None => error_response("policy not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// PUT /api/v1/scaling/policies/:id
///
/// The path id wins over any id in the body.
pub async fn update_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut policy): Json<ScalingPolicy>,
) -> Response {
    policy.id = id;
    match state.engine.update_policy(policy).await {
        Ok(policy) => ApiResponse::ok(policy).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Streams ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StreamEntry {
    pub id: String,
    pub stats: WindowStats,
}

/// GET /api/v1/streams
pub async fn list_streams(State(state): State<ApiState>) -> Response {
    let streams: Vec<StreamEntry> = state
        .engine
        .streams()
        .await
        .into_iter()
        .map(|(id, stats)| StreamEntry { id, stats })
        .collect();
    ApiResponse::ok(streams).into_response()
}

/// GET /api/v1/streams/:id/stats
pub async fn stream_stats(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.stream_stats(&id).await {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = render_prometheus(&state.engine.exposition().await);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
