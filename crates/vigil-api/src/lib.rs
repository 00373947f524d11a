//! vigil-api — REST API for Vigil.
//!
//! Thin axum layer over [`vigil_engine::Engine`]. Every JSON response uses
//! the `{success, data?, error?}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/ingest` | Submit a sample |
//! | GET | `/api/v1/anomalies` | List anomalies (filterable) |
//! | GET | `/api/v1/anomalies/summary` | Anomaly counters |
//! | GET | `/api/v1/anomalies/:id` | Get one anomaly |
//! | POST | `/api/v1/anomalies/:id/resolve` | Resolve an anomaly |
//! | GET | `/api/v1/scaling/state` | Current scaling state |
//! | GET | `/api/v1/scaling/events` | Scaling events, newest first |
//! | GET | `/api/v1/scaling/policies` | List policies |
//! | POST | `/api/v1/scaling/policies` | Create a policy |
//! | GET | `/api/v1/scaling/policies/:id` | Get a policy |
//! | PUT | `/api/v1/scaling/policies/:id` | Update a policy |
//! | GET | `/api/v1/streams` | Streams with window stats |
//! | GET | `/api/v1/streams/:id/stats` | Window stats for one stream |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use vigil_engine::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };

    let api_routes = Router::new()
        .route("/ingest", post(handlers::ingest))
        .route("/anomalies", get(handlers::list_anomalies))
        .route("/anomalies/summary", get(handlers::anomaly_summary))
        .route("/anomalies/{id}", get(handlers::get_anomaly))
        .route("/anomalies/{id}/resolve", post(handlers::resolve_anomaly))
        .route("/scaling/state", get(handlers::scaling_state))
        .route("/scaling/events", get(handlers::scaling_events))
        .route(
            "/scaling/policies",
            get(handlers::list_policies).post(handlers::create_policy),
        )
        .route(
            "/scaling/policies/{id}",
            get(handlers::get_policy).put(handlers::update_policy),
        )
        .route("/streams", get(handlers::list_streams))
        .route("/streams/{id}/stats", get(handlers::stream_stats))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
