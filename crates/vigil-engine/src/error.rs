//! Engine error types.

use thiserror::Error;

use vigil_anomaly::LifecycleError;
use vigil_autoscale::PolicyError;
use vigil_metrics::WindowError;
use vigil_state::StateError;

use crate::config::ConfigError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Reasons a sample is refused at ingestion.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("sample has an empty stream id")]
    EmptyStreamId,

    #[error("stream {stream_id}: value {value} is not finite")]
    NonFiniteValue { stream_id: String, value: f64 },

    #[error("stream {stream_id}: timestamp {timestamp} precedes last accepted {last}")]
    OutOfOrder {
        stream_id: String,
        timestamp: u64,
        last: u64,
    },

    #[error("ingest buffer full ({capacity} samples pending)")]
    BufferFull { capacity: usize },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}
