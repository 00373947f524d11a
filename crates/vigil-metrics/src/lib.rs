//! vigil-metrics — sliding-window statistics for Vigil streams.
//!
//! Keeps the most recent samples of every stream in a fixed-capacity ring
//! buffer with incrementally maintained statistics, and renders engine
//! state in the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! WindowStore
//!   ├── push()  ← one writer per stream, returns the prior baseline
//!   ├── stats() → WindowStats (mean, stddev, last, count, ewma)
//!   └── snapshot() → stats for every stream
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod prometheus;
pub mod store;
pub mod window;

pub use prometheus::{ExpositionSnapshot, render_prometheus};
pub use store::{WindowError, WindowResult, WindowStore};
pub use window::{DEFAULT_WINDOW_CAPACITY, MetricWindow, WindowStats};
