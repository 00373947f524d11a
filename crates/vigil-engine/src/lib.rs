//! vigil-engine — the monitoring and autoscaling decision loop.
//!
//! # Architecture
//!
//! ```text
//!  ingest() ──► pending buffer
//!                    │  Engine::tick(now)
//!                    ▼
//!  ┌───────── one task per stream ─────────┐
//!  │ WindowStore::push → Detector + Rules  │   joined under tick_budget
//!  └───────────────────┬───────────────────┘
//!                      ▼
//!              AlertManager::observe          ──► Notification::Anomaly*
//!                      │
//!  forecasts ──► PolicyEngine::decide(stats, policies, basis)
//!                      ▼
//!              ConvergenceLoop::tick          ──► Notification::ScalingEvent
//!                      ▼
//!                 StateStore (redb)
//! ```
//!
//! The [`Ticker`] drives `tick` on a fixed period; tests call it directly.

pub mod config;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod notify;
pub mod ticker;

pub use config::{ConfigError, EngineSection, ScalingSection, ServerSection, Timings, VigilConfig};
pub use engine::{Engine, EngineBuilder, TickReport, epoch_secs};
pub use error::{EngineError, EngineResult, IngestError};
pub use forecast::{ForecastCallback, ForecastFuture, fetch_forecasts, static_forecasts};
pub use notify::{Notification, Notifier, log_notifications};
pub use ticker::{SampleSource, Ticker, VecSampleSource};
