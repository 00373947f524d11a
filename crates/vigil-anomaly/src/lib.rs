//! vigil-anomaly — anomaly detection and alert lifecycle.
//!
//! # Architecture
//!
//! ```text
//! sample + prior WindowStats
//!   ├── Detector::evaluate()      → statistical candidate (deviation tiers, z-score confidence)
//!   └── ThresholdRule::evaluate() → static-rule candidate
//!         │
//!         ▼
//! AlertManager::observe()  (dedup by stream/type/source)
//!   ├── Open     — first candidate, later ones within debounce update in place
//!   └── Resolved — manual resolve() or N consecutive clear observations
//! ```
//!
//! The detector and rules are pure: they hold no state, so every stream can
//! be evaluated independently. The alert manager is the single writer of
//! anomaly records.

pub mod detector;
pub mod lifecycle;
pub mod profile;
pub mod rules;

pub use detector::{AnomalyCandidate, Detector, DetectorConfig, SeverityTiers};
pub use lifecycle::{
    AlertManager, AnomalyFilter, AnomalySummary, DedupKey, LifecycleChange, LifecycleConfig,
    LifecycleError, LifecycleResult, Observation, ResolveOutcome,
};
pub use profile::{BaselineMode, ProfileRegistry, StreamProfile};
pub use rules::{Comparison, ThresholdRule};
