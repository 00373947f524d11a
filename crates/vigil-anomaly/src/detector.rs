//! Statistical anomaly detector.
//!
//! Scores a sample against the rolling statistics of its window as they
//! stood before the sample arrived:
//!
//! ```text
//! baseline      = window mean (or EWMA)
//! deviation_pct = (value - baseline) / max(baseline, ε) * 100
//! severity      = tier(|deviation_pct|, stream type)
//! confidence    = 1 - exp(-|z| / 2),  z = (value - mean) / stddev
//! ```
//!
//! A constant window (`stddev == 0`) has no meaningful z-score; its
//! candidates carry a fixed low confidence instead.

use serde::{Deserialize, Serialize};

use vigil_metrics::WindowStats;
use vigil_state::{AnomalyType, MetricSample, Severity};

use crate::profile::{BaselineMode, StreamProfile};

/// Floor for the deviation denominator.
pub const DEVIATION_EPSILON: f64 = 1e-9;

/// Confidence reported for candidates on a zero-variance window.
pub const CONSTANT_STREAM_CONFIDENCE: f64 = 0.1;

const Z_SCALE: f64 = 2.0;

/// Tunables for the statistical detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples a window needs before it is trusted as a baseline.
    pub min_baseline_samples: usize,
    /// Minimum |z| for a candidate when the window has variance.
    pub min_z_score: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_baseline_samples: 2,
            min_z_score: 2.0,
        }
    }
}

/// A scored sample that crossed a severity tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCandidate {
    pub stream_id: String,
    pub kind: AnomalyType,
    pub severity: Severity,
    pub confidence: f64,
    pub value: f64,
    pub baseline: f64,
    pub deviation_pct: f64,
    pub source: String,
    pub timestamp: u64,
}

/// |deviation| thresholds (percent) for each severity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityTiers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl SeverityTiers {
    /// Fixed tiers per metric type. Latency and error rate react to smaller
    /// relative moves than traffic; security signals tighter still.
    pub fn for_type(kind: AnomalyType) -> Self {
        match kind {
            AnomalyType::Traffic | AnomalyType::Resource => Self {
                low: 20.0,
                medium: 35.0,
                high: 50.0,
                critical: 100.0,
            },
            AnomalyType::Latency | AnomalyType::ErrorRate => Self {
                low: 10.0,
                medium: 20.0,
                high: 35.0,
                critical: 75.0,
            },
            AnomalyType::Security => Self {
                low: 5.0,
                medium: 10.0,
                high: 25.0,
                critical: 50.0,
            },
        }
    }

    /// Severity for an absolute deviation, `None` below the lowest tier.
    pub fn classify(&self, deviation_pct: f64) -> Option<Severity> {
        let d = deviation_pct.abs();
        if d >= self.critical {
            Some(Severity::Critical)
        } else if d >= self.high {
            Some(Severity::High)
        } else if d >= self.medium {
            Some(Severity::Medium)
        } else if d >= self.low {
            Some(Severity::Low)
        } else {
            None
        }
    }
}

/// Signed percentage deviation of `value` from `baseline`.
pub fn deviation_pct(value: f64, baseline: f64) -> f64 {
    (value - baseline) / baseline.max(DEVIATION_EPSILON) * 100.0
}

/// Confidence in `[0, 1]` from the z-score of `value`. Never NaN.
pub fn confidence(value: f64, mean: f64, stddev: f64) -> f64 {
    if stddev.is_nan() || stddev <= 0.0 || stddev.is_infinite() {
        return CONSTANT_STREAM_CONFIDENCE;
    }
    let z = ((value - mean) / stddev).abs();
    let c = 1.0 - (-z / Z_SCALE).exp();
    if c.is_nan() { CONSTANT_STREAM_CONFIDENCE } else { c.clamp(0.0, 1.0) }
}

/// Stateless statistical detector.
#[derive(Debug, Clone, Default)]
pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Score `sample` against `prior`, the window statistics before the
    /// sample was pushed.
    pub fn evaluate(
        &self,
        profile: &StreamProfile,
        prior: &WindowStats,
        sample: &MetricSample,
    ) -> Option<AnomalyCandidate> {
        if prior.count < self.config.min_baseline_samples.max(1) {
            return None;
        }

        let baseline = match profile.baseline {
            BaselineMode::Mean => prior.mean,
            BaselineMode::Ewma => prior.ewma,
        };
        let deviation = deviation_pct(sample.value, baseline);
        if !deviation.is_finite() {
            return None;
        }

        let severity = SeverityTiers::for_type(profile.kind).classify(deviation)?;

        if prior.stddev > 0.0 {
            let z = ((sample.value - prior.mean) / prior.stddev).abs();
            if z < self.config.min_z_score {
                return None;
            }
        }

        Some(AnomalyCandidate {
            stream_id: sample.stream_id.clone(),
            kind: profile.kind,
            severity,
            confidence: confidence(sample.value, prior.mean, prior.stddev),
            value: sample.value,
            baseline,
            deviation_pct: deviation,
            source: profile.source.clone(),
            timestamp: sample.timestamp,
        })
    }
}
