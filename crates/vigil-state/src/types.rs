//! Domain types for the Vigil state store.
//!
//! These types represent metric samples, anomaly records, scaling policies,
//! scaling events and the scaling state. All persisted types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a metric time series (e.g. `checkout.latency_p99`).
pub type StreamId = String;

/// Unique identifier of an anomaly record (`anom-NNNNNN`).
pub type AnomalyId = String;

/// Unique identifier of a scaling event (`scale-NNNNNN`).
pub type EventId = String;

/// Unique identifier of a scaling policy.
pub type PolicyId = String;

// ── Samples ───────────────────────────────────────────────────────

/// A single observation of a stream. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub stream_id: StreamId,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub value: f64,
}

impl MetricSample {
    pub fn new(stream_id: impl Into<String>, timestamp: u64, value: f64) -> Self {
        Self {
            stream_id: stream_id.into(),
            timestamp,
            value,
        }
    }
}

// ── Anomalies ─────────────────────────────────────────────────────

/// Category of metric an anomaly was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Traffic,
    Latency,
    ErrorRate,
    Resource,
    Security,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 5] = [
        AnomalyType::Traffic,
        AnomalyType::Latency,
        AnomalyType::ErrorRate,
        AnomalyType::Resource,
        AnomalyType::Security,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyType::Traffic => "traffic",
            AnomalyType::Latency => "latency",
            AnomalyType::ErrorRate => "error_rate",
            AnomalyType::Resource => "resource",
            AnomalyType::Security => "security",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly severity. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an anomaly reached the resolved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// Resolved by an operator.
    Manual,
    /// Enough consecutive non-anomalous samples were observed.
    AutoClear,
    /// Automatic clear: the record went quiet past the debounce interval
    /// and a new occurrence of the same anomaly replaced it.
    Stale,
}

/// A detected anomaly. Append-only history: records are resolved, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: AnomalyId,
    pub stream_id: StreamId,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub severity: Severity,
    /// Detection confidence (0.0–1.0).
    pub confidence: f64,
    /// Most recent anomalous value.
    pub value: f64,
    /// Baseline the value was compared against.
    pub baseline: f64,
    /// Signed deviation from baseline, in percent.
    pub deviation_pct: f64,
    /// Detector that produced this record (e.g. `load-balancer`, `rule:p99-slo`).
    pub source: String,
    /// Unix timestamp of the first anomalous sample.
    pub detected_at: u64,
    /// Unix timestamp of the latest anomalous sample folded into this record.
    pub last_seen_at: u64,
    /// Number of candidates merged into this record.
    pub occurrences: u32,
    pub resolved: bool,
    pub resolved_at: Option<u64>,
    pub resolution: Option<ResolutionReason>,
}

// ── Scaling policies ──────────────────────────────────────────────

/// Which signal a policy scales on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Current metric value vs threshold.
    Reactive,
    /// Externally supplied forecast vs threshold.
    Predictive,
    /// Stronger of the reactive and predictive signals.
    Hybrid,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::Reactive => "reactive",
            PolicyKind::Predictive => "predictive",
            PolicyKind::Hybrid => "hybrid",
        }
    }
}

/// An autoscaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: PolicyId,
    #[serde(default)]
    pub name: String,
    /// Stream the policy watches.
    pub metric: StreamId,
    pub threshold: f64,
    pub kind: PolicyKind,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Minimum seconds between scaling actions triggered by this policy.
    pub cooldown_seconds: u64,
    /// Step size factor (0.0–1.0).
    pub aggressiveness: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ── Scaling events ────────────────────────────────────────────────

/// Direction of a scaling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventKind {
    ScaleUp,
    ScaleDown,
}

impl ScalingEventKind {
    pub fn between(from: u32, to: u32) -> Self {
        if to >= from {
            ScalingEventKind::ScaleUp
        } else {
            ScalingEventKind::ScaleDown
        }
    }
}

/// Scaling event state machine: `pending → executing → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl EventStatus {
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Pending,
        EventStatus::Executing,
        EventStatus::Completed,
        EventStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Executing => "executing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    /// Completed and failed events are closed and never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

/// One scaling action, from decision to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub id: EventId,
    /// Unix timestamp the event was created.
    pub timestamp: u64,
    pub kind: ScalingEventKind,
    /// Metric (or `predictive` / `bounds`) that caused the event.
    pub trigger: String,
    pub policy_id: Option<PolicyId>,
    pub from_instances: u32,
    pub to_instances: u32,
    /// Instance count actually reached when the event closed.
    pub reached_instances: u32,
    pub confidence: f64,
    pub status: EventStatus,
    /// Elapsed ticks between creation and close.
    pub duration: u32,
    /// Closed early because a newer decision changed the target.
    #[serde(default)]
    pub superseded: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Instance counts of the scaled group. Mutated only by the convergence loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingState {
    pub current_instances: u32,
    pub target_instances: u32,
    /// Unix timestamp of the last scaling action; `None` until the first.
    #[serde(default)]
    pub last_scale_time: Option<u64>,
    /// Cooldown of the policy that set the current target.
    pub cooldown_seconds: u64,
}

impl ScalingState {
    pub fn new(instances: u32) -> Self {
        Self {
            current_instances: instances,
            target_instances: instances,
            last_scale_time: None,
            cooldown_seconds: 0,
        }
    }
}

// ── IDs ───────────────────────────────────────────────────────────

/// Prefix of anomaly IDs.
pub const ANOMALY_ID_PREFIX: &str = "anom-";

/// Prefix of scaling event IDs.
pub const EVENT_ID_PREFIX: &str = "scale-";

/// Build a sequence ID such as `anom-000042`.
pub fn sequence_id(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq:06}")
}

/// Parse the sequence number back out of a sequence ID.
pub fn parse_sequence(prefix: &str, id: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.parse().ok()
}
