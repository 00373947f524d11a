//! Alert lifecycle manager.
//!
//! Turns the stream of per-sample detector verdicts into anomaly records.
//! Records are keyed for deduplication by `(stream, type, source)`; at most
//! one record per key is open at any time.
//!
//! ```text
//!             candidate (within debounce)
//!               ┌──────┐
//!               ▼      │
//! candidate ─► Open ───┘──► Resolved   (manual | auto_clear | stale)
//! ```
//!
//! Resolved is terminal: a later candidate on the same key opens a new
//! record with a new ID.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use vigil_state::{
    ANOMALY_ID_PREFIX, Anomaly, AnomalyId, AnomalyType, ResolutionReason, Severity,
    parse_sequence, sequence_id,
};

use crate::detector::AnomalyCandidate;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("anomaly not found: {0}")]
    NotFound(String),
}

/// Lifecycle tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Candidates this close (seconds) to the record's last sighting update
    /// it in place instead of opening a new record.
    pub debounce_secs: u64,
    /// Consecutive clear observations that auto-resolve an open record.
    /// `None` or `0` disables auto-clear.
    pub auto_clear_after: Option<u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 300,
            auto_clear_after: Some(5),
        }
    }
}

/// Deduplication key of an anomaly record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub stream_id: String,
    pub kind: AnomalyType,
    pub source: String,
}

impl DedupKey {
    pub fn new(stream_id: impl Into<String>, kind: AnomalyType, source: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind,
            source: source.into(),
        }
    }

    fn of(anomaly: &Anomaly) -> Self {
        Self::new(&anomaly.stream_id, anomaly.kind, &anomaly.source)
    }
}

impl From<&AnomalyCandidate> for DedupKey {
    fn from(c: &AnomalyCandidate) -> Self {
        Self::new(&c.stream_id, c.kind, &c.source)
    }
}

/// One detector verdict for one key: a candidate, or a clear sample.
#[derive(Debug, Clone)]
pub struct Observation {
    pub key: DedupKey,
    pub timestamp: u64,
    pub candidate: Option<AnomalyCandidate>,
}

impl Observation {
    pub fn anomalous(candidate: AnomalyCandidate) -> Self {
        Self {
            key: DedupKey::from(&candidate),
            timestamp: candidate.timestamp,
            candidate: Some(candidate),
        }
    }

    pub fn clear(key: DedupKey, timestamp: u64) -> Self {
        Self {
            key,
            timestamp,
            candidate: None,
        }
    }
}

/// A change to an anomaly record.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleChange {
    Opened(Anomaly),
    Updated(Anomaly),
    Resolved(Anomaly),
}

impl LifecycleChange {
    pub fn anomaly(&self) -> &Anomaly {
        match self {
            LifecycleChange::Opened(a)
            | LifecycleChange::Updated(a)
            | LifecycleChange::Resolved(a) => a,
        }
    }
}

/// Result of a manual resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved(Anomaly),
    /// Already resolved; the record is returned unchanged.
    AlreadyResolved(Anomaly),
}

impl ResolveOutcome {
    pub fn anomaly(&self) -> &Anomaly {
        match self {
            ResolveOutcome::Resolved(a) | ResolveOutcome::AlreadyResolved(a) => a,
        }
    }

    pub fn into_anomaly(self) -> Anomaly {
        match self {
            ResolveOutcome::Resolved(a) | ResolveOutcome::AlreadyResolved(a) => a,
        }
    }
}

/// Query filter for [`AlertManager::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnomalyFilter {
    pub severity: Option<Severity>,
    pub resolved: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<AnomalyType>,
    pub stream_id: Option<String>,
    pub limit: Option<usize>,
}

impl AnomalyFilter {
    fn matches(&self, a: &Anomaly) -> bool {
        self.severity.is_none_or(|s| a.severity == s)
            && self.resolved.is_none_or(|r| a.resolved == r)
            && self.kind.is_none_or(|k| a.kind == k)
            && self.stream_id.as_deref().is_none_or(|s| a.stream_id == s)
    }
}

/// Headline counters over all anomaly records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySummary {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub open_by_severity: BTreeMap<Severity, usize>,
    pub average_confidence: f64,
}

/// Owns every anomaly record. Single writer; callers serialize access.
#[derive(Debug)]
pub struct AlertManager {
    config: LifecycleConfig,
    records: HashMap<AnomalyId, Anomaly>,
    open: HashMap<DedupKey, AnomalyId>,
    clear_streak: HashMap<DedupKey, u32>,
    next_seq: u64,
}

impl AlertManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            open: HashMap::new(),
            clear_streak: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Load persisted records. ID assignment resumes after the highest
    /// restored sequence number.
    pub fn restore(&mut self, anomalies: impl IntoIterator<Item = Anomaly>) {
        for anomaly in anomalies {
            if let Some(seq) = parse_sequence(ANOMALY_ID_PREFIX, &anomaly.id) {
                self.next_seq = self.next_seq.max(seq + 1);
            }
            if !anomaly.resolved {
                let key = DedupKey::of(&anomaly);
                let newer = match self.open.get(&key).and_then(|id| self.records.get(id)) {
                    Some(existing) => anomaly.detected_at >= existing.detected_at,
                    None => true,
                };
                if newer {
                    self.open.insert(key, anomaly.id.clone());
                }
            }
            self.records.insert(anomaly.id.clone(), anomaly);
        }
        debug!(
            records = self.records.len(),
            open = self.open.len(),
            "anomaly history restored"
        );
    }

    /// Fold one observation into the records.
    pub fn observe(&mut self, observation: Observation) -> Vec<LifecycleChange> {
        match observation.candidate {
            Some(candidate) => self.on_candidate(observation.key, candidate),
            None => self.on_clear(observation.key, observation.timestamp),
        }
    }

    fn on_candidate(&mut self, key: DedupKey, c: AnomalyCandidate) -> Vec<LifecycleChange> {
        let mut changes = Vec::new();
        self.clear_streak.remove(&key);

        if let Some(id) = self.open.get(&key).cloned() {
            let debounce = self.config.debounce_secs;
            if let Some(record) = self.records.get_mut(&id) {
                if c.timestamp.saturating_sub(record.last_seen_at) <= debounce {
                    record.value = c.value;
                    record.confidence = c.confidence;
                    record.deviation_pct = c.deviation_pct;
                    record.baseline = c.baseline;
                    record.last_seen_at = record.last_seen_at.max(c.timestamp);
                    record.occurrences = record.occurrences.saturating_add(1);
                    record.severity = record.severity.max(c.severity);
                    debug!(
                        id = %record.id,
                        stream = %record.stream_id,
                        severity = %record.severity,
                        occurrences = record.occurrences,
                        "anomaly updated"
                    );
                    changes.push(LifecycleChange::Updated(record.clone()));
                    return changes;
                }

                close(record, ResolutionReason::Stale, c.timestamp);
                info!(id = %record.id, stream = %record.stream_id, "stale anomaly closed");
                changes.push(LifecycleChange::Resolved(record.clone()));
            }
            self.open.remove(&key);
        }

        let id = sequence_id(ANOMALY_ID_PREFIX, self.next_seq);
        self.next_seq += 1;
        let anomaly = Anomaly {
            id: id.clone(),
            stream_id: c.stream_id,
            kind: c.kind,
            severity: c.severity,
            confidence: c.confidence,
            value: c.value,
            baseline: c.baseline,
            deviation_pct: c.deviation_pct,
            source: c.source,
            detected_at: c.timestamp,
            last_seen_at: c.timestamp,
            occurrences: 1,
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        info!(
            %id,
            stream = %anomaly.stream_id,
            kind = %anomaly.kind,
            severity = %anomaly.severity,
            deviation_pct = anomaly.deviation_pct,
            source = %anomaly.source,
            "anomaly opened"
        );
        self.open.insert(key, id.clone());
        self.records.insert(id, anomaly.clone());
        changes.push(LifecycleChange::Opened(anomaly));
        changes
    }

    fn on_clear(&mut self, key: DedupKey, timestamp: u64) -> Vec<LifecycleChange> {
        let Some(id) = self.open.get(&key).cloned() else {
            self.clear_streak.remove(&key);
            return Vec::new();
        };
        let Some(threshold) = self.config.auto_clear_after.filter(|n| *n > 0) else {
            return Vec::new();
        };

        let streak = self.clear_streak.entry(key.clone()).or_insert(0);
        *streak += 1;
        if *streak < threshold {
            return Vec::new();
        }

        self.clear_streak.remove(&key);
        self.open.remove(&key);
        match self.records.get_mut(&id) {
            Some(record) => {
                close(record, ResolutionReason::AutoClear, timestamp);
                info!(%id, stream = %record.stream_id, "anomaly auto-cleared");
                vec![LifecycleChange::Resolved(record.clone())]
            }
            None => Vec::new(),
        }
    }

    /// Manually resolve an anomaly. Resolving twice is a no-op.
    pub fn resolve(&mut self, id: &str, now: u64) -> LifecycleResult<ResolveOutcome> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        if record.resolved {
            return Ok(ResolveOutcome::AlreadyResolved(record.clone()));
        }

        close(record, ResolutionReason::Manual, now);
        let key = DedupKey::of(record);
        let resolved = record.clone();
        if self.open.get(&key).map(String::as_str) == Some(id) {
            self.open.remove(&key);
        }
        self.clear_streak.remove(&key);
        info!(%id, "anomaly resolved");
        Ok(ResolveOutcome::Resolved(resolved))
    }

    pub fn get(&self, id: &str) -> Option<&Anomaly> {
        self.records.get(id)
    }

    /// Records matching `filter`, newest first.
    pub fn list(&self, filter: &AnomalyFilter) -> Vec<Anomaly> {
        let mut out: Vec<Anomaly> = self
            .records
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.detected_at.cmp(&a.detected_at).then_with(|| {
                let seq_a = parse_sequence(ANOMALY_ID_PREFIX, &a.id);
                let seq_b = parse_sequence(ANOMALY_ID_PREFIX, &b.id);
                seq_b.cmp(&seq_a).then_with(|| b.id.cmp(&a.id))
            })
        });
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn summary(&self) -> AnomalySummary {
        let total = self.records.len();
        let mut open_by_severity: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        let mut open = 0;
        let mut confidence_sum = 0.0;
        for a in self.records.values() {
            confidence_sum += a.confidence;
            if !a.resolved {
                open += 1;
                *open_by_severity.entry(a.severity).or_insert(0) += 1;
            }
        }
        AnomalySummary {
            total,
            open,
            resolved: total - open,
            open_by_severity,
            average_confidence: if total == 0 {
                0.0
            } else {
                confidence_sum / total as f64
            },
        }
    }

    /// Number of records, open and resolved.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

fn close(record: &mut Anomaly, reason: ResolutionReason, at: u64) {
    record.resolved = true;
    record.resolved_at = Some(at.max(record.detected_at));
    record.resolution = Some(reason);
}
