//! Policy evaluation: stream statistics and forecasts in, one target out.
//!
//! [`PolicyEngine::decide`] is pure. It never looks at cooldowns or at the
//! event in flight; the convergence loop owns those.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use vigil_metrics::WindowStats;
use vigil_state::{PolicyKind, ScalingEventKind, ScalingPolicy};

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Rejections raised when a policy is created or updated.
#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("policy id must not be empty")]
    EmptyId,

    #[error("policy {id}: min_instances {min} exceeds max_instances {max}")]
    InvalidBounds { id: String, min: u32, max: u32 },

    #[error("policy {id}: aggressiveness {value} is outside 0.0..=1.0")]
    InvalidAggressiveness { id: String, value: f64 },

    #[error("policy {id}: threshold {value} must be finite and positive")]
    InvalidThreshold { id: String, value: f64 },

    #[error("policy {id}: unknown metric {metric}")]
    UnknownMetric { id: String, metric: String },

    #[error("enabled policies have no common instance range (min {min} > max {max})")]
    ConflictingBounds { min: u32, max: u32 },

    #[error("policy already exists: {0}")]
    Duplicate(String),

    #[error("policy not found: {0}")]
    NotFound(String),
}

/// Check a single policy in isolation.
///
/// `known_metric` answers whether a stream name refers to something the
/// engine can observe.
pub fn validate_policy(
    policy: &ScalingPolicy,
    known_metric: impl Fn(&str) -> bool,
) -> PolicyResult<()> {
    let id = policy.id.trim();
    if id.is_empty() {
        return Err(PolicyError::EmptyId);
    }
    if policy.min_instances > policy.max_instances {
        return Err(PolicyError::InvalidBounds {
            id: id.to_string(),
            min: policy.min_instances,
            max: policy.max_instances,
        });
    }
    if !(0.0..=1.0).contains(&policy.aggressiveness) {
        return Err(PolicyError::InvalidAggressiveness {
            id: id.to_string(),
            value: policy.aggressiveness,
        });
    }
    if !policy.threshold.is_finite() || policy.threshold <= 0.0 {
        return Err(PolicyError::InvalidThreshold {
            id: id.to_string(),
            value: policy.threshold,
        });
    }
    if !known_metric(&policy.metric) {
        return Err(PolicyError::UnknownMetric {
            id: id.to_string(),
            metric: policy.metric.clone(),
        });
    }
    Ok(())
}

/// Intersection of the enabled policies' instance ranges:
/// `(max(min_instances), min(max_instances))`. `None` with no enabled
/// policy.
pub fn union_bounds<'a>(policies: impl IntoIterator<Item = &'a ScalingPolicy>) -> Option<(u32, u32)> {
    policies
        .into_iter()
        .filter(|p| p.enabled)
        .fold(None, |acc, p| match acc {
            None => Some((p.min_instances, p.max_instances)),
            Some((lo, hi)) => Some((lo.max(p.min_instances), hi.min(p.max_instances))),
        })
}

/// The configured policy set, validated on every write.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: BTreeMap<String, ScalingPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from trusted (already persisted) policies without validation.
    pub fn restore(policies: impl IntoIterator<Item = ScalingPolicy>) -> Self {
        Self {
            policies: policies.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn create(
        &mut self,
        policy: ScalingPolicy,
        known_metric: impl Fn(&str) -> bool,
    ) -> PolicyResult<()> {
        validate_policy(&policy, known_metric)?;
        if self.policies.contains_key(&policy.id) {
            return Err(PolicyError::Duplicate(policy.id));
        }
        self.check_feasible_with(&policy)?;
        debug!(policy = %policy.id, metric = %policy.metric, "policy created");
        self.policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    pub fn update(
        &mut self,
        policy: ScalingPolicy,
        known_metric: impl Fn(&str) -> bool,
    ) -> PolicyResult<()> {
        if !self.policies.contains_key(&policy.id) {
            return Err(PolicyError::NotFound(policy.id));
        }
        validate_policy(&policy, known_metric)?;
        self.check_feasible_with(&policy)?;
        debug!(policy = %policy.id, enabled = policy.enabled, "policy updated");
        self.policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    fn check_feasible_with(&self, candidate: &ScalingPolicy) -> PolicyResult<()> {
        let others = self.policies.values().filter(|p| p.id != candidate.id);
        match union_bounds(others.chain(std::iter::once(candidate))) {
            Some((min, max)) if min > max => Err(PolicyError::ConflictingBounds { min, max }),
            _ => Ok(()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ScalingPolicy> {
        self.policies.get(id)
    }

    /// All policies, ordered by ID.
    pub fn list(&self) -> Vec<ScalingPolicy> {
        self.policies.values().cloned().collect()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ScalingPolicy> {
        self.policies.values().filter(|p| p.enabled)
    }

    /// Metrics watched by enabled policies.
    pub fn metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = self.enabled().map(|p| p.metric.clone()).collect();
        metrics.sort();
        metrics.dedup();
        metrics
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// A forecast supplied by an external predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub metric: String,
    pub predicted_value: f64,
    /// How far ahead the prediction looks, in seconds.
    pub horizon_secs: u64,
    pub confidence: f64,
}

/// Tunables for [`PolicyEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// A signal below `threshold * scale_down_ratio` proposes a scale-down.
    pub scale_down_ratio: f64,
    /// Forecasts less confident than this are ignored.
    pub min_forecast_confidence: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            scale_down_ratio: 0.5,
            min_forecast_confidence: 0.5,
        }
    }
}

/// A concrete target produced by [`PolicyEngine::decide`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleTarget {
    pub target: u32,
    /// Policy that won the combination; `None` for bound corrections.
    pub policy_id: Option<String>,
    /// Metric name, `predictive`, or `bounds`.
    pub trigger: String,
    pub cooldown_seconds: u64,
    pub aggressiveness: f64,
    pub confidence: f64,
    pub kind: ScalingEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TargetDecision {
    ScaleTo(ScaleTarget),
    Hold,
}

impl TargetDecision {
    pub fn target(&self) -> Option<u32> {
        match self {
            TargetDecision::ScaleTo(t) => Some(t.target),
            TargetDecision::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
struct Signal {
    direction: Direction,
    breach: f64,
    confidence: f64,
    predictive: bool,
}

#[derive(Debug, Clone)]
struct Proposal<'a> {
    policy: &'a ScalingPolicy,
    signal: Signal,
    target: u32,
}

/// Evaluates policies into a single [`TargetDecision`].
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: DecisionConfig,
}

impl PolicyEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Decide the target instance count.
    ///
    /// `basis` is the instance count proposals are computed from: the
    /// starting point of the event in flight, or the current count.
    pub fn decide(
        &self,
        stats: &HashMap<String, WindowStats>,
        policies: &[ScalingPolicy],
        forecasts: &HashMap<String, Forecast>,
        basis: u32,
    ) -> TargetDecision {
        let Some((lo, hi)) = union_bounds(policies) else {
            return TargetDecision::Hold;
        };
        // Infeasible sets are rejected on write; pin to the floor if one slips by.
        let hi = hi.max(lo);

        let proposals: Vec<Proposal<'_>> = policies
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| {
                let signal = self.signal_for(p, stats, forecasts)?;
                let step = step_size(basis, signal.breach, p.aggressiveness);
                let target = match signal.direction {
                    Direction::Up => basis.saturating_add(step),
                    Direction::Down => basis.saturating_sub(step),
                };
                Some(Proposal {
                    policy: p,
                    signal,
                    target,
                })
            })
            .collect();

        let winner = pick(&proposals, Direction::Up).or_else(|| pick(&proposals, Direction::Down));

        let Some(winner) = winner else {
            if basis < lo || basis > hi {
                let target = basis.clamp(lo, hi);
                debug!(basis, target, lo, hi, "instance count outside policy bounds");
                return TargetDecision::ScaleTo(ScaleTarget {
                    target,
                    policy_id: None,
                    trigger: "bounds".to_string(),
                    cooldown_seconds: 0,
                    aggressiveness: 1.0,
                    confidence: 1.0,
                    kind: ScalingEventKind::between(basis, target),
                });
            }
            return TargetDecision::Hold;
        };

        let target = winner.target.clamp(lo, hi);
        if target == basis {
            return TargetDecision::Hold;
        }

        let trigger = if winner.signal.predictive {
            "predictive".to_string()
        } else {
            winner.policy.metric.clone()
        };
        debug!(
            policy = %winner.policy.id,
            basis,
            proposed = winner.target,
            target,
            breach = winner.signal.breach,
            %trigger,
            "scaling target decided"
        );
        TargetDecision::ScaleTo(ScaleTarget {
            target,
            policy_id: Some(winner.policy.id.clone()),
            trigger,
            cooldown_seconds: winner.policy.cooldown_seconds,
            aggressiveness: winner.policy.aggressiveness,
            confidence: winner.signal.confidence,
            kind: ScalingEventKind::between(basis, target),
        })
    }

    fn signal_for(
        &self,
        policy: &ScalingPolicy,
        stats: &HashMap<String, WindowStats>,
        forecasts: &HashMap<String, Forecast>,
    ) -> Option<Signal> {
        let reactive = || {
            let s = stats.get(&policy.metric)?;
            self.classify(s.last, policy.threshold).map(|(direction, breach)| Signal {
                direction,
                breach,
                confidence: 0.5 + 0.5 * breach.min(1.0),
                predictive: false,
            })
        };
        let predictive = || {
            let f = forecasts
                .get(&policy.metric)
                .filter(|f| f.confidence >= self.config.min_forecast_confidence)?;
            self.classify(f.predicted_value, policy.threshold)
                .map(|(direction, breach)| Signal {
                    direction,
                    breach,
                    confidence: f.confidence.clamp(0.0, 1.0),
                    predictive: true,
                })
        };

        match policy.kind {
            PolicyKind::Reactive => reactive(),
            PolicyKind::Predictive => predictive(),
            PolicyKind::Hybrid => stronger(reactive(), predictive()),
        }
    }

    fn classify(&self, value: f64, threshold: f64) -> Option<(Direction, f64)> {
        if !value.is_finite() || threshold <= 0.0 {
            return None;
        }
        if value > threshold {
            Some((Direction::Up, (value - threshold) / threshold))
        } else if value < threshold * self.config.scale_down_ratio {
            Some((Direction::Down, (threshold - value) / threshold))
        } else {
            None
        }
    }
}

/// Up beats down; within a direction the larger breach wins.
fn stronger(a: Option<Signal>, b: Option<Signal>) -> Option<Signal> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.direction != b.direction {
                Some(if a.direction == Direction::Up { a } else { b })
            } else if b.breach > a.breach {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}

fn step_size(basis: u32, breach: f64, aggressiveness: f64) -> u32 {
    let raw = (basis as f64 * breach * aggressiveness).ceil();
    if raw.is_finite() && raw >= 1.0 {
        raw.min(u32::MAX as f64) as u32
    } else {
        1
    }
}

/// Largest target in `direction`. For scale-down that is the least
/// aggressive proposal.
fn pick<'a, 'p>(proposals: &'p [Proposal<'a>], direction: Direction) -> Option<&'p Proposal<'a>> {
    let mut best: Option<&'p Proposal<'a>> = None;
    for p in proposals.iter().filter(|p| p.signal.direction == direction) {
        if best.is_none_or(|b| p.target > b.target) {
            best = Some(p);
        }
    }
    best
}
