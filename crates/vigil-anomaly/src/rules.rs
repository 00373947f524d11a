//! Static threshold rules.
//!
//! A rule compares each sample of one stream against a fixed threshold and
//! fires with a configured severity. Rules run alongside the statistical
//! detector; each rule is its own dedup source (`rule:<name>`).

use serde::{Deserialize, Serialize};

use vigil_state::{MetricSample, Severity};

use crate::detector::{AnomalyCandidate, deviation_pct};
use crate::profile::StreamProfile;

/// Comparison operator of a threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Ne => value != threshold,
        }
    }
}

/// Fires when `value <operator> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub name: String,
    #[serde(rename = "stream")]
    pub stream_id: String,
    pub operator: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ThresholdRule {
    /// Source label used for this rule's anomalies.
    pub fn source(&self) -> String {
        format!("rule:{}", self.name)
    }

    pub fn evaluate(
        &self,
        profile: &StreamProfile,
        sample: &MetricSample,
    ) -> Option<AnomalyCandidate> {
        if !self.enabled || sample.stream_id != self.stream_id {
            return None;
        }
        if !self.operator.holds(sample.value, self.threshold) {
            return None;
        }
        Some(AnomalyCandidate {
            stream_id: sample.stream_id.clone(),
            kind: profile.kind,
            severity: self.severity,
            confidence: 1.0,
            value: sample.value,
            baseline: self.threshold,
            deviation_pct: deviation_pct(sample.value, self.threshold),
            source: self.source(),
            timestamp: sample.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p99_rule() -> ThresholdRule {
        ThresholdRule {
            name: "p99-slo".to_string(),
            stream_id: "api.latency_p99".to_string(),
            operator: Comparison::Gt,
            threshold: 500.0,
            severity: Severity::Critical,
            enabled: true,
        }
    }

    #[test]
    fn comparisons() {
        assert!(Comparison::Gt.holds(2.0, 1.0));
        assert!(!Comparison::Gt.holds(1.0, 1.0));
        assert!(Comparison::Ge.holds(1.0, 1.0));
        assert!(Comparison::Lt.holds(0.5, 1.0));
        assert!(Comparison::Le.holds(1.0, 1.0));
        assert!(Comparison::Eq.holds(3.0, 3.0));
        assert!(Comparison::Ne.holds(3.0, 4.0));
    }

    #[test]
    fn fires_above_threshold() {
        let rule = p99_rule();
        let profile = StreamProfile::infer(&rule.stream_id);
        let sample = MetricSample::new("api.latency_p99", 10, 750.0);

        let candidate = rule.evaluate(&profile, &sample).unwrap();
        assert_eq!(candidate.source, "rule:p99-slo");
        assert_eq!(candidate.severity, Severity::Critical);
        assert_eq!(candidate.baseline, 500.0);
        assert_eq!(candidate.deviation_pct, 50.0);
        assert_eq!(candidate.confidence, 1.0);
    }

    #[test]
    fn ignores_other_streams_and_disabled() {
        let mut rule = p99_rule();
        let profile = StreamProfile::infer("api.latency_p50");
        let other = MetricSample::new("api.latency_p50", 10, 900.0);
        assert!(rule.evaluate(&profile, &other).is_none());

        rule.enabled = false;
        let sample = MetricSample::new("api.latency_p99", 10, 900.0);
        assert!(rule.evaluate(&profile, &sample).is_none());
    }

    #[test]
    fn parses_operator_symbols() {
        let rule: ThresholdRule = serde_json::from_str(
            r#"{"name":"low-health","stream":"backend_health","operator":"<","threshold":80.0,"severity":"high"}"#,
        )
        .unwrap();
        assert_eq!(rule.operator, Comparison::Lt);
        assert!(rule.enabled);
    }
}
