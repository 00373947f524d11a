//! Stream profiles: what kind of metric a stream carries and where it
//! comes from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vigil_state::AnomalyType;

/// Which rolling value a stream's baseline is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    /// Window mean.
    #[default]
    Mean,
    /// Exponentially weighted mean, for slow-trend metrics.
    Ewma,
}

/// Detection metadata for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProfile {
    #[serde(rename = "id")]
    pub stream_id: String,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    /// Reported as the anomaly source (e.g. `load-balancer`).
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub baseline: BaselineMode,
}

fn default_source() -> String {
    "ingest".to_string()
}

impl StreamProfile {
    /// Profile for a stream that was never declared, with its type guessed
    /// from the stream name.
    pub fn infer(stream_id: &str) -> Self {
        let name = stream_id.to_ascii_lowercase();
        let kind = if name.contains("latency") {
            AnomalyType::Latency
        } else if name.contains("error") {
            AnomalyType::ErrorRate
        } else if name.contains("traffic") || name.contains("rps") || name.contains("request") {
            AnomalyType::Traffic
        } else if name.contains("security") || name.contains("auth") {
            AnomalyType::Security
        } else {
            AnomalyType::Resource
        };
        Self {
            stream_id: stream_id.to_string(),
            kind,
            source: default_source(),
            baseline: BaselineMode::Mean,
        }
    }
}

/// Declared profiles, with inference for everything else.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, StreamProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: impl IntoIterator<Item = StreamProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.stream_id.clone(), p))
                .collect(),
        }
    }

    /// The declared profile, or an inferred one.
    pub fn resolve(&self, stream_id: &str) -> StreamProfile {
        self.profiles
            .get(stream_id)
            .cloned()
            .unwrap_or_else(|| StreamProfile::infer(stream_id))
    }

    pub fn is_declared(&self, stream_id: &str) -> bool {
        self.profiles.contains_key(stream_id)
    }

    pub fn declared(&self) -> impl Iterator<Item = &StreamProfile> {
        self.profiles.values()
    }
}
