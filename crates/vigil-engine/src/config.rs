//! vigil.toml configuration parser.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. Durations are strings such as `"500ms"`, `"5s"`, `"2m"`
//! or `"1h"`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_anomaly::{DetectorConfig, LifecycleConfig, StreamProfile, ThresholdRule};
use vigil_autoscale::{DecisionConfig, PolicyError, PolicySet};
use vigil_state::ScalingPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("{field}: invalid duration {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub server: ServerSection,
    pub engine: EngineSection,
    pub detection: DetectorConfig,
    pub lifecycle: LifecycleConfig,
    pub scaling: ScalingSection,
    pub streams: Vec<StreamProfile>,
    pub rules: Vec<ThresholdRule>,
    pub policies: Vec<ScalingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    /// Directory of the redb state file. Unset keeps state in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 9090,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub tick_interval: String,
    /// Wall-clock budget for the detection fan-out of one tick.
    pub tick_budget: String,
    pub window_capacity: usize,
    pub ewma_alpha: f64,
    /// Instance count assumed when no scaling state was persisted.
    pub initial_instances: u32,
    /// Samples buffered between ticks before ingestion pushes back.
    pub max_pending_samples: usize,
    /// Capacity of the notification broadcast channel.
    pub notification_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            tick_interval: "5s".to_string(),
            tick_budget: "2s".to_string(),
            window_capacity: vigil_metrics::DEFAULT_WINDOW_CAPACITY,
            ewma_alpha: 0.3,
            initial_instances: 2,
            max_pending_samples: 100_000,
            notification_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSection {
    pub scale_down_ratio: f64,
    pub min_forecast_confidence: f64,
    pub forecast_timeout: String,
    pub executor_timeout: String,
}

impl Default for ScalingSection {
    fn default() -> Self {
        let decision = DecisionConfig::default();
        Self {
            scale_down_ratio: decision.scale_down_ratio,
            min_forecast_confidence: decision.min_forecast_confidence,
            forecast_timeout: "1s".to_string(),
            executor_timeout: "30s".to_string(),
        }
    }
}

impl ScalingSection {
    pub fn decision(&self) -> DecisionConfig {
        DecisionConfig {
            scale_down_ratio: self.scale_down_ratio,
            min_forecast_confidence: self.min_forecast_confidence,
        }
    }
}

/// Parsed durations of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub tick_interval: Duration,
    pub tick_budget: Duration,
    pub forecast_timeout: Duration,
    pub executor_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            tick_budget: Duration::from_secs(2),
            forecast_timeout: Duration::from_secs(1),
            executor_timeout: Duration::from_secs(30),
        }
    }
}

impl VigilConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: VigilConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn timings(&self) -> Result<Timings, ConfigError> {
        let parse = |field: &'static str, value: &str| {
            parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
                field,
                value: value.to_string(),
            })
        };
        Ok(Timings {
            tick_interval: parse("engine.tick_interval", &self.engine.tick_interval)?,
            tick_budget: parse("engine.tick_budget", &self.engine.tick_budget)?,
            forecast_timeout: parse("scaling.forecast_timeout", &self.scaling.forecast_timeout)?,
            executor_timeout: parse("scaling.executor_timeout", &self.scaling.executor_timeout)?,
        })
    }

    /// Streams named by declared profiles or threshold rules.
    pub fn known_streams(&self) -> HashSet<String> {
        self.streams
            .iter()
            .map(|s| s.stream_id.clone())
            .chain(self.rules.iter().map(|r| r.stream_id.clone()))
            .collect()
    }

    /// Check everything that can be checked without running the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = self.timings()?;
        if timings.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("engine.tick_interval must be positive".into()));
        }
        if timings.tick_budget.is_zero() {
            return Err(ConfigError::Invalid("engine.tick_budget must be positive".into()));
        }
        if self.engine.window_capacity == 0 {
            return Err(ConfigError::Invalid("engine.window_capacity must be at least 1".into()));
        }
        if !(self.engine.ewma_alpha > 0.0 && self.engine.ewma_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "engine.ewma_alpha {} is outside (0, 1]",
                self.engine.ewma_alpha
            )));
        }
        if self.engine.max_pending_samples == 0 || self.engine.notification_buffer == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_pending_samples and engine.notification_buffer must be positive".into(),
            ));
        }
        if !(self.scaling.scale_down_ratio >= 0.0 && self.scaling.scale_down_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scaling.scale_down_ratio {} is outside [0, 1]",
                self.scaling.scale_down_ratio
            )));
        }
        if !self.detection.min_z_score.is_finite() || self.detection.min_z_score < 0.0 {
            return Err(ConfigError::Invalid("detection.min_z_score must be >= 0".into()));
        }
        if self.lifecycle.debounce_secs == 0 {
            return Err(ConfigError::Invalid("lifecycle.debounce_secs must be positive".into()));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.stream_id.trim().is_empty() {
                return Err(ConfigError::Invalid("streams: id must not be empty".into()));
            }
            if !seen.insert(stream.stream_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "streams: {} declared twice",
                    stream.stream_id
                )));
            }
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() || rule.stream_id.trim().is_empty() {
                return Err(ConfigError::Invalid("rules: name and stream are required".into()));
            }
            if !rule.threshold.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "rules: {} has a non-finite threshold",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::Invalid(format!("rules: {} defined twice", rule.name)));
            }
        }

        let known = self.known_streams();
        let mut set = PolicySet::new();
        for policy in &self.policies {
            set.create(policy.clone(), |m| known.contains(m))?;
        }
        Ok(())
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
