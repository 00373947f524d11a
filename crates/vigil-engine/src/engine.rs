//! The engine: owns every component and runs one tick at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vigil_anomaly::{
    AlertManager, AnomalyFilter, AnomalySummary, DedupKey, Detector, LifecycleChange, Observation,
    ProfileRegistry, ResolveOutcome, StreamProfile, ThresholdRule,
};
use vigil_autoscale::{
    ConvergenceLoop, PolicyEngine, PolicySet, ScaleCallback, TargetDecision, union_bounds,
};
use vigil_metrics::{ExpositionSnapshot, WindowStats, WindowStore};
use vigil_state::{
    Anomaly, EVENT_ID_PREFIX, EventStatus, MetricSample, PolicyKind, ScalingEvent, ScalingPolicy,
    ScalingState, Severity, StateStore, parse_sequence,
};

use crate::config::{Timings, VigilConfig};
use crate::error::{EngineResult, IngestError};
use crate::forecast::{ForecastCallback, fetch_forecasts};
use crate::notify::{Notification, Notifier};

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What one tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub seq: u64,
    pub now: u64,
    /// Samples drained from the ingest buffer.
    pub samples: usize,
    /// Detection overran the tick budget; its observations were dropped.
    pub degraded: bool,
    /// Stream tasks that panicked.
    pub failed_streams: usize,
    #[serde(skip)]
    pub changes: Vec<LifecycleChange>,
    pub decision: TargetDecision,
    pub events: Vec<ScalingEvent>,
    pub state: ScalingState,
    pub elapsed_ms: u64,
}

impl TickReport {
    pub fn opened(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, LifecycleChange::Opened(_)))
            .count()
    }

    pub fn resolved(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, LifecycleChange::Resolved(_)))
            .count()
    }
}

#[derive(Debug, Default)]
struct IngestBuffer {
    pending: Vec<MetricSample>,
    last_accepted: HashMap<String, u64>,
}

/// Assembles an [`Engine`] from configuration and optional collaborators.
pub struct EngineBuilder {
    config: VigilConfig,
    store: Option<StateStore>,
    executor: Option<ScaleCallback>,
    forecaster: Option<ForecastCallback>,
    evaluator: StreamEvaluator,
}

impl EngineBuilder {
    /// Persist to `store` and restore history from it.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Callback that performs scaling steps. Without one, decisions are
    /// applied to the recorded state only.
    pub fn with_executor(mut self, executor: ScaleCallback) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_forecaster(mut self, forecaster: ForecastCallback) -> Self {
        self.forecaster = Some(forecaster);
        self
    }

    #[cfg(test)]
    fn with_evaluator(mut self, evaluator: StreamEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        config.validate()?;
        let timings = config.timings()?;

        let mut alerts = AlertManager::new(config.lifecycle.clone());
        let mut convergence = ConvergenceLoop::new(config.engine.initial_instances)
            .with_executor_timeout(timings.executor_timeout);
        if let Some(executor) = self.executor {
            convergence = convergence.with_executor(executor);
        }

        let mut policies = PolicySet::new();
        let mut events: BTreeMap<u64, ScalingEvent> = BTreeMap::new();

        if let Some(store) = &self.store {
            let anomalies = store.list_anomalies()?;
            let restored_anomalies = anomalies.len();
            alerts.restore(anomalies);

            let persisted_events = store.list_events()?;
            let state = store
                .get_scaling_state()?
                .unwrap_or_else(|| ScalingState::new(config.engine.initial_instances));
            let closed = convergence.restore(state, &persisted_events);
            if !closed.is_empty() {
                store.put_events(&closed)?;
            }
            for event in persisted_events.into_iter().chain(closed) {
                if let Some(seq) = parse_sequence(EVENT_ID_PREFIX, &event.id) {
                    events.insert(seq, event);
                }
            }

            policies = PolicySet::restore(store.list_policies()?);
            info!(
                anomalies = restored_anomalies,
                events = events.len(),
                policies = policies.len(),
                "engine state restored"
            );
        }

        // Configured policies seed the set; persisted edits win.
        let known = config.known_streams();
        for policy in &config.policies {
            if policies.get(&policy.id).is_none() {
                policies.create(policy.clone(), |m| known.contains(m))?;
                if let Some(store) = &self.store {
                    store.put_policy(policy)?;
                }
            }
        }

        let scaling_state = convergence.state().clone();
        Ok(Engine {
            windows: Arc::new(WindowStore::new(
                config.engine.window_capacity,
                config.engine.ewma_alpha,
            )),
            profiles: Arc::new(ProfileRegistry::new(config.streams.iter().cloned())),
            rules: Arc::new(config.rules.clone()),
            detector: Detector::new(config.detection.clone()),
            policy_engine: PolicyEngine::new(config.scaling.decision()),
            alerts: Mutex::new(alerts),
            policies: RwLock::new(policies),
            convergence: Mutex::new(convergence),
            scaling_state: RwLock::new(scaling_state),
            events: RwLock::new(events),
            ingest: Mutex::new(IngestBuffer::default()),
            tick_lock: Mutex::new(()),
            ticks: AtomicU64::new(0),
            notifier: Notifier::new(config.engine.notification_buffer),
            store: self.store,
            forecaster: self.forecaster,
            evaluator: self.evaluator,
            timings,
            max_pending: config.engine.max_pending_samples,
            known_streams: known,
        })
    }
}

/// The monitoring and autoscaling engine.
///
/// Each component sits behind its own lock; the tick is the only writer of
/// windows, anomaly records (besides manual resolve) and scaling state.
pub struct Engine {
    windows: Arc<WindowStore>,
    profiles: Arc<ProfileRegistry>,
    rules: Arc<Vec<ThresholdRule>>,
    detector: Detector,
    policy_engine: PolicyEngine,
    alerts: Mutex<AlertManager>,
    policies: RwLock<PolicySet>,
    convergence: Mutex<ConvergenceLoop>,
    scaling_state: RwLock<ScalingState>,
    events: RwLock<BTreeMap<u64, ScalingEvent>>,
    ingest: Mutex<IngestBuffer>,
    tick_lock: Mutex<()>,
    ticks: AtomicU64,
    notifier: Notifier,
    store: Option<StateStore>,
    forecaster: Option<ForecastCallback>,
    evaluator: StreamEvaluator,
    timings: Timings,
    max_pending: usize,
    known_streams: HashSet<String>,
}

impl Engine {
    pub fn builder(config: VigilConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            executor: None,
            forecaster: None,
            evaluator: evaluate_stream,
        }
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    // ── Ingestion ─────────────────────────────────────────────────

    /// Validate and buffer a sample for the next tick.
    ///
    /// A timestamp older than the stream's last accepted one is refused;
    /// an equal one is accepted.
    pub async fn ingest(&self, sample: MetricSample) -> Result<(), IngestError> {
        if sample.stream_id.trim().is_empty() {
            return Err(IngestError::EmptyStreamId);
        }
        if !sample.value.is_finite() {
            return Err(IngestError::NonFiniteValue {
                stream_id: sample.stream_id,
                value: sample.value,
            });
        }

        let mut buffer = self.ingest.lock().await;
        if let Some(&last) = buffer.last_accepted.get(&sample.stream_id)
            && sample.timestamp < last
        {
            return Err(IngestError::OutOfOrder {
                stream_id: sample.stream_id,
                timestamp: sample.timestamp,
                last,
            });
        }
        if buffer.pending.len() >= self.max_pending {
            return Err(IngestError::BufferFull {
                capacity: self.max_pending,
            });
        }
        buffer
            .last_accepted
            .insert(sample.stream_id.clone(), sample.timestamp);
        buffer.pending.push(sample);
        Ok(())
    }

    /// Samples waiting for the next tick.
    pub async fn pending_samples(&self) -> usize {
        self.ingest.lock().await.pending.len()
    }

    // ── Tick ──────────────────────────────────────────────────────

    /// Run one full tick at time `now`.
    ///
    /// Returns `None` when another tick is still running; overlapping ticks
    /// are skipped, never queued.
    pub async fn tick(&self, now: u64) -> Option<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!(now, "tick skipped: previous tick still running");
            return None;
        };
        let seq = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let samples = std::mem::take(&mut self.ingest.lock().await.pending);
        let sample_count = samples.len();

        let (observations, degraded, failed_streams) = self.detect(samples).await;

        let changes = {
            let mut alerts = self.alerts.lock().await;
            let mut changes = Vec::new();
            for observation in observations {
                changes.extend(alerts.observe(observation));
            }
            changes
        };

        let (policies, predictive_metrics) = {
            let set = self.policies.read().await;
            let policies: Vec<ScalingPolicy> = set.enabled().cloned().collect();
            let mut predictive: Vec<String> = policies
                .iter()
                .filter(|p| p.kind != PolicyKind::Reactive)
                .map(|p| p.metric.clone())
                .collect();
            predictive.sort();
            predictive.dedup();
            (policies, predictive)
        };
        let forecasts = fetch_forecasts(
            self.forecaster.as_ref(),
            &predictive_metrics,
            self.timings.forecast_timeout,
        )
        .await;
        let metric_ids: Vec<&str> = policies.iter().map(|p| p.metric.as_str()).collect();
        let stats = self.windows.stats_for(metric_ids).await;

        let (decision, convergence, state) = {
            let mut conv = self.convergence.lock().await;
            let decision = self
                .policy_engine
                .decide(&stats, &policies, &forecasts, conv.basis());
            let report = conv.tick(&decision, now).await;
            (decision, report, conv.state().clone())
        };

        *self.scaling_state.write().await = state.clone();
        {
            let mut events = self.events.write().await;
            for event in &convergence.events {
                if let Some(seq) = parse_sequence(EVENT_ID_PREFIX, &event.id) {
                    events.insert(seq, event.clone());
                }
            }
        }

        let touched: Vec<Anomaly> = changes.iter().map(|c| c.anomaly().clone()).collect();
        self.persist(&touched, &convergence.events, Some(&state));

        for change in &changes {
            self.notifier.send(change.clone().into());
        }
        for event in &convergence.events {
            self.notifier.send(Notification::ScalingEvent(event.clone()));
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            seq,
            samples = sample_count,
            changes = changes.len(),
            events = convergence.events.len(),
            current = state.current_instances,
            target = state.target_instances,
            elapsed_ms,
            "tick complete"
        );

        Some(TickReport {
            seq,
            now,
            samples: sample_count,
            degraded,
            failed_streams,
            changes,
            decision,
            events: convergence.events,
            state,
            elapsed_ms,
        })
    }

    /// Fan out one task per stream, join under the tick budget.
    async fn detect(&self, samples: Vec<MetricSample>) -> (Vec<Observation>, bool, usize) {
        let mut by_stream: BTreeMap<String, Vec<MetricSample>> = BTreeMap::new();
        for sample in samples {
            by_stream
                .entry(sample.stream_id.clone())
                .or_default()
                .push(sample);
        }

        let handles: Vec<(String, JoinHandle<Vec<Observation>>)> = by_stream
            .into_iter()
            .map(|(stream_id, samples)| {
                let job = StreamJob {
                    windows: self.windows.clone(),
                    detector: self.detector.clone(),
                    profile: self.profiles.resolve(&stream_id),
                    rules: self
                        .rules
                        .iter()
                        .filter(|r| r.enabled && r.stream_id == stream_id)
                        .cloned()
                        .collect(),
                    samples,
                };
                let handle = tokio::spawn((self.evaluator)(job));
                (stream_id, handle)
            })
            .collect();

        let budget = self.timings.tick_budget;
        let joined = tokio::time::timeout(budget, async move {
            let mut observations = Vec::new();
            let mut failed = 0;
            for (stream_id, handle) in handles {
                match handle.await {
                    Ok(mut obs) => observations.append(&mut obs),
                    Err(e) => {
                        failed += 1;
                        error!(stream = %stream_id, error = %e, "stream evaluation failed");
                    }
                }
            }
            (observations, failed)
        })
        .await;

        match joined {
            Ok((observations, failed)) => (observations, false, failed),
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "degraded: detection exceeded tick budget, observations dropped"
                );
                (Vec::new(), true, 0)
            }
        }
    }

    fn persist(&self, anomalies: &[Anomaly], events: &[ScalingEvent], state: Option<&ScalingState>) {
        let Some(store) = &self.store else {
            return;
        };
        if !anomalies.is_empty()
            && let Err(e) = store.put_anomalies(anomalies)
        {
            error!(error = %e, count = anomalies.len(), "failed to persist anomalies");
        }
        if !events.is_empty()
            && let Err(e) = store.put_events(events)
        {
            error!(error = %e, count = events.len(), "failed to persist scaling events");
        }
        if let Some(state) = state
            && let Err(e) = store.put_scaling_state(state)
        {
            error!(error = %e, "failed to persist scaling state");
        }
    }

    // ── Anomalies ─────────────────────────────────────────────────

    pub async fn anomalies(&self, filter: &AnomalyFilter) -> Vec<Anomaly> {
        self.alerts.lock().await.list(filter)
    }

    pub async fn anomaly(&self, id: &str) -> Option<Anomaly> {
        self.alerts.lock().await.get(id).cloned()
    }

    pub async fn anomaly_summary(&self) -> AnomalySummary {
        self.alerts.lock().await.summary()
    }

    /// Manually resolve an anomaly. Resolving twice is a no-op.
    pub async fn resolve_anomaly(&self, id: &str, now: u64) -> EngineResult<ResolveOutcome> {
        let outcome = self.alerts.lock().await.resolve(id, now)?;
        if let ResolveOutcome::Resolved(anomaly) = &outcome {
            self.persist(std::slice::from_ref(anomaly), &[], None);
            self.notifier
                .send(Notification::AnomalyResolved(anomaly.clone()));
        }
        Ok(outcome)
    }

    // ── Scaling ───────────────────────────────────────────────────

    pub async fn scaling_state(&self) -> ScalingState {
        self.scaling_state.read().await.clone()
    }

    /// Scaling events, newest first.
    pub async fn scaling_events(&self, limit: Option<usize>) -> Vec<ScalingEvent> {
        let events = self.events.read().await;
        events
            .values()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn policies(&self) -> Vec<ScalingPolicy> {
        self.policies.read().await.list()
    }

    pub async fn policy(&self, id: &str) -> Option<ScalingPolicy> {
        self.policies.read().await.get(id).cloned()
    }

    /// Streams a policy may watch: declared, rule-bound or already ingested.
    async fn known_metrics(&self) -> HashSet<String> {
        let mut known = self.known_streams.clone();
        known.extend(self.windows.streams().await);
        known.extend(
            self.ingest
                .lock()
                .await
                .last_accepted
                .keys()
                .cloned(),
        );
        known
    }

    /// Validate and persist `policy`; it goes live only once stored.
    pub async fn create_policy(&self, policy: ScalingPolicy) -> EngineResult<ScalingPolicy> {
        let known = self.known_metrics().await;
        let mut policies = self.policies.write().await;
        let mut next = policies.clone();
        next.create(policy.clone(), |m| known.contains(m))?;
        if let Some(store) = &self.store {
            store.put_policy(&policy)?;
        }
        *policies = next;
        info!(policy = %policy.id, metric = %policy.metric, "scaling policy created");
        Ok(policy)
    }

    pub async fn update_policy(&self, policy: ScalingPolicy) -> EngineResult<ScalingPolicy> {
        let known = self.known_metrics().await;
        let mut policies = self.policies.write().await;
        let mut next = policies.clone();
        next.update(policy.clone(), |m| known.contains(m))?;
        if let Some(store) = &self.store {
            store.put_policy(&policy)?;
        }
        *policies = next;
        info!(policy = %policy.id, enabled = policy.enabled, "scaling policy updated");
        Ok(policy)
    }

    /// Instance range allowed by the enabled policies.
    pub async fn bounds(&self) -> Option<(u32, u32)> {
        union_bounds(self.policies.read().await.enabled())
    }

    // ── Streams ───────────────────────────────────────────────────

    pub async fn streams(&self) -> Vec<(String, WindowStats)> {
        self.windows.snapshot().await
    }

    pub async fn stream_stats(&self, stream_id: &str) -> EngineResult<WindowStats> {
        Ok(self.windows.stats(stream_id).await?)
    }

    pub fn stream_profile(&self, stream_id: &str) -> StreamProfile {
        self.profiles.resolve(stream_id)
    }

    /// Everything the Prometheus endpoint renders.
    pub async fn exposition(&self) -> ExpositionSnapshot {
        let summary = self.anomaly_summary().await;
        let mut by_status: HashMap<EventStatus, usize> = HashMap::new();
        for event in self.events.read().await.values() {
            *by_status.entry(event.status).or_insert(0) += 1;
        }
        ExpositionSnapshot {
            streams: self.streams().await,
            open_anomalies: Severity::ALL
                .iter()
                .map(|s| (*s, summary.open_by_severity.get(s).copied().unwrap_or(0)))
                .collect(),
            scaling: Some(self.scaling_state().await),
            events_by_status: EventStatus::ALL
                .iter()
                .map(|s| (*s, by_status.get(s).copied().unwrap_or(0)))
                .collect(),
        }
    }
}

/// One stream's share of a tick.
struct StreamJob {
    windows: Arc<WindowStore>,
    detector: Detector,
    profile: StreamProfile,
    rules: Vec<ThresholdRule>,
    samples: Vec<MetricSample>,
}

type StreamFuture = Pin<Box<dyn Future<Output = Vec<Observation>> + Send>>;

/// Runs on its own task, one per stream with samples in the tick.
type StreamEvaluator = fn(StreamJob) -> StreamFuture;

fn evaluate_stream(job: StreamJob) -> StreamFuture {
    Box::pin(job.run())
}

impl StreamJob {
    /// Push the samples in order and score each against the window as it
    /// stood before that sample.
    async fn run(self) -> Vec<Observation> {
        let StreamJob {
            windows,
            detector,
            profile,
            rules,
            samples,
        } = self;
        let detector_key = DedupKey::new(&profile.stream_id, profile.kind, &profile.source);
        let mut observations = Vec::with_capacity(samples.len() * (1 + rules.len()));

        for sample in samples {
            let prior = windows.push(&sample).await;

            let candidate = prior.and_then(|prior| detector.evaluate(&profile, &prior, &sample));
            observations.push(match candidate {
                Some(c) => Observation::anomalous(c),
                None => Observation::clear(detector_key.clone(), sample.timestamp),
            });

            for rule in &rules {
                observations.push(match rule.evaluate(&profile, &sample) {
                    Some(c) => Observation::anomalous(c),
                    None => Observation::clear(
                        DedupKey::new(&sample.stream_id, profile.kind, rule.source()),
                        sample.timestamp,
                    ),
                });
            }
        }
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use vigil_autoscale::{BoxFuture, Forecast};

    use crate::forecast::static_forecasts;
    use vigil_state::{AnomalyType, ResolutionReason, ScalingEventKind};

    const SCALING: &str = r#"
[engine]
initial_instances = 2

[[streams]]
id = "cpu"
type = "resource"

[[policies]]
id = "cpu-reactive"
metric = "cpu"
threshold = 70.0
kind = "reactive"
min_instances = 1
max_instances = 10
cooldown_seconds = 60
aggressiveness = 1.0
"#;

    fn engine() -> Engine {
        Engine::builder(VigilConfig::default()).build().unwrap()
    }

    fn scaling_engine() -> Engine {
        let config = VigilConfig::from_toml_str(SCALING).unwrap();
        Engine::builder(config).build().unwrap()
    }

    async fn feed(engine: &Engine, stream: &str, values: &[(u64, f64)]) {
        for (ts, v) in values {
            engine.ingest(MetricSample::new(stream, *ts, *v)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn ingest_rejects_invalid_samples() {
        let engine = engine();

        assert_eq!(
            engine.ingest(MetricSample::new("", 1, 1.0)).await,
            Err(IngestError::EmptyStreamId)
        );
        assert!(matches!(
            engine.ingest(MetricSample::new("cpu", 1, f64::NAN)).await,
            Err(IngestError::NonFiniteValue { .. })
        ));

        engine.ingest(MetricSample::new("cpu", 10, 1.0)).await.unwrap();
        // Equal timestamps are fine, older ones are not.
        engine.ingest(MetricSample::new("cpu", 10, 2.0)).await.unwrap();
        assert_eq!(
            engine.ingest(MetricSample::new("cpu", 9, 3.0)).await,
            Err(IngestError::OutOfOrder {
                stream_id: "cpu".into(),
                timestamp: 9,
                last: 10,
            })
        );
        assert_eq!(engine.pending_samples().await, 2);
    }

    #[tokio::test]
    async fn ingest_buffer_is_bounded() {
        let mut config = VigilConfig::default();
        config.engine.max_pending_samples = 2;
        let engine = Engine::builder(config).build().unwrap();

        feed(&engine, "cpu", &[(1, 1.0), (2, 1.0)]).await;
        assert_eq!(
            engine.ingest(MetricSample::new("cpu", 3, 1.0)).await,
            Err(IngestError::BufferFull { capacity: 2 })
        );

        engine.tick(3).await.unwrap();
        engine.ingest(MetricSample::new("cpu", 3, 1.0)).await.unwrap();
    }

    #[tokio::test]
    async fn traffic_spike_opens_anomaly() {
        let engine = engine();
        let mut rx = engine.subscribe();

        feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
        let report = engine.tick(110).await.unwrap();

        assert_eq!(report.samples, 3);
        assert_eq!(report.opened(), 1);
        assert!(!report.degraded);

        let open = engine
            .anomalies(&AnomalyFilter {
                resolved: Some(false),
                ..Default::default()
            })
            .await;
        assert_eq!(open.len(), 1);
        let anomaly = &open[0];
        assert_eq!(anomaly.kind, AnomalyType::Traffic);
        assert_eq!(anomaly.severity, Severity::High);
        assert_eq!(anomaly.baseline, 810.0);
        assert_eq!(anomaly.detected_at, 110);
        assert!(anomaly.confidence > 0.9);

        match rx.recv().await.unwrap() {
            Notification::AnomalyOpened(a) => assert_eq!(a.id, anomaly.id),
            other => panic!("unexpected notification: {other:?}"),
        }

        let summary = engine.anomaly_summary().await;
        assert_eq!(summary.open, 1);
        assert_eq!(summary.open_by_severity[&Severity::High], 1);
    }

    #[tokio::test]
    async fn resolve_twice_is_a_no_op() {
        let engine = engine();
        feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
        engine.tick(110).await.unwrap();
        let id = engine.anomalies(&AnomalyFilter::default()).await[0].id.clone();

        let first = engine.resolve_anomaly(&id, 200).await.unwrap();
        assert!(matches!(first, ResolveOutcome::Resolved(_)));
        let resolved = first.into_anomaly();
        assert_eq!(resolved.resolved_at, Some(200));
        assert_eq!(resolved.resolution, Some(ResolutionReason::Manual));

        let second = engine.resolve_anomaly(&id, 300).await.unwrap();
        assert!(matches!(second, ResolveOutcome::AlreadyResolved(_)));
        assert_eq!(second.anomaly().resolved_at, Some(200));

        assert!(matches!(
            engine.resolve_anomaly("anom-999999", 300).await,
            Err(EngineError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn threshold_rule_fires_without_history() {
        let config = VigilConfig::from_toml_str(
            r#"
[[rules]]
name = "p99-slo"
stream = "api.latency_p99"
operator = ">"
threshold = 500.0
severity = "critical"
"#,
        )
        .unwrap();
        let engine = Engine::builder(config).build().unwrap();

        feed(&engine, "api.latency_p99", &[(1, 640.0)]).await;
        let report = engine.tick(1).await.unwrap();
        assert_eq!(report.opened(), 1);

        let anomaly = &engine.anomalies(&AnomalyFilter::default()).await[0];
        assert_eq!(anomaly.source, "rule:p99-slo");
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(anomaly.confidence, 1.0);
    }

    #[tokio::test]
    async fn sustained_load_scales_up() {
        let engine = scaling_engine();

        feed(&engine, "cpu", &[(100, 90.0)]).await;
        let report = engine.tick(100).await.unwrap();

        assert!(matches!(report.decision, TargetDecision::ScaleTo(_)));
        assert_eq!(report.events.len(), 1);
        let event = &report.events[0];
        assert_eq!(event.kind, ScalingEventKind::ScaleUp);
        assert_eq!(event.trigger, "cpu");
        assert_eq!(event.policy_id.as_deref(), Some("cpu-reactive"));
        assert_eq!((event.from_instances, event.to_instances), (2, 3));

        let state = engine.scaling_state().await;
        assert_eq!(state.current_instances, 3);
        assert_eq!(state.last_scale_time, Some(100));

        // Within the cooldown window nothing new starts.
        feed(&engine, "cpu", &[(105, 95.0)]).await;
        let report = engine.tick(105).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(engine.scaling_events(None).await.len(), 1);
    }

    #[tokio::test]
    async fn confident_forecast_scales_ahead_of_load() {
        let config = VigilConfig::from_toml_str(&SCALING.replace("reactive", "predictive")).unwrap();
        let forecaster = static_forecasts([Forecast {
            metric: "cpu".into(),
            predicted_value: 95.0,
            horizon_secs: 300,
            confidence: 0.8,
        }]);
        let engine = Engine::builder(config)
            .with_forecaster(forecaster)
            .build()
            .unwrap();

        let report = engine.tick(100).await.unwrap();
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].trigger, "predictive");
        assert_eq!(report.events[0].confidence, 0.8);
        assert_eq!(engine.scaling_state().await.current_instances, 3);
    }

    #[tokio::test]
    async fn policy_writes_are_validated() {
        let engine = scaling_engine();
        let mut policy = engine.policy("cpu-reactive").await.unwrap();

        assert!(matches!(
            engine.create_policy(policy.clone()).await,
            Err(EngineError::Policy(_))
        ));

        policy.id = "mem".into();
        policy.metric = "mem".into();
        assert!(matches!(
            engine.create_policy(policy.clone()).await,
            Err(EngineError::Policy(_))
        ));

        // Ingesting makes the stream known.
        feed(&engine, "mem", &[(1, 40.0)]).await;
        engine.create_policy(policy.clone()).await.unwrap();
        assert_eq!(engine.policies().await.len(), 2);

        policy.enabled = false;
        engine.update_policy(policy).await.unwrap();
        assert!(!engine.policy("mem").await.unwrap().enabled);
        assert_eq!(engine.bounds().await, Some((1, 10)));
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let config = VigilConfig::from_toml_str(SCALING).unwrap();
        let slow: ScaleCallback = Box::new(|_, _| -> BoxFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::Ok(())
            })
        });
        let engine = Arc::new(Engine::builder(config).with_executor(slow).build().unwrap());

        feed(&engine, "cpu", &[(100, 90.0)]).await;
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.tick(100).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.tick(105).await.is_none());
        assert!(first.await.unwrap().is_some());
        assert!(engine.tick(110).await.is_some());
    }

    #[tokio::test]
    async fn scaling_stops_once_load_is_gone() {
        let engine = scaling_engine();

        feed(&engine, "cpu", &[(1000, 90.0)]).await;
        engine.tick(1000).await.unwrap();
        assert_eq!(engine.scaling_state().await.current_instances, 3);

        // Still breaching inside the cooldown: the next step is deferred.
        feed(&engine, "cpu", &[(1010, 90.0)]).await;
        let report = engine.tick(1010).await.unwrap();
        assert!(report.events.is_empty());
        assert_eq!(report.state.target_instances, 4);

        // Load back within the band before the cooldown ends.
        feed(&engine, "cpu", &[(1020, 50.0)]).await;
        let report = engine.tick(1020).await.unwrap();
        assert_eq!(report.decision, TargetDecision::Hold);
        assert_eq!(report.state.target_instances, 3);

        for ts in [1070, 1080] {
            feed(&engine, "cpu", &[(ts, 50.0)]).await;
            let report = engine.tick(ts).await.unwrap();
            assert!(report.events.is_empty());
        }
        assert_eq!(engine.scaling_state().await.current_instances, 3);
        assert_eq!(engine.scaling_events(None).await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_policy_write_leaves_live_and_stored_sets_alone() {
        let config = VigilConfig::from_toml_str(SCALING).unwrap();
        let engine = Engine::builder(config)
            .with_store(StateStore::open_in_memory().unwrap())
            .build()
            .unwrap();
        let stored = |engine: &Engine| engine.store.as_ref().unwrap().list_policies().unwrap();

        let mut policy = engine.policy("cpu-reactive").await.unwrap();
        policy.min_instances = 20;
        assert!(matches!(
            engine.update_policy(policy).await,
            Err(EngineError::Policy(_))
        ));
        assert_eq!(engine.policy("cpu-reactive").await.unwrap().min_instances, 1);
        assert_eq!(stored(&engine)[0].min_instances, 1);
        assert_eq!(engine.bounds().await, Some((1, 10)));

        let mut policy = engine.policy("cpu-reactive").await.unwrap();
        policy.max_instances = 6;
        engine.update_policy(policy).await.unwrap();
        assert_eq!(engine.bounds().await, Some((1, 6)));
        assert_eq!(stored(&engine)[0].max_instances, 6);
    }

    fn stalled(job: StreamJob) -> StreamFuture {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            job.run().await
        })
    }

    fn broken_stream_panics(job: StreamJob) -> StreamFuture {
        Box::pin(async move {
            if job.profile.stream_id == "broken" {
                panic!("evaluation failed for {}", job.profile.stream_id);
            }
            job.run().await
        })
    }

    #[tokio::test]
    async fn budget_overrun_drops_observations() {
        let mut config = VigilConfig::default();
        config.engine.tick_budget = "20ms".into();
        let engine = Engine::builder(config)
            .with_evaluator(stalled)
            .build()
            .unwrap();

        feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
        let report = engine.tick(110).await.unwrap();

        assert!(report.degraded);
        assert!(report.changes.is_empty());
        assert_eq!(report.failed_streams, 0);
        assert!(engine.anomalies(&AnomalyFilter::default()).await.is_empty());

        // The stalled task still lands its window updates.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.stream_stats("edge.traffic").await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn panicking_stream_is_isolated() {
        let engine = Engine::builder(VigilConfig::default())
            .with_evaluator(broken_stream_panics)
            .build()
            .unwrap();

        feed(&engine, "broken", &[(100, 1.0)]).await;
        feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
        let report = engine.tick(110).await.unwrap();

        assert_eq!(report.failed_streams, 1);
        assert!(!report.degraded);
        assert_eq!(report.opened(), 1);
        let open = engine.anomalies(&AnomalyFilter::default()).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].stream_id, "edge.traffic");

        // The next tick is unaffected.
        assert!(engine.tick(115).await.is_some());
    }

    #[tokio::test]
    async fn executor_receives_each_step() {
        let config = VigilConfig::from_toml_str(SCALING).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor: ScaleCallback = Box::new(move |from, to| -> BoxFuture {
            assert!(to > from);
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { anyhow::Ok(()) })
        });
        let engine = Engine::builder(config).with_executor(executor).build().unwrap();

        feed(&engine, "cpu", &[(100, 90.0)]).await;
        engine.tick(100).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.redb");

        let anomaly_id = {
            let config = VigilConfig::from_toml_str(SCALING).unwrap();
            let engine = Engine::builder(config)
                .with_store(StateStore::open(&path).unwrap())
                .build()
                .unwrap();
            feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
            feed(&engine, "cpu", &[(110, 90.0)]).await;
            engine.tick(110).await.unwrap();

            let mut policy = engine.policy("cpu-reactive").await.unwrap();
            policy.cooldown_seconds = 120;
            engine.update_policy(policy).await.unwrap();

            engine.anomalies(&AnomalyFilter::default()).await[0].id.clone()
        };

        let config = VigilConfig::from_toml_str(SCALING).unwrap();
        let engine = Engine::builder(config)
            .with_store(StateStore::open(&path).unwrap())
            .build()
            .unwrap();

        let anomaly = engine.anomaly(&anomaly_id).await.unwrap();
        assert!(!anomaly.resolved);
        assert_eq!(engine.scaling_state().await.current_instances, 3);
        assert_eq!(engine.scaling_events(None).await.len(), 1);
        // The persisted edit wins over the configured policy.
        assert_eq!(
            engine.policy("cpu-reactive").await.unwrap().cooldown_seconds,
            120
        );
    }

    #[tokio::test]
    async fn exposition_counts_open_anomalies() {
        let engine = engine();
        feed(&engine, "edge.traffic", &[(100, 800.0), (105, 820.0), (110, 1250.0)]).await;
        engine.tick(110).await.unwrap();

        let snapshot = engine.exposition().await;
        assert_eq!(snapshot.streams.len(), 1);
        assert!(snapshot.open_anomalies.contains(&(Severity::High, 1)));
        assert!(snapshot.open_anomalies.contains(&(Severity::Low, 0)));
        assert_eq!(snapshot.scaling.unwrap().current_instances, 2);
    }
}
