//! Convergence loop: moves the scaled group toward its target.
//!
//! Scaling events follow `pending → executing → {completed | failed}`. At
//! most one event is in flight. Each tick steps the instance count by at
//! most `max(1, ceil(aggressiveness * |target - current|))` through the
//! executor callback; the actual scaling is performed by that callback.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use vigil_state::{
    EVENT_ID_PREFIX, EventStatus, ScalingEvent, ScalingEventKind, ScalingState, parse_sequence,
    sequence_id,
};

use crate::policy::{ScaleTarget, TargetDecision};

/// Boxed future returned by a [`ScaleCallback`].
pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback type for performing scaling actions.
///
/// Called with `(from_instances, to_instances)` for every step.
pub type ScaleCallback = Box<dyn Fn(u32, u32) -> BoxFuture + Send + Sync>;

/// Default bound on a single executor call.
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);

struct InFlight {
    event: ScalingEvent,
    started_tick: u64,
    aggressiveness: f64,
}

/// Outcome of one convergence tick.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceReport {
    /// Events created or changed this tick, in order.
    pub events: Vec<ScalingEvent>,
    /// Instance count changed this tick.
    pub scaled: bool,
}

/// Owns [`ScalingState`] and the event in flight.
pub struct ConvergenceLoop {
    state: ScalingState,
    directive: Option<ScaleTarget>,
    in_flight: Option<InFlight>,
    ticks: u64,
    next_seq: u64,
    executor: Option<ScaleCallback>,
    executor_timeout: Duration,
}

impl ConvergenceLoop {
    /// Create a loop for a group currently running `instances` instances.
    pub fn new(instances: u32) -> Self {
        Self {
            state: ScalingState::new(instances),
            directive: None,
            in_flight: None,
            ticks: 0,
            next_seq: 1,
            executor: None,
            executor_timeout: DEFAULT_EXECUTOR_TIMEOUT,
        }
    }

    /// Set the callback used to perform scaling. Without one every step
    /// succeeds immediately.
    pub fn with_executor(mut self, f: ScaleCallback) -> Self {
        self.executor = Some(f);
        self
    }

    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Resume from persisted state. Events left open by a previous run
    /// are closed as failed and returned so the caller can persist them.
    pub fn restore(&mut self, state: ScalingState, events: &[ScalingEvent]) -> Vec<ScalingEvent> {
        self.state = state;
        // Targets are recomputed from live data; a stale one is not resumed.
        self.state.target_instances = self.state.current_instances;
        let mut closed = Vec::new();
        for event in events {
            if let Some(seq) = parse_sequence(EVENT_ID_PREFIX, &event.id) {
                self.next_seq = self.next_seq.max(seq + 1);
            }
            if !event.status.is_terminal() {
                let mut event = event.clone();
                event.status = EventStatus::Failed;
                event.error = Some("interrupted by restart".to_string());
                warn!(event = %event.id, "closing scaling event left open by previous run");
                closed.push(event);
            }
        }
        closed
    }

    pub fn state(&self) -> &ScalingState {
        &self.state
    }

    /// Instance count the policy engine should plan from: the starting
    /// point of the event in flight, else the current count.
    pub fn basis(&self) -> u32 {
        self.in_flight
            .as_ref()
            .map(|f| f.event.from_instances)
            .unwrap_or(self.state.current_instances)
    }

    /// The event in flight, if any.
    pub fn in_flight(&self) -> Option<&ScalingEvent> {
        self.in_flight.as_ref().map(|f| &f.event)
    }

    /// Apply one decision and advance by one step.
    pub async fn tick(&mut self, decision: &TargetDecision, now: u64) -> ConvergenceReport {
        self.ticks += 1;
        let mut report = ConvergenceReport::default();
        let mut superseded = false;

        if let TargetDecision::ScaleTo(target) = decision {
            if target.target != self.state.target_instances {
                if let Some(flight) = self.in_flight.take() {
                    let mut event = flight.event;
                    event.status = EventStatus::Completed;
                    event.superseded = true;
                    event.reached_instances = self.state.current_instances;
                    event.duration = self.elapsed(flight.started_tick);
                    info!(
                        event = %event.id,
                        reached = event.reached_instances,
                        new_target = target.target,
                        "scaling event superseded"
                    );
                    report.events.push(event);
                    superseded = true;
                }
                debug!(
                    from = self.state.target_instances,
                    to = target.target,
                    trigger = %target.trigger,
                    "scaling target changed"
                );
                self.state.target_instances = target.target;
                self.state.cooldown_seconds = target.cooldown_seconds;
            }
            self.directive = Some(target.clone());
        } else if self.in_flight.is_none()
            && self.state.target_instances != self.state.current_instances
        {
            // Nothing proposes the deferred target any more.
            debug!(
                target = self.state.target_instances,
                current = self.state.current_instances,
                "deferred scaling target dropped"
            );
            self.state.target_instances = self.state.current_instances;
            self.directive = None;
        }

        if self.in_flight.is_none() && self.state.target_instances != self.state.current_instances {
            if superseded || self.cooldown_elapsed(now) {
                let event = self.start_event(now);
                report.events.push(event);
            } else {
                debug!(
                    target = self.state.target_instances,
                    current = self.state.current_instances,
                    last_scale_time = ?self.state.last_scale_time,
                    cooldown = self.state.cooldown_seconds,
                    "scaling deferred by cooldown"
                );
            }
        }

        if let Some(flight) = self.in_flight.take() {
            let (event, scaled) = self.step(flight, now).await;
            report.scaled = scaled;
            // The freshly started event is reported once, in its latest state.
            if let Some(last) = report.events.last_mut()
                && last.id == event.id
            {
                *last = event;
            } else {
                report.events.push(event);
            }
        }

        report
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        match self.state.last_scale_time {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.state.cooldown_seconds,
        }
    }

    fn elapsed(&self, started_tick: u64) -> u32 {
        (self.ticks - started_tick + 1).min(u32::MAX as u64) as u32
    }

    fn start_event(&mut self, now: u64) -> ScalingEvent {
        let from = self.state.current_instances;
        let to = self.state.target_instances;
        let directive = self.directive.as_ref();
        let mut event = ScalingEvent {
            id: sequence_id(EVENT_ID_PREFIX, self.next_seq),
            timestamp: now,
            kind: ScalingEventKind::between(from, to),
            trigger: directive
                .map(|d| d.trigger.clone())
                .unwrap_or_else(|| "bounds".to_string()),
            policy_id: directive.and_then(|d| d.policy_id.clone()),
            from_instances: from,
            to_instances: to,
            reached_instances: from,
            confidence: directive.map(|d| d.confidence).unwrap_or(1.0),
            status: EventStatus::Pending,
            duration: 0,
            superseded: false,
            error: None,
        };
        self.next_seq += 1;
        debug!(event = %event.id, from, to, "scaling event pending");

        event.status = EventStatus::Executing;
        info!(
            event = %event.id,
            kind = ?event.kind,
            from,
            to,
            trigger = %event.trigger,
            "scaling event executing"
        );

        self.in_flight = Some(InFlight {
            event: event.clone(),
            started_tick: self.ticks,
            aggressiveness: directive.map(|d| d.aggressiveness).unwrap_or(1.0),
        });
        event
    }

    async fn step(&mut self, mut flight: InFlight, now: u64) -> (ScalingEvent, bool) {
        let current = self.state.current_instances;
        let target = self.state.target_instances;

        let delta = current.abs_diff(target);
        let step = ((flight.aggressiveness * delta as f64).ceil() as u32).clamp(1, delta.max(1));
        let next = if target > current {
            current + step.min(delta)
        } else {
            current - step.min(delta)
        };

        let outcome = match &self.executor {
            None => Ok(()),
            Some(execute) => {
                match tokio::time::timeout(self.executor_timeout, execute(current, next)).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "executor timed out after {}ms",
                        self.executor_timeout.as_millis()
                    )),
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.state.current_instances = next;
                flight.event.reached_instances = next;
                debug!(event = %flight.event.id, from = current, to = next, "scaling step applied");
                if next == target {
                    flight.event.status = EventStatus::Completed;
                    flight.event.duration = self.elapsed(flight.started_tick);
                    self.state.last_scale_time = Some(now);
                    info!(
                        event = %flight.event.id,
                        instances = next,
                        duration = flight.event.duration,
                        "scaling event completed"
                    );
                    (flight.event, true)
                } else {
                    let event = flight.event.clone();
                    self.in_flight = Some(flight);
                    (event, true)
                }
            }
            Err(error) => {
                flight.event.status = EventStatus::Failed;
                flight.event.duration = self.elapsed(flight.started_tick);
                flight.event.reached_instances = current;
                flight.event.error = Some(error.clone());
                self.state.last_scale_time = Some(now);
                warn!(
                    event = %flight.event.id,
                    from = current,
                    to = next,
                    %error,
                    "scaling action failed"
                );
                (flight.event, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use vigil_metrics::WindowStats;
    use vigil_state::{PolicyKind, ScalingPolicy};

    use crate::policy::PolicyEngine;

    fn scale_to(target: u32, cooldown: u64, aggressiveness: f64) -> TargetDecision {
        TargetDecision::ScaleTo(ScaleTarget {
            target,
            policy_id: Some("cpu".to_string()),
            trigger: "cpu".to_string(),
            cooldown_seconds: cooldown,
            aggressiveness,
            confidence: 0.8,
            kind: ScalingEventKind::ScaleUp,
        })
    }

    fn counting_executor(calls: Arc<AtomicU32>) -> ScaleCallback {
        Box::new(move |_from: u32, _to: u32| -> BoxFuture {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
        })
    }

    #[tokio::test]
    async fn hold_does_nothing() {
        let mut conv = ConvergenceLoop::new(3);
        let report = conv.tick(&TargetDecision::Hold, 1000).await;
        assert!(report.events.is_empty());
        assert!(!report.scaled);
        assert_eq!(conv.state().current_instances, 3);
    }

    #[tokio::test]
    async fn full_step_completes_in_one_tick() {
        let mut conv = ConvergenceLoop::new(2);
        let report = conv.tick(&scale_to(5, 60, 1.0), 1000).await;

        assert_eq!(report.events.len(), 1);
        let event = &report.events[0];
        assert_eq!(event.id, "scale-000001");
        assert_eq!(event.status, EventStatus::Completed);
        assert_eq!(event.from_instances, 2);
        assert_eq!(event.to_instances, 5);
        assert_eq!(event.reached_instances, 5);
        assert_eq!(event.duration, 1);
        assert_eq!(event.policy_id.as_deref(), Some("cpu"));
        assert_eq!(conv.state().current_instances, 5);
        assert_eq!(conv.state().last_scale_time, Some(1000));
        assert!(conv.in_flight().is_none());
    }

    #[tokio::test]
    async fn partial_steps_converge_over_ticks() {
        let mut conv = ConvergenceLoop::new(2);
        let decision = scale_to(10, 60, 0.25);

        // |delta| = 8 → step 2
        let report = conv.tick(&decision, 1000).await;
        assert_eq!(report.events[0].status, EventStatus::Executing);
        assert_eq!(conv.state().current_instances, 4);
        assert_eq!(conv.basis(), 2);

        // |delta| = 6 → step 2, then 4 → 1, 3 → 1 ...
        let mut ticks = 1;
        while conv.in_flight().is_some() {
            conv.tick(&TargetDecision::Hold, 1000 + ticks).await;
            ticks += 1;
            assert!(ticks < 20, "did not converge");
        }
        assert_eq!(conv.state().current_instances, 10);
        assert_eq!(conv.basis(), 10);
    }

    #[tokio::test]
    async fn new_target_supersedes_in_flight_event() {
        let mut conv = ConvergenceLoop::new(2);
        conv.tick(&scale_to(10, 60, 0.25), 1000).await;
        assert_eq!(conv.state().current_instances, 4);

        let report = conv.tick(&scale_to(12, 60, 0.25), 1005).await;
        assert_eq!(report.events.len(), 2);

        let old = &report.events[0];
        assert_eq!(old.id, "scale-000001");
        assert_eq!(old.status, EventStatus::Completed);
        assert!(old.superseded);
        assert_eq!(old.reached_instances, 4);

        let new = &report.events[1];
        assert_eq!(new.id, "scale-000002");
        assert_eq!(new.from_instances, 4);
        assert_eq!(new.to_instances, 12);
        assert!(!new.superseded);
    }

    #[tokio::test]
    async fn cooldown_gates_new_events() {
        let mut conv = ConvergenceLoop::new(2);
        conv.tick(&scale_to(3, 60, 1.0), 1000).await;
        assert_eq!(conv.state().current_instances, 3);

        let report = conv.tick(&scale_to(4, 60, 1.0), 1030).await;
        assert!(report.events.is_empty());
        assert_eq!(conv.state().target_instances, 4);
        assert_eq!(conv.state().current_instances, 3);

        let report = conv.tick(&scale_to(4, 60, 1.0), 1060).await;
        assert_eq!(report.events.len(), 1);
        assert_eq!(conv.state().current_instances, 4);
    }

    #[tokio::test]
    async fn deferred_target_dropped_when_proposal_stops() {
        let mut conv = ConvergenceLoop::new(2);
        conv.tick(&scale_to(3, 60, 1.0), 1000).await;
        conv.tick(&scale_to(4, 60, 1.0), 1010).await;
        assert_eq!(conv.state().target_instances, 4);
        assert_eq!(conv.state().current_instances, 3);

        let report = conv.tick(&TargetDecision::Hold, 1020).await;
        assert!(report.events.is_empty());
        assert_eq!(conv.state().target_instances, 3);

        // Cooldown over, still nothing proposed: no scale.
        let report = conv.tick(&TargetDecision::Hold, 1070).await;
        assert!(report.events.is_empty());
        assert_eq!(conv.state().current_instances, 3);
    }

    #[tokio::test]
    async fn hold_does_not_abandon_event_in_flight() {
        let mut conv = ConvergenceLoop::new(2);
        conv.tick(&scale_to(10, 60, 0.25), 1000).await;
        assert!(conv.in_flight().is_some());

        conv.tick(&TargetDecision::Hold, 1005).await;
        assert_eq!(conv.state().target_instances, 10);
        assert!(conv.state().current_instances > 4);
    }

    #[tokio::test]
    async fn scale_at_time_zero_still_starts_cooldown() {
        let mut conv = ConvergenceLoop::new(2);
        conv.tick(&scale_to(3, 60, 1.0), 0).await;
        assert_eq!(conv.state().last_scale_time, Some(0));

        let report = conv.tick(&scale_to(4, 60, 1.0), 5).await;
        assert!(report.events.is_empty());
        assert_eq!(conv.state().current_instances, 3);

        let report = conv.tick(&scale_to(4, 60, 1.0), 60).await;
        assert_eq!(report.events.len(), 1);
        assert_eq!(conv.state().current_instances, 4);
    }

    #[tokio::test]
    async fn executor_failure_marks_event_failed_and_retries_after_cooldown() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let executor: ScaleCallback = Box::new(move |_from: u32, _to: u32| -> BoxFuture {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("provider unavailable");
                }
                Ok(())
            })
        });
        let mut conv = ConvergenceLoop::new(2).with_executor(executor);

        let report = conv.tick(&scale_to(4, 60, 1.0), 1000).await;
        let event = &report.events[0];
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("provider unavailable"));
        assert_eq!(conv.state().current_instances, 2);
        assert_eq!(conv.state().target_instances, 4);
        assert_eq!(conv.state().last_scale_time, Some(1000));

        // Still cooling down.
        assert!(conv.tick(&scale_to(4, 60, 1.0), 1030).await.events.is_empty());

        let report = conv.tick(&scale_to(4, 60, 1.0), 1060).await;
        assert_eq!(report.events[0].id, "scale-000002");
        assert_eq!(report.events[0].status, EventStatus::Completed);
        assert_eq!(conv.state().current_instances, 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn executor_timeout_fails_the_event() {
        let executor: ScaleCallback = Box::new(|_from: u32, _to: u32| -> BoxFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                anyhow::Ok(())
            })
        });
        let mut conv = ConvergenceLoop::new(2)
            .with_executor(executor)
            .with_executor_timeout(Duration::from_millis(20));

        let report = conv.tick(&scale_to(4, 60, 1.0), 1000).await;
        assert_eq!(report.events[0].status, EventStatus::Failed);
        assert!(report.events[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(conv.state().current_instances, 2);
    }

    #[tokio::test]
    async fn executor_called_per_step() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut conv = ConvergenceLoop::new(2).with_executor(counting_executor(calls.clone()));
        conv.tick(&scale_to(10, 0, 0.25), 1000).await;
        conv.tick(&TargetDecision::Hold, 1001).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn restore_closes_open_events_and_resumes_ids() {
        let mut first = ConvergenceLoop::new(2);
        let report = first.tick(&scale_to(10, 60, 0.25), 1000).await;
        let open_event = report.events[0].clone();
        assert_eq!(open_event.status, EventStatus::Executing);

        let mut second = ConvergenceLoop::new(1);
        let closed = second.restore(first.state().clone(), &[open_event]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, EventStatus::Failed);
        assert_eq!(second.state().current_instances, 4);
        assert_eq!(second.state().target_instances, 4);

        let report = second.tick(&scale_to(6, 0, 1.0), 2000).await;
        assert_eq!(report.events[0].id, "scale-000002");
    }

    /// Sustained breach: threshold 70, metric 90, cooldown 60s,
    /// aggressiveness 1.0, one tick every 5s for five minutes.
    #[tokio::test]
    async fn sustained_breach_scales_up_once_per_cooldown_window() {
        let policies = vec![ScalingPolicy {
            id: "cpu".to_string(),
            name: "cpu".to_string(),
            metric: "cpu".to_string(),
            threshold: 70.0,
            kind: PolicyKind::Reactive,
            min_instances: 1,
            max_instances: 50,
            cooldown_seconds: 60,
            aggressiveness: 1.0,
            enabled: true,
        }];
        let stats = HashMap::from([(
            "cpu".to_string(),
            WindowStats {
                count: 10,
                mean: 90.0,
                stddev: 0.0,
                last: 90.0,
                ewma: 90.0,
                last_timestamp: 0,
            },
        )]);
        let engine = PolicyEngine::default();
        let mut conv = ConvergenceLoop::new(2);

        let start = 10_000;
        let mut scale_ups: Vec<u64> = Vec::new();
        for i in 0..60 {
            let now = start + i * 5;
            let decision = engine.decide(&stats, &policies, &HashMap::new(), conv.basis());
            let report = conv.tick(&decision, now).await;
            for event in &report.events {
                if event.kind == ScalingEventKind::ScaleUp && event.status == EventStatus::Completed {
                    scale_ups.push(now);
                }
            }
        }

        assert!(scale_ups.len() >= 2);
        for pair in scale_ups.windows(2) {
            assert!(pair[1] - pair[0] >= 60, "scale-ups too close: {pair:?}");
        }
        assert!(conv.state().current_instances > 2);
    }
}
