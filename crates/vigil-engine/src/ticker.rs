//! Fixed-period driver for [`Engine::tick`].
//!
//! Each period the ticker drains its sample source into the engine and
//! spawns a tick. Ticks run detached from the timer, so a slow tick never
//! delays the schedule; the next one simply finds the engine busy and is
//! skipped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use vigil_state::MetricSample;

use crate::engine::{Engine, epoch_secs};

/// Where the ticker pulls samples from each period.
pub trait SampleSource: Send {
    /// Samples available at `now`.
    fn poll(&mut self, now: u64) -> Vec<MetricSample>;
}

/// Replays a fixed sequence of samples, `per_tick` at a time.
#[derive(Debug, Clone, Default)]
pub struct VecSampleSource {
    samples: VecDeque<MetricSample>,
    per_tick: usize,
}

impl VecSampleSource {
    pub fn new(samples: impl IntoIterator<Item = MetricSample>, per_tick: usize) -> Self {
        Self {
            samples: samples.into_iter().collect(),
            per_tick: per_tick.max(1),
        }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SampleSource for VecSampleSource {
    fn poll(&mut self, _now: u64) -> Vec<MetricSample> {
        let n = self.per_tick.min(self.samples.len());
        self.samples.drain(..n).collect()
    }
}

pub struct Ticker {
    engine: Arc<Engine>,
    interval: Duration,
    source: Option<Box<dyn SampleSource>>,
}

impl Ticker {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Box<dyn SampleSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Run until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "ticker started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = epoch_secs();
                    self.drain_source(now).await;
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        engine.tick(now).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("ticker shutting down");
                    break;
                }
            }
        }
    }

    async fn drain_source(&mut self, now: u64) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        for sample in source.poll(now) {
            if let Err(e) = self.engine.ingest(sample).await {
                debug!(error = %e, "sample from source rejected");
            }
        }
    }
}
