//! Fixed-capacity ring buffer with rolling statistics.
//!
//! Mean and variance are maintained incrementally with Welford's update,
//! including the inverse update when the oldest sample is evicted. The
//! running sums are rebuilt from the buffer every `RECOMPUTE_EVERY` pushes
//! so floating-point drift cannot accumulate on long-lived streams.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of samples kept per stream.
pub const DEFAULT_WINDOW_CAPACITY: usize = 50;

const RECOMPUTE_EVERY: u64 = 1024;

/// Rolling statistics of a stream's window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Samples currently in the window.
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
    /// Most recent value.
    pub last: f64,
    /// Exponentially weighted mean over every sample seen.
    pub ewma: f64,
    /// Timestamp of the most recent sample.
    pub last_timestamp: u64,
}

/// Sliding window over one stream.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    samples: VecDeque<(u64, f64)>,
    capacity: usize,
    mean: f64,
    m2: f64,
    ewma: Option<f64>,
    ewma_alpha: f64,
    pushes: u64,
}

impl MetricWindow {
    /// Create an empty window. `capacity` is raised to at least 1 and
    /// `ewma_alpha` is clamped to `(0, 1]`.
    pub fn new(capacity: usize, ewma_alpha: f64) -> Self {
        let capacity = capacity.max(1);
        let ewma_alpha = if ewma_alpha.is_finite() {
            ewma_alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            mean: 0.0,
            m2: 0.0,
            ewma: None,
            ewma_alpha,
            pushes: 0,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Returns the evicted `(timestamp, value)` pair, if any.
    pub fn push(&mut self, timestamp: u64, value: f64) -> Option<(u64, f64)> {
        let evicted = if self.samples.len() == self.capacity {
            let oldest = self.samples.pop_front();
            if let Some((_, old)) = oldest {
                self.remove_from_stats(old);
            }
            oldest
        } else {
            None
        };

        self.samples.push_back((timestamp, value));
        self.add_to_stats(value);

        self.ewma = Some(match self.ewma {
            Some(prev) => self.ewma_alpha * value + (1.0 - self.ewma_alpha) * prev,
            None => value,
        });

        self.pushes += 1;
        if self.pushes % RECOMPUTE_EVERY == 0 {
            self.recompute();
        }

        evicted
    }

    fn add_to_stats(&mut self, value: f64) {
        let n = self.samples.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    fn remove_from_stats(&mut self, value: f64) {
        // Called after pop_front, so len() is already the reduced count.
        let remaining = self.samples.len() as f64;
        if remaining == 0.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let old_mean = self.mean;
        self.mean = ((remaining + 1.0) * old_mean - value) / remaining;
        self.m2 -= (value - old_mean) * (value - self.mean);
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    fn recompute(&mut self) {
        let n = self.samples.len() as f64;
        if n == 0.0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        self.mean = self.samples.iter().map(|(_, v)| v).sum::<f64>() / n;
        self.m2 = self
            .samples
            .iter()
            .map(|(_, v)| (v - self.mean).powi(2))
            .sum();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values currently in the window, oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|(_, v)| *v)
    }

    /// Current statistics, or `None` if nothing was pushed yet.
    pub fn stats(&self) -> Option<WindowStats> {
        let &(last_timestamp, last) = self.samples.back()?;
        let count = self.samples.len();
        Some(WindowStats {
            count,
            mean: self.mean,
            stddev: (self.m2 / count as f64).sqrt(),
            last,
            ewma: self.ewma.unwrap_or(last),
            last_timestamp,
        })
    }
}
