//! Per-stream sliding window store.
//!
//! The stream map sits behind an `RwLock` so lookups from many readers
//! never block each other. Each window has its own `RwLock`: pushes for one
//! stream serialize on it, while statistics reads from any number of tasks
//! proceed concurrently and never touch other streams.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use vigil_state::MetricSample;

use crate::window::{MetricWindow, WindowStats};

/// Result type alias for window store operations.
pub type WindowResult<T> = Result<T, WindowError>;

/// Errors returned by the window store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("stream not found: {0}")]
    NotFound(String),
}

/// Holds one [`MetricWindow`] per stream.
pub struct WindowStore {
    windows: RwLock<HashMap<String, Arc<RwLock<MetricWindow>>>>,
    capacity: usize,
    ewma_alpha: f64,
}

impl WindowStore {
    /// Create a store whose windows hold `capacity` samples each.
    pub fn new(capacity: usize, ewma_alpha: f64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity,
            ewma_alpha,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn window(&self, stream_id: &str) -> Option<Arc<RwLock<MetricWindow>>> {
        self.windows.read().await.get(stream_id).cloned()
    }

    async fn window_or_insert(&self, stream_id: &str) -> Arc<RwLock<MetricWindow>> {
        if let Some(window) = self.window(stream_id).await {
            return window;
        }
        let mut windows = self.windows.write().await;
        windows
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                debug!(%stream_id, capacity = self.capacity, "window created");
                Arc::new(RwLock::new(MetricWindow::new(self.capacity, self.ewma_alpha)))
            })
            .clone()
    }

    /// Append a sample to its stream's window.
    ///
    /// Returns the statistics as they stood *before* the sample was added,
    /// i.e. the baseline the sample should be judged against. `None` means
    /// the stream had no samples yet.
    pub async fn push(&self, sample: &MetricSample) -> Option<WindowStats> {
        let window = self.window_or_insert(&sample.stream_id).await;
        let mut window = window.write().await;
        let prior = window.stats();
        window.push(sample.timestamp, sample.value);
        prior
    }

    /// Current rolling statistics for a stream.
    pub async fn stats(&self, stream_id: &str) -> WindowResult<WindowStats> {
        let window = self
            .window(stream_id)
            .await
            .ok_or_else(|| WindowError::NotFound(stream_id.to_string()))?;
        let window = window.read().await;
        window
            .stats()
            .ok_or_else(|| WindowError::NotFound(stream_id.to_string()))
    }

    /// Whether the stream has ever been pushed to.
    pub async fn contains(&self, stream_id: &str) -> bool {
        self.windows.read().await.contains_key(stream_id)
    }

    /// All known stream IDs, sorted.
    pub async fn streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.windows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Statistics for every stream, sorted by stream ID.
    pub async fn snapshot(&self) -> Vec<(String, WindowStats)> {
        let windows: Vec<(String, Arc<RwLock<MetricWindow>>)> = self
            .windows
            .read()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();

        let mut out = Vec::with_capacity(windows.len());
        for (id, window) in windows {
            if let Some(stats) = window.read().await.stats() {
                out.push((id, stats));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Statistics for the given streams; streams without data are omitted.
    pub async fn stats_for<'a, I>(&self, stream_ids: I) -> HashMap<String, WindowStats>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashMap::new();
        for id in stream_ids {
            if let Ok(stats) = self.stats(id).await {
                out.insert(id.to_string(), stats);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stream: &str, ts: u64, value: f64) -> MetricSample {
        MetricSample::new(stream, ts, value)
    }

    #[tokio::test]
    async fn stats_of_unknown_stream_is_not_found() {
        let store = WindowStore::new(50, 0.3);
        assert_eq!(
            store.stats("nope").await,
            Err(WindowError::NotFound("nope".to_string()))
        );
        assert!(!store.contains("nope").await);
    }

    #[tokio::test]
    async fn push_returns_prior_baseline() {
        let store = WindowStore::new(50, 0.3);
        assert!(store.push(&sample("edge.rps", 1, 800.0)).await.is_none());

        let prior = store.push(&sample("edge.rps", 2, 820.0)).await.unwrap();
        assert_eq!(prior.count, 1);
        assert_eq!(prior.mean, 800.0);

        let prior = store.push(&sample("edge.rps", 3, 1250.0)).await.unwrap();
        assert_eq!(prior.count, 2);
        assert!((prior.mean - 810.0).abs() < 1e-9);

        let current = store.stats("edge.rps").await.unwrap();
        assert_eq!(current.count, 3);
        assert_eq!(current.last, 1250.0);
    }

    #[tokio::test]
    async fn window_size_is_bounded_per_stream() {
        let store = WindowStore::new(5, 0.3);
        for i in 0..20 {
            store.push(&sample("a", i, i as f64)).await;
        }
        store.push(&sample("b", 1, 1.0)).await;

        assert_eq!(store.stats("a").await.unwrap().count, 5);
        // Oldest evicted first: the window holds 15..=19.
        assert!((store.stats("a").await.unwrap().mean - 17.0).abs() < 1e-9);
        assert_eq!(store.stats("b").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn snapshot_and_streams_are_sorted() {
        let store = WindowStore::new(5, 0.3);
        store.push(&sample("zeta", 1, 1.0)).await;
        store.push(&sample("alpha", 1, 2.0)).await;

        assert_eq!(store.streams().await, vec!["alpha", "zeta"]);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "alpha");
    }

    #[tokio::test]
    async fn stats_for_skips_missing_streams() {
        let store = WindowStore::new(5, 0.3);
        store.push(&sample("cpu", 1, 50.0)).await;

        let stats = store.stats_for(["cpu", "memory"]).await;
        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key("cpu"));
    }

    #[tokio::test]
    async fn concurrent_writers_on_distinct_streams() {
        let store = Arc::new(WindowStore::new(50, 0.3));
        let mut handles = Vec::new();
        for s in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let stream = format!("stream-{s}");
                for i in 0..100 {
                    store.push(&sample(&stream, i, i as f64)).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for s in 0..8 {
            let stats = store.stats(&format!("stream-{s}")).await.unwrap();
            assert_eq!(stats.count, 50);
            assert_eq!(stats.last, 99.0);
        }
    }
}
