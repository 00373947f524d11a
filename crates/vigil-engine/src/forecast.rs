//! Forecast boundary.
//!
//! Forecasts are produced elsewhere and consumed here through an injected
//! callback. A missing collaborator, a timeout or an error all mean the
//! same thing: no predictive signal for that metric this tick.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vigil_autoscale::Forecast;

/// Future returned by a [`ForecastCallback`].
pub type ForecastFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Forecast>>> + Send>>;

/// Called with a metric name; returns its forecast, if any.
pub type ForecastCallback = Arc<dyn Fn(String) -> ForecastFuture + Send + Sync>;

/// Fetch forecasts for `metrics` concurrently, each bounded by `timeout`.
pub async fn fetch_forecasts(
    callback: Option<&ForecastCallback>,
    metrics: &[String],
    timeout: Duration,
) -> HashMap<String, Forecast> {
    let Some(callback) = callback else {
        return HashMap::new();
    };

    let handles: Vec<_> = metrics
        .iter()
        .map(|metric| {
            let fut = callback(metric.clone());
            let metric = metric.clone();
            (metric, tokio::spawn(tokio::time::timeout(timeout, fut)))
        })
        .collect();

    let mut out = HashMap::new();
    for (metric, handle) in handles {
        match handle.await {
            Ok(Ok(Ok(Some(forecast)))) => {
                debug!(%metric, predicted = forecast.predicted_value, "forecast received");
                out.insert(metric, forecast);
            }
            Ok(Ok(Ok(None))) => {}
            Ok(Ok(Err(e))) => warn!(%metric, error = %e, "forecast failed"),
            Ok(Err(_)) => warn!(%metric, timeout_ms = timeout.as_millis() as u64, "forecast timed out"),
            Err(e) => warn!(%metric, error = %e, "forecast task failed"),
        }
    }
    out
}

/// A callback serving fixed forecasts, keyed by metric.
pub fn static_forecasts(forecasts: impl IntoIterator<Item = Forecast>) -> ForecastCallback {
    let table: Arc<HashMap<String, Forecast>> = Arc::new(
        forecasts
            .into_iter()
            .map(|f| (f.metric.clone(), f))
            .collect(),
    );
    Arc::new(move |metric: String| -> ForecastFuture {
        let table = table.clone();
        Box::pin(async move { anyhow::Ok(table.get(&metric).cloned()) })
    })
}
