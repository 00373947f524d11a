//! Typed change notifications.
//!
//! Every anomaly and scaling-event change is published on a broadcast
//! channel. Delivery (webhooks, chat, paging) belongs to subscribers; a
//! slow subscriber lags and loses messages rather than stalling the tick.

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use vigil_anomaly::LifecycleChange;
use vigil_state::{Anomaly, ScalingEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Notification {
    AnomalyOpened(Anomaly),
    AnomalyUpdated(Anomaly),
    AnomalyResolved(Anomaly),
    ScalingEvent(ScalingEvent),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AnomalyOpened(_) => "anomaly_opened",
            Notification::AnomalyUpdated(_) => "anomaly_updated",
            Notification::AnomalyResolved(_) => "anomaly_resolved",
            Notification::ScalingEvent(_) => "scaling_event",
        }
    }
}

impl From<LifecycleChange> for Notification {
    fn from(change: LifecycleChange) -> Self {
        match change {
            LifecycleChange::Opened(a) => Notification::AnomalyOpened(a),
            LifecycleChange::Updated(a) => Notification::AnomalyUpdated(a),
            LifecycleChange::Resolved(a) => Notification::AnomalyResolved(a),
        }
    }
}

/// Broadcast sender for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is not an error.
    pub fn send(&self, notification: Notification) {
        let kind = notification.kind();
        if self.tx.send(notification).is_err() {
            debug!(kind, "notification dropped: no subscribers");
        }
    }
}

/// Log every notification until shutdown.
pub async fn log_notifications(
    mut rx: broadcast::Receiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(Notification::AnomalyOpened(a)) => info!(
                    id = %a.id, stream = %a.stream_id, severity = %a.severity,
                    deviation_pct = a.deviation_pct, "notify: anomaly opened"
                ),
                Ok(Notification::AnomalyUpdated(a)) => debug!(
                    id = %a.id, severity = %a.severity, occurrences = a.occurrences,
                    "notify: anomaly updated"
                ),
                Ok(Notification::AnomalyResolved(a)) => info!(
                    id = %a.id, resolution = ?a.resolution, "notify: anomaly resolved"
                ),
                Ok(Notification::ScalingEvent(e)) => info!(
                    id = %e.id, status = e.status.as_str(), from = e.from_instances,
                    to = e.to_instances, reached = e.reached_instances, "notify: scaling event"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
