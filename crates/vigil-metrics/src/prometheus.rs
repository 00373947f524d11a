//! Prometheus text exposition format.
//!
//! Renders the engine's stream statistics, open anomalies and scaling
//! state into the Prometheus text exposition format for scraping by a
//! Prometheus server or compatible agent.

use std::fmt::Write;

use vigil_state::{EventStatus, ScalingState, Severity};

use crate::window::WindowStats;

/// Everything the `/metrics` endpoint exposes, gathered in one pass.
#[derive(Debug, Clone, Default)]
pub struct ExpositionSnapshot {
    pub streams: Vec<(String, WindowStats)>,
    /// Open (unresolved) anomaly count per severity.
    pub open_anomalies: Vec<(Severity, usize)>,
    pub scaling: Option<ScalingState>,
    /// Scaling event count per status.
    pub events_by_status: Vec<(EventStatus, usize)>,
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render a snapshot into Prometheus text format.
///
/// Stream gauges carry a `stream` label, anomaly gauges a `severity`
/// label and event counters a `status` label.
pub fn render_prometheus(snapshot: &ExpositionSnapshot) -> String {
    let mut out = String::new();

    header(&mut out, "vigil_stream_last_value", "Most recent sample value.", "gauge");
    for (id, s) in &snapshot.streams {
        let _ = writeln!(out, "vigil_stream_last_value{{stream=\"{id}\"}} {:.4}", s.last);
    }

    header(&mut out, "vigil_stream_mean", "Rolling window mean.", "gauge");
    for (id, s) in &snapshot.streams {
        let _ = writeln!(out, "vigil_stream_mean{{stream=\"{id}\"}} {:.4}", s.mean);
    }

    header(&mut out, "vigil_stream_stddev", "Rolling window standard deviation.", "gauge");
    for (id, s) in &snapshot.streams {
        let _ = writeln!(out, "vigil_stream_stddev{{stream=\"{id}\"}} {:.4}", s.stddev);
    }

    header(&mut out, "vigil_stream_window_samples", "Samples currently in the window.", "gauge");
    for (id, s) in &snapshot.streams {
        let _ = writeln!(out, "vigil_stream_window_samples{{stream=\"{id}\"}} {}", s.count);
    }

    header(&mut out, "vigil_anomalies_open", "Unresolved anomalies by severity.", "gauge");
    for (severity, count) in &snapshot.open_anomalies {
        let _ = writeln!(out, "vigil_anomalies_open{{severity=\"{severity}\"}} {count}");
    }

    if let Some(state) = &snapshot.scaling {
        header(&mut out, "vigil_instances_current", "Current instance count.", "gauge");
        let _ = writeln!(out, "vigil_instances_current {}", state.current_instances);
        header(&mut out, "vigil_instances_target", "Target instance count.", "gauge");
        let _ = writeln!(out, "vigil_instances_target {}", state.target_instances);
    }

    header(&mut out, "vigil_scaling_events_total", "Scaling events by status.", "counter");
    for (status, count) in &snapshot.events_by_status {
        let _ = writeln!(
            out,
            "vigil_scaling_events_total{{status=\"{}\"}} {count}",
            status.as_str()
        );
    }

    out
}
