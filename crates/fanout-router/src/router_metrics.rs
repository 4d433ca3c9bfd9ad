//! Metrics infrastructure for the fan-out router
//!
//! Prometheus-compatible metrics (via the `metrics` facade) for:
//! - Ingested and dropped envelopes
//! - Lane creation and lane count
//! - Job outcomes and durations per lane
//!
//! No recorder is installed here; the host decides which exporter to use.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an envelope entering the pipeline
pub fn record_envelope_ingested() {
    counter!("fanout_envelopes_ingested_total").increment(1);
}

/// Record an envelope dropped before reaching a lane
pub fn record_envelope_dropped(reason: &'static str) {
    counter!(
        "fanout_envelopes_dropped_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record a newly created lane
pub fn record_lane_created(lane_count: usize) {
    counter!("fanout_lanes_created_total").increment(1);
    gauge!("fanout_lane_count").set(lane_count as f64);
}

/// Record a finished worker invocation
pub fn record_job(lane: &str, success: bool, duration: Duration) {
    counter!(
        "fanout_jobs_total",
        "lane" => lane.to_string(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);

    histogram!(
        "fanout_job_duration_seconds",
        "lane" => lane.to_string()
    )
    .record(duration.as_secs_f64());
}
