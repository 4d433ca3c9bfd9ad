use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

pub mod logging;

/// Lane key used when a payload carries no routing key of its own
pub const DEFAULT_QUEUE_KEY: &str = "__DEFAULT__";

/// Metric name under which every lane's work is aggregated
pub const ALL_LANES_METRIC: &str = "__ALL__";

/// Anything that can flow through the pipeline.
///
/// Payloads are shared read-only between the envelope and the worker, so they
/// must be `Send + Sync`. `Debug` is used to describe the payload in logs.
pub trait Payload: fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: fmt::Debug + Send + Sync + 'static {}

// ============================================================================
// Envelope
// ============================================================================

/// The value object that flows through ingest, routing and dispatch.
///
/// `queue_key` is assigned once by the routing stage, `duration_micros` once
/// after the worker returns. Neither can be overwritten afterwards.
#[derive(Debug)]
pub struct Envelope<P> {
    payload: Arc<P>,
    queue_key: Option<String>,
    started: Instant,
    received_at: DateTime<Utc>,
    duration_micros: Option<u64>,
}

impl<P: Payload> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload: Arc::new(payload),
            queue_key: None,
            started: Instant::now(),
            received_at: Utc::now(),
            duration_micros: None,
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn queue_key(&self) -> Option<&str> {
        self.queue_key.as_deref()
    }

    /// Assign the lane key. Returns false (and keeps the old key) if one was
    /// already assigned.
    pub fn assign_key(&mut self, key: String) -> bool {
        if self.queue_key.is_some() {
            return false;
        }
        self.queue_key = Some(key);
        true
    }

    /// Monotonic instant taken at ingest
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Wall-clock time taken at ingest
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn duration_micros(&self) -> Option<u64> {
        self.duration_micros
    }

    /// Stamp the end-to-end duration. Only the first call records a value;
    /// later calls return what was recorded.
    pub fn complete(&mut self) -> u64 {
        *self
            .duration_micros
            .get_or_insert_with(|| self.started.elapsed().as_micros() as u64)
    }

    /// Projection handed to the worker. `None` until a key is assigned.
    pub fn work_record(&self) -> Option<WorkRecord<P>> {
        self.queue_key.as_ref().map(|key| WorkRecord {
            key: key.clone(),
            payload: Arc::clone(&self.payload),
            received_at: self.received_at,
        })
    }
}

/// Data passed to a worker for a single envelope
#[derive(Debug, Clone)]
pub struct WorkRecord<P> {
    pub key: String,
    pub payload: Arc<P>,
    pub received_at: DateTime<Utc>,
}

// ============================================================================
// Routing Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingKind {
    RoundRobin,
    #[serde(alias = "LESS_WORKLOAD")]
    LeastWorkload,
    #[default]
    ByKey,
}

impl fmt::Display for RoutingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingKind::RoundRobin => "ROUND_ROBIN",
            RoutingKind::LeastWorkload => "LEAST_WORKLOAD",
            RoutingKind::ByKey => "BY_KEY",
        };
        f.write_str(name)
    }
}

impl FromStr for RoutingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ROUND_ROBIN" => Ok(RoutingKind::RoundRobin),
            "LEAST_WORKLOAD" | "LESS_WORKLOAD" => Ok(RoutingKind::LeastWorkload),
            "BY_KEY" => Ok(RoutingKind::ByKey),
            other => Err(format!("unknown routing strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingKind,
    /// Number of lanes used by ROUND_ROBIN and LEAST_WORKLOAD.
    /// Values <= 0 make both strategies route everything to lane "0".
    pub fixed_lanes: i64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingKind::ByKey,
            fixed_lanes: 1,
        }
    }
}

impl RoutingConfig {
    pub fn round_robin(fixed_lanes: i64) -> Self {
        Self { strategy: RoutingKind::RoundRobin, fixed_lanes }
    }

    pub fn least_workload(fixed_lanes: i64) -> Self {
        Self { strategy: RoutingKind::LeastWorkload, fixed_lanes }
    }

    pub fn by_key() -> Self {
        Self::default()
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Read-only snapshot of one named metric. Durations are in microseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub jobs_queued: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub last_job_timestamp: Option<DateTime<Utc>>,
    pub last_job_duration: u64,
    pub average_job_duration: f64,
    pub total_job_time: u64,
}
