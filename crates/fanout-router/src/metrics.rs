//! Job Metrics Collection
//!
//! Named counters for queued/started/completed/failed jobs and their
//! durations (microseconds). Lanes record under their own key and under
//! [`ALL_LANES_METRIC`]. Counters are atomics, so any number of lane tasks
//! can update them concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use fanout_common::MetricsSnapshot;

pub use fanout_common::ALL_LANES_METRIC;

/// Counters behind a single metric name
#[derive(Debug, Default)]
pub struct MetricsData {
    jobs_queued: AtomicU64,
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    last_job_duration: AtomicU64,
    total_job_time: AtomicU64,
    last_job_timestamp: RwLock<Option<DateTime<Utc>>>,
}

impl MetricsData {
    pub fn record_queued(&self) {
        self.jobs_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished invocation. Failed jobs count as completed too;
    /// `jobs_failed` tells them apart.
    pub fn record_completed(&self, duration_micros: u64, success: bool) {
        self.total_job_time.fetch_add(duration_micros, Ordering::Relaxed);
        self.last_job_duration.store(duration_micros, Ordering::Relaxed);
        *self.last_job_timestamp.write() = Some(Utc::now());
        if !success {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let jobs_completed = self.jobs_completed.load(Ordering::Relaxed);
        let total_job_time = self.total_job_time.load(Ordering::Relaxed);

        let average_job_duration = if jobs_completed > 0 {
            total_job_time as f64 / jobs_completed as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed,
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            last_job_timestamp: *self.last_job_timestamp.read(),
            last_job_duration: self.last_job_duration.load(Ordering::Relaxed),
            average_job_duration,
            total_job_time,
        }
    }

    fn reset(&self) {
        self.jobs_queued.store(0, Ordering::Relaxed);
        self.jobs_started.store(0, Ordering::Relaxed);
        self.jobs_completed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.last_job_duration.store(0, Ordering::Relaxed);
        self.total_job_time.store(0, Ordering::Relaxed);
        *self.last_job_timestamp.write() = None;
    }
}

/// Registry of named metrics
#[derive(Debug, Default)]
pub struct Metrics {
    metrics: DashMap<String, Arc<MetricsData>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counters for `name`, created on first use.
    pub fn handle(&self, name: &str) -> Arc<MetricsData> {
        if let Some(data) = self.metrics.get(name) {
            return Arc::clone(data.value());
        }
        let entry = self.metrics.entry(name.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Snapshot of `name`. Unknown names are registered and read as zero.
    pub fn get_metric(&self, name: &str) -> MetricsSnapshot {
        self.handle(name).snapshot()
    }

    /// Snapshot of the aggregate over all lanes
    pub fn totals(&self) -> MetricsSnapshot {
        self.get_metric(ALL_LANES_METRIC)
    }

    /// Registered metric names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Reset all counters (useful for testing)
    pub fn reset(&self) {
        for entry in self.metrics.iter() {
            entry.value().reset();
        }
    }
}
