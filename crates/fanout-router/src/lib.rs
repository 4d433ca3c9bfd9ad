//! Fanout Message Router
//!
//! In-process fan-out of a single message stream onto keyed lanes:
//! - Pipeline: ingest -> routing -> dispatch stages, each at concurrency 1
//! - Routing: RoundRobin, LeastWorkload and ByKey strategies, or a custom one
//! - QueueManager: lazily created lanes, one per distinct key
//! - Lane: FIFO execution of a Worker, one envelope in flight per key
//! - Metrics: per-lane and aggregate job counters and durations

pub mod error;
pub mod lane;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod router_metrics;
pub mod strategy;
pub mod worker;

pub use error::RouterError;
pub use lane::Lane;
pub use manager::{LaneStats, LaneTable, QueueManager};
pub use metrics::{Metrics, MetricsData};
pub use pipeline::{DataInput, Pipeline, PipelineBuilder};
pub use strategy::{
    ByKey, KeyExtractor, LeastWorkload, RoundRobin, Routing, RoutingStrategy, WorkloadView,
};
pub use worker::{DefaultWorker, Worker};

// Re-export the shared data model
pub use fanout_common::{
    Envelope, MetricsSnapshot, Payload, RoutingConfig, RoutingKind, WorkRecord,
    ALL_LANES_METRIC, DEFAULT_QUEUE_KEY,
};

pub type Result<T> = std::result::Result<T, RouterError>;
