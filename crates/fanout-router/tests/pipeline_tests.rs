//! Pipeline Tests
//!
//! End-to-end behaviour of ingest -> routing -> dispatch:
//! - Round robin spreads messages over the fixed lanes in arrival order
//! - Least workload balances a burst that arrives before any lane has run
//! - Absent payloads never reach a lane
//! - Worker failures and panics don't block the lane
//! - Routing failures drop only the failing message
//! - Shutdown rejects new input but drains what was accepted

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use fanout_router::{
    DataInput, Envelope, Pipeline, RouterError, RoutingConfig, RoutingStrategy, WorkRecord,
    Worker, ALL_LANES_METRIC, DEFAULT_QUEUE_KEY,
};

/// Worker that records (lane, payload) pairs
struct RecordingWorker {
    records: parking_lot::Mutex<Vec<(String, u32)>>,
}

impl RecordingWorker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn records(&self) -> Vec<(String, u32)> {
        self.records.lock().clone()
    }

    fn by_lane(&self) -> HashMap<String, Vec<u32>> {
        let mut lanes: HashMap<String, Vec<u32>> = HashMap::new();
        for (key, value) in self.records() {
            lanes.entry(key).or_default().push(value);
        }
        lanes
    }
}

#[async_trait]
impl Worker<u32> for RecordingWorker {
    async fn do_work(&self, record: WorkRecord<u32>) -> anyhow::Result<()> {
        self.records.lock().push((record.key, *record.payload));
        Ok(())
    }
}

/// Worker that records (lane, payload) pairs once a permit is released
struct GatedWorker {
    gate: Semaphore,
    records: parking_lot::Mutex<Vec<(String, u32)>>,
}

impl GatedWorker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            records: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Worker<u32> for GatedWorker {
    async fn do_work(&self, record: WorkRecord<u32>) -> anyhow::Result<()> {
        self.gate.acquire().await?.forget();
        self.records.lock().push((record.key, *record.payload));
        Ok(())
    }
}

/// Worker that fails on some payloads and panics on others
struct FlakyWorker {
    fail_on: u32,
    panic_on: u32,
    processed: parking_lot::Mutex<Vec<u32>>,
}

#[async_trait]
impl Worker<u32> for FlakyWorker {
    async fn do_work(&self, record: WorkRecord<u32>) -> anyhow::Result<()> {
        let value = *record.payload;
        if value == self.panic_on {
            panic!("worker blew up on {}", value);
        }
        if value == self.fail_on {
            anyhow::bail!("cannot process {}", value);
        }
        self.processed.lock().push(value);
        Ok(())
    }
}

/// Custom strategy that rejects odd payloads
struct EvenOnly;

impl RoutingStrategy<u32> for EvenOnly {
    fn queue_key(&self, envelope: &Envelope<u32>) -> fanout_router::Result<String> {
        let value = *envelope.payload();
        if value % 2 == 1 {
            return Err(RouterError::Routing(format!("odd payload {}", value)));
        }
        Ok(format!("lane-{}", value % 4))
    }
}

#[tokio::test]
async fn test_round_robin_distributes_in_arrival_order() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(4))
        .worker(worker.clone())
        .build()
        .unwrap();

    for value in 1..=8u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    let lanes = worker.by_lane();
    assert_eq!(lanes.len(), 4);
    assert_eq!(lanes["0"], vec![1, 5]);
    assert_eq!(lanes["1"], vec![2, 6]);
    assert_eq!(lanes["2"], vec![3, 7]);
    assert_eq!(lanes["3"], vec![4, 8]);
    assert_eq!(pipeline.lane_keys(), vec!["0", "1", "2", "3"]);
}

#[tokio::test]
async fn test_least_workload_balances_burst() {
    let worker = GatedWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::least_workload(4))
        .worker(worker.clone())
        .build()
        .unwrap();

    for value in 1..=8u32 {
        pipeline.push(value);
    }
    // Let the burst reach the lanes while every worker is blocked
    tokio::time::sleep(Duration::from_millis(200)).await;

    let manager = pipeline.queue_manager();
    let depths: Vec<usize> = ["0", "1", "2", "3"].iter().map(|k| manager.depth(k)).collect();
    assert_eq!(depths, vec![2, 2, 2, 2]);
    assert_eq!(pipeline.lane_count(), 4);

    worker.gate.add_permits(8);
    pipeline.shutdown().await;

    let mut lanes: HashMap<String, Vec<u32>> = HashMap::new();
    for (key, value) in worker.records.lock().iter() {
        lanes.entry(key.clone()).or_default().push(*value);
    }
    assert_eq!(lanes["0"], vec![1, 5]);
    assert_eq!(lanes["1"], vec![2, 6]);
    assert_eq!(lanes["2"], vec![3, 7]);
    assert_eq!(lanes["3"], vec![4, 8]);

    for key in ["0", "1", "2", "3"] {
        assert_eq!(manager.depth(key), 0);
    }
}

#[tokio::test]
async fn test_least_workload_prefers_drained_lanes() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::least_workload(3))
        .worker(worker.clone())
        .build()
        .unwrap();

    pipeline.push(1);
    pipeline.push(2);
    // Both lanes finish before the next push, so lane 0 is the least loaded again
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.push(3);
    pipeline.shutdown().await;

    let lanes = worker.by_lane();
    assert_eq!(lanes["0"], vec![1, 3]);
    assert_eq!(lanes["1"], vec![2]);
    assert_eq!(pipeline.lane_count(), 2);
}

#[tokio::test]
async fn test_round_robin_with_zero_lanes_uses_lane_zero() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(0))
        .worker(worker.clone())
        .build()
        .unwrap();

    for value in 0..5u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    assert_eq!(pipeline.lane_count(), 1);
    assert_eq!(worker.by_lane()["0"], vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_absent_payload_creates_no_lane() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
        .worker(worker.clone())
        .build()
        .unwrap();

    pipeline.push_option(None);
    pipeline.shutdown().await;

    assert_eq!(pipeline.lane_count(), 0);
    assert!(worker.records().is_empty());
    assert_eq!(pipeline.metrics().totals().jobs_queued, 0);
}

#[tokio::test]
async fn test_by_key_routes_with_extractor() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::by_key())
        .worker(worker.clone())
        .key_extractor(|v: &u32| if *v == 0 { None } else { Some(format!("k{}", v % 3)) })
        .build()
        .unwrap();

    for value in 0..7u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    let lanes = worker.by_lane();
    assert_eq!(lanes[DEFAULT_QUEUE_KEY], vec![0]);
    assert_eq!(lanes["k0"], vec![3, 6]);
    assert_eq!(lanes["k1"], vec![1, 4]);
    assert_eq!(lanes["k2"], vec![2, 5]);
    assert_eq!(pipeline.strategy_name(), "by_key");
}

#[tokio::test]
async fn test_by_key_without_extractor_uses_default_lane() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::by_key())
        .worker(worker.clone())
        .build()
        .unwrap();

    pipeline.push(1);
    pipeline.push(2);
    pipeline.shutdown().await;

    assert_eq!(pipeline.lane_keys(), vec![DEFAULT_QUEUE_KEY]);
    assert_eq!(worker.by_lane()[DEFAULT_QUEUE_KEY], vec![1, 2]);
}

#[tokio::test]
async fn test_worker_failures_do_not_block_lane() {
    let worker = Arc::new(FlakyWorker {
        fail_on: 2,
        panic_on: 3,
        processed: parking_lot::Mutex::new(Vec::new()),
    });
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(1))
        .worker(worker.clone())
        .build()
        .unwrap();

    for value in 1..=5u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    assert_eq!(*worker.processed.lock(), vec![1, 4, 5]);

    let lane = pipeline.metrics().get_metric("0");
    assert_eq!(lane.jobs_queued, 5);
    assert_eq!(lane.jobs_started, 5);
    assert_eq!(lane.jobs_completed, 5);
    assert_eq!(lane.jobs_failed, 2);
}

#[tokio::test]
async fn test_routing_failure_drops_only_that_message() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::by_key())
        .worker(worker.clone())
        .routing_strategy(Arc::new(EvenOnly))
        .build()
        .unwrap();

    for value in 0..6u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    let mut values: Vec<u32> = worker.records().into_iter().map(|(_, v)| v).collect();
    values.sort();
    assert_eq!(values, vec![0, 2, 4]);
    assert_eq!(pipeline.strategy_name(), "custom");
    assert_eq!(pipeline.metrics().totals().jobs_queued, 3);
}

#[tokio::test]
async fn test_custom_strategy_ignored_outside_by_key() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
        .worker(worker.clone())
        .routing_strategy(Arc::new(EvenOnly))
        .build()
        .unwrap();

    for value in 0..4u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    assert_eq!(worker.records().len(), 4);
    assert_eq!(pipeline.strategy_name(), "round_robin");
}

#[tokio::test]
async fn test_push_after_shutdown_is_rejected() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
        .worker(worker.clone())
        .build()
        .unwrap();

    tokio_test::assert_ok!(pipeline.try_push(1));
    tokio_test::assert_ok!(pipeline.try_push(2));
    pipeline.complete();
    assert!(pipeline.is_completed());
    // Already complete, resolves immediately
    pipeline.wait_completed().await;

    let rejected = tokio_test::assert_err!(pipeline.try_push(3));
    assert!(matches!(rejected, RouterError::ShutdownInProgress));
    // Fire-and-forget variant swallows the rejection
    pipeline.push(4);

    pipeline.wait_drained().await;
    assert!(pipeline.is_drained());

    let mut values: Vec<u32> = worker.records().into_iter().map(|(_, v)| v).collect();
    values.sort();
    assert_eq!(values, vec![1, 2]);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
        .build()
        .unwrap();

    pipeline.push(1);
    pipeline.shutdown().await;
    pipeline.shutdown().await;

    assert!(pipeline.is_drained());
    assert_eq!(pipeline.metrics().totals().jobs_completed, 1);
}

#[tokio::test]
async fn test_metrics_snapshot_after_drain() {
    let worker = RecordingWorker::new();
    let pipeline = Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
        .worker(worker.clone())
        .build()
        .unwrap();

    for value in 0..6u32 {
        pipeline.push(value);
    }
    pipeline.shutdown().await;

    let metrics = pipeline.metrics();
    let totals = metrics.totals();
    assert_eq!(totals.jobs_queued, 6);
    assert_eq!(totals.jobs_started, 6);
    assert_eq!(totals.jobs_completed, 6);
    assert_eq!(totals.jobs_failed, 0);
    assert!(totals.last_job_timestamp.is_some());
    assert!(totals.average_job_duration >= 0.0);

    for lane in ["0", "1"] {
        let snapshot = metrics.get_metric(lane);
        assert_eq!(snapshot.jobs_queued, 3);
        assert_eq!(snapshot.jobs_completed, 3);
    }

    assert_eq!(metrics.names(), vec!["0", "1", ALL_LANES_METRIC]);
}

#[tokio::test]
async fn test_complete_on_signal() {
    let worker = RecordingWorker::new();
    let pipeline = Arc::new(
        Pipeline::<u32>::builder(RoutingConfig::round_robin(2))
            .worker(worker.clone())
            .build()
            .unwrap(),
    );

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    pipeline.complete_on(async move {
        let _ = signal_rx.await;
    });

    pipeline.push(1);
    pipeline.push(2);
    assert!(!pipeline.is_completed());

    signal_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), pipeline.wait_completed())
        .await
        .expect("input should complete once the signal fires");
    pipeline.wait_drained().await;

    assert!(pipeline.is_completed());
    assert_eq!(worker.records().len(), 2);
}
