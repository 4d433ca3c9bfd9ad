//! QueueManager - owns the key -> lane table and dispatches routed envelopes
//!
//! - Lanes are created lazily on the first envelope for a key
//! - Keys are case-insensitive; a lane keeps the spelling it was created with
//! - Lanes are never removed, lane count == distinct keys seen
//! - Depth is counted from the moment a key is assigned, so routing
//!   decisions see envelopes still on their way to the lane

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use fanout_common::{Envelope, Payload};
use crate::error::RouterError;
use crate::lane::Lane;
use crate::metrics::Metrics;
use crate::router_metrics;
use crate::strategy::WorkloadView;
use crate::worker::Worker;
use crate::Result;

/// Point-in-time view of one lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    pub key: String,
    pub depth: usize,
    pub closed: bool,
}

/// Concurrent key -> lane map with atomic get-or-create, plus the per-key
/// depth counters shared with the lanes
pub struct LaneTable<P> {
    lanes: DashMap<String, Arc<Lane<P>>>,
    depths: DashMap<String, Arc<AtomicUsize>>,
}

impl<P: Payload> LaneTable<P> {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            depths: DashMap::new(),
        }
    }

    fn normalize(key: &str) -> String {
        key.to_lowercase()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Lane<P>>> {
        self.lanes
            .get(&Self::normalize(key))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Existing lane for `key`, or the one built by `create`. The second
    /// element is true when this call inserted the lane. Two racing callers
    /// for the same unseen key get the same lane; only one `create` runs.
    pub fn get_or_create<F>(&self, key: &str, create: F) -> (Arc<Lane<P>>, bool)
    where
        F: FnOnce() -> Arc<Lane<P>>,
    {
        let normalized = Self::normalize(key);
        if let Some(entry) = self.lanes.get(&normalized) {
            return (Arc::clone(entry.value()), false);
        }

        let mut created = false;
        let entry = self.lanes.entry(normalized).or_insert_with(|| {
            created = true;
            create()
        });
        let lane = Arc::clone(entry.value());
        // Release the shard lock before callers touch the map again
        drop(entry);

        (lane, created)
    }

    /// Depth counter for `key`, created on first use. A lane created later
    /// for the same key shares it.
    pub(crate) fn depth_counter(&self, key: &str) -> Arc<AtomicUsize> {
        let normalized = Self::normalize(key);
        if let Some(counter) = self.depths.get(&normalized) {
            return Arc::clone(counter.value());
        }
        let entry = self.depths.entry(normalized).or_default();
        Arc::clone(entry.value())
    }

    /// Count one more envelope against `key`
    pub fn reserve(&self, key: &str) {
        self.depth_counter(key).fetch_add(1, Ordering::SeqCst);
    }

    /// Undo a reservation for an envelope that never reached its lane
    pub fn release(&self, key: &str) {
        if let Some(counter) = self.depths.get(&Self::normalize(key)) {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Lane keys as first seen, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lanes
            .iter()
            .map(|entry| entry.value().key().to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn lanes(&self) -> Vec<Arc<Lane<P>>> {
        self.lanes.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

impl<P: Payload> Default for LaneTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> WorkloadView for LaneTable<P> {
    fn depth(&self, key: &str) -> usize {
        self.depths
            .get(&Self::normalize(key))
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Central dispatcher for routed envelopes
pub struct QueueManager<P: Payload> {
    lanes: Arc<LaneTable<P>>,
    worker: Arc<dyn Worker<P>>,
    metrics: Arc<Metrics>,
}

impl<P: Payload> QueueManager<P> {
    pub fn new(worker: Arc<dyn Worker<P>>, metrics: Arc<Metrics>) -> Self {
        Self {
            lanes: Arc::new(LaneTable::new()),
            worker,
            metrics,
        }
    }

    /// Read-only backlog view for the least-workload strategy
    pub fn workload_view(&self) -> Arc<dyn WorkloadView> {
        self.lanes.clone()
    }

    /// Count an envelope against `key` before it reaches the lane.
    pub fn reserve(&self, key: &str) {
        self.lanes.reserve(key);
    }

    /// Undo [`reserve`](Self::reserve) for an envelope that was dropped.
    pub fn release(&self, key: &str) {
        self.lanes.release(key);
    }

    /// Hand an envelope to the lane for its key, creating the lane if needed.
    pub fn enroute(&self, envelope: Envelope<P>) -> Result<()> {
        let key = envelope
            .queue_key()
            .ok_or(RouterError::MissingQueueKey)?
            .to_string();

        self.reserve(&key);
        self.post_reserved(envelope)
    }

    /// Post an envelope whose key was already reserved by the routing stage.
    /// The reservation is released if the lane refuses the envelope.
    pub(crate) fn post_reserved(&self, envelope: Envelope<P>) -> Result<()> {
        let key = envelope
            .queue_key()
            .ok_or(RouterError::MissingQueueKey)?
            .to_string();

        let (lane, created) = self.lanes.get_or_create(&key, || {
            Lane::spawn(
                &key,
                Arc::clone(&self.worker),
                &self.metrics,
                self.lanes.depth_counter(&key),
            )
        });

        if created {
            let lane_count = self.lanes.len();
            info!(queue_key = %key, lane_count = lane_count, "Add lane for key");
            router_metrics::record_lane_created(lane_count);
        }

        if let Err(e) = lane.post(envelope) {
            self.release(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Serialized dispatch loop: runs until the routing stage closes the
    /// channel, then drains every lane. Keys arrive already reserved.
    pub async fn run_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<Envelope<P>>) {
        debug!("Dispatch stage started");

        while let Some(envelope) = rx.recv().await {
            let queue_key = envelope.queue_key().map(str::to_string);
            if let Err(e) = self.post_reserved(envelope) {
                router_metrics::record_envelope_dropped("dispatch");
                error!(queue_key = ?queue_key, error = %e, "Failed to enroute message, dropping");
            }
        }

        info!(lane_count = self.lanes.len(), "Dispatch stage completed, draining lanes");
        self.drain().await;
    }

    /// Close every lane and wait until each has worked off its backlog.
    pub async fn drain(&self) {
        let lanes = self.lanes.lanes();
        for lane in &lanes {
            lane.close();
        }
        for lane in &lanes {
            lane.join().await;
        }
        info!(lane_count = lanes.len(), "All lanes drained");
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_keys(&self) -> Vec<String> {
        self.lanes.keys()
    }

    /// Pending + in-flight envelopes for `key` (0 for unknown keys)
    pub fn depth(&self, key: &str) -> usize {
        self.lanes.depth(key)
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        let mut stats: Vec<LaneStats> = self
            .lanes
            .lanes()
            .iter()
            .map(|lane| LaneStats {
                key: lane.key().to_string(),
                depth: lane.depth(),
                closed: lane.is_closed(),
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
