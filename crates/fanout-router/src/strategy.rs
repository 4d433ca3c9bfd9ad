//! Routing strategies - map an envelope to the key of the lane that runs it
//!
//! - RoundRobin: cycles over a fixed set of lanes "0".."N-1"
//! - LeastWorkload: picks the fixed lane with the smallest backlog
//! - ByKey: derives the key from the payload (default)
//!
//! RoundRobin and LeastWorkload carry state that is only meaningful when
//! called from a single serialized routing stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use fanout_common::{Envelope, Payload, RoutingConfig, RoutingKind, DEFAULT_QUEUE_KEY};
use crate::Result;

/// Computes the lane key for an envelope. Returning `Err` drops the envelope.
pub trait RoutingStrategy<P: Payload>: Send + Sync {
    fn queue_key(&self, envelope: &Envelope<P>) -> Result<String>;
}

/// Read-only view of per-lane backlog: envelopes counted from key assignment
/// until their worker invocation returns
pub trait WorkloadView: Send + Sync {
    fn depth(&self, key: &str) -> usize;
}

/// Extracts a routing key from a payload; `None` means "no key".
pub type KeyExtractor<P> = Arc<dyn Fn(&P) -> Option<String> + Send + Sync>;

// ============================================================================
// Round robin
// ============================================================================

#[derive(Debug)]
pub struct RoundRobin {
    counter: AtomicU64,
    fixed_lanes: i64,
}

impl RoundRobin {
    pub fn new(fixed_lanes: i64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            fixed_lanes,
        }
    }

    pub fn next_key(&self) -> String {
        if self.fixed_lanes <= 0 {
            return "0".to_string();
        }
        let current = self.counter.fetch_add(1, Ordering::SeqCst);
        (current % self.fixed_lanes as u64).to_string()
    }
}

impl<P: Payload> RoutingStrategy<P> for RoundRobin {
    fn queue_key(&self, _envelope: &Envelope<P>) -> Result<String> {
        Ok(self.next_key())
    }
}

// ============================================================================
// Least workload
// ============================================================================

pub struct LeastWorkload {
    fixed_lanes: i64,
    view: Arc<dyn WorkloadView>,
}

impl LeastWorkload {
    pub fn new(fixed_lanes: i64, view: Arc<dyn WorkloadView>) -> Self {
        Self { fixed_lanes, view }
    }

    /// Lane with the fewest pending + in-flight envelopes. Lanes that do not
    /// exist yet count as empty; ties go to the lowest index.
    pub fn next_key(&self) -> String {
        if self.fixed_lanes <= 0 {
            return "0".to_string();
        }

        let mut best_index = 0;
        let mut best_depth = usize::MAX;
        for index in 0..self.fixed_lanes {
            let depth = self.view.depth(&index.to_string());
            if depth < best_depth {
                best_index = index;
                best_depth = depth;
                if depth == 0 {
                    break;
                }
            }
        }
        best_index.to_string()
    }
}

impl<P: Payload> RoutingStrategy<P> for LeastWorkload {
    fn queue_key(&self, _envelope: &Envelope<P>) -> Result<String> {
        Ok(self.next_key())
    }
}

// ============================================================================
// By key
// ============================================================================

pub struct ByKey<P> {
    extractor: Option<KeyExtractor<P>>,
}

impl<P: Payload> ByKey<P> {
    pub fn new(extractor: Option<KeyExtractor<P>>) -> Self {
        Self { extractor }
    }

    /// Key for `payload`, or [`DEFAULT_QUEUE_KEY`] when the extractor is
    /// missing or yields nothing usable.
    pub fn key_for(&self, payload: &P) -> String {
        self.extractor
            .as_ref()
            .and_then(|extract| extract(payload))
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string())
    }
}

impl<P: Payload> RoutingStrategy<P> for ByKey<P> {
    fn queue_key(&self, envelope: &Envelope<P>) -> Result<String> {
        Ok(self.key_for(envelope.payload()))
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// The strategy selected by configuration, resolved once at construction
pub enum Routing<P: Payload> {
    RoundRobin(RoundRobin),
    LeastWorkload(LeastWorkload),
    ByKey(ByKey<P>),
    Custom(Arc<dyn RoutingStrategy<P>>),
}

impl<P: Payload> Routing<P> {
    /// A custom strategy only takes effect under BY_KEY, where it wins over
    /// the key extractor.
    pub fn resolve(
        config: &RoutingConfig,
        custom: Option<Arc<dyn RoutingStrategy<P>>>,
        extractor: Option<KeyExtractor<P>>,
        view: Arc<dyn WorkloadView>,
    ) -> Self {
        if config.strategy != RoutingKind::ByKey && config.fixed_lanes <= 0 {
            warn!(
                strategy = %config.strategy,
                fixed_lanes = config.fixed_lanes,
                "Non-positive lane count, every message will be routed to lane 0"
            );
        }

        match config.strategy {
            RoutingKind::RoundRobin => Routing::RoundRobin(RoundRobin::new(config.fixed_lanes)),
            RoutingKind::LeastWorkload => {
                Routing::LeastWorkload(LeastWorkload::new(config.fixed_lanes, view))
            }
            RoutingKind::ByKey => match custom {
                Some(strategy) => Routing::Custom(strategy),
                None => Routing::ByKey(ByKey::new(extractor)),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Routing::RoundRobin(_) => "round_robin",
            Routing::LeastWorkload(_) => "least_workload",
            Routing::ByKey(_) => "by_key",
            Routing::Custom(_) => "custom",
        }
    }
}

impl<P: Payload> RoutingStrategy<P> for Routing<P> {
    fn queue_key(&self, envelope: &Envelope<P>) -> Result<String> {
        match self {
            Routing::RoundRobin(rr) => Ok(rr.next_key()),
            Routing::LeastWorkload(lw) => Ok(lw.next_key()),
            Routing::ByKey(by_key) => by_key.queue_key(envelope),
            Routing::Custom(strategy) => strategy.queue_key(envelope),
        }
    }
}
