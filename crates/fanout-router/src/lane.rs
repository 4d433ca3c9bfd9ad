//! Lane - ordered, single-concurrency execution channel for one routing key
//!
//! Each lane owns an unbounded channel and one dedicated tokio task, so:
//! - envelopes reach the worker in the order they were posted
//! - at most one worker invocation per lane is in flight
//! - different lanes run concurrently on the runtime's worker threads

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use fanout_common::{Envelope, Payload, ALL_LANES_METRIC};
use crate::error::RouterError;
use crate::metrics::{Metrics, MetricsData};
use crate::router_metrics;
use crate::worker::Worker;
use crate::Result;

pub struct Lane<P> {
    key: Arc<str>,
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope<P>>>>,
    /// Reserved + pending + in-flight envelopes, shared with the lane table
    depth: Arc<AtomicUsize>,
    metrics: Arc<MetricsData>,
    totals: Arc<MetricsData>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Payload> Lane<P> {
    /// Create the lane and start its worker task. Must run inside a tokio runtime.
    ///
    /// `depth` is incremented by whoever reserves the key and decremented
    /// here once an envelope's worker invocation returns.
    pub(crate) fn spawn(
        key: &str,
        worker: Arc<dyn Worker<P>>,
        metrics: &Metrics,
        depth: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key: Arc<str> = Arc::from(key);
        let lane_metrics = metrics.handle(&key);
        let totals = metrics.handle(ALL_LANES_METRIC);

        let handle = tokio::spawn(Self::run(
            Arc::clone(&key),
            rx,
            worker,
            Arc::clone(&depth),
            Arc::clone(&lane_metrics),
            Arc::clone(&totals),
        ));

        Arc::new(Self {
            key,
            tx: Mutex::new(Some(tx)),
            depth,
            metrics: lane_metrics,
            totals,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reserved + pending + in-flight envelopes
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Append an envelope to the lane backlog. Never blocks. The envelope
    /// must already be counted in `depth`.
    pub(crate) fn post(&self, envelope: Envelope<P>) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(RouterError::LaneClosed(self.key.to_string()));
        };

        if tx.send(envelope).is_err() {
            return Err(RouterError::LaneClosed(self.key.to_string()));
        }

        self.metrics.record_queued();
        self.totals.record_queued();
        Ok(())
    }

    /// Stop accepting envelopes; the backlog is still processed.
    pub(crate) fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!(queue_key = %self.key, backlog = self.depth(), "Lane closed");
        }
    }

    /// Wait for the lane task to finish its backlog. Only meaningful after `close`.
    pub(crate) async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue_key = %self.key, error = %e, "Lane task terminated abnormally");
            }
        }
    }

    async fn run(
        key: Arc<str>,
        mut rx: mpsc::UnboundedReceiver<Envelope<P>>,
        worker: Arc<dyn Worker<P>>,
        depth: Arc<AtomicUsize>,
        metrics: Arc<MetricsData>,
        totals: Arc<MetricsData>,
    ) {
        debug!(queue_key = %key, "Lane worker started");

        while let Some(mut envelope) = rx.recv().await {
            Self::process(&key, &mut envelope, worker.as_ref(), &metrics, &totals).await;
            depth.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(queue_key = %key, "Lane drained, worker exiting");
    }

    /// Run the worker on one envelope. Nothing escapes: errors and panics are
    /// logged and counted, then the lane moves on.
    async fn process(
        key: &str,
        envelope: &mut Envelope<P>,
        worker: &dyn Worker<P>,
        metrics: &MetricsData,
        totals: &MetricsData,
    ) {
        let Some(record) = envelope.work_record() else {
            error!(queue_key = %key, payload = ?envelope.payload(), "Envelope without queue key in lane, skipping");
            return;
        };

        metrics.record_started();
        totals.record_started();

        let outcome = AssertUnwindSafe(worker.do_work(record)).catch_unwind().await;
        let duration_micros = envelope.complete();

        let success = match outcome {
            Ok(Ok(())) => {
                info!(
                    queue_key = %key,
                    payload = ?envelope.payload(),
                    duration_micros = duration_micros,
                    "Message processed"
                );
                true
            }
            Ok(Err(e)) => {
                error!(
                    queue_key = %key,
                    payload = ?envelope.payload(),
                    duration_micros = duration_micros,
                    error = %e,
                    "Error calling worker"
                );
                false
            }
            Err(panic) => {
                error!(
                    queue_key = %key,
                    payload = ?envelope.payload(),
                    duration_micros = duration_micros,
                    panic = %panic_message(panic.as_ref()),
                    "Worker panicked"
                );
                false
            }
        };

        metrics.record_completed(duration_micros, success);
        totals.record_completed(duration_micros, success);
        router_metrics::record_job(key, success, Duration::from_micros(duration_micros));
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
