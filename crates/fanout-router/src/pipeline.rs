//! Pipeline - ingest -> routing -> dispatch
//!
//! Each stage is a single tokio task connected to the next one by an
//! unbounded channel, so every stage runs at concurrency 1 and the global
//! arrival order is what the routing strategy observes. Completion travels
//! down the chain by channel closure: ingest ends, then routing, then
//! dispatch, which finally drains every lane.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use fanout_common::{Envelope, Payload, RoutingConfig};
use crate::error::RouterError;
use crate::lane::panic_message;
use crate::manager::QueueManager;
use crate::metrics::Metrics;
use crate::router_metrics;
use crate::strategy::{KeyExtractor, Routing, RoutingStrategy};
use crate::worker::{DefaultWorker, Worker};
use crate::Result;

/// Entry point for producers
pub trait DataInput<P>: Send + Sync {
    /// Fire-and-forget submission; failures only show up in logs and metrics.
    fn push(&self, value: P);
}

/// Builder wiring configuration, worker and routing capabilities together
pub struct PipelineBuilder<P: Payload> {
    config: RoutingConfig,
    worker: Option<Arc<dyn Worker<P>>>,
    custom_strategy: Option<Arc<dyn RoutingStrategy<P>>>,
    key_extractor: Option<KeyExtractor<P>>,
    metrics: Option<Arc<Metrics>>,
}

impl<P: Payload> PipelineBuilder<P> {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            worker: None,
            custom_strategy: None,
            key_extractor: None,
            metrics: None,
        }
    }

    /// Worker invoked by every lane. Defaults to [`DefaultWorker`].
    pub fn worker(mut self, worker: Arc<dyn Worker<P>>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Custom strategy, used instead of the key extractor under BY_KEY
    pub fn routing_strategy(mut self, strategy: Arc<dyn RoutingStrategy<P>>) -> Self {
        self.custom_strategy = Some(strategy);
        self
    }

    /// Key extractor for BY_KEY routing
    pub fn key_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&P) -> Option<String> + Send + Sync + 'static,
    {
        self.key_extractor = Some(Arc::new(extractor));
        self
    }

    /// Share an existing metrics registry
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve the routing strategy and start the three stage tasks.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Pipeline<P>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RouterError::Config(
                "pipeline must be built inside a tokio runtime".to_string(),
            ));
        }

        let worker = self.worker.unwrap_or_else(|| Arc::new(DefaultWorker));
        let metrics = self.metrics.unwrap_or_default();
        let manager = Arc::new(QueueManager::new(worker, Arc::clone(&metrics)));

        let routing = Arc::new(Routing::resolve(
            &self.config,
            self.custom_strategy,
            self.key_extractor,
            manager.workload_view(),
        ));

        info!(
            strategy = routing.name(),
            fixed_lanes = self.config.fixed_lanes,
            "Starting fan-out pipeline"
        );

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Option<P>>();
        let (routing_tx, routing_rx) = mpsc::unbounded_channel::<Envelope<P>>();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel::<Envelope<P>>();
        let (drained_tx, drained_rx) = watch::channel(false);
        let (completed_tx, _) = watch::channel(false);

        tokio::spawn(run_ingest_stage(input_rx, routing_tx));
        tokio::spawn(run_routing_stage(
            routing_rx,
            dispatch_tx,
            Arc::clone(&routing),
            Arc::clone(&manager),
        ));

        let dispatcher = Arc::clone(&manager);
        tokio::spawn(async move {
            dispatcher.run_dispatcher(dispatch_rx).await;
            let _ = drained_tx.send(true);
            info!("Pipeline drained");
        });

        Ok(Pipeline {
            input: Mutex::new(Some(input_tx)),
            manager,
            metrics,
            routing,
            completed: completed_tx,
            drained: drained_rx,
        })
    }
}

/// Running fan-out pipeline
pub struct Pipeline<P: Payload> {
    input: Mutex<Option<mpsc::UnboundedSender<Option<P>>>>,
    manager: Arc<QueueManager<P>>,
    metrics: Arc<Metrics>,
    routing: Arc<Routing<P>>,
    completed: watch::Sender<bool>,
    drained: watch::Receiver<bool>,
}

impl<P: Payload> Pipeline<P> {
    pub fn builder(config: RoutingConfig) -> PipelineBuilder<P> {
        PipelineBuilder::new(config)
    }

    /// Submit a payload, reporting rejection after shutdown.
    pub fn try_push(&self, value: P) -> Result<()> {
        self.offer(Some(value))
    }

    /// Submit a possibly absent payload. `None` is accepted and silently
    /// dropped by the ingest stage.
    pub fn push_option(&self, value: Option<P>) {
        if let Err(e) = self.offer(value) {
            router_metrics::record_envelope_dropped("rejected");
            warn!(error = %e, "Push rejected, pipeline input is complete");
        }
    }

    fn offer(&self, value: Option<P>) -> Result<()> {
        let input = self.input.lock();
        match input.as_ref() {
            Some(tx) => tx.send(value).map_err(|_| RouterError::ShutdownInProgress),
            None => Err(RouterError::ShutdownInProgress),
        }
    }

    /// Mark the input complete. Later pushes are rejected; everything already
    /// accepted keeps flowing through to the lanes.
    pub fn complete(&self) {
        if self.input.lock().take().is_some() {
            self.completed.send_replace(true);
            info!("Pipeline input completed, waiting for lanes to drain");
        }
    }

    /// Resolves once the input has been completed, by [`complete`](Self::complete)
    /// or a `complete_on` signal.
    pub async fn wait_completed(&self) {
        let mut completed = self.completed.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close
        let _ = completed.wait_for(|done| *done).await;
    }

    /// Complete the input once `signal` resolves (host termination hook).
    pub fn complete_on<F>(self: &Arc<Self>, signal: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pipeline = Arc::downgrade(self);
        tokio::spawn(async move {
            signal.await;
            if let Some(pipeline) = pipeline.upgrade() {
                info!("Termination signal received");
                pipeline.complete();
            }
        });
    }

    /// Complete the input and wait until every admitted envelope has been
    /// processed by its lane.
    pub async fn shutdown(&self) {
        self.complete();
        self.wait_drained().await;
    }

    /// Wait for the drain to finish without completing the input.
    pub async fn wait_drained(&self) {
        let mut drained = self.drained.clone();
        if drained.wait_for(|done| *done).await.is_err() {
            warn!("Dispatch stage ended without reporting drain completion");
        }
    }

    pub fn is_completed(&self) -> bool {
        self.input.lock().is_none()
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.routing.name()
    }

    pub fn queue_manager(&self) -> &Arc<QueueManager<P>> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn lane_count(&self) -> usize {
        self.manager.lane_count()
    }

    pub fn lane_keys(&self) -> Vec<String> {
        self.manager.lane_keys()
    }
}

impl<P: Payload> DataInput<P> for Pipeline<P> {
    fn push(&self, value: P) {
        self.push_option(Some(value));
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Ingest: wrap a raw value, dropping absent ones.
pub(crate) fn accept<P: Payload>(raw: Option<P>) -> Option<Envelope<P>> {
    match raw {
        Some(payload) => {
            router_metrics::record_envelope_ingested();
            Some(Envelope::new(payload))
        }
        None => {
            router_metrics::record_envelope_dropped("empty");
            debug!("Dropping empty payload");
            None
        }
    }
}

/// Routing: assign the lane key. Strategy errors and panics drop the envelope.
pub(crate) fn route<P: Payload>(
    strategy: &dyn RoutingStrategy<P>,
    mut envelope: Envelope<P>,
) -> Option<Envelope<P>> {
    let outcome = catch_unwind(AssertUnwindSafe(|| strategy.queue_key(&envelope)));

    let error = match outcome {
        Ok(Ok(key)) => {
            envelope.assign_key(key);
            return Some(envelope);
        }
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("strategy panicked: {}", panic_message(panic.as_ref())),
    };

    router_metrics::record_envelope_dropped("routing");
    error!(payload = ?envelope.payload(), error = %error, "Key extraction error, dropping message");
    None
}

async fn run_ingest_stage<P: Payload>(
    mut rx: mpsc::UnboundedReceiver<Option<P>>,
    tx: mpsc::UnboundedSender<Envelope<P>>,
) {
    while let Some(raw) = rx.recv().await {
        if let Some(envelope) = accept(raw) {
            if tx.send(envelope).is_err() {
                error!("Routing stage is gone, ingest stopping");
                break;
            }
        }
    }
    debug!("Ingest stage completed");
}

async fn run_routing_stage<P: Payload>(
    mut rx: mpsc::UnboundedReceiver<Envelope<P>>,
    tx: mpsc::UnboundedSender<Envelope<P>>,
    strategy: Arc<Routing<P>>,
    manager: Arc<QueueManager<P>>,
) {
    while let Some(envelope) = rx.recv().await {
        let Some(routed) = route(strategy.as_ref(), envelope) else {
            continue;
        };

        // Counted before the next routing decision, not when the lane gets it
        if let Some(key) = routed.queue_key() {
            manager.reserve(key);
        }

        if let Err(mpsc::error::SendError(lost)) = tx.send(routed) {
            if let Some(key) = lost.queue_key() {
                manager.release(key);
            }
            error!("Dispatch stage is gone, routing stopping");
            break;
        }
    }
    debug!("Routing stage completed");
}
