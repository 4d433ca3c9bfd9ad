//! Worker - application-defined processing of one envelope at a time

use async_trait::async_trait;
use fanout_common::{Payload, WorkRecord};
use tracing::info;

/// Trait for per-envelope work.
///
/// Called at most once per envelope and never retried. Errors and panics are
/// contained by the lane and only show up in logs and metrics.
#[async_trait]
pub trait Worker<P: Payload>: Send + Sync {
    async fn do_work(&self, record: WorkRecord<P>) -> anyhow::Result<()>;
}

/// Worker used when the host does not supply one: logs each record.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWorker;

#[async_trait]
impl<P: Payload> Worker<P> for DefaultWorker {
    async fn do_work(&self, record: WorkRecord<P>) -> anyhow::Result<()> {
        info!(
            queue_key = %record.key,
            payload = ?record.payload,
            received_at = %record.received_at,
            "Processing message"
        );
        Ok(())
    }
}
