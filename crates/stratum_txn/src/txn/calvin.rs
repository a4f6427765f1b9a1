//! Deterministic execution path.
//!
//! Requests are not locked and executed as they arrive; the sequencer seals
//! them into totally-ordered batches at epoch boundaries, the scheduler
//! grants every declared lock in batch order (so no transaction ever aborts
//! on a conflict), execution runs against local memory only, and the
//! collector releases responses once the batch's log group is durable. Two
//! nodes fed the same sealed batches produce identical state and identical
//! responses.

mod collector;
mod executor;
mod scheduler;
mod sequencer;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::access::AccessStore;
use super::types::{CoreConfig, Transport, TxRequest, TxResponse};
use super::wal::WalBridge;

pub use sequencer::SealedBatch;

/// Everything one batch needs to run.
#[derive(Clone)]
pub(crate) struct BatchResources {
    pub(crate) config: Arc<CoreConfig>,
    pub(crate) access: Arc<AccessStore>,
    pub(crate) wal: Arc<WalBridge>,
    pub(crate) transport: Arc<dyn Transport>,
}

pub(crate) struct CalvinJob {
    pub(crate) req: TxRequest,
    pub(crate) client: oneshot::Sender<TxResponse>,
}

/// Handle for submitting requests to the deterministic pipeline.
pub struct CalvinEngine {
    resources: BatchResources,
    submit_tx: mpsc::UnboundedSender<CalvinJob>,
}

impl CalvinEngine {
    pub fn new(
        config: Arc<CoreConfig>,
        access: Arc<AccessStore>,
        wal: Arc<WalBridge>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let resources = BatchResources {
            config: config.clone(),
            access,
            wal,
            transport,
        };
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        tokio::spawn(sequencer::run(
            submit_rx,
            resources.clone(),
            config.epoch_interval,
        ));
        Arc::new(Self {
            resources,
            submit_tx,
        })
    }

    /// Queue a request for the next epoch. The response resolves once its
    /// batch executed and is durable.
    pub fn submit(&self, req: TxRequest) -> oneshot::Receiver<TxResponse> {
        let (client, rx) = oneshot::channel();
        if self.submit_tx.send(CalvinJob { req, client }).is_err() {
            tracing::error!("sequencer is gone, request dropped");
        }
        rx
    }

    /// Run one sealed batch to completion. Exposed so replicas (and replay
    /// checks) can apply an externally-ordered batch directly.
    pub async fn apply_batch(&self, batch: SealedBatch) -> anyhow::Result<Vec<TxResponse>> {
        scheduler::run_batch(&self.resources, batch).await
    }
}
