//! Batch sequencer: turns the request stream into sealed, totally-ordered
//! batches at fixed epoch boundaries.
//!
//! Order within a batch is arrival order of the input stream. Determinism
//! across nodes rests on the input stream itself being replicated in order;
//! this module only guarantees that the same stream yields the same sealed
//! batches.

use std::time::Duration;

use tokio::sync::mpsc;

use super::super::types::TxRequest;
use super::{scheduler, BatchResources, CalvinJob};

/// One sealed epoch of transactions, in execution order.
#[derive(Clone, Debug)]
pub struct SealedBatch {
    pub epoch: u64,
    pub txns: Vec<TxRequest>,
}

pub(crate) async fn run(
    mut rx: mpsc::UnboundedReceiver<CalvinJob>,
    resources: BatchResources,
    epoch_interval: Duration,
) {
    let mut epoch: u64 = 0;
    let mut pending: Vec<CalvinJob> = Vec::new();
    let mut tick = tokio::time::interval(epoch_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => pending.push(job),
                None => break,
            },
            _ = tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                epoch += 1;
                seal_and_run(&resources, epoch, std::mem::take(&mut pending)).await;
            }
        }
    }

    // The engine went away; flush whatever was queued so no client hangs.
    if !pending.is_empty() {
        epoch += 1;
        seal_and_run(&resources, epoch, pending).await;
    }
}

async fn seal_and_run(resources: &BatchResources, epoch: u64, jobs: Vec<CalvinJob>) {
    let batch = SealedBatch {
        epoch,
        txns: jobs.iter().map(|job| job.req.clone()).collect(),
    };
    tracing::trace!(epoch, txns = batch.txns.len(), "batch sealed");
    match scheduler::run_batch(resources, batch).await {
        Ok(responses) => {
            debug_assert_eq!(responses.len(), jobs.len());
            for (job, response) in jobs.into_iter().zip(responses) {
                let _ = job.client.send(response);
            }
        }
        Err(err) => {
            tracing::error!(epoch, error = ?err, "batch failed");
        }
    }
}
