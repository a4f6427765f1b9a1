//! Result collector: aggregates a batch's per-transaction outcomes and
//! releases the responses once the batch's log group is durable.

use tokio::sync::oneshot;

use super::super::types::{LogKind, LogRecord, TxResponse};
use super::super::wal::WalCompletion;
use super::executor::TxnOutcome;
use super::BatchResources;

pub(crate) async fn finish(
    resources: &BatchResources,
    epoch: u64,
    outcomes: Vec<TxnOutcome>,
) -> anyhow::Result<Vec<TxResponse>> {
    let records: Vec<LogRecord> = outcomes
        .iter()
        .filter(|outcome| outcome.committed)
        .map(|outcome| LogRecord {
            xid: outcome.response.xid,
            kind: LogKind::CalvinBatch,
            ops: outcome.staged.clone(),
        })
        .collect();

    if !records.is_empty() {
        let (tx, rx) = oneshot::channel();
        resources
            .wal
            .append(records, WalCompletion::Signal(tx));
        rx.await
            .map_err(|_| anyhow::anyhow!("wal commit thread gone"))?
            .map_err(|err| err.context(format!("batch {epoch} append")))?;
    }

    tracing::trace!(epoch, txns = outcomes.len(), "batch durable");
    Ok(outcomes.into_iter().map(|o| o.response).collect())
}
