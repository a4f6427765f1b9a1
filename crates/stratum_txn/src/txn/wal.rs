//! Bridge between transaction contexts and the durable redo log.
//!
//! Contexts stage their records and submit one contiguous append group per
//! transaction. A dedicated commit thread performs the blocking log I/O and
//! fans durability notifications back out in append order, either as a
//! `LogDurable` event on a transaction mailbox or as a oneshot completion for
//! callers that await durability inline (coordinator decisions, deterministic
//! batches).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use super::types::{LogKind, LogRecord, RedoLog, TxEvent, TxMailbox, Xid};

/// Where to report durability of one append group.
pub enum WalCompletion {
    /// Post `LogDurable { kind }` to a transaction mailbox.
    Tx { mailbox: TxMailbox, kind: LogKind },
    /// Resolve a oneshot with the append outcome.
    Signal(tokio::sync::oneshot::Sender<anyhow::Result<()>>),
}

struct AppendWork {
    records: Vec<LogRecord>,
    completion: WalCompletion,
}

enum WalCommand {
    Append(AppendWork),
    MarkEnded(Xid),
}

/// Handle used by the engine to reach the commit thread.
pub struct WalBridge {
    tx: mpsc::Sender<WalCommand>,
}

impl WalBridge {
    pub fn new(log: Arc<dyn RedoLog>) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("wal-commit".to_string())
            .spawn(move || wal_worker(log, rx))
            .map_err(|err| anyhow::anyhow!("spawn wal commit thread: {err}"))?;
        Ok(Self { tx })
    }

    /// Submit one transaction's records as a contiguous group. Durability is
    /// reported through `completion`; group order equals submission order.
    pub fn append(&self, records: Vec<LogRecord>, completion: WalCompletion) {
        if self
            .tx
            .send(WalCommand::Append(AppendWork {
                records,
                completion,
            }))
            .is_err()
        {
            tracing::error!("wal commit thread is gone, append dropped");
        }
    }

    /// Mark a transaction finished so the physical log may compact its
    /// records.
    pub fn mark_ended(&self, xid: Xid) {
        let _ = self.tx.send(WalCommand::MarkEnded(xid));
    }
}

fn wal_worker(log: Arc<dyn RedoLog>, rx: mpsc::Receiver<WalCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            WalCommand::Append(work) => run_append(log.as_ref(), work),
            WalCommand::MarkEnded(xid) => {
                if let Err(err) = log.mark_ended(xid) {
                    tracing::warn!(xid, error = ?err, "wal mark_ended failed");
                }
            }
        }
    }
}

fn run_append(log: &dyn RedoLog, work: AppendWork) {
    let result = log.append_group(&work.records);
    match work.completion {
        WalCompletion::Tx { mailbox, kind } => match result {
            Ok(()) => {
                if mailbox.send(TxEvent::LogDurable { kind }).is_err() {
                    tracing::trace!("durability notification dropped, transaction gone");
                }
            }
            Err(err) => {
                // Fatal for the transaction: no durability event is
                // delivered, the record set must be reconciled from the log
                // on restart.
                let xid = work.records.first().map(|r| r.xid).unwrap_or_default();
                tracing::error!(xid, error = ?err, "wal append failed");
            }
        },
        WalCompletion::Signal(tx) => {
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::testutil::MemRedoLog;
    use crate::txn::types::{LogKind, OpKind, TxOp};
    use tokio::sync::mpsc as tokio_mpsc;

    fn record(xid: Xid, kind: LogKind) -> LogRecord {
        LogRecord {
            xid,
            kind,
            ops: vec![TxOp {
                kind: OpKind::Insert,
                table_id: 1,
                shard_id: 0,
                tuple_id: xid,
                payload: Some(b"v".to_vec()),
            }],
        }
    }

    #[tokio::test]
    async fn durability_events_arrive_in_append_order() {
        let log = Arc::new(MemRedoLog::new());
        let bridge = WalBridge::new(log.clone()).unwrap();
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();

        bridge.append(
            vec![record(1, LogKind::RmPrepareCommit)],
            WalCompletion::Tx {
                mailbox: tx.clone(),
                kind: LogKind::RmPrepareCommit,
            },
        );
        bridge.append(
            vec![record(1, LogKind::RmCommit)],
            WalCompletion::Tx {
                mailbox: tx.clone(),
                kind: LogKind::RmCommit,
            },
        );

        match rx.recv().await {
            Some(TxEvent::LogDurable { kind }) => assert_eq!(kind, LogKind::RmPrepareCommit),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Some(TxEvent::LogDurable { kind }) => assert_eq!(kind, LogKind::RmCommit),
            other => panic!("unexpected event {other:?}"),
        }

        let groups = log.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].kind, LogKind::RmPrepareCommit);
        assert_eq!(groups[1][0].kind, LogKind::RmCommit);
    }

    #[tokio::test]
    async fn signal_completion_resolves_with_append_result() {
        let bridge = WalBridge::new(Arc::new(MemRedoLog::new())).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge.append(vec![record(7, LogKind::TmCommit)], WalCompletion::Signal(tx));
        rx.await.expect("worker alive").expect("append ok");
    }
}
