//! Batch scheduler: grants declared locks in batch order, then hands each
//! transaction to execution once its full lock set is held.
//!
//! Because every transaction's read/write set is declared up front and all
//! grants follow batch order, conflicts only ever delay a transaction behind
//! its predecessors; nothing aborts. The missing-row latency is absorbed in
//! one remote-read sweep before any mutation runs.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;

use super::super::access::RowKey;
use super::super::types::{LockMode, ReadRowRequest, TxRequest, TxResponse};
use super::executor::{self, TxnOutcome};
use super::{collector, BatchResources, SealedBatch};

/// Per-key grant state scoped to one batch. Indices are positions in the
/// batch, so FIFO promotion equals batch order.
#[derive(Default)]
struct KeySlot {
    readers: HashSet<usize>,
    writer: Option<usize>,
    queue: VecDeque<(usize, LockMode)>,
}

impl KeySlot {
    fn try_grant(&mut self, idx: usize, mode: LockMode) -> bool {
        if !self.queue.is_empty() {
            return false;
        }
        match mode {
            LockMode::Read => {
                if self.writer.is_some() {
                    return false;
                }
                self.readers.insert(idx);
                true
            }
            LockMode::Write => {
                if self.writer.is_some() || !self.readers.is_empty() {
                    return false;
                }
                self.writer = Some(idx);
                true
            }
        }
    }

    fn release(&mut self, idx: usize, mode: LockMode) {
        match mode {
            LockMode::Read => {
                self.readers.remove(&idx);
            }
            LockMode::Write => {
                if self.writer == Some(idx) {
                    self.writer = None;
                }
            }
        }
    }

    /// Pop compatible waiters from the head; returns the granted indices.
    fn promote(&mut self) -> Vec<usize> {
        let mut granted = Vec::new();
        while let Some((idx, mode)) = self.queue.front().copied() {
            let ok = match mode {
                LockMode::Read => self.writer.is_none(),
                LockMode::Write => self.writer.is_none() && self.readers.is_empty(),
            };
            if !ok {
                break;
            }
            self.queue.pop_front();
            match mode {
                LockMode::Read => {
                    self.readers.insert(idx);
                }
                LockMode::Write => self.writer = Some(idx),
            }
            granted.push(idx);
        }
        granted
    }
}

/// Declared lock set of one transaction: its keys, write mode winning when a
/// key is touched both ways, sorted for stable acquisition.
fn declared_locks(req: &TxRequest) -> Vec<(RowKey, LockMode)> {
    let mut by_key: HashMap<RowKey, LockMode> = HashMap::new();
    for op in &req.ops {
        let key = RowKey {
            table_id: op.table_id,
            shard_id: op.shard_id,
            tuple_id: op.tuple_id,
        };
        let mode = op.kind.lock_mode();
        by_key
            .entry(key)
            .and_modify(|current| {
                if *current == LockMode::Read && mode == LockMode::Write {
                    *current = LockMode::Write;
                }
            })
            .or_insert(mode);
    }
    let mut locks: Vec<(RowKey, LockMode)> = by_key.into_iter().collect();
    locks.sort_by_key(|(key, _)| (key.table_id, key.shard_id, key.tuple_id));
    locks
}

/// Fetch every row the batch will touch that is not yet local. Runs before
/// any mutation so execution itself never leaves memory.
async fn remote_read(resources: &BatchResources, batch: &SealedBatch) {
    let mut fetched: HashSet<RowKey> = HashSet::new();
    for req in &batch.txns {
        for op in &req.ops {
            let key = RowKey {
                table_id: op.table_id,
                shard_id: op.shard_id,
                tuple_id: op.tuple_id,
            };
            if !fetched.insert(key) || resources.access.contains(key) {
                continue;
            }
            let Some(dest) = resources.config.broker_for(op.shard_id) else {
                continue;
            };
            let read = ReadRowRequest {
                xid: req.xid,
                oid: 0,
                cno: resources.config.cno,
                source: resources.config.node_id,
                dest,
                table_id: op.table_id,
                shard_id: op.shard_id,
                tuple_id: op.tuple_id,
            };
            match resources.transport.read_row(dest, read).await {
                Ok(resp) => {
                    if resp.error_code.is_ok() {
                        if let Some(row) = resp.row {
                            resources.access.put(key, row);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        xid = req.xid,
                        dest,
                        error = ?err,
                        "remote read failed, key treated as absent"
                    );
                }
            }
        }
    }
}

pub(crate) async fn run_batch(
    resources: &BatchResources,
    batch: SealedBatch,
) -> anyhow::Result<Vec<TxResponse>> {
    remote_read(resources, &batch).await;

    let n = batch.txns.len();
    let lock_sets: Vec<Vec<(RowKey, LockMode)>> = batch.txns.iter().map(declared_locks).collect();

    let mut slots: HashMap<RowKey, KeySlot> = HashMap::new();
    let mut missing = vec![0usize; n];
    for (idx, set) in lock_sets.iter().enumerate() {
        for (key, mode) in set {
            let slot = slots.entry(*key).or_default();
            if !slot.try_grant(idx, *mode) {
                missing[idx] += 1;
                slot.queue.push_back((idx, *mode));
            }
        }
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, TxnOutcome)>();
    let spawn_exec = |idx: usize| {
        let req = batch.txns[idx].clone();
        let access = resources.access.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let outcome = executor::execute(&req, &access);
            let _ = done_tx.send((idx, outcome));
        });
    };

    for idx in 0..n {
        if missing[idx] == 0 {
            spawn_exec(idx);
        }
    }

    let mut outcomes: Vec<Option<TxnOutcome>> = (0..n).map(|_| None).collect();
    let mut remaining = n;
    while remaining > 0 {
        let Some((idx, outcome)) = done_rx.recv().await else {
            anyhow::bail!("batch executors vanished");
        };
        outcomes[idx] = Some(outcome);
        remaining -= 1;
        for (key, mode) in &lock_sets[idx] {
            let Some(slot) = slots.get_mut(key) else {
                continue;
            };
            slot.release(idx, *mode);
            for granted in slot.promote() {
                missing[granted] -= 1;
                if missing[granted] == 0 {
                    spawn_exec(granted);
                }
            }
        }
    }

    let outcomes: Vec<TxnOutcome> = outcomes
        .into_iter()
        .map(|o| o.expect("every transaction executed"))
        .collect();
    collector::finish(resources, batch.epoch, outcomes).await
}

#[cfg(test)]
mod tests {
    use super::super::super::types::{OpKind, TxOp, TxRequest};
    use super::*;

    fn req(xid: u64, ops: Vec<TxOp>) -> TxRequest {
        TxRequest {
            xid,
            oneshot: true,
            read_only: false,
            distributed: false,
            source_node: 1,
            ops,
        }
    }

    fn write_op(tuple_id: u64) -> TxOp {
        TxOp {
            kind: OpKind::Update,
            table_id: 1,
            shard_id: 0,
            tuple_id,
            payload: Some(b"w".to_vec()),
        }
    }

    fn read_op(tuple_id: u64) -> TxOp {
        TxOp {
            kind: OpKind::Read,
            table_id: 1,
            shard_id: 0,
            tuple_id,
            payload: None,
        }
    }

    #[test]
    fn declared_locks_take_write_over_read() {
        let request = req(1, vec![read_op(5), write_op(5), read_op(6)]);
        let locks = declared_locks(&request);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks[0].1, LockMode::Write);
        assert_eq!(locks[1].1, LockMode::Read);
    }

    #[test]
    fn key_slot_promotes_in_queue_order() {
        let mut slot = KeySlot::default();
        assert!(slot.try_grant(0, LockMode::Write));
        slot.queue.push_back((1, LockMode::Read));
        slot.queue.push_back((2, LockMode::Read));
        slot.queue.push_back((3, LockMode::Write));

        slot.release(0, LockMode::Write);
        assert_eq!(slot.promote(), vec![1, 2]);

        slot.release(1, LockMode::Read);
        assert!(slot.promote().is_empty());
        slot.release(2, LockMode::Read);
        assert_eq!(slot.promote(), vec![3]);
    }

    #[test]
    fn later_txn_cannot_jump_queue() {
        let mut slot = KeySlot::default();
        assert!(slot.try_grant(0, LockMode::Read));
        slot.queue.push_back((1, LockMode::Write));
        // A read behind a queued writer must not be granted directly.
        assert!(!slot.try_grant(2, LockMode::Read));
    }
}
