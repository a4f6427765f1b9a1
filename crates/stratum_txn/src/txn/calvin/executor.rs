//! In-memory transaction execution for the deterministic path.
//!
//! By the time a transaction reaches this point every row it may touch is
//! local and every lock it declared is held, so execution is a plain loop
//! over its operations. Mutations collect in an overlay and land in the
//! access store only when the whole transaction succeeded.

use std::collections::HashMap;

use super::super::access::{AccessStore, RowKey};
use super::super::types::{ErrorCode, LatencyReport, OpKind, TxOp, TxRequest, TxResponse};

/// Result of executing one transaction of a batch.
pub(crate) struct TxnOutcome {
    pub(crate) response: TxResponse,
    pub(crate) staged: Vec<TxOp>,
    pub(crate) committed: bool,
}

pub(crate) fn execute(req: &TxRequest, access: &AccessStore) -> TxnOutcome {
    // Uncommitted writes; `None` marks a removal.
    let mut overlay: HashMap<RowKey, Option<Vec<u8>>> = HashMap::new();
    let mut rows: Vec<Option<Vec<u8>>> = Vec::with_capacity(req.ops.len());
    let mut staged: Vec<TxOp> = Vec::new();
    let mut error_code = ErrorCode::Ok;

    let lookup = |overlay: &HashMap<RowKey, Option<Vec<u8>>>, key: RowKey| -> Option<Vec<u8>> {
        match overlay.get(&key) {
            Some(entry) => entry.clone(),
            None => access.get(key),
        }
    };

    for op in &req.ops {
        let key = RowKey {
            table_id: op.table_id,
            shard_id: op.shard_id,
            tuple_id: op.tuple_id,
        };
        let mut ec = ErrorCode::Ok;
        match op.kind {
            OpKind::Read | OpKind::ReadForWrite => match lookup(&overlay, key) {
                Some(row) => {
                    rows.push(Some(row));
                    staged.push(op.clone());
                }
                None => {
                    rows.push(None);
                    ec = ErrorCode::NotFound;
                }
            },
            OpKind::Insert => {
                rows.push(None);
                if lookup(&overlay, key).is_some() {
                    ec = ErrorCode::Duplication;
                } else {
                    overlay.insert(key, op.payload.clone());
                    staged.push(op.clone());
                }
            }
            OpKind::Update => {
                rows.push(None);
                if lookup(&overlay, key).is_some() {
                    overlay.insert(key, op.payload.clone());
                    staged.push(op.clone());
                } else {
                    ec = ErrorCode::NotFound;
                }
            }
            OpKind::Remove => match lookup(&overlay, key) {
                Some(row) => {
                    rows.push(Some(row));
                    overlay.insert(key, None);
                    staged.push(op.clone());
                }
                None => {
                    rows.push(None);
                    ec = ErrorCode::NotFound;
                }
            },
        }
        if ec == ErrorCode::NotFound && req.read_only {
            ec = ErrorCode::Ok;
        }
        if !ec.is_ok() {
            error_code = ec;
            break;
        }
    }

    let committed = error_code.is_ok();
    if committed {
        for (key, entry) in overlay {
            match entry {
                Some(row) => access.put(key, row),
                None => {
                    access.remove(key);
                }
            }
        }
    } else {
        staged.clear();
    }

    let num_locks = req
        .ops
        .iter()
        .map(|op| (op.table_id, op.shard_id, op.tuple_id))
        .collect::<std::collections::HashSet<_>>()
        .len() as u64;

    TxnOutcome {
        response: TxResponse {
            xid: req.xid,
            error_code: if committed {
                ErrorCode::Ok
            } else {
                error_code
            },
            rows,
            latency: LatencyReport {
                num_locks,
                ..LatencyReport::default()
            },
        },
        staged,
        committed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::super::types::OpKind;

    fn op(kind: OpKind, tuple_id: u64, payload: Option<&[u8]>) -> TxOp {
        TxOp {
            kind,
            table_id: 1,
            shard_id: 0,
            tuple_id,
            payload: payload.map(|p| p.to_vec()),
        }
    }

    fn req(xid: u64, read_only: bool, ops: Vec<TxOp>) -> TxRequest {
        TxRequest {
            xid,
            oneshot: true,
            read_only,
            distributed: false,
            source_node: 1,
            ops,
        }
    }

    #[test]
    fn insert_then_read_sees_own_write() {
        let access = AccessStore::new(8);
        let outcome = execute(
            &req(
                1,
                false,
                vec![
                    op(OpKind::Insert, 7, Some(b"a")),
                    op(OpKind::Read, 7, None),
                ],
            ),
            &access,
        );
        assert!(outcome.committed);
        assert_eq!(outcome.response.rows, vec![None, Some(b"a".to_vec())]);
        assert_eq!(
            access.get(RowKey {
                table_id: 1,
                shard_id: 0,
                tuple_id: 7
            }),
            Some(b"a".to_vec())
        );
    }

    #[test]
    fn failed_txn_leaves_no_trace_in_store() {
        let access = AccessStore::new(8);
        let outcome = execute(
            &req(
                2,
                false,
                vec![
                    op(OpKind::Insert, 1, Some(b"x")),
                    op(OpKind::Update, 2, Some(b"y")),
                ],
            ),
            &access,
        );
        assert!(!outcome.committed);
        assert_eq!(outcome.response.error_code, ErrorCode::NotFound);
        assert!(outcome.staged.is_empty());
        assert!(access.is_empty());
    }

    #[test]
    fn duplicate_insert_fails() {
        let access = AccessStore::new(8);
        access.put(
            RowKey {
                table_id: 1,
                shard_id: 0,
                tuple_id: 7,
            },
            b"old".to_vec(),
        );
        let outcome = execute(&req(3, false, vec![op(OpKind::Insert, 7, Some(b"new"))]), &access);
        assert_eq!(outcome.response.error_code, ErrorCode::Duplication);
    }

    #[test]
    fn read_only_tolerates_missing_rows() {
        let access = AccessStore::new(8);
        let outcome = execute(&req(4, true, vec![op(OpKind::Read, 9, None)]), &access);
        assert!(outcome.committed);
        assert_eq!(outcome.response.rows, vec![None]);
    }
}
