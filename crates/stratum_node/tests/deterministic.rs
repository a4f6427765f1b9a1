//! Replaying the same sealed batches on two fresh instances must produce
//! identical responses and identical final state.

mod common;

use std::sync::Arc;

use common::{insert_op, read_op, update_op, NullTransport, TABLE};
use stratum_node::wal_file::{FileRedoLog, SyncMode};
use stratum_txn::txn::{
    AccessStore, CalvinEngine, CoreConfig, ErrorCode, ExecutionModel, OpKind, RowKey, SealedBatch,
    TxOp, TxRequest, TxResponse, WalBridge,
};

struct Instance {
    access: Arc<AccessStore>,
    engine: Arc<CalvinEngine>,
    _dir: tempfile::TempDir,
}

fn fresh_instance() -> Instance {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(CoreConfig::new(1, ExecutionModel::Deterministic));
    let access = Arc::new(AccessStore::new(64));
    let redo = Arc::new(FileRedoLog::open_dir(dir.path(), SyncMode::None).unwrap());
    let wal = Arc::new(WalBridge::new(redo).unwrap());
    let engine = CalvinEngine::new(config, access.clone(), wal, Arc::new(NullTransport));
    Instance {
        access,
        engine,
        _dir: dir,
    }
}

fn txn(xid: u64, read_only: bool, ops: Vec<TxOp>) -> TxRequest {
    TxRequest {
        xid,
        oneshot: true,
        read_only,
        distributed: false,
        source_node: 1,
        ops,
    }
}

fn remove_op(tuple_id: u64) -> TxOp {
    TxOp {
        kind: OpKind::Remove,
        table_id: TABLE,
        shard_id: 0,
        tuple_id,
        payload: None,
    }
}

fn batches() -> Vec<SealedBatch> {
    vec![
        SealedBatch {
            epoch: 1,
            txns: vec![
                txn(1, false, vec![insert_op(0, 1, b"a"), insert_op(0, 2, b"b")]),
                txn(2, false, vec![insert_op(0, 3, b"c")]),
                // Conflicts with txn 1 on key 1; must observe its insert.
                txn(3, false, vec![read_op(0, 1), update_op(0, 1, b"a2")]),
            ],
        },
        SealedBatch {
            epoch: 2,
            txns: vec![
                // Duplicate insert: fails, leaves no state behind.
                txn(4, false, vec![insert_op(0, 2, b"dup")]),
                txn(5, false, vec![remove_op(3), read_op(0, 1)]),
                txn(6, true, vec![read_op(0, 99)]),
            ],
        },
    ]
}

async fn replay(instance: &Instance) -> Vec<TxResponse> {
    let mut responses = Vec::new();
    for batch in batches() {
        responses.extend(instance.engine.apply_batch(batch).await.unwrap());
    }
    responses
}

#[tokio::test]
async fn two_instances_agree_on_responses_and_state() {
    let a = fresh_instance();
    let b = fresh_instance();

    let responses_a = replay(&a).await;
    let responses_b = replay(&b).await;
    assert_eq!(responses_a, responses_b);

    // Spot outcomes: the conflicting update saw the insert, the duplicate
    // failed, the remove returned key 3's row.
    assert_eq!(responses_a[2].error_code, ErrorCode::Ok);
    assert_eq!(responses_a[2].rows[0], Some(b"a".to_vec()));
    assert_eq!(responses_a[3].error_code, ErrorCode::Duplication);
    assert_eq!(responses_a[4].error_code, ErrorCode::Ok);
    assert_eq!(responses_a[4].rows[0], Some(b"c".to_vec()));
    assert_eq!(responses_a[5].error_code, ErrorCode::Ok);

    for tuple_id in [1u64, 2, 3, 99] {
        let key = RowKey {
            table_id: TABLE,
            shard_id: 0,
            tuple_id,
        };
        assert_eq!(a.access.get(key), b.access.get(key), "key {tuple_id}");
    }
    assert_eq!(
        a.access.get(RowKey {
            table_id: TABLE,
            shard_id: 0,
            tuple_id: 1
        }),
        Some(b"a2".to_vec())
    );
    assert_eq!(a.access.len(), b.access.len());
}
