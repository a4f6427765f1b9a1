//! Single-node transaction lifecycle against the fjall-backed broker.

mod common;

use std::time::Duration;

use common::{insert_op, read_op, request, start, update_op, SlowBroker, TABLE};
use stratum_txn::txn::{ErrorCode, ExecutionModel, LogKind, RowKey, TxRequest};

#[tokio::test]
async fn broker_miss_read_fills_the_cache() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 42, b"v").unwrap();

    let core = tc.core(0);
    let resp = core
        .submit(request(core, false, vec![read_op(0, 42)]))
        .await
        .unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);
    assert_eq!(resp.rows, vec![Some(b"v".to_vec())]);
    assert_eq!(
        core.access().get(RowKey {
            table_id: TABLE,
            shard_id: 0,
            tuple_id: 42
        }),
        Some(b"v".to_vec())
    );
}

#[tokio::test]
async fn insert_then_read_writes_one_commit_record() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    let core = tc.core(0);

    let req = request(core, false, vec![insert_op(0, 7, b"a"), read_op(0, 7)]);
    let xid = req.xid;
    let resp = core.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);
    assert_eq!(resp.rows, vec![None, Some(b"a".to_vec())]);

    let commits: Vec<_> = core
        .redo_log()
        .load()
        .unwrap()
        .into_iter()
        .filter(|r| r.xid == xid && r.kind == LogKind::RmCommit)
        .collect();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].ops.len(), 2);
    assert_eq!(commits[0].ops[0].payload, Some(b"a".to_vec()));
}

#[tokio::test]
async fn duplicate_insert_fails_without_commit_record() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 7, b"old").unwrap();
    let core = tc.core(0);

    let req = request(core, false, vec![insert_op(0, 7, b"new")]);
    let xid = req.xid;
    let resp = core.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::Duplication);
    assert!(core
        .redo_log()
        .load()
        .unwrap()
        .iter()
        .all(|r| !(r.xid == xid && r.kind == LogKind::RmCommit)));

    // Locks are gone: the same key is immediately writable again.
    let resp = core
        .submit(request(core, false, vec![update_op(0, 7, b"newer")]))
        .await
        .unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);
}

#[tokio::test]
async fn update_of_missing_row_aborts() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    let core = tc.core(0);

    let resp = core
        .submit(request(core, false, vec![update_op(0, 404, b"x")]))
        .await
        .unwrap();
    assert_eq!(resp.error_code, ErrorCode::NotFound);
}

#[tokio::test]
async fn read_only_transaction_tolerates_missing_rows() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    let core = tc.core(0);

    let resp = core
        .submit(TxRequest {
            read_only: true,
            ..request(core, false, vec![read_op(0, 9), read_op(0, 10)])
        })
        .await
        .unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);
    assert_eq!(resp.rows, vec![None, None]);
    // Read-only commits never touch the log.
    assert!(core.redo_log().load().unwrap().is_empty());
}

#[tokio::test]
async fn stuck_broker_read_hits_the_transaction_timeout() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 1, b"v").unwrap();
    // Reads outlast the transaction timeout set below.
    SlowBroker::wrap(&tc.cluster, Duration::from_secs(30));

    let core = tc.core(0);
    let req = request(core, false, vec![read_op(0, 1)]);

    let started = std::time::Instant::now();
    let resp = tokio::time::timeout(Duration::from_secs(10), core.submit(req))
        .await
        .expect("timeout must fire well before 10s")
        .unwrap();
    assert_eq!(resp.error_code, ErrorCode::TxAbort);
    assert!(started.elapsed() >= Duration::from_secs(4));
}
