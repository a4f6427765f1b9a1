//! Deadlock detection across two contending transactions.

mod common;

use std::time::Duration;

use common::{read_for_write_op, request, start, SlowBroker, TABLE};
use stratum_txn::txn::{ErrorCode, ExecutionModel};

#[tokio::test]
async fn younger_transaction_is_victimized_and_older_commits() {
    let tc = start(1, 1, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 1, b"k1").unwrap();
    tc.cluster.broker.put_row(TABLE, 0, 2, b"k2").unwrap();
    // Both transactions sit in their first broker read long enough for the
    // other to grab its first lock, so the crossing second requests deadlock.
    SlowBroker::wrap(&tc.cluster, Duration::from_millis(150));

    let core = tc.core(0);
    let older = request(core, false, vec![read_for_write_op(0, 1), read_for_write_op(0, 2)]);
    let younger = request(core, false, vec![read_for_write_op(0, 2), read_for_write_op(0, 1)]);
    assert!(older.xid < younger.xid);
    let older_xid = older.xid;
    let younger_xid = younger.xid;

    let older_rx = core.submit(older);
    let younger_rx = core.submit(younger);

    let older_resp = tokio::time::timeout(Duration::from_secs(10), older_rx)
        .await
        .expect("older transaction must finish")
        .unwrap();
    let younger_resp = tokio::time::timeout(Duration::from_secs(10), younger_rx)
        .await
        .expect("younger transaction must finish")
        .unwrap();

    assert_eq!(older_resp.xid, older_xid);
    assert_eq!(older_resp.error_code, ErrorCode::Ok);
    assert_eq!(
        older_resp.rows,
        vec![Some(b"k1".to_vec()), Some(b"k2".to_vec())]
    );

    assert_eq!(younger_resp.xid, younger_xid);
    assert_eq!(younger_resp.error_code, ErrorCode::TxAbort);

    // The broken cycle leaves no residue in the wait-for graph.
    assert!(core.wait_graph().snapshot().is_empty());
}
