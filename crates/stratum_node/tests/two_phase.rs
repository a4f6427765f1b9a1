//! Two-phase commit across two participant nodes.

mod common;

use common::{request, start, update_op, TABLE};
use stratum_txn::txn::{ErrorCode, ExecutionModel, LogKind, LogRecord, Xid};

fn kinds_for(records: Vec<LogRecord>, xid: Xid) -> Vec<LogKind> {
    records
        .into_iter()
        .filter(|r| r.xid == xid)
        .map(|r| r.kind)
        .collect()
}

#[tokio::test]
async fn commit_runs_prepare_then_commit_on_both_participants() {
    // Shard 0 lives on node 1, shard 1 on node 2.
    let tc = start(2, 2, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 10, b"a").unwrap();
    tc.cluster.broker.put_row(TABLE, 1, 11, b"b").unwrap();

    let coordinator = tc.core(0);
    let req = request(
        coordinator,
        true,
        vec![update_op(0, 10, b"a2"), update_op(1, 11, b"b2")],
    );
    let xid = req.xid;
    let resp = coordinator.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);

    let node1 = kinds_for(tc.core(0).redo_log().load().unwrap(), xid);
    let node2 = kinds_for(tc.core(1).redo_log().load().unwrap(), xid);

    // The coordinator node carries its participant's records plus the
    // decision record, all in causal order.
    assert_eq!(
        node1,
        vec![LogKind::RmPrepareCommit, LogKind::TmCommit, LogKind::RmCommit]
    );
    assert_eq!(node2, vec![LogKind::RmPrepareCommit, LogKind::RmCommit]);
}

#[tokio::test]
async fn one_abort_vote_aborts_every_participant() {
    let tc = start(2, 2, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 20, b"a").unwrap();
    // Shard 1's row is missing: participant B's update fails and votes abort.

    let coordinator = tc.core(0);
    let req = request(
        coordinator,
        true,
        vec![update_op(0, 20, b"a2"), update_op(1, 21, b"nope")],
    );
    let xid = req.xid;
    let resp = coordinator.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::TxAbort);

    let node1 = kinds_for(tc.core(0).redo_log().load().unwrap(), xid);
    let node2 = kinds_for(tc.core(1).redo_log().load().unwrap(), xid);

    // Participant A may or may not get its prepare record down before the
    // decision overtakes it; what must hold is the abort on both sides and
    // no commit anywhere.
    assert!(node1.contains(&LogKind::TmAbort));
    assert!(node1.contains(&LogKind::RmAbort));
    assert!(!node1.contains(&LogKind::RmCommit));
    assert_eq!(node2, vec![LogKind::RmPrepareAbort, LogKind::RmAbort]);
}

#[tokio::test]
async fn geo_replicated_model_commits_distributed_transactions() {
    let tc = start(2, 2, ExecutionModel::GeoReplicated);
    tc.cluster.broker.put_row(TABLE, 0, 40, b"a").unwrap();
    tc.cluster.broker.put_row(TABLE, 1, 41, b"b").unwrap();

    let coordinator = tc.core(0);
    let req = request(
        coordinator,
        true,
        vec![update_op(0, 40, b"a2"), update_op(1, 41, b"b2")],
    );
    let xid = req.xid;
    let resp = coordinator.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);

    let node2 = kinds_for(tc.core(1).redo_log().load().unwrap(), xid);
    assert_eq!(node2, vec![LogKind::RmPrepareCommit, LogKind::RmCommit]);
}

#[tokio::test]
async fn committed_post_images_replay_into_the_broker() {
    let tc = start(2, 2, ExecutionModel::ShareNothing);
    tc.cluster.broker.put_row(TABLE, 0, 30, b"a").unwrap();
    tc.cluster.broker.put_row(TABLE, 1, 31, b"b").unwrap();

    let coordinator = tc.core(0);
    let req = request(
        coordinator,
        true,
        vec![update_op(0, 30, b"a2"), update_op(1, 31, b"b2")],
    );
    let xid = req.xid;
    let resp = coordinator.submit(req).await.unwrap();
    assert_eq!(resp.error_code, ErrorCode::Ok);

    // Ship each participant's commit records to the broker, the way a
    // downstream applier would.
    for core in &tc.cluster.cores {
        let commits: Vec<LogRecord> = core
            .redo_log()
            .load()
            .unwrap()
            .into_iter()
            .filter(|r| r.xid == xid && r.kind == LogKind::RmCommit)
            .collect();
        tc.cluster.broker.apply_committed(&commits).unwrap();
    }
    assert_eq!(
        tc.cluster.broker.get_row(TABLE, 0, 30).unwrap(),
        Some(b"a2".to_vec())
    );
    assert_eq!(
        tc.cluster.broker.get_row(TABLE, 1, 31).unwrap(),
        Some(b"b2".to_vec())
    );
}
