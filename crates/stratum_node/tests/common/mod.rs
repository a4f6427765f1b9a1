//! Shared helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratum_node::node::{start_cluster, Cluster, ClusterConfig, BROKER_NODE_ID};
use stratum_node::storage::RowStore;
use stratum_node::wal_file::SyncMode;
use stratum_txn::txn::{
    ConcurrencyCore, ErrorCode, ExecutionModel, Message, NodeId, OpKind, ReadRowRequest,
    ReadRowResponse, Transport, TupleId, TxOp, TxRequest,
};

pub const TABLE: u32 = 1;

/// A cluster plus the tempdir holding its state.
pub struct TestCluster {
    pub cluster: Cluster,
    _dir: tempfile::TempDir,
}

impl TestCluster {
    pub fn core(&self, index: usize) -> &Arc<ConcurrencyCore> {
        &self.cluster.cores[index]
    }
}

/// Spin up an in-process cluster with test-friendly intervals.
pub fn start(nodes: usize, shards: u32, model: ExecutionModel) -> TestCluster {
    let dir = tempfile::tempdir().expect("create test dir");
    let mut config = ClusterConfig::new(dir.path().to_path_buf(), model);
    config.nodes = nodes;
    config.shards = shards;
    config.sync_mode = SyncMode::None;
    config.tx_timeout = Duration::from_secs(5);
    config.deadlock_scan_interval = Duration::from_millis(30);
    config.epoch_interval = Duration::from_millis(5);
    let cluster = start_cluster(&config).expect("start cluster");
    TestCluster {
        cluster,
        _dir: dir,
    }
}

pub fn read_op(shard_id: u32, tuple_id: TupleId) -> TxOp {
    TxOp {
        kind: OpKind::Read,
        table_id: TABLE,
        shard_id,
        tuple_id,
        payload: None,
    }
}

pub fn read_for_write_op(shard_id: u32, tuple_id: TupleId) -> TxOp {
    TxOp {
        kind: OpKind::ReadForWrite,
        table_id: TABLE,
        shard_id,
        tuple_id,
        payload: None,
    }
}

pub fn insert_op(shard_id: u32, tuple_id: TupleId, payload: &[u8]) -> TxOp {
    TxOp {
        kind: OpKind::Insert,
        table_id: TABLE,
        shard_id,
        tuple_id,
        payload: Some(payload.to_vec()),
    }
}

pub fn update_op(shard_id: u32, tuple_id: TupleId, payload: &[u8]) -> TxOp {
    TxOp {
        kind: OpKind::Update,
        table_id: TABLE,
        shard_id,
        tuple_id,
        payload: Some(payload.to_vec()),
    }
}

pub fn request(core: &Arc<ConcurrencyCore>, distributed: bool, ops: Vec<TxOp>) -> TxRequest {
    TxRequest {
        xid: core.allocate_xid(),
        oneshot: true,
        read_only: false,
        distributed,
        source_node: core.config().node_id,
        ops,
    }
}

/// Broker wrapper that delays every row read; used to hold transactions in
/// their broker-read suspension long enough to interleave.
pub struct SlowBroker {
    inner: Arc<dyn RowStore>,
    delay: Duration,
}

impl SlowBroker {
    pub fn wrap(cluster: &Cluster, delay: Duration) {
        let slow = Arc::new(SlowBroker {
            inner: cluster.broker.clone(),
            delay,
        });
        cluster.mesh.register_broker(BROKER_NODE_ID, slow);
    }
}

#[async_trait]
impl RowStore for SlowBroker {
    async fn read_row(&self, req: ReadRowRequest) -> anyhow::Result<ReadRowResponse> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_row(req).await
    }
}

/// Transport whose sends vanish and whose reads find nothing. For engines
/// exercised without any peers.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, _dest: NodeId, _msg: Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn read_row(
        &self,
        _dest: NodeId,
        req: ReadRowRequest,
    ) -> anyhow::Result<ReadRowResponse> {
        Ok(ReadRowResponse {
            xid: req.xid,
            oid: req.oid,
            error_code: ErrorCode::NotFound,
            table_id: req.table_id,
            shard_id: req.shard_id,
            tuple_id: req.tuple_id,
            row: None,
            latency_read_broker_us: 0,
        })
    }
}
