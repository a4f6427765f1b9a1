//! Cluster wiring and the workload driver shared by the binary and the
//! integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use stratum_txn::txn::{
    ConcurrencyCore, CoreConfig, ErrorCode, ExecutionModel, NodeId, OpKind, ShardId, TxOp,
    TxRequest,
};

use crate::mesh::Mesh;
use crate::storage::FjallBroker;
use crate::wal_file::{FileRedoLog, SyncMode};

/// Node id of the data storage broker in mesh topologies.
pub const BROKER_NODE_ID: NodeId = 1_000;

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub nodes: usize,
    pub shards: u32,
    pub model: ExecutionModel,
    pub data_dir: PathBuf,
    pub sync_mode: SyncMode,
    pub tx_timeout: Duration,
    pub deadlock_scan_interval: Duration,
    pub epoch_interval: Duration,
}

impl ClusterConfig {
    pub fn new(data_dir: PathBuf, model: ExecutionModel) -> Self {
        Self {
            nodes: 1,
            shards: 1,
            model,
            data_dir,
            sync_mode: SyncMode::Data,
            tx_timeout: Duration::from_secs(5),
            deadlock_scan_interval: Duration::from_millis(50),
            epoch_interval: Duration::from_millis(10),
        }
    }
}

/// A running in-process cluster: one broker plus `nodes` resource managers.
pub struct Cluster {
    pub mesh: Arc<Mesh>,
    pub broker: Arc<FjallBroker>,
    pub cores: Vec<Arc<ConcurrencyCore>>,
}

/// Resource manager owning a shard's locks.
pub fn shard_owner(shard_id: ShardId, nodes: usize) -> NodeId {
    (u64::from(shard_id) % nodes.max(1) as u64) + 1
}

pub fn start_cluster(config: &ClusterConfig) -> anyhow::Result<Cluster> {
    let mesh = Arc::new(Mesh::new());
    let broker = FjallBroker::open(config.data_dir.join("broker"))?;
    mesh.register_broker(BROKER_NODE_ID, broker.clone());

    let mut cores = Vec::with_capacity(config.nodes);
    for node_id in 1..=config.nodes as NodeId {
        let mut core_config = CoreConfig::new(node_id, config.model);
        core_config.default_broker = Some(BROKER_NODE_ID);
        core_config.tx_timeout = config.tx_timeout;
        core_config.deadlock_scan_interval = config.deadlock_scan_interval;
        core_config.epoch_interval = config.epoch_interval;
        core_config.local_shards = (0..config.shards)
            .filter(|shard| shard_owner(*shard, config.nodes) == node_id)
            .collect();
        for shard in 0..config.shards {
            core_config
                .shard_to_rm
                .insert(shard, shard_owner(shard, config.nodes));
        }

        let wal_dir = config.data_dir.join(format!("node-{node_id}")).join("wal");
        let redo = Arc::new(
            FileRedoLog::open_dir(&wal_dir, config.sync_mode)
                .with_context(|| format!("open redo log for node {node_id}"))?,
        );
        let core = ConcurrencyCore::new(core_config, mesh.clone(), redo)
            .with_context(|| format!("start engine for node {node_id}"))?;
        mesh.register_engine(node_id, &core);
        cores.push(core);
    }

    Ok(Cluster {
        mesh,
        broker,
        cores,
    })
}

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub txns: usize,
    pub keys: u64,
    pub ops_per_txn: usize,
    pub read_ratio: f64,
    pub distributed_ratio: f64,
    pub concurrency: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            txns: 1_000,
            keys: 10_000,
            ops_per_txn: 4,
            read_ratio: 0.8,
            distributed_ratio: 0.1,
            concurrency: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WorkloadStats {
    pub committed: u64,
    pub aborted: u64,
    pub elapsed: Duration,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl WorkloadStats {
    pub fn throughput(&self) -> f64 {
        let total = self.committed + self.aborted;
        if self.elapsed.is_zero() {
            return 0.0;
        }
        total as f64 / self.elapsed.as_secs_f64()
    }

    pub fn avg_latency_us(&self) -> u64 {
        let total = self.committed + self.aborted;
        if total == 0 {
            return 0;
        }
        self.total_latency_us / total
    }
}

const WORKLOAD_TABLE: u32 = 1;

/// Seed every workload key into the broker so updates find their rows.
pub fn seed_rows(cluster: &Cluster, config: &WorkloadConfig, shards: u32) -> anyhow::Result<()> {
    for key in 0..config.keys {
        let shard = (key % u64::from(shards.max(1))) as ShardId;
        cluster
            .broker
            .put_row(WORKLOAD_TABLE, shard, key, format!("v{key}").as_bytes())?;
    }
    cluster.broker.persist()
}

fn random_request(
    rng: &mut impl Rng,
    cluster: &Cluster,
    config: &WorkloadConfig,
    shards: u32,
    core_index: usize,
) -> TxRequest {
    let core = &cluster.cores[core_index];
    let nodes = cluster.cores.len();
    let node_id = core.config().node_id;
    let xid = core.allocate_xid();

    // A transaction stays one-phase only while every shard it touches is
    // owned by the submitting node.
    let owned: Vec<ShardId> = (0..shards)
        .filter(|shard| shard_owner(*shard, nodes) == node_id)
        .collect();
    let distributed =
        owned.is_empty() || (shards > 1 && rng.gen_bool(config.distributed_ratio));

    let span = (config.keys / u64::from(shards.max(1))).max(1);
    let mut ops = Vec::with_capacity(config.ops_per_txn);
    for _ in 0..config.ops_per_txn {
        let shard = if distributed {
            rng.gen_range(0..shards.max(1))
        } else {
            owned[rng.gen_range(0..owned.len())]
        };
        let tuple_id = u64::from(shard) + u64::from(shards.max(1)) * rng.gen_range(0..span);
        let op = if rng.gen_bool(config.read_ratio) {
            TxOp {
                kind: OpKind::Read,
                table_id: WORKLOAD_TABLE,
                shard_id: shard,
                tuple_id,
                payload: None,
            }
        } else {
            TxOp {
                kind: OpKind::Update,
                table_id: WORKLOAD_TABLE,
                shard_id: shard,
                tuple_id,
                payload: Some(format!("u{xid}").into_bytes()),
            }
        };
        ops.push(op);
    }
    TxRequest {
        xid,
        oneshot: true,
        read_only: false,
        distributed,
        source_node: node_id,
        ops,
    }
}

/// Drive random transactions through the cluster and tally the outcomes.
pub async fn run_workload(
    cluster: &Cluster,
    config: &WorkloadConfig,
    shards: u32,
) -> anyhow::Result<WorkloadStats> {
    let mut stats = WorkloadStats::default();
    let started = Instant::now();
    let mut in_flight = tokio::task::JoinSet::new();
    let mut submitted = 0usize;
    let mut rng = StdRng::from_entropy();

    while submitted < config.txns || !in_flight.is_empty() {
        while submitted < config.txns && in_flight.len() < config.concurrency.max(1) {
            let core_index = submitted % cluster.cores.len();
            let req = random_request(&mut rng, cluster, config, shards, core_index);
            let rx = cluster.cores[core_index].submit(req);
            submitted += 1;
            in_flight.spawn(async move {
                let op_start = Instant::now();
                let resp = rx.await;
                (resp, op_start.elapsed())
            });
        }
        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (resp, latency) = joined.context("workload task panicked")?;
        let latency_us = latency.as_micros() as u64;
        stats.total_latency_us += latency_us;
        stats.max_latency_us = stats.max_latency_us.max(latency_us);
        match resp {
            Ok(resp) if resp.error_code == ErrorCode::Ok => stats.committed += 1,
            Ok(_) => stats.aborted += 1,
            Err(_) => stats.aborted += 1,
        }
    }

    stats.elapsed = started.elapsed();
    Ok(stats)
}
