//! Shared types for the concurrency core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the transaction engine and the transport/log layers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Transaction identifier, unique and monotonically allocated per origin node.
pub type Xid = u64;
/// Operation identifier, a per-transaction counter starting at 1.
pub type Oid = u32;
/// Logical node identifier.
pub type NodeId = u64;
/// Shard identifier within the keyspace.
pub type ShardId = u32;
/// Table identifier.
pub type TableId = u32;
/// Row identifier within a table shard.
pub type TupleId = u64;
/// Consistency number (epoch) tagged onto broker reads to detect stale data.
pub type Cno = u64;

/// Protocol-level outcome carried in responses and votes.
///
/// Infrastructure failures (I/O, channel closure) travel as `anyhow::Error`;
/// this enum is the part of an outcome that clients see.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    NotFound,
    Duplication,
    TxAbort,
    Victim,
    Cascade,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

/// Row lock modes. Reads share; writes exclude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    pub fn compatible_with(self, other: LockMode) -> bool {
        self == LockMode::Read && other == LockMode::Read
    }
}

/// Operation kinds a transaction may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Read,
    ReadForWrite,
    Update,
    Insert,
    Remove,
}

impl OpKind {
    /// Lock mode the operation needs on its row.
    pub fn lock_mode(self) -> LockMode {
        match self {
            OpKind::Read => LockMode::Read,
            OpKind::ReadForWrite | OpKind::Update | OpKind::Insert | OpKind::Remove => {
                LockMode::Write
            }
        }
    }

    pub fn is_mutation(self) -> bool {
        matches!(self, OpKind::Update | OpKind::Insert | OpKind::Remove)
    }
}

/// One operation of a transaction request.
///
/// `payload` carries the post-image for inserts and updates and is empty for
/// reads and removes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOp {
    pub kind: OpKind,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
    pub payload: Option<Vec<u8>>,
}

/// Client-facing transaction request.
///
/// A distributed request names its coordinator in `source_node`; the
/// coordinator partitions `ops` across participants by shard ownership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRequest {
    pub xid: Xid,
    pub oneshot: bool,
    pub read_only: bool,
    pub distributed: bool,
    pub source_node: NodeId,
    pub ops: Vec<TxOp>,
}

/// Latency counters accumulated by one participant and reported back to the
/// client (and to the coordinator on prepare).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub lock_wait_us: u64,
    pub read_us: u64,
    pub read_broker_us: u64,
    pub append_us: u64,
    pub total_us: u64,
    pub num_locks: u64,
    pub num_read_violate: u64,
    pub num_write_violate: u64,
}

/// Client-facing transaction response.
///
/// `rows` holds one slot per submitted operation in submission order; read
/// and remove operations fill their slot with the observed row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub xid: Xid,
    pub error_code: ErrorCode,
    pub rows: Vec<Option<Vec<u8>>>,
    pub latency: LatencyReport,
}

/// Row read request sent to the data storage broker owning a shard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRowRequest {
    pub xid: Xid,
    pub oid: Oid,
    pub cno: Cno,
    pub source: NodeId,
    pub dest: NodeId,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
}

/// Broker response for a row read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRowResponse {
    pub xid: Xid,
    pub oid: Oid,
    pub error_code: ErrorCode,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
    pub row: Option<Vec<u8>>,
    pub latency_read_broker_us: u64,
}

/// Participant vote sent to the coordinator after the prepare record is
/// durable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxPrepare {
    pub xid: Xid,
    pub source_node: NodeId,
    pub dest_node: NodeId,
    pub commit: bool,
    pub latency: LatencyReport,
}

/// Participant acknowledgement of a coordinator decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxAck {
    pub xid: Xid,
    pub source_node: NodeId,
    pub dest_node: NodeId,
    pub commit: bool,
}

/// Deadlock-victim notification forwarded by a distributed participant to its
/// coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxVictim {
    pub xid: Xid,
    pub source: NodeId,
    pub dest: NodeId,
}

/// Everything that travels between nodes as a one-way notification. Broker
/// row reads are request/response and go through `Transport::read_row`
/// instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    ClientRequest(TxRequest),
    ClientResponse(TxResponse),
    Prepare(TxPrepare),
    Ack(TxAck),
    TmCommit { xid: Xid },
    TmAbort { xid: Xid },
    Victim(TxVictim),
    EnableViolate { xid: Xid },
}

/// Durable record kinds appended by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    RmCommit,
    RmAbort,
    RmPrepareCommit,
    RmPrepareAbort,
    TmCommit,
    TmAbort,
    CalvinBatch,
}

/// One write-ahead log record. Records for a single transaction are appended
/// as one contiguous group; inserts and updates embed their post-image in
/// `ops`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub xid: Xid,
    pub kind: LogKind,
    pub ops: Vec<TxOp>,
}

/// Durable log interface (physical WAL).
///
/// Implementations persist append groups and return them on startup for
/// reconciliation. Called from the WAL bridge's commit thread, so blocking
/// I/O is acceptable here.
pub trait RedoLog: Send + Sync + 'static {
    fn append_group(&self, records: &[LogRecord]) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Vec<LogRecord>>;
    /// Mark a transaction finished so its records become compactable.
    fn mark_ended(&self, xid: Xid) -> anyhow::Result<()>;
    /// Drop up to `max_delete` records of ended transactions.
    fn compact(&self, max_delete: usize) -> anyhow::Result<usize>;
}

/// Message transport between nodes.
///
/// The engine is transport-agnostic; concrete implementations can use gRPC,
/// in-process channels, or test harnesses. `send` is one-way and best-effort:
/// delivery failures are logged by callers, and distributed commit relies on
/// coordinator retry, not on transport guarantees. `read_row` is the
/// request/response path to the data storage broker owning a shard.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, dest: NodeId, msg: Message) -> anyhow::Result<()>;

    async fn read_row(
        &self,
        dest: NodeId,
        req: ReadRowRequest,
    ) -> anyhow::Result<ReadRowResponse>;
}

/// Events delivered to a transaction context's mailbox.
///
/// All cross-thread notifications aimed at one transaction become events on
/// its mailbox; the owning task consumes them sequentially, which is the
/// serial-executor guarantee the state machine relies on.
#[derive(Debug)]
pub enum TxEvent {
    LockGranted { oid: Oid, ec: ErrorCode },
    RowFetched(ReadRowResponse),
    LogDurable { kind: LogKind },
    Decision { commit: bool },
    DependencyCleared,
    EnableViolate,
    Timeout,
}

/// Sending half of a transaction mailbox.
pub type TxMailbox = tokio::sync::mpsc::UnboundedSender<TxEvent>;

/// Execution models. Exactly one is active per node; the original selected
/// these at compile time, the rewrite selects at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionModel {
    /// Row locking with one-phase or two-phase commit across shards.
    ShareNothing,
    /// ShareNothing plus dependency tracking and early (violable) lock
    /// release for geo-replicated deployments.
    GeoReplicated,
    /// Calvin-style deterministic batching: order first, execute without
    /// conflict aborts.
    Deterministic,
}

impl ExecutionModel {
    pub fn two_phase(self) -> bool {
        matches!(
            self,
            ExecutionModel::ShareNothing | ExecutionModel::GeoReplicated
        )
    }

    pub fn geo_replicated(self) -> bool {
        self == ExecutionModel::GeoReplicated
    }

    pub fn deterministic(self) -> bool {
        self == ExecutionModel::Deterministic
    }
}

/// Per-node configuration and operational tuning.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub node_id: NodeId,
    pub model: ExecutionModel,
    /// Current consistency number attached to broker reads.
    pub cno: Cno,
    /// Broker node owning each shard's durable rows.
    pub shard_to_broker: HashMap<ShardId, NodeId>,
    /// Fallback broker when a shard has no explicit owner.
    pub default_broker: Option<NodeId>,
    /// Resource-manager node owning each shard's locks; shards without an
    /// entry are treated as local.
    pub shard_to_rm: HashMap<ShardId, NodeId>,
    /// Shards this node manages locks for.
    pub local_shards: Vec<ShardId>,
    /// Upper bound for one transaction from begin to response.
    pub tx_timeout: Duration,
    /// Spacing between deadlock detector passes.
    pub deadlock_scan_interval: Duration,
    /// Sealing interval for deterministic batches.
    pub epoch_interval: Duration,
    /// Spacing between coordinator decision rebroadcasts.
    pub decision_retry_interval: Duration,
    /// Bucket count for each shard's lock table.
    pub lock_table_buckets: usize,
}

impl CoreConfig {
    pub fn new(node_id: NodeId, model: ExecutionModel) -> Self {
        Self {
            node_id,
            model,
            cno: 1,
            shard_to_broker: HashMap::new(),
            default_broker: None,
            shard_to_rm: HashMap::new(),
            local_shards: vec![0],
            tx_timeout: Duration::from_secs(10),
            deadlock_scan_interval: Duration::from_millis(100),
            epoch_interval: Duration::from_millis(10),
            decision_retry_interval: Duration::from_millis(200),
            lock_table_buckets: 64,
        }
    }

    /// Broker node that owns a shard's rows.
    pub fn broker_for(&self, shard_id: ShardId) -> Option<NodeId> {
        self.shard_to_broker
            .get(&shard_id)
            .copied()
            .or(self.default_broker)
    }
}
