//! Transaction module wiring.
//!
//! `runtime` owns the per-node engine, `context` drives one transaction
//! through lock acquisition and the commit protocol, `coordinator` is the
//! coordinator side of distributed commit, `lock_mgr` and `deadlock` form the
//! lock manager, `wal` bridges to the durable log, and `calvin` is the
//! deterministic batch path. `types` defines the shared record/message and
//! trait contracts (transport, redo log).

mod access;
mod calvin;
mod context;
mod coordinator;
mod deadlock;
mod lock_mgr;
mod runtime;
#[cfg(test)]
mod testutil;
mod types;
mod wal;

pub use access::{AccessStore, RowKey};
pub use calvin::{CalvinEngine, SealedBatch};
pub use context::{ResponseSink, RmState, TxContext, TxOutcome};
pub use coordinator::TxCoordinator;
pub use deadlock::{DeadlockDetector, WaitGraph};
pub use lock_mgr::{GlobalLockManager, LockWaiter, ShardLockManager, ViolationCounters};
pub use runtime::{ConcurrencyCore, XID_NODE_SHIFT};
pub use wal::{WalBridge, WalCompletion};
pub use types::{
    Cno, CoreConfig, ErrorCode, ExecutionModel, LatencyReport, LockMode, LogKind, LogRecord,
    Message, NodeId, Oid, OpKind, ReadRowRequest, ReadRowResponse, RedoLog, ShardId, TableId,
    Transport, TupleId, TxAck, TxEvent, TxMailbox, TxOp, TxPrepare, TxRequest, TxResponse,
    TxVictim, Xid,
};
