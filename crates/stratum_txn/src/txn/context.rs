//! Per-transaction context: the participant-side state machine.
//!
//! One context owns one transaction on this node from request arrival to
//! response. It runs as a task draining the transaction's mailbox, so every
//! handler below executes single-threaded with respect to the transaction.
//! The pipeline suspends at four points: waiting for a lock grant, waiting
//! for a broker row, waiting for log durability, and waiting for the
//! coordinator's decision. Each suspension is resumed by a typed event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use super::access::{AccessStore, RowKey};
use super::deadlock::WaitGraph;
use super::lock_mgr::{GlobalLockManager, LockWaiter};
use super::types::{
    Cno, CoreConfig, ErrorCode, LatencyReport, LockMode, LogKind, LogRecord, Message, NodeId, Oid,
    OpKind, ReadRowRequest, ReadRowResponse, ShardId, TableId, Transport, TupleId, TxAck, TxEvent,
    TxMailbox, TxOp, TxPrepare, TxRequest, TxResponse, TxVictim, Xid,
};
use super::wal::{WalBridge, WalCompletion};

/// Participant states of the commit protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmState {
    Idle,
    Committing,
    Aborting,
    PrepareCommitting,
    PrepareAborting,
    Ended,
}

/// Final shape of a transaction as reported to the runtime when it ends.
#[derive(Clone, Debug)]
pub struct TxOutcome {
    pub xid: Xid,
    pub state: RmState,
    pub error_code: ErrorCode,
    pub committed: bool,
    pub distributed: bool,
    pub coord_node: NodeId,
}

pub type TxStateObserver = Arc<dyn Fn(TxOutcome) + Send + Sync>;

/// Where the client response goes.
pub enum ResponseSink {
    Local(oneshot::Sender<TxResponse>),
    Remote { dest: NodeId },
    Discard,
}

/// Stopwatch accumulating one latency component across begin/end pairs.
#[derive(Default)]
struct TimeTracker {
    total: Duration,
    started: Option<Instant>,
}

impl TimeTracker {
    fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    fn end(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    fn micros(&self) -> u64 {
        self.total.as_micros().min(u128::from(u64::MAX)) as u64
    }
}

/// One acquired or requested row lock, owned by the transaction.
#[derive(Clone, Copy, Debug)]
struct LockItem {
    mode: LockMode,
    table_id: TableId,
    shard_id: ShardId,
    tuple_id: TupleId,
}

/// The operation currently in flight. At most one exists per transaction.
struct PendingOp {
    op: TxOp,
    oid: Oid,
    slot: usize,
}

/// Dependency bookkeeping shared between geo-replicated transactions.
///
/// An edge `a -> b` means b's commit waits on a's. Both endpoints' cells are
/// locked in xid order for every mutation, acquired once per call.
pub(crate) struct DepCell {
    xid: Xid,
    inner: Mutex<DepInner>,
}

struct DepInner {
    dep_in: HashSet<Xid>,
    dep_out: HashMap<Xid, Arc<DepCell>>,
    decided: bool,
    cascade: bool,
    mailbox: TxMailbox,
}

impl DepCell {
    pub(crate) fn new(xid: Xid, mailbox: TxMailbox) -> Arc<Self> {
        Arc::new(Self {
            xid,
            inner: Mutex::new(DepInner {
                dep_in: HashSet::new(),
                dep_out: HashMap::new(),
                decided: false,
                cascade: false,
                mailbox,
            }),
        })
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, DepInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_decided(&self) {
        self.guard().decided = true;
    }

    /// (cascade, blocked) snapshot for commit gating.
    fn gate(&self) -> (bool, bool) {
        let inner = self.guard();
        (inner.cascade, !inner.dep_in.is_empty())
    }
}

/// Record `holder -> dependent`. Rejected when either endpoint is already
/// past its decision point.
pub(crate) fn register_dependency(holder: &Arc<DepCell>, dependent: &Arc<DepCell>) {
    if holder.xid == dependent.xid {
        tracing::error!(xid = holder.xid, "cannot register a self dependency");
        return;
    }
    let (first, second) = if holder.xid < dependent.xid {
        (holder, dependent)
    } else {
        (dependent, holder)
    };
    let mut first_guard = first.guard();
    let mut second_guard = second.guard();
    let (holder_inner, dependent_inner) = if holder.xid == first.xid {
        (&mut *first_guard, &mut *second_guard)
    } else {
        (&mut *second_guard, &mut *first_guard)
    };
    if holder_inner.decided || dependent_inner.decided {
        return;
    }
    if !holder_inner.dep_out.contains_key(&dependent.xid) {
        holder_inner.dep_out.insert(dependent.xid, dependent.clone());
        dependent_inner.dep_in.insert(holder.xid);
    }
}

/// Holder committed: clear its outbound edges and wake dependents whose last
/// inbound edge went away.
fn report_dependencies(holder: &Arc<DepCell>) {
    let dependents: Vec<Arc<DepCell>> = {
        let mut inner = holder.guard();
        inner.dep_out.drain().map(|(_, cell)| cell).collect()
    };
    for cell in dependents {
        let mut inner = cell.guard();
        inner.dep_in.remove(&holder.xid);
        if inner.dep_in.is_empty() {
            let _ = inner.mailbox.send(TxEvent::DependencyCleared);
        }
    }
}

/// Holder aborted: dependents that consumed its early-released state must
/// abort too.
fn cascade_dependencies(holder: &Arc<DepCell>) {
    let dependents: Vec<Arc<DepCell>> = {
        let mut inner = holder.guard();
        inner.dep_out.drain().map(|(_, cell)| cell).collect()
    };
    for cell in dependents {
        let mut inner = cell.guard();
        inner.dep_in.remove(&holder.xid);
        inner.cascade = true;
        let _ = inner.mailbox.send(TxEvent::DependencyCleared);
    }
}

pub(crate) struct TxContextParams {
    pub(crate) req: TxRequest,
    pub(crate) config: Arc<CoreConfig>,
    pub(crate) lock_mgr: Arc<GlobalLockManager>,
    pub(crate) graph: Arc<WaitGraph>,
    pub(crate) access: Arc<AccessStore>,
    pub(crate) wal: Arc<WalBridge>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) sink: ResponseSink,
    pub(crate) observer: TxStateObserver,
    pub(crate) dep: Option<Arc<DepCell>>,
}

pub struct TxContext {
    xid: Xid,
    cno: Cno,
    node_id: NodeId,
    coord_node: NodeId,
    distributed: bool,
    read_only: bool,
    two_phase: bool,
    geo_replicated: bool,

    state: RmState,
    error_code: ErrorCode,

    ops: VecDeque<TxOp>,
    total_ops: usize,
    next_oid: Oid,
    pending: Option<PendingOp>,
    locks: HashMap<Oid, LockItem>,
    broker_reads: HashSet<Oid>,
    staged: Vec<TxOp>,
    rows: Vec<Option<Vec<u8>>>,

    prepare_log_synced: bool,
    commit_log_synced: bool,
    dep: Option<Arc<DepCell>>,
    victim: bool,
    timeout_invoked: bool,
    responded: bool,

    lock_wait_time: TimeTracker,
    read_time: TimeTracker,
    append_time: TimeTracker,
    part_time: TimeTracker,
    latency_read_broker_us: u64,
    num_locks: u64,
    num_read_violate: u64,
    num_write_violate: u64,
    trace: String,

    config: Arc<CoreConfig>,
    lock_mgr: Arc<GlobalLockManager>,
    graph: Arc<WaitGraph>,
    access: Arc<AccessStore>,
    wal: Arc<WalBridge>,
    transport: Arc<dyn Transport>,
    sink: Option<ResponseSink>,
    observer: TxStateObserver,
    mailbox: TxMailbox,
}

impl TxContext {
    pub(crate) fn new(params: TxContextParams, mailbox: TxMailbox) -> Self {
        let TxContextParams {
            req,
            config,
            lock_mgr,
            graph,
            access,
            wal,
            transport,
            sink,
            observer,
            dep,
        } = params;
        let coord_node = if req.distributed { req.source_node } else { 0 };
        let total_ops = req.ops.len();
        Self {
            xid: req.xid,
            cno: config.cno,
            node_id: config.node_id,
            coord_node,
            distributed: req.distributed,
            read_only: req.read_only,
            two_phase: config.model.two_phase(),
            geo_replicated: config.model.geo_replicated(),
            state: RmState::Idle,
            error_code: ErrorCode::Ok,
            ops: req.ops.into_iter().collect(),
            total_ops,
            next_oid: 1,
            pending: None,
            locks: HashMap::new(),
            broker_reads: HashSet::new(),
            staged: Vec::new(),
            rows: Vec::new(),
            prepare_log_synced: false,
            commit_log_synced: false,
            dep,
            victim: false,
            timeout_invoked: false,
            responded: false,
            lock_wait_time: TimeTracker::default(),
            read_time: TimeTracker::default(),
            append_time: TimeTracker::default(),
            part_time: TimeTracker::default(),
            latency_read_broker_us: 0,
            num_locks: 0,
            num_read_violate: 0,
            num_write_violate: 0,
            trace: String::new(),
            config,
            lock_mgr,
            graph,
            access,
            wal,
            transport,
            sink: Some(sink),
            observer,
            mailbox,
        }
    }

    pub fn state(&self) -> RmState {
        self.state
    }

    /// Drive the transaction to completion. The receiver is this
    /// transaction's mailbox; the timer enforces the transaction-level
    /// timeout.
    pub(crate) async fn run(mut self, mut rx: UnboundedReceiver<TxEvent>) {
        tracing::trace!(xid = self.xid, node_id = self.node_id, "transaction begin");
        self.part_time.begin();
        let timeout = tokio::time::sleep(self.config.tx_timeout);
        tokio::pin!(timeout);

        self.trace.push_str("rq;");
        self.handle_next_operation();

        while self.state != RmState::Ended {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(ev) => self.on_event(ev),
                    None => break,
                },
                _ = &mut timeout, if !self.timeout_invoked => {
                    self.on_event(TxEvent::Timeout);
                }
            }
        }
        tracing::trace!(xid = self.xid, "transaction end");
    }

    fn on_event(&mut self, ev: TxEvent) {
        match ev {
            TxEvent::LockGranted { oid, ec } => self.on_lock_granted(oid, ec),
            TxEvent::RowFetched(resp) => self.on_row_fetched(resp),
            TxEvent::LogDurable { kind } => self.on_log_durable(kind),
            TxEvent::Decision { commit } => self.on_decision(commit),
            TxEvent::DependencyCleared => self.on_dependency_cleared(),
            TxEvent::EnableViolate => self.make_locks_violable(),
            TxEvent::Timeout => self.on_timeout(),
        }
    }

    // ---- operation driver ----

    fn handle_next_operation(&mut self) {
        if self.state != RmState::Idle {
            return;
        }
        if self.error_code == ErrorCode::Ok {
            if let Some(op) = self.ops.pop_front() {
                self.start_op(op);
            } else {
                debug_assert_eq!(self.next_oid as usize, self.total_ops + 1);
                if self.distributed && self.two_phase {
                    self.phase1_prepare_commit();
                } else {
                    self.phase1_commit();
                }
            }
        } else {
            tracing::trace!(xid = self.xid, ec = ?self.error_code, "abort");
            if self.distributed && self.two_phase {
                self.phase1_prepare_abort();
            } else {
                self.phase1_abort();
            }
        }
    }

    fn start_op(&mut self, op: TxOp) {
        debug_assert!(self.pending.is_none(), "one lock acquisition in flight");
        let oid = self.next_oid;
        self.next_oid += 1;
        let mode = op.kind.lock_mode();
        let slot = self.rows.len();
        self.rows.push(None);
        if self
            .locks
            .insert(
                oid,
                LockItem {
                    mode,
                    table_id: op.table_id,
                    shard_id: op.shard_id,
                    tuple_id: op.tuple_id,
                },
            )
            .is_none()
        {
            self.num_locks += 1;
        }
        self.trace
            .push_str(&format!("lk {}:{}:{};", op.table_id, op.tuple_id, oid));
        let table_id = op.table_id;
        let shard_id = op.shard_id;
        let tuple_id = op.tuple_id;
        self.pending = Some(PendingOp { op, oid, slot });
        self.lock_wait_time.begin();
        if self.read_only {
            // Read-only transactions skip lock acquisition entirely.
            self.on_lock_granted(oid, ErrorCode::Ok);
        } else {
            self.lock_mgr.lock_row(
                mode,
                table_id,
                shard_id,
                tuple_id,
                LockWaiter {
                    xid: self.xid,
                    oid,
                    mailbox: self.mailbox.clone(),
                },
            );
        }
    }

    fn on_lock_granted(&mut self, oid: Oid, ec: ErrorCode) {
        self.trace.push_str("lk ntf;");
        self.lock_wait_time.end();
        let Some(pending) = self.pending.as_ref() else {
            tracing::warn!(xid = self.xid, oid, "lock grant without a pending operation");
            debug_assert!(false, "lock grant without a pending operation");
            return;
        };
        debug_assert_eq!(pending.oid, oid);

        if ec == ErrorCode::Victim {
            self.victim = true;
        }
        if !ec.is_ok() {
            self.op_done(ec);
            return;
        }

        let op = pending.op.clone();
        let key = RowKey {
            table_id: op.table_id,
            shard_id: op.shard_id,
            tuple_id: op.tuple_id,
        };
        match op.kind {
            OpKind::Read | OpKind::ReadForWrite => {
                if let Some(row) = self.access.get(key) {
                    let slot = pending.slot;
                    self.rows[slot] = Some(row);
                    self.staged.push(op);
                    self.op_done(ErrorCode::Ok);
                } else {
                    self.read_from_broker(oid, &op);
                }
            }
            OpKind::Update => {
                if self.access.contains(key) {
                    self.finish_mutation(ErrorCode::Ok);
                } else {
                    self.read_from_broker(oid, &op);
                }
            }
            OpKind::Insert => {
                if self.access.contains(key) {
                    self.op_done(ErrorCode::Duplication);
                } else {
                    self.read_from_broker(oid, &op);
                }
            }
            OpKind::Remove => {
                if let Some(row) = self.access.remove(key) {
                    let slot = pending.slot;
                    self.rows[slot] = Some(row);
                    self.finish_mutation(ErrorCode::Ok);
                } else {
                    self.op_done(ErrorCode::NotFound);
                }
            }
        }
    }

    fn read_from_broker(&mut self, oid: Oid, op: &TxOp) {
        self.trace.push_str("rd dsb;");
        let Some(dest) = self.config.broker_for(op.shard_id) else {
            tracing::error!(
                xid = self.xid,
                shard_id = op.shard_id,
                "no broker configured for shard"
            );
            self.op_done(ErrorCode::NotFound);
            return;
        };
        let req = ReadRowRequest {
            xid: self.xid,
            oid,
            cno: self.cno,
            source: self.node_id,
            dest,
            table_id: op.table_id,
            shard_id: op.shard_id,
            tuple_id: op.tuple_id,
        };
        self.broker_reads.insert(oid);
        self.read_time.begin();
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let xid = self.xid;
        tokio::spawn(async move {
            match transport.read_row(dest, req).await {
                Ok(resp) => {
                    let _ = mailbox.send(TxEvent::RowFetched(resp));
                }
                Err(err) => {
                    // The transaction times out and aborts; the row read is
                    // retried by the client, not by this node.
                    tracing::error!(xid, dest, error = ?err, "broker read failed");
                }
            }
        });
    }

    fn on_row_fetched(&mut self, resp: ReadRowResponse) {
        self.trace.push_str("dsb rsp;");
        if !self.broker_reads.remove(&resp.oid) {
            // A stale response, e.g. after this transaction was picked as a
            // deadlock victim. The result is discarded.
            tracing::trace!(xid = self.xid, oid = resp.oid, "discarding stale broker read");
            return;
        }
        self.read_time.end();
        self.latency_read_broker_us += resp.latency_read_broker_us;

        let ec = resp.error_code;
        let key = RowKey {
            table_id: resp.table_id,
            shard_id: resp.shard_id,
            tuple_id: resp.tuple_id,
        };
        let Some(pending) = self.pending.as_ref() else {
            tracing::warn!(xid = self.xid, oid = resp.oid, "broker row without pending op");
            return;
        };
        let kind = pending.op.kind;
        let slot = pending.slot;
        let op = pending.op.clone();

        match kind {
            OpKind::Read | OpKind::ReadForWrite => {
                match (ec, resp.row.clone()) {
                    (ErrorCode::Ok, Some(row)) => {
                        self.rows[slot] = Some(row.clone());
                        self.access.put(key, row);
                        self.staged.push(op);
                        self.op_done(ErrorCode::Ok);
                    }
                    (ErrorCode::Ok, None) | (ErrorCode::NotFound, _) => {
                        self.op_done(ErrorCode::NotFound);
                    }
                    (other, _) => self.op_done(other),
                }
            }
            OpKind::Update => match ec {
                ErrorCode::Ok => {
                    if let Some(row) = resp.row {
                        self.access.put(key, row);
                    }
                    self.finish_mutation(ErrorCode::Ok);
                }
                other => self.op_done(other),
            },
            OpKind::Insert => match ec {
                // The probe found an existing row: the insert collides.
                ErrorCode::Ok => {
                    if let Some(row) = resp.row {
                        self.access.put(key, row);
                    }
                    self.op_done(ErrorCode::Duplication);
                }
                ErrorCode::NotFound => self.finish_mutation(ErrorCode::Ok),
                other => self.op_done(other),
            },
            OpKind::Remove => {
                // Removes resolve against the access layer alone.
                tracing::warn!(xid = self.xid, "unexpected broker read for remove");
                self.op_done(ec);
            }
        }
    }

    /// A mutation succeeded: stage it for the log and install its post-image
    /// so later operations of this transaction observe it.
    fn finish_mutation(&mut self, ec: ErrorCode) {
        debug_assert!(ec.is_ok());
        if let Some(pending) = self.pending.as_ref() {
            let op = pending.op.clone();
            let key = RowKey {
                table_id: op.table_id,
                shard_id: op.shard_id,
                tuple_id: op.tuple_id,
            };
            match op.kind {
                OpKind::Insert | OpKind::Update => {
                    if let Some(payload) = &op.payload {
                        self.access.put(key, payload.clone());
                    }
                }
                OpKind::Remove => {}
                OpKind::Read | OpKind::ReadForWrite => {
                    debug_assert!(false, "reads are not staged");
                }
            }
            self.staged.push(op);
        }
        self.op_done(ec);
    }

    fn op_done(&mut self, ec: ErrorCode) {
        self.pending = None;
        if self.read_only && ec == ErrorCode::NotFound {
            // Missing rows do not fail a read-only transaction.
            self.error_code = ErrorCode::Ok;
        } else {
            self.error_code = ec;
        }
        self.handle_next_operation();
    }

    // ---- one-phase commit ----

    fn phase1_commit(&mut self) {
        self.trace.push_str("c1p;");
        match self.state {
            RmState::Idle | RmState::PrepareCommitting => {
                self.state = RmState::Committing;
                self.mark_dep_decided();
                tracing::trace!(xid = self.xid, "commit");
                if self.read_only {
                    self.on_log_durable(LogKind::RmCommit);
                } else {
                    self.force_log(LogKind::RmCommit);
                }
            }
            RmState::Committing => self.send_response(),
            other => self.impossible_transition("phase1 commit", other),
        }
    }

    fn phase1_abort(&mut self) {
        self.trace.push_str("a1p;");
        match self.state {
            RmState::Idle => {
                self.state = RmState::Aborting;
                self.mark_dep_decided();
                tracing::trace!(xid = self.xid, "phase1 abort");
                self.force_log(LogKind::RmAbort);
            }
            RmState::Aborting => self.send_response(),
            other => self.impossible_transition("phase1 abort", other),
        }
    }

    // ---- two-phase participant ----

    fn phase1_prepare_commit(&mut self) {
        self.trace.push_str("pc1p;");
        if self.state == RmState::Idle {
            self.state = RmState::PrepareCommitting;
            tracing::trace!(xid = self.xid, "prepare commit");
            self.force_log(LogKind::RmPrepareCommit);
        }
    }

    fn phase1_prepare_abort(&mut self) {
        self.trace.push_str("pa1p;");
        if self.victim {
            // A victim participant cannot decide alone; the coordinator
            // learns about it and drives the global abort.
            self.post(
                self.coord_node,
                Message::Victim(TxVictim {
                    xid: self.xid,
                    source: self.node_id,
                    dest: self.coord_node,
                }),
            );
        }
        self.state = RmState::PrepareAborting;
        tracing::trace!(xid = self.xid, "prepare abort");
        self.force_log(LogKind::RmPrepareAbort);
    }

    fn on_decision(&mut self, commit: bool) {
        if commit {
            self.trace.push_str("c2p;");
            match self.state {
                RmState::PrepareCommitting => {
                    self.state = RmState::Committing;
                    self.mark_dep_decided();
                    self.force_log(LogKind::RmCommit);
                }
                RmState::Committing | RmState::Ended => self.send_ack(true),
                other => self.impossible_transition("phase2 commit", other),
            }
        } else {
            self.abort_2p();
        }
    }

    fn abort_2p(&mut self) {
        self.trace.push_str("a2p;");
        match self.state {
            RmState::Idle | RmState::PrepareAborting | RmState::PrepareCommitting => {
                self.state = RmState::Aborting;
                self.mark_dep_decided();
                tracing::trace!(xid = self.xid, "phase2 abort");
                self.force_log(LogKind::RmAbort);
            }
            RmState::Aborting | RmState::Ended => self.send_ack(false),
            other => self.impossible_transition("phase2 abort", other),
        }
    }

    // ---- log durability ----

    fn force_log(&mut self, kind: LogKind) {
        self.trace.push_str("fc lg;");
        let ops = match kind {
            LogKind::RmCommit | LogKind::RmPrepareCommit => std::mem::take(&mut self.staged),
            _ => Vec::new(),
        };
        let record = LogRecord {
            xid: self.xid,
            kind,
            ops,
        };
        self.append_time.begin();
        self.wal.append(
            vec![record],
            WalCompletion::Tx {
                mailbox: self.mailbox.clone(),
                kind,
            },
        );
    }

    fn on_log_durable(&mut self, kind: LogKind) {
        self.trace.push_str("lg cmt;");
        match kind {
            LogKind::RmCommit => {
                self.append_time.end();
                self.commit_log_synced = true;
                if self.state == RmState::Committing {
                    self.try_complete_commit();
                }
            }
            LogKind::RmAbort => {
                if self.state == RmState::Aborting {
                    self.tx_aborted();
                }
            }
            LogKind::RmPrepareCommit => {
                self.append_time.end();
                self.prepare_log_synced = true;
                // The coordinator's decision can overtake our own prepare
                // record; once the state moved on, the vote is moot.
                if self.state == RmState::PrepareCommitting {
                    self.try_complete_prepare();
                }
            }
            LogKind::RmPrepareAbort => {
                if self.state == RmState::PrepareAborting {
                    self.tx_prepare_aborted();
                }
            }
            other => {
                tracing::warn!(xid = self.xid, kind = ?other, "unexpected durable record");
            }
        }
    }

    // ---- commit/abort completion ----

    fn try_complete_commit(&mut self) {
        if !self.commit_log_synced {
            return;
        }
        if self.geo_replicated {
            if let Some(dep) = self.dep.clone() {
                let (cascade, blocked) = dep.gate();
                if cascade {
                    tracing::warn!(xid = self.xid, "cascade abort after commit record");
                    self.error_code = ErrorCode::Cascade;
                    self.tx_aborted();
                    return;
                }
                if blocked {
                    self.trace.push_str("dlv wait C;");
                    return;
                }
            }
        }
        self.tx_committed();
    }

    fn try_complete_prepare(&mut self) {
        if !self.prepare_log_synced {
            return;
        }
        if self.geo_replicated {
            if let Some(dep) = self.dep.clone() {
                let (cascade, blocked) = dep.gate();
                if cascade {
                    self.error_code = ErrorCode::Cascade;
                    self.tx_prepare_aborted();
                    return;
                }
                if blocked {
                    self.trace.push_str("dlv wait PC;");
                    return;
                }
            }
        }
        self.tx_prepare_committed();
    }

    fn on_dependency_cleared(&mut self) {
        match self.state {
            RmState::Committing => self.try_complete_commit(),
            RmState::PrepareCommitting => self.try_complete_prepare(),
            _ => {}
        }
    }

    fn tx_committed(&mut self) {
        self.trace.push_str("C;");
        if self.geo_replicated {
            if let Some(dep) = &self.dep {
                report_dependencies(dep);
            }
        }
        if self.distributed {
            self.send_ack(true);
        } else {
            self.send_response();
        }
        self.release_locks();
    }

    fn tx_aborted(&mut self) {
        self.trace.push_str("A;");
        if self.geo_replicated {
            if let Some(dep) = &self.dep {
                cascade_dependencies(dep);
            }
        }
        if self.distributed {
            self.send_ack(false);
        } else {
            // Victims surface to the client as a plain transaction abort.
            if matches!(self.error_code, ErrorCode::Ok | ErrorCode::Victim) {
                self.error_code = ErrorCode::TxAbort;
            }
            self.send_response();
        }
        self.release_locks();
    }

    fn tx_prepare_committed(&mut self) {
        self.trace.push_str("PC;");
        self.send_prepare(true);
    }

    fn tx_prepare_aborted(&mut self) {
        self.trace.push_str("PA;");
        self.send_prepare(false);
    }

    fn release_locks(&mut self) {
        self.trace.push_str("rl;");
        if !self.read_only {
            for item in self.locks.values() {
                self.lock_mgr.unlock(
                    self.xid,
                    item.mode,
                    item.table_id,
                    item.shard_id,
                    item.tuple_id,
                );
            }
        }
        self.graph.tx_finish(self.xid);
        self.wal.mark_ended(self.xid);
        self.locks.clear();
        self.tx_ended();
    }

    fn tx_ended(&mut self) {
        self.state = RmState::Ended;
        (self.observer.as_ref())(TxOutcome {
            xid: self.xid,
            state: self.state,
            error_code: self.error_code,
            committed: self.error_code == ErrorCode::Ok,
            distributed: self.distributed,
            coord_node: self.coord_node,
        });
    }

    // ---- timeout / geo-replication ----

    fn on_timeout(&mut self) {
        self.timeout_invoked = true;
        match self.state {
            // Past the decision point the transaction must run to its
            // conclusion; only the coordinator can resolve it now.
            RmState::PrepareCommitting | RmState::Committing | RmState::Ended => {}
            _ => {
                tracing::warn!(xid = self.xid, trace = %self.trace, "transaction timeout");
                if self.distributed && self.two_phase {
                    self.abort_2p();
                } else {
                    if self.error_code == ErrorCode::Ok {
                        self.error_code = ErrorCode::TxAbort;
                    }
                    self.phase1_abort();
                    self.send_response();
                }
            }
        }
    }

    fn make_locks_violable(&mut self) {
        self.trace.push_str("dlv V;");
        let items: Vec<LockItem> = self.locks.values().copied().collect();
        for item in items {
            let counters = self.lock_mgr.make_violable(
                self.xid,
                item.mode,
                item.table_id,
                item.shard_id,
                item.tuple_id,
            );
            self.num_read_violate += counters.read_promoted;
            self.num_write_violate += counters.write_promoted;
        }
    }

    fn mark_dep_decided(&mut self) {
        if let Some(dep) = &self.dep {
            dep.mark_decided();
        }
    }

    // ---- outbound ----

    fn latency_report(&self) -> LatencyReport {
        LatencyReport {
            lock_wait_us: self.lock_wait_time.micros(),
            read_us: self.read_time.micros(),
            read_broker_us: self.latency_read_broker_us,
            append_us: self.append_time.micros(),
            total_us: self.part_time.micros(),
            num_locks: self.num_locks,
            num_read_violate: self.num_read_violate,
            num_write_violate: self.num_write_violate,
        }
    }

    fn send_response(&mut self) {
        if self.responded {
            return;
        }
        self.responded = true;
        self.trace.push_str("RESP;");
        self.part_time.end();
        tracing::trace!(xid = self.xid, ec = ?self.error_code, "send response");
        let response = TxResponse {
            xid: self.xid,
            error_code: self.error_code,
            rows: self.rows.clone(),
            latency: self.latency_report(),
        };
        match self.sink.take() {
            Some(ResponseSink::Local(tx)) => {
                let _ = tx.send(response);
            }
            Some(ResponseSink::Remote { dest }) => {
                self.post(dest, Message::ClientResponse(response));
            }
            Some(ResponseSink::Discard) | None => {}
        }
    }

    fn send_prepare(&mut self, commit: bool) {
        self.part_time.end();
        let latency = if commit {
            self.latency_report()
        } else {
            LatencyReport::default()
        };
        self.post(
            self.coord_node,
            Message::Prepare(TxPrepare {
                xid: self.xid,
                source_node: self.node_id,
                dest_node: self.coord_node,
                commit,
                latency,
            }),
        );
    }

    fn send_ack(&mut self, commit: bool) {
        self.post(
            self.coord_node,
            Message::Ack(TxAck {
                xid: self.xid,
                source_node: self.node_id,
                dest_node: self.coord_node,
                commit,
            }),
        );
    }

    fn post(&self, dest: NodeId, msg: Message) {
        let transport = self.transport.clone();
        let xid = self.xid;
        tokio::spawn(async move {
            if let Err(err) = transport.send(dest, msg).await {
                tracing::error!(xid, dest, error = ?err, "send failed");
            }
        });
    }

    fn impossible_transition(&mut self, action: &str, state: RmState) {
        tracing::warn!(xid = self.xid, action, state = ?state, "impossible state transition");
        debug_assert!(false, "impossible transition: {action} in {state:?}");
        if self.error_code == ErrorCode::Ok {
            self.error_code = ErrorCode::TxAbort;
        }
    }

    /// Short event trail for stuck-transaction diagnostics.
    pub fn debug_dump(&self) -> String {
        format!(
            "RM {} state {:?} trace {}",
            self.xid, self.state, self.trace
        )
    }
}
