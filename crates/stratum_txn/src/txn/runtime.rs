//! Per-node engine: owns the shared collaborators and the live transaction
//! table, routes inbound messages to the right transaction or coordinator,
//! and selects the execution model.
//!
//! The lock tables, wait-for graph, and access store are explicit
//! collaborators handed to every context; nothing here is process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};

use super::access::AccessStore;
use super::calvin::CalvinEngine;
use super::context::{
    DepCell, ResponseSink, RmState, TxContext, TxContextParams, TxOutcome,
};
use super::coordinator::TxCoordinator;
use super::deadlock::{DeadlockDetector, WaitGraph};
use super::lock_mgr::GlobalLockManager;
use super::types::{
    CoreConfig, ErrorCode, Message, NodeId, RedoLog, Transport, TxAck, TxEvent, TxMailbox,
    TxRequest, TxResponse, Xid,
};
use super::wal::WalBridge;

/// Node-local xids carry the origin node in the high bits so they stay unique
/// across the cluster while remaining monotonic per origin.
pub const XID_NODE_SHIFT: u32 = 48;

pub struct ConcurrencyCore {
    config: Arc<CoreConfig>,
    transport: Arc<dyn Transport>,
    redo: Arc<dyn RedoLog>,
    access: Arc<AccessStore>,
    graph: Arc<WaitGraph>,
    lock_mgr: Arc<GlobalLockManager>,
    wal: Arc<WalBridge>,
    detector: Arc<DeadlockDetector>,
    detector_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    calvin: Option<Arc<CalvinEngine>>,
    contexts: Mutex<HashMap<Xid, TxMailbox>>,
    deps: Mutex<HashMap<Xid, Arc<DepCell>>>,
    finished: Mutex<HashMap<Xid, TxOutcome>>,
    coordinators: Mutex<HashMap<Xid, Arc<TxCoordinator>>>,
    client_waiters: Mutex<HashMap<Xid, oneshot::Sender<TxResponse>>>,
    next_xid: AtomicU64,
}

impl ConcurrencyCore {
    /// Build the engine and start its background workers. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        redo: Arc<dyn RedoLog>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let recovered = redo.load()?;
        if !recovered.is_empty() {
            tracing::info!(
                node_id = config.node_id,
                records = recovered.len(),
                "redo log carries records from a previous run"
            );
        }

        let access = Arc::new(AccessStore::new(config.lock_table_buckets * 4));
        let graph = Arc::new(WaitGraph::new());
        let lock_mgr = Arc::new(GlobalLockManager::new(
            &config.local_shards,
            config.lock_table_buckets,
            graph.clone(),
        ));
        let wal = Arc::new(WalBridge::new(redo.clone())?);
        let detector = Arc::new(DeadlockDetector::new(
            graph.clone(),
            lock_mgr.clone(),
            config.deadlock_scan_interval,
        ));
        let calvin = if config.model.deterministic() {
            Some(CalvinEngine::new(
                config.clone(),
                access.clone(),
                wal.clone(),
                transport.clone(),
            ))
        } else {
            None
        };

        let core = Arc::new(Self {
            config,
            transport,
            redo,
            access,
            graph,
            lock_mgr,
            wal,
            detector: detector.clone(),
            detector_task: Mutex::new(None),
            calvin,
            contexts: Mutex::new(HashMap::new()),
            deps: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            coordinators: Mutex::new(HashMap::new()),
            client_waiters: Mutex::new(HashMap::new()),
            next_xid: AtomicU64::new(0),
        });

        if core.config.model.geo_replicated() {
            let weak = Arc::downgrade(&core);
            core.lock_mgr
                .set_violation_hook(Arc::new(move |holder, grantee| {
                    if let Some(core) = weak.upgrade() {
                        core.on_lock_violation(holder, grantee);
                    }
                }));
        }

        *lock_guard(&core.detector_task) = Some(detector.spawn());
        Ok(core)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn access(&self) -> &AccessStore {
        &self.access
    }

    pub fn wait_graph(&self) -> &WaitGraph {
        &self.graph
    }

    pub fn redo_log(&self) -> &Arc<dyn RedoLog> {
        &self.redo
    }

    /// Run one deadlock detector pass outside the periodic schedule.
    pub fn deadlock_pass(&self) -> Vec<Xid> {
        self.detector.pass()
    }

    /// Allocate the next xid originated by this node.
    pub fn allocate_xid(&self) -> Xid {
        let counter = self.next_xid.fetch_add(1, Ordering::Relaxed) + 1;
        (self.config.node_id << XID_NODE_SHIFT) | counter
    }

    /// Submit a client request to this node. The receiver resolves with the
    /// transaction response.
    pub fn submit(self: &Arc<Self>, req: TxRequest) -> oneshot::Receiver<TxResponse> {
        if let Some(calvin) = &self.calvin {
            return calvin.submit(req);
        }
        let (tx, rx) = oneshot::channel();
        if req.distributed {
            let coordinator = TxCoordinator::start(
                req.clone(),
                &self.config,
                self.transport.clone(),
                self.wal.clone(),
                tx,
            );
            lock_guard(&self.coordinators).insert(req.xid, coordinator.clone());
            coordinator.launch();
        } else {
            self.spawn_context(req, ResponseSink::Local(tx));
        }
        rx
    }

    /// Submit a request owned by a remote node and await its response
    /// message.
    pub fn submit_remote(
        self: &Arc<Self>,
        dest: NodeId,
        req: TxRequest,
    ) -> oneshot::Receiver<TxResponse> {
        let (tx, rx) = oneshot::channel();
        lock_guard(&self.client_waiters).insert(req.xid, tx);
        self.post(dest, Message::ClientRequest(req));
        rx
    }

    /// Inbound message dispatch; the transport implementation calls this for
    /// every message addressed to this node.
    pub async fn deliver(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::ClientRequest(req) => self.on_client_request(req),
            Message::ClientResponse(resp) => {
                if let Some(waiter) = lock_guard(&self.client_waiters).remove(&resp.xid) {
                    let _ = waiter.send(resp);
                } else {
                    tracing::trace!(xid = resp.xid, "response without a waiter");
                }
            }
            Message::Prepare(prepare) => {
                let coordinator = lock_guard(&self.coordinators).get(&prepare.xid).cloned();
                match coordinator {
                    Some(coordinator) => coordinator.on_prepare(prepare).await,
                    None => tracing::warn!(xid = prepare.xid, "vote without a coordinator"),
                }
            }
            Message::Ack(ack) => {
                let coordinator = lock_guard(&self.coordinators).get(&ack.xid).cloned();
                if let Some(coordinator) = coordinator {
                    coordinator.on_ack(ack.source_node, ack.commit).await;
                    if coordinator.is_ended() {
                        lock_guard(&self.coordinators).remove(&ack.xid);
                    }
                }
            }
            Message::TmCommit { xid } => self.route_decision(xid, true),
            Message::TmAbort { xid } => self.route_decision(xid, false),
            Message::Victim(victim) => {
                let coordinator = lock_guard(&self.coordinators).get(&victim.xid).cloned();
                if let Some(coordinator) = coordinator {
                    coordinator.on_victim(victim).await;
                }
            }
            Message::EnableViolate { xid } => {
                if let Some(mailbox) = lock_guard(&self.contexts).get(&xid) {
                    let _ = mailbox.send(TxEvent::EnableViolate);
                }
            }
        }
    }

    fn on_client_request(self: &Arc<Self>, req: TxRequest) {
        if let Some(calvin) = &self.calvin {
            // Remotely-submitted requests join the local batch stream; the
            // response travels back as a message.
            let source = req.source_node;
            let rx = calvin.submit(req);
            let core = self.clone();
            tokio::spawn(async move {
                if let Ok(resp) = rx.await {
                    core.post(source, Message::ClientResponse(resp));
                }
            });
            return;
        }
        let sink = if req.distributed {
            // Participants answer their coordinator, not the client.
            ResponseSink::Discard
        } else {
            ResponseSink::Remote {
                dest: req.source_node,
            }
        };
        self.spawn_context(req, sink);
    }

    fn route_decision(self: &Arc<Self>, xid: Xid, commit: bool) {
        let mailbox = lock_guard(&self.contexts).get(&xid).cloned();
        if let Some(mailbox) = mailbox {
            if mailbox.send(TxEvent::Decision { commit }).is_ok() {
                return;
            }
        }
        // The transaction already ended: repeat the acknowledgement so the
        // coordinator's retry loop converges.
        let outcome = lock_guard(&self.finished).get(&xid).cloned();
        match outcome {
            Some(outcome) if outcome.distributed => {
                self.post(
                    outcome.coord_node,
                    Message::Ack(TxAck {
                        xid,
                        source_node: self.config.node_id,
                        dest_node: outcome.coord_node,
                        commit: outcome.committed,
                    }),
                );
            }
            _ => {
                tracing::warn!(xid, commit, "decision for unknown transaction");
            }
        }
    }

    fn spawn_context(self: &Arc<Self>, req: TxRequest, sink: ResponseSink) {
        let xid = req.xid;
        let (mailbox, events) = mpsc::unbounded_channel();
        lock_guard(&self.contexts).insert(xid, mailbox.clone());

        let dep = if self.config.model.geo_replicated() {
            let cell = DepCell::new(xid, mailbox.clone());
            lock_guard(&self.deps).insert(xid, cell.clone());
            Some(cell)
        } else {
            None
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let observer: super::context::TxStateObserver = Arc::new(move |outcome: TxOutcome| {
            if let Some(core) = weak.upgrade() {
                core.on_tx_ended(outcome);
            }
        });

        let context = TxContext::new(
            TxContextParams {
                req,
                config: self.config.clone(),
                lock_mgr: self.lock_mgr.clone(),
                graph: self.graph.clone(),
                access: self.access.clone(),
                wal: self.wal.clone(),
                transport: self.transport.clone(),
                sink,
                observer,
                dep,
            },
            mailbox,
        );
        tokio::spawn(context.run(events));
    }

    fn on_tx_ended(&self, outcome: TxOutcome) {
        debug_assert_eq!(outcome.state, RmState::Ended);
        lock_guard(&self.contexts).remove(&outcome.xid);
        lock_guard(&self.deps).remove(&outcome.xid);
        lock_guard(&self.finished).insert(outcome.xid, outcome);
    }

    fn on_lock_violation(&self, holder: Xid, grantee: Xid) {
        let deps = lock_guard(&self.deps);
        if let (Some(holder_cell), Some(grantee_cell)) = (deps.get(&holder), deps.get(&grantee)) {
            super::context::register_dependency(holder_cell, grantee_cell);
        }
    }

    fn post(&self, dest: NodeId, msg: Message) {
        let transport = self.transport.clone();
        let node_id = self.config.node_id;
        tokio::spawn(async move {
            if let Err(err) = transport.send(dest, msg).await {
                tracing::error!(node_id, dest, error = ?err, "send failed");
            }
        });
    }

    /// Final error code of an ended transaction, if this node still remembers
    /// it.
    pub fn finished_error_code(&self, xid: Xid) -> Option<ErrorCode> {
        lock_guard(&self.finished).get(&xid).map(|o| o.error_code)
    }
}

impl Drop for ConcurrencyCore {
    fn drop(&mut self) {
        if let Some(task) = lock_guard(&self.detector_task).take() {
            task.abort();
        }
    }
}

fn lock_guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
