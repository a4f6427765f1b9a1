//! Coordinator side of distributed commit.
//!
//! One coordinator exists per distributed transaction whose source is this
//! node. It partitions the request across participants by shard ownership,
//! collects prepare votes, persists its decision before broadcasting commit,
//! and rebroadcasts an undecided participant's decision on a bounded interval
//! until every participant acknowledged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::types::{
    CoreConfig, ErrorCode, LatencyReport, LogKind, LogRecord, Message, NodeId, Transport,
    TxPrepare, TxRequest, TxResponse, TxVictim, Xid,
};
use super::wal::{WalBridge, WalCompletion};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TmState {
    Preparing,
    Committing,
    Aborting,
    Ended,
}

#[derive(Default)]
struct Participant {
    voted: Option<bool>,
    acked: bool,
}

struct CoordInner {
    state: TmState,
    participants: HashMap<NodeId, Participant>,
    client: Option<oneshot::Sender<TxResponse>>,
    latency: LatencyReport,
    /// Subrequests held back until the runtime registered this coordinator,
    /// so no vote can arrive before it is routable.
    outbox: Vec<(NodeId, TxRequest)>,
}

pub struct TxCoordinator {
    xid: Xid,
    node_id: NodeId,
    geo_replicated: bool,
    transport: Arc<dyn Transport>,
    wal: Arc<WalBridge>,
    retry_interval: Duration,
    inner: Mutex<CoordInner>,
}

impl TxCoordinator {
    /// Partition a distributed request across its participants and start the
    /// vote collection. The client response resolves once every participant
    /// acknowledged the decision.
    pub fn start(
        req: TxRequest,
        config: &CoreConfig,
        transport: Arc<dyn Transport>,
        wal: Arc<WalBridge>,
        client: oneshot::Sender<TxResponse>,
    ) -> Arc<Self> {
        let mut per_node: HashMap<NodeId, TxRequest> = HashMap::new();
        for op in &req.ops {
            let dest = config
                .shard_to_rm
                .get(&op.shard_id)
                .copied()
                .unwrap_or(config.node_id);
            per_node
                .entry(dest)
                .or_insert_with(|| TxRequest {
                    xid: req.xid,
                    oneshot: req.oneshot,
                    read_only: req.read_only,
                    distributed: true,
                    source_node: config.node_id,
                    ops: Vec::new(),
                })
                .ops
                .push(op.clone());
        }

        let participants = per_node
            .keys()
            .map(|node| (*node, Participant::default()))
            .collect();

        let coordinator = Arc::new(Self {
            xid: req.xid,
            node_id: config.node_id,
            geo_replicated: config.model.geo_replicated(),
            transport,
            wal,
            retry_interval: config.decision_retry_interval,
            inner: Mutex::new(CoordInner {
                state: TmState::Preparing,
                participants,
                client: Some(client),
                latency: LatencyReport::default(),
                outbox: per_node.into_iter().collect(),
            }),
        });

        // Undecided votes force an abort after the transaction timeout.
        let vote_deadline = config.tx_timeout;
        let timeout_coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(vote_deadline).await;
            if timeout_coordinator.state() == TmState::Preparing {
                tracing::warn!(
                    xid = timeout_coordinator.xid,
                    "vote collection timed out, aborting"
                );
                timeout_coordinator.decide(false).await;
            }
        });

        coordinator.clone().spawn_retry();
        coordinator
    }

    /// Send the participant subrequests. Called once the coordinator is
    /// registered for inbound routing.
    pub fn launch(&self) {
        let outbox = std::mem::take(&mut self.guard().outbox);
        for (dest, subrequest) in outbox {
            self.post(dest, Message::ClientRequest(subrequest));
        }
    }

    fn state(&self) -> TmState {
        self.guard().state
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, CoordInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state() == TmState::Ended
    }

    /// A participant's vote arrived.
    pub async fn on_prepare(&self, prepare: TxPrepare) {
        debug_assert_eq!(prepare.xid, self.xid);
        let decision = {
            let mut inner = self.guard();
            if inner.state != TmState::Preparing {
                None
            } else {
                match inner.participants.get_mut(&prepare.source_node) {
                    Some(participant) => {
                        participant.voted = Some(prepare.commit);
                        merge_latency(&mut inner.latency, &prepare.latency);
                    }
                    None => {
                        tracing::warn!(
                            xid = self.xid,
                            node_id = prepare.source_node,
                            "vote from unknown participant"
                        );
                        return;
                    }
                }
                if !prepare.commit {
                    Some(false)
                } else if inner
                    .participants
                    .values()
                    .all(|p| p.voted == Some(true))
                {
                    Some(true)
                } else {
                    None
                }
            }
        };
        if let Some(commit) = decision {
            self.decide(commit).await;
        }
    }

    /// A blocked participant was picked as a deadlock victim; it cannot vote,
    /// so the coordinator aborts on its behalf.
    pub async fn on_victim(&self, victim: TxVictim) {
        debug_assert_eq!(victim.xid, self.xid);
        if self.state() == TmState::Preparing {
            tracing::debug!(xid = self.xid, node_id = victim.source, "participant is a victim");
            self.decide(false).await;
        }
    }

    /// A participant acknowledged the decision. The client response goes out
    /// once all of them have.
    pub async fn on_ack(&self, source_node: NodeId, _commit: bool) {
        let response = {
            let mut inner = self.guard();
            if let Some(participant) = inner.participants.get_mut(&source_node) {
                participant.acked = true;
            }
            let all_acked = inner.participants.values().all(|p| p.acked);
            let decided = matches!(inner.state, TmState::Committing | TmState::Aborting);
            if all_acked && decided {
                let error_code = if inner.state == TmState::Committing {
                    ErrorCode::Ok
                } else {
                    ErrorCode::TxAbort
                };
                inner.state = TmState::Ended;
                inner.client.take().map(|client| {
                    (
                        client,
                        TxResponse {
                            xid: self.xid,
                            error_code,
                            rows: Vec::new(),
                            latency: inner.latency,
                        },
                    )
                })
            } else {
                None
            }
        };
        if let Some((client, response)) = response {
            tracing::trace!(xid = self.xid, ec = ?response.error_code, "distributed transaction done");
            let _ = client.send(response);
        }
    }

    /// Persist the decision, then broadcast it.
    async fn decide(&self, commit: bool) {
        {
            let mut inner = self.guard();
            if inner.state != TmState::Preparing {
                return;
            }
            inner.state = if commit {
                TmState::Committing
            } else {
                TmState::Aborting
            };
        }
        let kind = if commit {
            LogKind::TmCommit
        } else {
            LogKind::TmAbort
        };
        let (tx, rx) = oneshot::channel();
        self.wal.append(
            vec![LogRecord {
                xid: self.xid,
                kind,
                ops: Vec::new(),
            }],
            WalCompletion::Signal(tx),
        );
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(xid = self.xid, error = ?err, "decision record append failed");
                return;
            }
            Err(_) => return,
        }
        tracing::trace!(xid = self.xid, commit, "decision durable, broadcasting");
        if commit && self.geo_replicated {
            // Every participant prepared; their remaining lock footprint can
            // stop blocking newcomers while the commit records land.
            let targets: Vec<NodeId> = {
                let inner = self.guard();
                inner.participants.keys().copied().collect()
            };
            for dest in targets {
                self.post(dest, Message::EnableViolate { xid: self.xid });
            }
        }
        self.broadcast(commit);
    }

    fn broadcast(&self, commit: bool) {
        let targets: Vec<NodeId> = {
            let inner = self.guard();
            inner
                .participants
                .iter()
                .filter(|(_, p)| !p.acked)
                .map(|(node, _)| *node)
                .collect()
        };
        let msg = if commit {
            Message::TmCommit { xid: self.xid }
        } else {
            Message::TmAbort { xid: self.xid }
        };
        for dest in targets {
            self.post(dest, msg.clone());
        }
    }

    /// Rebroadcast the decision to unacknowledged participants until all ack.
    fn spawn_retry(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.retry_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match self.state() {
                    TmState::Ended => break,
                    TmState::Committing => self.broadcast(true),
                    TmState::Aborting => self.broadcast(false),
                    TmState::Preparing => {}
                }
            }
        });
    }

    fn post(&self, dest: NodeId, msg: Message) {
        let transport = self.transport.clone();
        let xid = self.xid;
        let node_id = self.node_id;
        tokio::spawn(async move {
            if let Err(err) = transport.send(dest, msg).await {
                tracing::error!(xid, node_id, dest, error = ?err, "coordinator send failed");
            }
        });
    }
}

/// Keep the slowest participant's numbers: the client-visible latency of a
/// distributed transaction is its critical path.
fn merge_latency(into: &mut LatencyReport, from: &LatencyReport) {
    into.lock_wait_us = into.lock_wait_us.max(from.lock_wait_us);
    into.read_us = into.read_us.max(from.read_us);
    into.read_broker_us = into.read_broker_us.max(from.read_broker_us);
    into.append_us = into.append_us.max(from.append_us);
    into.total_us = into.total_us.max(from.total_us);
    into.num_locks += from.num_locks;
    into.num_read_violate += from.num_read_violate;
    into.num_write_violate += from.num_write_violate;
}
