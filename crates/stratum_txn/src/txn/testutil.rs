//! Shared helpers for the crate's unit tests: an in-memory redo log and a
//! loopback transport that routes messages straight back into attached
//! engines while serving broker reads from a table of canned rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::runtime::ConcurrencyCore;
use super::types::{
    CoreConfig, ErrorCode, ExecutionModel, LogRecord, Message, NodeId, ReadRowRequest,
    ReadRowResponse, RedoLog, ShardId, TableId, Transport, TupleId, Xid,
};

/// Redo log capturing append groups in memory.
pub(crate) struct MemRedoLog {
    groups: Mutex<Vec<Vec<LogRecord>>>,
}

impl MemRedoLog {
    pub(crate) fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn groups(&self) -> Vec<Vec<LogRecord>> {
        self.groups.lock().unwrap().clone()
    }

    pub(crate) fn records(&self) -> Vec<LogRecord> {
        self.groups.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl RedoLog for MemRedoLog {
    fn append_group(&self, records: &[LogRecord]) -> anyhow::Result<()> {
        self.groups.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<LogRecord>> {
        Ok(self.records())
    }

    fn mark_ended(&self, _xid: Xid) -> anyhow::Result<()> {
        Ok(())
    }

    fn compact(&self, _max_delete: usize) -> anyhow::Result<usize> {
        Ok(0)
    }
}

type BrokerKey = (TableId, ShardId, TupleId);

/// Loopback transport: delivery to any attached node's engine, plus a broker
/// row table answering `read_row`.
pub(crate) struct TestTransport {
    nodes: Mutex<HashMap<NodeId, Weak<ConcurrencyCore>>>,
    rows: Mutex<HashMap<BrokerKey, Vec<u8>>>,
    sent: Mutex<Vec<(NodeId, Message)>>,
    read_delay: Mutex<Duration>,
}

impl TestTransport {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            rows: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            read_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn attach(&self, node_id: NodeId, core: &Arc<ConcurrencyCore>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node_id, Arc::downgrade(core));
    }

    pub(crate) fn put_broker_row(
        &self,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
        row: &[u8],
    ) {
        self.rows
            .lock()
            .unwrap()
            .insert((table_id, shard_id, tuple_id), row.to_vec());
    }

    pub(crate) fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub(crate) fn count_acks(&self, xid: Xid) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, msg)| matches!(msg, Message::Ack(ack) if ack.xid == xid))
            .count()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, dest: NodeId, msg: Message) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((dest, msg.clone()));
        let target = self
            .nodes
            .lock()
            .unwrap()
            .get(&dest)
            .and_then(Weak::upgrade);
        match target {
            Some(core) => {
                core.deliver(msg).await;
                Ok(())
            }
            None => anyhow::bail!("no node {dest} attached"),
        }
    }

    async fn read_row(
        &self,
        _dest: NodeId,
        req: ReadRowRequest,
    ) -> anyhow::Result<ReadRowResponse> {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let row = self
            .rows
            .lock()
            .unwrap()
            .get(&(req.table_id, req.shard_id, req.tuple_id))
            .cloned();
        let error_code = if row.is_some() {
            ErrorCode::Ok
        } else {
            ErrorCode::NotFound
        };
        Ok(ReadRowResponse {
            xid: req.xid,
            oid: req.oid,
            error_code,
            table_id: req.table_id,
            shard_id: req.shard_id,
            tuple_id: req.tuple_id,
            row,
            latency_read_broker_us: delay.as_micros() as u64,
        })
    }
}

/// Config with intervals short enough for tests.
pub(crate) fn test_config(node_id: NodeId, model: ExecutionModel) -> CoreConfig {
    let mut config = CoreConfig::new(node_id, model);
    config.default_broker = Some(999);
    config.tx_timeout = Duration::from_secs(2);
    config.deadlock_scan_interval = Duration::from_millis(25);
    config.epoch_interval = Duration::from_millis(5);
    config.decision_retry_interval = Duration::from_millis(50);
    config
}
