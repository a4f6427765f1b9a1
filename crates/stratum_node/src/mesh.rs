//! In-process mesh transport.
//!
//! Runs several logical nodes (resource managers and brokers) inside one
//! process: messages are delivered straight into the destination engine's
//! dispatch, row reads into the destination broker. The binary and the
//! integration tests use this in place of a network stack.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use stratum_txn::txn::{ConcurrencyCore, Message, NodeId, ReadRowRequest, ReadRowResponse, Transport};

use crate::storage::RowStore;

pub struct Mesh {
    engines: RwLock<HashMap<NodeId, Weak<ConcurrencyCore>>>,
    brokers: RwLock<HashMap<NodeId, Arc<dyn RowStore>>>,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            brokers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_engine(&self, node_id: NodeId, core: &Arc<ConcurrencyCore>) {
        if let Ok(mut engines) = self.engines.write() {
            engines.insert(node_id, Arc::downgrade(core));
        }
    }

    pub fn register_broker(&self, node_id: NodeId, broker: Arc<dyn RowStore>) {
        if let Ok(mut brokers) = self.brokers.write() {
            brokers.insert(node_id, broker);
        }
    }

    fn engine(&self, node_id: NodeId) -> Option<Arc<ConcurrencyCore>> {
        self.engines
            .read()
            .ok()
            .and_then(|engines| engines.get(&node_id).and_then(Weak::upgrade))
    }

    fn broker(&self, node_id: NodeId) -> Option<Arc<dyn RowStore>> {
        self.brokers
            .read()
            .ok()
            .and_then(|brokers| brokers.get(&node_id).cloned())
    }
}

#[async_trait]
impl Transport for Mesh {
    async fn send(&self, dest: NodeId, msg: Message) -> anyhow::Result<()> {
        match self.engine(dest) {
            Some(core) => {
                core.deliver(msg).await;
                Ok(())
            }
            None => anyhow::bail!("no engine registered for node {dest}"),
        }
    }

    async fn read_row(
        &self,
        dest: NodeId,
        req: ReadRowRequest,
    ) -> anyhow::Result<ReadRowResponse> {
        match self.broker(dest) {
            Some(broker) => broker.read_row(req).await,
            None => anyhow::bail!("no broker registered for node {dest}"),
        }
    }
}
