//! Data storage broker backed by a fjall keyspace.
//!
//! The broker is the durable home of table rows; resource managers reach it
//! for rows their access layer does not hold and replay committed
//! post-images into it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use stratum_txn::txn::{
    ErrorCode, LogRecord, OpKind, ReadRowRequest, ReadRowResponse, ShardId, TableId, TupleId,
};

/// Serving side of the row-read protocol. The mesh routes `read_row` calls
/// addressed to a broker node here.
#[async_trait]
pub trait RowStore: Send + Sync + 'static {
    async fn read_row(&self, req: ReadRowRequest) -> anyhow::Result<ReadRowResponse>;
}

pub struct FjallBroker {
    keyspace: Keyspace,
    rows: PartitionHandle,
}

impl FjallBroker {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let keyspace = fjall::Config::new(dir.as_ref())
            .open()
            .context("open broker keyspace")?;
        let rows = keyspace
            .open_partition("rows", PartitionCreateOptions::default())
            .context("open rows partition")?;
        Ok(Arc::new(Self { keyspace, rows }))
    }

    pub fn put_row(
        &self,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
        row: &[u8],
    ) -> anyhow::Result<()> {
        self.rows
            .insert(row_key(table_id, shard_id, tuple_id), row)
            .context("insert row")
    }

    pub fn get_row(
        &self,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .rows
            .get(row_key(table_id, shard_id, tuple_id))
            .context("get row")?
            .map(|slice| slice.to_vec()))
    }

    /// Replay committed post-images into the durable store.
    pub fn apply_committed(&self, records: &[LogRecord]) -> anyhow::Result<usize> {
        let mut applied = 0usize;
        for record in records {
            for op in &record.ops {
                let key = row_key(op.table_id, op.shard_id, op.tuple_id);
                match op.kind {
                    OpKind::Insert | OpKind::Update => {
                        if let Some(payload) = &op.payload {
                            self.rows.insert(key, payload).context("apply row")?;
                            applied += 1;
                        }
                    }
                    OpKind::Remove => {
                        self.rows.remove(key).context("remove row")?;
                        applied += 1;
                    }
                    OpKind::Read | OpKind::ReadForWrite => {}
                }
            }
        }
        Ok(applied)
    }

    /// Push buffered writes down to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist broker keyspace")
    }
}

#[async_trait]
impl RowStore for FjallBroker {
    async fn read_row(&self, req: ReadRowRequest) -> anyhow::Result<ReadRowResponse> {
        let start = Instant::now();
        let row = self.get_row(req.table_id, req.shard_id, req.tuple_id)?;
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
            latency_read_broker_us: start.elapsed().as_micros() as u64,
        })
    }
}

fn row_key(table_id: TableId, shard_id: ShardId, tuple_id: TupleId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..4].copy_from_slice(&table_id.to_be_bytes());
    key[4..8].copy_from_slice(&shard_id.to_be_bytes());
    key[8..16].copy_from_slice(&tuple_id.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broker_serves_seeded_rows() {
        let dir = tempfile::tempdir().unwrap();
        let broker = FjallBroker::open(dir.path()).unwrap();
        broker.put_row(1, 0, 42, b"v").unwrap();

        let resp = broker
            .read_row(ReadRowRequest {
                xid: 1,
                oid: 1,
                cno: 1,
                source: 1,
                dest: 1000,
                table_id: 1,
                shard_id: 0,
                tuple_id: 42,
            })
            .await
            .unwrap();
        assert_eq!(resp.error_code, ErrorCode::Ok);
        assert_eq!(resp.row, Some(b"v".to_vec()));

        let missing = broker
            .read_row(ReadRowRequest {
                xid: 1,
                oid: 2,
                cno: 1,
                source: 1,
                dest: 1000,
                table_id: 1,
                shard_id: 0,
                tuple_id: 43,
            })
            .await
            .unwrap();
        assert_eq!(missing.error_code, ErrorCode::NotFound);
        assert_eq!(missing.row, None);
    }
}
