//! File-backed redo log.
//!
//! Records are framed as `u32` length + `u32` CRC32 + payload and appended
//! sequentially; one append group becomes consecutive frames followed by a
//! single flush. Fsync cost is amortized: the file is synced when enough
//! groups accumulated or enough time passed, per the configured mode.
//! Compaction rewrites the file without the records of ended transactions.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use crc32fast::Hasher;
use stratum_txn::txn::{LogKind, LogRecord, OpKind, RedoLog, TxOp, Xid};

const LOG_FILE: &str = "redo.log";
const PERSIST_EVERY_GROUPS: u64 = 64;
const PERSIST_INTERVAL: Duration = Duration::from_millis(2);

/// How far an append is pushed toward the platter before it counts as
/// durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Leave durability to the OS page cache.
    None,
    /// `fdatasync` on the persist threshold.
    Data,
    /// `fsync` on the persist threshold.
    All,
}

struct Inner {
    file: File,
    groups_since_sync: u64,
    last_sync: Instant,
}

pub struct FileRedoLog {
    log_path: PathBuf,
    mode: SyncMode,
    inner: Mutex<Inner>,
    ended: Mutex<HashSet<Xid>>,
}

impl FileRedoLog {
    pub fn open_dir(dir: impl AsRef<Path>, mode: SyncMode) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create redo log dir")?;
        let log_path = dir.join(LOG_FILE);
        let file = open_for_append(&log_path)?;
        Ok(Self {
            log_path,
            mode,
            inner: Mutex::new(Inner {
                file,
                groups_since_sync: 0,
                last_sync: Instant::now(),
            }),
            ended: Mutex::new(HashSet::new()),
        })
    }

    fn sync(&self, file: &File) -> std::io::Result<()> {
        match self.mode {
            SyncMode::None => Ok(()),
            SyncMode::Data => file.sync_data(),
            SyncMode::All => file.sync_all(),
        }
    }
}

impl RedoLog for FileRedoLog {
    fn append_group(&self, records: &[LogRecord]) -> anyhow::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for record in records {
            let payload = encode_record(record);
            write_frame(&mut inner.file, &payload)?;
        }
        inner.file.flush()?;

        inner.groups_since_sync += 1;
        let hit_count = inner.groups_since_sync >= PERSIST_EVERY_GROUPS;
        let hit_interval = inner.last_sync.elapsed() >= PERSIST_INTERVAL;
        if hit_count || hit_interval {
            inner.groups_since_sync = 0;
            inner.last_sync = Instant::now();
            self.sync(&inner.file).context("sync redo log")?;
        }
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<LogRecord>> {
        read_all_records(&self.log_path)
    }

    fn mark_ended(&self, xid: Xid) -> anyhow::Result<()> {
        if let Ok(mut ended) = self.ended.lock() {
            ended.insert(xid);
        }
        Ok(())
    }

    fn compact(&self, max_delete: usize) -> anyhow::Result<usize> {
        if max_delete == 0 {
            return Ok(0);
        }
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let records = read_all_records(&self.log_path)?;
        if records.is_empty() {
            return Ok(0);
        }
        let ended: HashSet<Xid> = self
            .ended
            .lock()
            .map(|set| set.clone())
            .unwrap_or_default();

        let tmp_path = self.log_path.with_extension("log.tmp");
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .context("open redo compact temp")?;

        let mut removed = 0usize;
        for record in &records {
            if removed < max_delete && ended.contains(&record.xid) {
                removed += 1;
                continue;
            }
            let payload = encode_record(record);
            write_frame(&mut out, &payload)?;
        }
        out.flush()?;
        out.sync_all()?;
        fs::rename(&tmp_path, &self.log_path).context("replace redo log")?;

        inner.file = open_for_append(&self.log_path)?;
        inner.groups_since_sync = 0;
        Ok(removed)
    }
}

fn open_for_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open redo log {}", path.display()))
}

fn write_frame(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_all_records(path: &Path) -> anyhow::Result<Vec<LogRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected, "redo log checksum mismatch");
        records.push(decode_record(&payload)?);
    }
    Ok(records)
}

fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + record.ops.len() * 32);
    out.extend_from_slice(&record.xid.to_be_bytes());
    out.push(kind_to_byte(record.kind));
    out.extend_from_slice(&(record.ops.len() as u32).to_be_bytes());
    for op in &record.ops {
        out.push(op_kind_to_byte(op.kind));
        out.extend_from_slice(&op.table_id.to_be_bytes());
        out.extend_from_slice(&op.shard_id.to_be_bytes());
        out.extend_from_slice(&op.tuple_id.to_be_bytes());
        match &op.payload {
            Some(payload) => {
                out.push(1);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
            None => out.push(0),
        }
    }
    out
}

fn decode_record(buf: &[u8]) -> anyhow::Result<LogRecord> {
    let mut offset = 0usize;
    let xid = read_u64(buf, &mut offset)?;
    let kind = kind_from_byte(read_u8(buf, &mut offset)?)?;
    let op_count = read_u32(buf, &mut offset)? as usize;
    let mut ops = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        let op_kind = op_kind_from_byte(read_u8(buf, &mut offset)?)?;
        let table_id = read_u32(buf, &mut offset)?;
        let shard_id = read_u32(buf, &mut offset)?;
        let tuple_id = read_u64(buf, &mut offset)?;
        let payload = match read_u8(buf, &mut offset)? {
            0 => None,
            1 => {
                let len = read_u32(buf, &mut offset)? as usize;
                anyhow::ensure!(offset + len <= buf.len(), "redo record short payload");
                let payload = buf[offset..offset + len].to_vec();
                offset += len;
                Some(payload)
            }
            other => anyhow::bail!("redo record bad payload marker {other}"),
        };
        ops.push(TxOp {
            kind: op_kind,
            table_id,
            shard_id,
            tuple_id,
            payload,
        });
    }
    Ok(LogRecord { xid, kind, ops })
}

fn kind_to_byte(kind: LogKind) -> u8 {
    match kind {
        LogKind::RmCommit => 0,
        LogKind::RmAbort => 1,
        LogKind::RmPrepareCommit => 2,
        LogKind::RmPrepareAbort => 3,
        LogKind::TmCommit => 4,
        LogKind::TmAbort => 5,
        LogKind::CalvinBatch => 6,
    }
}

fn kind_from_byte(byte: u8) -> anyhow::Result<LogKind> {
    Ok(match byte {
        0 => LogKind::RmCommit,
        1 => LogKind::RmAbort,
        2 => LogKind::RmPrepareCommit,
        3 => LogKind::RmPrepareAbort,
        4 => LogKind::TmCommit,
        5 => LogKind::TmAbort,
        6 => LogKind::CalvinBatch,
        other => anyhow::bail!("redo record bad kind {other}"),
    })
}

fn op_kind_to_byte(kind: OpKind) -> u8 {
    match kind {
        OpKind::Read => 0,
        OpKind::ReadForWrite => 1,
        OpKind::Update => 2,
        OpKind::Insert => 3,
        OpKind::Remove => 4,
    }
}

fn op_kind_from_byte(byte: u8) -> anyhow::Result<OpKind> {
    Ok(match byte {
        0 => OpKind::Read,
        1 => OpKind::ReadForWrite,
        2 => OpKind::Update,
        3 => OpKind::Insert,
        4 => OpKind::Remove,
        other => anyhow::bail!("redo record bad op kind {other}"),
    })
}

fn read_u8(buf: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= buf.len(), "redo record short u8");
    let value = buf[*offset];
    *offset += 1;
    Ok(value)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= buf.len(), "redo record short u32");
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= buf.len(), "redo record short u64");
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(xid: Xid, kind: LogKind, payload: Option<&[u8]>) -> LogRecord {
        LogRecord {
            xid,
            kind,
            ops: vec![TxOp {
                kind: OpKind::Insert,
                table_id: 1,
                shard_id: 0,
                tuple_id: xid,
                payload: payload.map(|p| p.to_vec()),
            }],
        }
    }

    #[test]
    fn append_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileRedoLog::open_dir(dir.path(), SyncMode::All).unwrap();

        log.append_group(&[record(1, LogKind::RmPrepareCommit, Some(b"a"))])
            .unwrap();
        log.append_group(&[record(1, LogKind::RmCommit, Some(b"a"))])
            .unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].kind, LogKind::RmPrepareCommit);
        assert_eq!(loaded[1].kind, LogKind::RmCommit);
        assert_eq!(loaded[1].ops[0].payload, Some(b"a".to_vec()));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileRedoLog::open_dir(dir.path(), SyncMode::All).unwrap();
            log.append_group(&[record(7, LogKind::RmCommit, Some(b"v"))])
                .unwrap();
        }
        let log = FileRedoLog::open_dir(dir.path(), SyncMode::All).unwrap();
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].xid, 7);
    }

    #[test]
    fn compact_drops_only_ended_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileRedoLog::open_dir(dir.path(), SyncMode::None).unwrap();
        log.append_group(&[record(1, LogKind::RmCommit, None)]).unwrap();
        log.append_group(&[record(2, LogKind::RmCommit, None)]).unwrap();
        log.mark_ended(1).unwrap();

        assert_eq!(log.compact(16).unwrap(), 1);
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].xid, 2);

        // The log stays appendable after the rewrite.
        log.append_group(&[record(3, LogKind::RmAbort, None)]).unwrap();
        assert_eq!(log.load().unwrap().len(), 2);
    }

    #[test]
    fn torn_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileRedoLog::open_dir(dir.path(), SyncMode::None).unwrap();
        log.append_group(&[record(1, LogKind::RmCommit, Some(b"payload"))])
            .unwrap();

        let path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(read_all_records(&path).is_err());
    }
}
