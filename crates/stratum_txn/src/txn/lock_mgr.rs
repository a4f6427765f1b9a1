//! Row lock manager.
//!
//! Each shard owns a bucketed table of lock slots keyed by (table, tuple).
//! A slot tracks the granted holders and a FIFO wait queue; grant decisions
//! and queue mutation happen under the bucket mutex, while waiter
//! notifications are posted to the waiters' mailboxes after the guard is
//! dropped. The global manager routes requests to the owning shard and keeps
//! the wait-for graph current for the deadlock detector.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use super::deadlock::WaitGraph;
use super::types::{ErrorCode, LockMode, Oid, ShardId, TableId, TupleId, TxEvent, TxMailbox, Xid};

/// Notification handle a transaction leaves with the lock manager.
///
/// The lock manager never holds the transaction itself; it holds the weak
/// (xid, oid) identity plus the mailbox to post the grant on.
#[derive(Clone)]
pub struct LockWaiter {
    pub xid: Xid,
    pub oid: Oid,
    pub mailbox: TxMailbox,
}

struct PendingRequest {
    xid: Xid,
    oid: Oid,
    mode: LockMode,
    mailbox: TxMailbox,
}

/// Counters returned by `make_violable`: how many queued readers/writers were
/// promoted because the lock stopped blocking them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViolationCounters {
    pub read_promoted: u64,
    pub write_promoted: u64,
}

#[derive(Default)]
struct LockSlot {
    readers: HashSet<Xid>,
    writer: Option<Xid>,
    queue: VecDeque<PendingRequest>,
    /// Holders whose blocking effect has been waived (geo-replication early
    /// release). Conflicts with these holders are tolerated and counted.
    violable: HashSet<Xid>,
}

/// Callback invoked as `(holder, grantee)` when a grant goes through only
/// because the holder's lock was made violable. The geo-replicated engine
/// uses it to record a commit dependency from the grantee on the holder.
pub type ViolationHook = Arc<dyn Fn(Xid, Xid) + Send + Sync>;

/// A grant decision plus the notifications to deliver once the bucket guard
/// is dropped.
struct Notification {
    xid: Xid,
    oid: Oid,
    ec: ErrorCode,
    mailbox: TxMailbox,
    violated: Vec<Xid>,
}

impl LockSlot {
    fn is_idle(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.queue.is_empty()
    }

    /// Holders that block (xid, mode), ignoring the requester itself and any
    /// violable holder.
    fn blocking_holders(&self, xid: Xid, mode: LockMode) -> Vec<Xid> {
        let mut out = Vec::new();
        if let Some(writer) = self.writer {
            if writer != xid && !self.violable.contains(&writer) {
                out.push(writer);
            }
        }
        if mode == LockMode::Write {
            for reader in &self.readers {
                if *reader != xid && !self.violable.contains(reader) {
                    out.push(*reader);
                }
            }
        }
        out
    }

    /// Violable holders that would conflict with (xid, mode); those conflicts
    /// are tolerated but counted and reported.
    fn violating_holders(&self, xid: Xid, mode: LockMode) -> Vec<Xid> {
        let mut out = Vec::new();
        if let Some(writer) = self.writer {
            if writer != xid && self.violable.contains(&writer) {
                out.push(writer);
            }
        }
        if mode == LockMode::Write {
            for reader in &self.readers {
                if *reader != xid && self.violable.contains(reader) {
                    out.push(*reader);
                }
            }
        }
        out
    }

    fn add_grant(&mut self, xid: Xid, mode: LockMode) {
        match mode {
            LockMode::Read => {
                self.readers.insert(xid);
            }
            LockMode::Write => {
                // Upgrade: a sole reader taking the write lock drops its read
                // grant in the same step.
                self.readers.remove(&xid);
                self.writer = Some(xid);
            }
        }
    }

    fn release(&mut self, xid: Xid, mode: LockMode) {
        match mode {
            LockMode::Read => {
                self.readers.remove(&xid);
            }
            LockMode::Write => {
                if self.writer == Some(xid) {
                    self.writer = None;
                }
                self.readers.remove(&xid);
            }
        }
        self.violable.remove(&xid);
    }

    /// Promote waiters from the head of the queue while they stay compatible
    /// with the grants accumulated so far. FIFO: iteration stops at the first
    /// waiter that cannot be granted, so a contiguous run of readers at the
    /// head is promoted together and nothing ever barges past it.
    fn promote(&mut self, notifications: &mut Vec<Notification>, counters: &mut ViolationCounters) {
        while let Some(head) = self.queue.front() {
            let blockers = self.blocking_holders(head.xid, head.mode);
            if !blockers.is_empty() {
                break;
            }
            let violated = self.violating_holders(head.xid, head.mode);
            if !violated.is_empty() {
                match head.mode {
                    LockMode::Read => counters.read_promoted += 1,
                    LockMode::Write => counters.write_promoted += 1,
                }
            }
            let req = self.queue.pop_front().expect("head exists");
            self.add_grant(req.xid, req.mode);
            notifications.push(Notification {
                xid: req.xid,
                oid: req.oid,
                ec: ErrorCode::Ok,
                mailbox: req.mailbox,
                violated,
            });
        }
    }
}

type SlotKey = (TableId, TupleId);

/// Lock table for one shard's rows.
pub struct ShardLockManager {
    shard_id: ShardId,
    buckets: Vec<Mutex<HashMap<SlotKey, LockSlot>>>,
    graph: Arc<WaitGraph>,
    violation_hook: Arc<RwLock<Option<ViolationHook>>>,
}

impl ShardLockManager {
    pub fn new(shard_id: ShardId, buckets: usize, graph: Arc<WaitGraph>) -> Self {
        Self::with_hook(shard_id, buckets, graph, Arc::new(RwLock::new(None)))
    }

    fn with_hook(
        shard_id: ShardId,
        buckets: usize,
        graph: Arc<WaitGraph>,
        violation_hook: Arc<RwLock<Option<ViolationHook>>>,
    ) -> Self {
        let buckets = buckets.max(1);
        Self {
            shard_id,
            buckets: (0..buckets)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            graph,
            violation_hook,
        }
    }

    fn bucket(&self, key: SlotKey) -> &Mutex<HashMap<SlotKey, LockSlot>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[idx]
    }

    /// Acquire a row lock. Grants immediately when the request is compatible
    /// with the current holders and no earlier waiter conflicts; otherwise
    /// queues and records wait-for edges toward every conflicting holder.
    pub fn acquire(&self, mode: LockMode, table_id: TableId, tuple_id: TupleId, w: LockWaiter) {
        let key = (table_id, tuple_id);
        let mut notifications = Vec::new();
        {
            let mut bucket = match self.bucket(key).lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let slot = bucket.entry(key).or_default();
            let blockers = slot.blocking_holders(w.xid, mode);
            let queue_conflict = slot
                .queue
                .iter()
                .any(|q| q.xid != w.xid && !q.mode.compatible_with(mode));

            if blockers.is_empty() && !queue_conflict {
                let violated = slot.violating_holders(w.xid, mode);
                slot.add_grant(w.xid, mode);
                notifications.push(Notification {
                    xid: w.xid,
                    oid: w.oid,
                    ec: ErrorCode::Ok,
                    mailbox: w.mailbox,
                    violated,
                });
            } else {
                for holder in &blockers {
                    self.graph.add_edge(w.xid, *holder);
                }
                slot.queue.push_back(PendingRequest {
                    xid: w.xid,
                    oid: w.oid,
                    mode,
                    mailbox: w.mailbox,
                });
            }
        }
        self.deliver(notifications);
    }

    /// Release one grant and promote the head of the wait queue.
    pub fn release(&self, xid: Xid, mode: LockMode, table_id: TableId, tuple_id: TupleId) {
        let key = (table_id, tuple_id);
        let mut notifications = Vec::new();
        let mut counters = ViolationCounters::default();
        {
            let mut bucket = match self.bucket(key).lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(slot) = bucket.get_mut(&key) else {
                return;
            };
            slot.release(xid, mode);
            slot.promote(&mut notifications, &mut counters);
            if slot.is_idle() {
                bucket.remove(&key);
            }
        }
        self.deliver(notifications);
    }

    /// Waive the remaining blocking effect of one holder's lock and promote
    /// whatever that unblocks. Returns how many readers/writers were let
    /// through.
    pub fn make_violable(
        &self,
        xid: Xid,
        _mode: LockMode,
        table_id: TableId,
        tuple_id: TupleId,
    ) -> ViolationCounters {
        let key = (table_id, tuple_id);
        let mut notifications = Vec::new();
        let mut counters = ViolationCounters::default();
        {
            let mut bucket = match self.bucket(key).lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(slot) = bucket.get_mut(&key) else {
                return counters;
            };
            slot.violable.insert(xid);
            slot.promote(&mut notifications, &mut counters);
        }
        self.deliver(notifications);
        counters
    }

    /// Fail every queued request of `xid` with the given error. Used by the
    /// deadlock detector to signal victims. Returns how many requests were
    /// cancelled.
    pub fn cancel_waiter(&self, xid: Xid, ec: ErrorCode) -> usize {
        let mut notifications = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = match bucket.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for slot in bucket.values_mut() {
                let mut kept = VecDeque::with_capacity(slot.queue.len());
                while let Some(req) = slot.queue.pop_front() {
                    if req.xid == xid {
                        notifications.push(Notification {
                            xid: req.xid,
                            oid: req.oid,
                            ec,
                            mailbox: req.mailbox,
                            violated: Vec::new(),
                        });
                    } else {
                        kept.push_back(req);
                    }
                }
                slot.queue = kept;
            }
            bucket.retain(|_, slot| !slot.is_idle());
        }
        let cancelled = notifications.len();
        self.deliver(notifications);
        cancelled
    }

    fn deliver(&self, notifications: Vec<Notification>) {
        let hook = self
            .violation_hook
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        for n in notifications {
            // The waiter was granted or cancelled; either way it no longer
            // waits on anyone.
            self.graph.clear_waiter(n.xid);
            if let Some(hook) = &hook {
                for holder in &n.violated {
                    (hook.as_ref())(*holder, n.xid);
                }
            }
            if n.mailbox
                .send(TxEvent::LockGranted { oid: n.oid, ec: n.ec })
                .is_err()
            {
                tracing::trace!(
                    xid = n.xid,
                    oid = n.oid,
                    shard_id = self.shard_id,
                    "lock notification dropped, transaction gone"
                );
            }
        }
    }

    #[cfg(test)]
    fn holders(&self, table_id: TableId, tuple_id: TupleId) -> (Vec<Xid>, Option<Xid>, usize) {
        let key = (table_id, tuple_id);
        let bucket = self.bucket(key).lock().unwrap();
        match bucket.get(&key) {
            Some(slot) => {
                let mut readers: Vec<Xid> = slot.readers.iter().copied().collect();
                readers.sort_unstable();
                (readers, slot.writer, slot.queue.len())
            }
            None => (Vec::new(), None, 0),
        }
    }
}

/// Routes lock traffic to the owning shard's manager.
pub struct GlobalLockManager {
    shards: RwLock<HashMap<ShardId, Arc<ShardLockManager>>>,
    buckets_per_shard: usize,
    graph: Arc<WaitGraph>,
    violation_hook: Arc<RwLock<Option<ViolationHook>>>,
}

impl GlobalLockManager {
    pub fn new(local_shards: &[ShardId], buckets_per_shard: usize, graph: Arc<WaitGraph>) -> Self {
        let violation_hook = Arc::new(RwLock::new(None));
        let mut shards = HashMap::new();
        for shard_id in local_shards {
            shards.insert(
                *shard_id,
                Arc::new(ShardLockManager::with_hook(
                    *shard_id,
                    buckets_per_shard,
                    graph.clone(),
                    violation_hook.clone(),
                )),
            );
        }
        Self {
            shards: RwLock::new(shards),
            buckets_per_shard,
            graph,
            violation_hook,
        }
    }

    pub fn wait_graph(&self) -> Arc<WaitGraph> {
        self.graph.clone()
    }

    /// Install the callback fired on violable-lock grants.
    pub fn set_violation_hook(&self, hook: ViolationHook) {
        if let Ok(mut guard) = self.violation_hook.write() {
            *guard = Some(hook);
        }
    }

    fn shard(&self, shard_id: ShardId) -> Arc<ShardLockManager> {
        if let Ok(shards) = self.shards.read() {
            if let Some(mgr) = shards.get(&shard_id) {
                return mgr.clone();
            }
        }
        // A request for a shard this node was not configured with still gets
        // a table; row placement mistakes surface in the workload, not as a
        // lost notification.
        tracing::warn!(shard_id, "lock request for unconfigured shard");
        let mut shards = match self.shards.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        shards
            .entry(shard_id)
            .or_insert_with(|| {
                Arc::new(ShardLockManager::with_hook(
                    shard_id,
                    self.buckets_per_shard,
                    self.graph.clone(),
                    self.violation_hook.clone(),
                ))
            })
            .clone()
    }

    pub fn lock_row(
        &self,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
        waiter: LockWaiter,
    ) {
        self.shard(shard_id).acquire(mode, table_id, tuple_id, waiter);
    }

    pub fn unlock(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
    ) {
        self.shard(shard_id).release(xid, mode, table_id, tuple_id);
    }

    pub fn make_violable(
        &self,
        xid: Xid,
        mode: LockMode,
        table_id: TableId,
        shard_id: ShardId,
        tuple_id: TupleId,
    ) -> ViolationCounters {
        self.shard(shard_id)
            .make_violable(xid, mode, table_id, tuple_id)
    }

    /// Fail every pending request of `xid` across all shards.
    pub fn cancel_waiter(&self, xid: Xid, ec: ErrorCode) -> usize {
        let shards: Vec<Arc<ShardLockManager>> = match self.shards.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        shards.iter().map(|s| s.cancel_waiter(xid, ec)).sum()
    }
}
