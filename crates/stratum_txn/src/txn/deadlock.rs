//! Wait-for graph and deadlock detector.
//!
//! The lock manager records an edge `waiter -> holder` whenever a request
//! queues behind a conflicting grant and clears it on grant or cancellation.
//! The detector periodically runs a bounded-depth cycle search over a
//! snapshot of the graph and fails one victim per cycle: the highest xid,
//! i.e. the youngest transaction, which keeps victim selection starvation
//! free under monotonic xid allocation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock_mgr::GlobalLockManager;
use super::types::{ErrorCode, Xid};

const MAX_CYCLE_DEPTH: usize = 64;

/// Shared wait-for graph. Nodes are live transactions; an edge `a -> b`
/// exists while `a` waits on a lock `b` holds.
pub struct WaitGraph {
    edges: Mutex<HashMap<Xid, HashSet<Xid>>>,
}

impl Default for WaitGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGraph {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<Xid, HashSet<Xid>>> {
        match self.edges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_edge(&self, waiter: Xid, holder: Xid) {
        if waiter == holder {
            return;
        }
        self.guard().entry(waiter).or_default().insert(holder);
    }

    /// Drop all outgoing edges of a waiter that was granted or cancelled.
    pub fn clear_waiter(&self, waiter: Xid) {
        self.guard().remove(&waiter);
    }

    /// Remove a finished transaction entirely: its waits and any edges that
    /// pointed at it.
    pub fn tx_finish(&self, xid: Xid) {
        let mut edges = self.guard();
        edges.remove(&xid);
        for targets in edges.values_mut() {
            targets.remove(&xid);
        }
        edges.retain(|_, targets| !targets.is_empty());
    }

    /// Sorted adjacency snapshot for scanning and tests.
    pub fn snapshot(&self) -> HashMap<Xid, Vec<Xid>> {
        self.guard()
            .iter()
            .map(|(waiter, holders)| {
                let mut targets: Vec<Xid> = holders.iter().copied().collect();
                targets.sort_unstable();
                (*waiter, targets)
            })
            .collect()
    }
}

/// Periodic cycle scanner over the wait-for graph.
pub struct DeadlockDetector {
    graph: Arc<WaitGraph>,
    lock_mgr: Arc<GlobalLockManager>,
    interval: Duration,
}

impl DeadlockDetector {
    pub fn new(
        graph: Arc<WaitGraph>,
        lock_mgr: Arc<GlobalLockManager>,
        interval: Duration,
    ) -> Self {
        Self {
            graph,
            lock_mgr,
            interval,
        }
    }

    /// Detect cycles in the current graph and return the victims: one per
    /// cycle, the highest xid in it. Does not signal anyone.
    pub fn scan_once(&self) -> Vec<Xid> {
        let adj = self.graph.snapshot();
        let mut victims = Vec::new();
        let mut broken: HashSet<Xid> = HashSet::new();
        let mut done: HashSet<Xid> = HashSet::new();

        let mut starts: Vec<Xid> = adj.keys().copied().collect();
        starts.sort_unstable();
        for start in starts {
            if done.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            Self::dfs(
                start,
                &adj,
                &mut path,
                &mut on_path,
                &mut done,
                &mut broken,
                &mut victims,
            );
        }
        victims
    }

    fn dfs(
        node: Xid,
        adj: &HashMap<Xid, Vec<Xid>>,
        path: &mut Vec<Xid>,
        on_path: &mut HashSet<Xid>,
        done: &mut HashSet<Xid>,
        broken: &mut HashSet<Xid>,
        victims: &mut Vec<Xid>,
    ) {
        if path.len() >= MAX_CYCLE_DEPTH || done.contains(&node) {
            return;
        }
        path.push(node);
        on_path.insert(node);
        if let Some(targets) = adj.get(&node) {
            for target in targets {
                if on_path.contains(target) {
                    let pos = path
                        .iter()
                        .position(|n| n == target)
                        .expect("target is on path");
                    let cycle = &path[pos..];
                    // At most one victim per cycle per pass; a cycle already
                    // broken by an earlier victim this pass is left alone.
                    if !cycle.iter().any(|n| broken.contains(n)) {
                        let victim = *cycle.iter().max().expect("cycle non-empty");
                        broken.insert(victim);
                        victims.push(victim);
                    }
                } else {
                    Self::dfs(*target, adj, path, on_path, done, broken, victims);
                }
            }
        }
        on_path.remove(&node);
        path.pop();
        done.insert(node);
    }

    /// One detector pass: scan, then fail each victim's pending lock request
    /// with `Victim` and drop its edges so the next pass sees the cycle
    /// broken.
    pub fn pass(&self) -> Vec<Xid> {
        let victims = self.scan_once();
        for victim in &victims {
            let cancelled = self.lock_mgr.cancel_waiter(*victim, ErrorCode::Victim);
            self.graph.tx_finish(*victim);
            tracing::debug!(
                xid = victim,
                cancelled,
                "deadlock victim selected"
            );
        }
        victims
    }

    /// Run passes forever on the configured interval. Callers keep the join
    /// handle and abort it on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                self.pass();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(graph: Arc<WaitGraph>) -> DeadlockDetector {
        let lock_mgr = Arc::new(GlobalLockManager::new(&[0], 8, graph.clone()));
        DeadlockDetector::new(graph, lock_mgr, Duration::from_millis(10))
    }

    #[test]
    fn two_transaction_cycle_picks_higher_xid() {
        let graph = Arc::new(WaitGraph::new());
        graph.add_edge(10, 11);
        graph.add_edge(11, 10);

        let det = detector(graph);
        assert_eq!(det.scan_once(), vec![11]);
    }

    #[test]
    fn chain_without_cycle_has_no_victim() {
        let graph = Arc::new(WaitGraph::new());
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);

        let det = detector(graph);
        assert!(det.scan_once().is_empty());
    }

    #[test]
    fn one_victim_per_cycle_per_pass() {
        let graph = Arc::new(WaitGraph::new());
        // Two cycles sharing node 5: 5 -> 6 -> 5 and 5 -> 7 -> 5. Breaking
        // one victim per cycle may pick 6 and 7, but never more than one
        // victim for the same cycle.
        graph.add_edge(5, 6);
        graph.add_edge(6, 5);
        graph.add_edge(5, 7);
        graph.add_edge(7, 5);

        let det = detector(graph.clone());
        let victims = det.scan_once();
        assert!(!victims.is_empty() && victims.len() <= 2, "{victims:?}");
        for v in &victims {
            assert!([6, 7].contains(v), "victim {v} should be the younger side");
        }
    }

    #[test]
    fn three_way_cycle_resolves_to_youngest() {
        let graph = Arc::new(WaitGraph::new());
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);

        let det = detector(graph.clone());
        assert_eq!(det.pass(), vec![3]);
        // Victim edges are gone; the next pass sees no cycle.
        assert!(det.scan_once().is_empty());
    }

    #[test]
    fn tx_finish_removes_inbound_edges() {
        let graph = WaitGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(3, 2);
        graph.tx_finish(2);
        assert!(graph.snapshot().is_empty());
    }
}
