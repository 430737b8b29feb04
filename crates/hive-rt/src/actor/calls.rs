//! Call statistics and pending tables for in-flight remote operations.
//!
//! Local calls correlate structurally -- the caller holds the one-shot reply
//! channel -- so only remote calls and spawns need id-keyed tables: a reply
//! arriving over the wire carries nothing but its correlation id. Entries are
//! drained on reply, on error, on timeout (the caller removes its own entry),
//! or when the peer node is lost, in which case every entry addressed to that
//! peer is rejected with `NodeNotReachable`.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use hive_wire::{NodeId, Term};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// CallStats
// ---------------------------------------------------------------------------

/// Monotonic counters over all calls and casts on this node.
#[derive(Default)]
pub struct CallStats {
    initiated: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    casts: AtomicU64,
}

/// Point-in-time view of [`CallStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatsSnapshot {
    pub initiated: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub casts: u64,
}

impl CallStats {
    pub fn new() -> Self {
        CallStats::default()
    }

    pub fn record_initiated(&self) {
        self.initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cast(&self) {
        self.casts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            initiated: self.initiated.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            casts: self.casts.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Pending tables
// ---------------------------------------------------------------------------

/// One in-flight remote call.
pub(crate) struct PendingCall {
    pub reply: Sender<Result<Term>>,
    pub node: NodeId,
    pub target_id: u64,
}

/// One in-flight remote spawn.
pub(crate) struct PendingSpawn {
    pub reply: Sender<Result<u64>>,
    pub node: NodeId,
}

/// Correlation tables for remote calls and spawns.
#[derive(Default)]
pub(crate) struct PendingTables {
    calls: Mutex<FxHashMap<String, PendingCall>>,
    spawns: Mutex<FxHashMap<String, PendingSpawn>>,
}

impl PendingTables {
    pub fn new() -> Self {
        PendingTables::default()
    }

    pub fn insert_call(&self, call_id: String, pending: PendingCall) {
        self.calls.lock().insert(call_id, pending);
    }

    /// Remove and return an entry; `None` when a reply races a timeout or
    /// peer-loss cleanup (late replies are discarded).
    pub fn take_call(&self, call_id: &str) -> Option<PendingCall> {
        self.calls.lock().remove(call_id)
    }

    pub fn insert_spawn(&self, spawn_id: String, pending: PendingSpawn) {
        self.spawns.lock().insert(spawn_id, pending);
    }

    pub fn take_spawn(&self, spawn_id: &str) -> Option<PendingSpawn> {
        self.spawns.lock().remove(spawn_id)
    }

    /// Reject every pending entry addressed to a lost peer.
    pub fn fail_node(&self, node: &NodeId) {
        let mut failed_calls = Vec::new();
        {
            let mut calls = self.calls.lock();
            calls.retain(|_, pending| {
                if &pending.node == node {
                    failed_calls.push(pending.reply.clone());
                    false
                } else {
                    true
                }
            });
        }
        for reply in failed_calls {
            let _ = reply.send(Err(Error::NodeNotReachable { node: node.clone() }));
        }

        let mut failed_spawns = Vec::new();
        {
            let mut spawns = self.spawns.lock();
            spawns.retain(|_, pending| {
                if &pending.node == node {
                    failed_spawns.push(pending.reply.clone());
                    false
                } else {
                    true
                }
            });
        }
        for reply in failed_spawns {
            let _ = reply.send(Err(Error::NodeNotReachable { node: node.clone() }));
        }
    }

    pub fn pending_call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
