//! Cluster-wide name registry with last-writer-wins conflict resolution.
//!
//! Every node holds a full replica. Writes are owner-local and broadcast
//! asynchronously; reads never touch the network. Convergence is eventual:
//! for any name, every node settles on the announcement with the smallest
//! `(registered_at, priority)` -- earliest registration wins, and the
//! priority (a deterministic FNV-1a hash of the owning node id) breaks
//! exact-timestamp ties identically on every peer.
//!
//! Cleanup paths, deliberately few:
//! - owner-initiated `unregister`, propagated by re-broadcasting the owner's
//!   full entry set (receivers drop entries of that owner absent from a full
//!   sync)
//! - node loss, which removes every entry owned by the lost peer.
//!
//! There is no quorum and no leader; a partition heals by LWW on rejoin.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use hive_wire::{ClusterMessage, GlobalEntry, NodeId, WireEnvelope};

use super::transport::Transport;
use crate::actor::process::ServerRef;
use crate::error::{Error, Result};
use crate::persist::Clock;

// ---------------------------------------------------------------------------
// Priority hash
// ---------------------------------------------------------------------------

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Deterministic tiebreaker: FNV-1a over the node id string. Two peers
/// computing the priority of the same node always agree.
pub fn node_priority(node: &NodeId) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in node.as_str().as_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Registry change notifications.
#[derive(Debug, Clone)]
pub enum GlobalEvent {
    Registered(GlobalEntry),
    Unregistered { name: String },
    ConflictResolved {
        name: String,
        winner: NodeId,
        loser: NodeId,
    },
}

type Subscriber = Arc<dyn Fn(&GlobalEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// GlobalRegistry
// ---------------------------------------------------------------------------

/// Handle to the node's replica of the cluster-wide registry.
#[derive(Clone)]
pub struct GlobalRegistry {
    inner: Arc<GlobalInner>,
}

struct GlobalInner {
    local: NodeId,
    priority: u64,
    clock: Arc<dyn Clock>,
    transport: Transport,
    entries: RwLock<FxHashMap<String, GlobalEntry>>,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_token: AtomicU64,
}

impl GlobalRegistry {
    pub fn new(local: NodeId, clock: Arc<dyn Clock>, transport: Transport) -> GlobalRegistry {
        let priority = node_priority(&local);
        GlobalRegistry {
            inner: Arc::new(GlobalInner {
                local,
                priority,
                clock,
                transport,
                entries: RwLock::new(FxHashMap::default()),
                subscribers: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, f: impl Fn(&GlobalEvent) + Send + Sync + 'static) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((token, Arc::new(f)));
        token
    }

    pub fn unsubscribe(&self, token: u64) {
        self.inner.subscribers.write().retain(|(t, _)| *t != token);
    }

    // -----------------------------------------------------------------------
    // Owner-side writes
    // -----------------------------------------------------------------------

    /// Register a local process under a cluster-wide name and announce it.
    pub fn register(&self, name: impl Into<String>, server_id: u64) -> Result<()> {
        let name = name.into();
        let entry = GlobalEntry {
            name: name.clone(),
            server_id,
            node: self.inner.local.clone(),
            registered_at: self.inner.clock.now_ms(),
            priority: self.inner.priority,
        };
        {
            let mut entries = self.inner.entries.write();
            if entries.contains_key(&name) {
                return Err(Error::GlobalNameConflict { name });
            }
            entries.insert(name, entry.clone());
        }
        info!("globally registered '{}' -> {}", entry.name, server_id);
        self.broadcast_sync(vec![entry.clone()], false);
        self.emit(&GlobalEvent::Registered(entry));
        Ok(())
    }

    /// Release a name. Only the owner may do this; releasing a name owned
    /// elsewhere fails with `GlobalNameConflict`. Returns `false` when the
    /// name was not registered at all.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        {
            let mut entries = self.inner.entries.write();
            match entries.get(name) {
                None => return Ok(false),
                Some(entry) if entry.node != self.inner.local => {
                    return Err(Error::GlobalNameConflict {
                        name: name.to_string(),
                    });
                }
                Some(_) => {
                    entries.remove(name);
                }
            }
        }
        self.emit(&GlobalEvent::Unregistered {
            name: name.to_string(),
        });
        // Propagation without a dedicated wire kind: a fresh owner full
        // sync authorizes receivers to drop our entries absent from it.
        self.broadcast_sync(self.owned_entries(), true);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn lookup(&self, name: &str) -> Result<ServerRef> {
        self.whereis(name).ok_or_else(|| Error::GlobalNameNotFound {
            name: name.to_string(),
        })
    }

    pub fn whereis(&self, name: &str) -> Option<ServerRef> {
        self.inner
            .entries
            .read()
            .get(name)
            .map(|entry| ServerRef::remote(entry.server_id, entry.node.clone()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entry(&self, name: &str) -> Option<GlobalEntry> {
        self.inner.entries.read().get(name).cloned()
    }

    /// Entries owned by this node.
    pub fn owned_entries(&self) -> Vec<GlobalEntry> {
        let mut owned: Vec<GlobalEntry> = self
            .inner
            .entries
            .read()
            .values()
            .filter(|entry| entry.node == self.inner.local)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        owned
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Merge an inbound sync. For each entry: insert when unknown, ignore
    /// when identical, otherwise smaller `(registered_at, priority)` wins.
    /// A full sync additionally drops stale entries owned by the sender.
    pub fn merge(&self, incoming: Vec<GlobalEntry>, full_sync: bool, from: &NodeId) {
        let mut events = Vec::new();
        {
            let mut entries = self.inner.entries.write();

            if full_sync {
                let fresh: std::collections::HashSet<&str> =
                    incoming.iter().map(|e| e.name.as_str()).collect();
                let stale: Vec<String> = entries
                    .iter()
                    .filter(|(name, entry)| {
                        &entry.node == from && !fresh.contains(name.as_str())
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in stale {
                    debug!("dropping stale entry '{}' after full sync from {}", name, from);
                    entries.remove(&name);
                    events.push(GlobalEvent::Unregistered { name });
                }
            }

            for entry in incoming {
                match entries.get(&entry.name) {
                    None => {
                        events.push(GlobalEvent::Registered(entry.clone()));
                        entries.insert(entry.name.clone(), entry);
                    }
                    Some(existing)
                        if existing.node == entry.node
                            && existing.server_id == entry.server_id =>
                    {
                        // Same ref re-announced; nothing to resolve.
                    }
                    Some(existing) => {
                        if entry.lww_key() < existing.lww_key() {
                            warn!(
                                "name conflict on '{}': {} wins over {}",
                                entry.name, entry.node, existing.node
                            );
                            events.push(GlobalEvent::ConflictResolved {
                                name: entry.name.clone(),
                                winner: entry.node.clone(),
                                loser: existing.node.clone(),
                            });
                            entries.insert(entry.name.clone(), entry);
                        }
                        // Local entry wins: keep it. The remote side makes
                        // the same comparison with our broadcast and yields.
                    }
                }
            }
        }
        for event in &events {
            self.emit(event);
        }
    }

    /// A peer joined: teach it our owned names.
    pub fn on_node_up(&self, peer: &NodeId) {
        let owned = self.owned_entries();
        let envelope = self.sync_envelope(owned, true);
        let _ = self.inner.transport.send(peer, &envelope);
    }

    /// A peer was lost: its entries go away. This is the sole automatic
    /// cleanup path.
    pub fn on_node_down(&self, peer: &NodeId) {
        let removed: Vec<String> = {
            let mut entries = self.inner.entries.write();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| &entry.node == peer)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };
        for name in removed {
            info!("dropping '{}': owner {} is down", name, peer);
            self.emit(&GlobalEvent::Unregistered { name });
        }
    }

    fn sync_envelope(&self, entries: Vec<GlobalEntry>, full_sync: bool) -> WireEnvelope {
        WireEnvelope::new(
            self.inner.local.clone(),
            self.inner.clock.now_ms(),
            ClusterMessage::RegistrySync { entries, full_sync },
        )
    }

    fn broadcast_sync(&self, entries: Vec<GlobalEntry>, full_sync: bool) {
        let envelope = self.sync_envelope(entries, full_sync);
        self.inner.transport.broadcast(&envelope);
    }

    fn emit(&self, event: &GlobalEvent) {
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!("registry subscriber panicked on {:?}", event);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
