//! Cluster membership: peer set, heartbeats, gossip, failure detection.
//!
//! Membership consumes transport events and turns socket-level connectivity
//! into node-level liveness. A peer only counts as *up* once its first
//! heartbeat arrives -- the heartbeat doubles as the connection hello -- and
//! goes *down* on transport loss, a graceful departure announcement, or the
//! heartbeat sweeper noticing silence past the configured window.
//!
//! Gossip rides on heartbeats: every heartbeat carries the sender's known
//! peer set, and the receiver dials any previously-unknown entries. Merge is
//! idempotent by node id, so loops converge. Seed bootstrap dials every
//! non-self seed; an unreachable seed never prevents startup.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use hive_wire::{ClusterMessage, NodeId, WireEnvelope};

use super::transport::{PeerDownCause, Transport};
use crate::actor::kernel::Kernel;
use crate::persist::Clock;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle of the local node's cluster participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A live peer, as last reported by its heartbeat.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub uptime_ms: u64,
    pub process_count: u64,
}

/// Node-level membership events.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeUp(NodeInfo),
    NodeDown(NodeId, String),
    StatusChange(ClusterStatus),
}

type Subscriber = Arc<dyn Fn(&ClusterEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

struct PeerState {
    up: bool,
    last_heartbeat: Instant,
    uptime_ms: u64,
    process_count: u64,
}

/// Handle to the membership service. Cheap to clone.
#[derive(Clone)]
pub struct Membership {
    inner: Arc<MembershipInner>,
}

struct MembershipInner {
    local: NodeId,
    transport: Transport,
    kernel: Kernel,
    clock: Arc<dyn Clock>,
    peers: RwLock<FxHashMap<NodeId, PeerState>>,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_token: AtomicU64,
    status: Mutex<ClusterStatus>,
    started_at: Instant,
    heartbeat_interval: Duration,
    heartbeat_deadline: Duration,
    shutdown: AtomicBool,
}

impl Membership {
    pub fn new(
        local: NodeId,
        transport: Transport,
        kernel: Kernel,
        clock: Arc<dyn Clock>,
        heartbeat_interval: Duration,
        heartbeat_deadline: Duration,
    ) -> Membership {
        Membership {
            inner: Arc::new(MembershipInner {
                local,
                transport,
                kernel,
                clock,
                peers: RwLock::new(FxHashMap::default()),
                subscribers: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(0),
                status: Mutex::new(ClusterStatus::Starting),
                started_at: Instant::now(),
                heartbeat_interval,
                heartbeat_deadline,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Dial the seeds and start the heartbeat/sweep thread.
    pub fn start(&self, seeds: &[NodeId]) {
        for seed in seeds {
            if seed != &self.inner.local {
                debug!("dialing seed {}", seed);
                self.inner.transport.connect(seed);
            }
        }
        let inner = Arc::clone(&self.inner);
        let _ = std::thread::Builder::new()
            .name("hive-heartbeat".to_string())
            .spawn(move || heartbeat_loop(inner));
        self.set_status(ClusterStatus::Running);
    }

    pub fn subscribe(&self, f: impl Fn(&ClusterEvent) + Send + Sync + 'static) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((token, Arc::new(f)));
        token
    }

    pub fn unsubscribe(&self, token: u64) {
        self.inner.subscribers.write().retain(|(t, _)| *t != token);
    }

    pub fn status(&self) -> ClusterStatus {
        *self.inner.status.lock()
    }

    /// Peers currently considered up.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .inner
            .peers
            .read()
            .iter()
            .filter(|(_, state)| state.up)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Heartbeat-reported stats for every up peer.
    pub fn node_stats(&self) -> Vec<NodeInfo> {
        let mut stats: Vec<NodeInfo> = self
            .inner
            .peers
            .read()
            .iter()
            .filter(|(_, state)| state.up)
            .map(|(id, state)| NodeInfo {
                id: id.clone(),
                uptime_ms: state.uptime_ms,
                process_count: state.process_count,
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    pub fn is_up(&self, peer: &NodeId) -> bool {
        self.inner
            .peers
            .read()
            .get(peer)
            .map(|state| state.up)
            .unwrap_or(false)
    }

    /// A transport connection came up: introduce ourselves immediately so
    /// the peer can key the connection and learn our stats.
    pub fn on_peer_up(&self, peer: &NodeId) {
        let _ = self
            .inner
            .transport
            .send(peer, &heartbeat_envelope(&self.inner));
    }

    /// A transport connection went down.
    pub fn on_peer_down(&self, peer: &NodeId, cause: PeerDownCause) {
        self.mark_down(peer, cause.as_str());
    }

    /// A peer announced its own departure.
    pub fn on_node_down_announcement(&self, peer: &NodeId, reason: &str) {
        self.inner.transport.disconnect(peer);
        self.mark_down(peer, reason);
    }

    /// Inbound heartbeat: refresh liveness, absorb stats, merge gossip.
    pub fn on_heartbeat(
        &self,
        peer: &NodeId,
        uptime_ms: u64,
        process_count: u64,
        gossip: &[NodeId],
    ) {
        let newly_up = {
            let mut peers = self.inner.peers.write();
            let state = peers.entry(peer.clone()).or_insert_with(|| PeerState {
                up: false,
                last_heartbeat: Instant::now(),
                uptime_ms: 0,
                process_count: 0,
            });
            state.last_heartbeat = Instant::now();
            state.uptime_ms = uptime_ms;
            state.process_count = process_count;
            let newly_up = !state.up;
            state.up = true;
            newly_up
        };

        if newly_up {
            info!("node up: {}", peer);
            self.emit(&ClusterEvent::NodeUp(NodeInfo {
                id: peer.clone(),
                uptime_ms,
                process_count,
            }));
        }

        // Gossip merge: dial anything we have never seen. Idempotent by
        // node-id equality, so mutual gossip converges instead of looping.
        for candidate in gossip {
            if candidate == &self.inner.local {
                continue;
            }
            let known = self.inner.peers.read().contains_key(candidate);
            if !known && !self.inner.transport.is_connected(candidate) {
                debug!("gossip discovered {}", candidate);
                self.inner.transport.connect(candidate);
            }
        }
    }

    /// Stop heartbeating and mark the local node as leaving.
    pub fn stop(&self) {
        self.set_status(ClusterStatus::Stopping);
        self.inner.shutdown.store(true, Ordering::Release);
        self.set_status(ClusterStatus::Stopped);
    }

    fn mark_down(&self, peer: &NodeId, reason: &str) {
        let was_up = {
            let mut peers = self.inner.peers.write();
            match peers.get_mut(peer) {
                Some(state) if state.up => {
                    state.up = false;
                    true
                }
                _ => false,
            }
        };
        if was_up {
            warn!("node down: {} ({})", peer, reason);
            self.emit(&ClusterEvent::NodeDown(peer.clone(), reason.to_string()));
        }
    }

    fn set_status(&self, status: ClusterStatus) {
        {
            let mut current = self.inner.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        self.emit(&ClusterEvent::StatusChange(status));
    }

    fn emit(&self, event: &ClusterEvent) {
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!("cluster subscriber panicked on {:?}", event);
            }
        }
    }
}

fn heartbeat_envelope(inner: &MembershipInner) -> WireEnvelope {
    let peers: Vec<NodeId> = inner
        .peers
        .read()
        .iter()
        .filter(|(_, state)| state.up)
        .map(|(id, _)| id.clone())
        .collect();
    WireEnvelope::new(
        inner.local.clone(),
        inner.clock.now_ms(),
        ClusterMessage::Heartbeat {
            uptime_ms: inner.started_at.elapsed().as_millis() as u64,
            process_count: inner.kernel.process_count() as u64,
            peers,
        },
    )
}

/// Periodic heartbeat broadcast plus the silence sweeper. Any up peer whose
/// last heartbeat is older than the deadline is declared down and its
/// connection closed.
fn heartbeat_loop(inner: Arc<MembershipInner>) {
    let membership = Membership {
        inner: Arc::clone(&inner),
    };
    loop {
        // Sleep in slices so stop() is prompt.
        let mut remaining = inner.heartbeat_interval;
        let slice = Duration::from_millis(50);
        while remaining > Duration::ZERO {
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }

        inner.transport.broadcast(&heartbeat_envelope(&inner));

        let silent: Vec<NodeId> = inner
            .peers
            .read()
            .iter()
            .filter(|(_, state)| state.up && state.last_heartbeat.elapsed() > inner.heartbeat_deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for peer in silent {
            warn!("peer {} missed heartbeats", peer);
            membership.mark_down(&peer, "heartbeat_timeout");
            inner
                .transport
                .close_peer(&peer, PeerDownCause::HeartbeatTimeout);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
