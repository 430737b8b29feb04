//! The cluster message catalog.
//!
//! Every payload carried by a wire envelope is one of these kinds,
//! discriminated by a `type` field in snake_case. The catalog is deliberately
//! closed: routing code matches exhaustively and unknown kinds fail to decode
//! at the codec layer rather than leaking into subsystems.
//!
//! Membership gossip rides on `heartbeat` (the `peers` field), so the kind
//! list matches the protocol exactly.

use serde::{Deserialize, Serialize};

use crate::node_id::NodeId;
use crate::term::Term;

// ---------------------------------------------------------------------------
// ClusterMessage
// ---------------------------------------------------------------------------

/// A message exchanged between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Periodic liveness signal. Also the first message on a fresh
    /// connection (identifying the sender) and the gossip carrier.
    Heartbeat {
        uptime_ms: u64,
        process_count: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<NodeId>,
    },
    /// Synchronous request addressed to a process on the receiving node.
    Call {
        call_id: String,
        target_id: u64,
        payload: Term,
    },
    /// Successful reply to a `Call`.
    CallReply { call_id: String, payload: Term },
    /// Failed reply to a `Call`.
    CallError {
        call_id: String,
        kind: CallErrorKind,
        detail: Term,
    },
    /// Fire-and-forget message addressed to a process on the receiving node.
    Cast { target_id: u64, payload: Term },
    /// Request to start a cataloged behavior on the receiving node.
    SpawnRequest {
        spawn_id: String,
        behavior: String,
        init_args: Term,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        register_name: Option<String>,
        #[serde(default)]
        register_global: bool,
    },
    /// Successful reply to a `SpawnRequest`.
    SpawnReply { spawn_id: String, server_id: u64 },
    /// Failed reply to a `SpawnRequest`.
    SpawnError {
        spawn_id: String,
        kind: SpawnErrorKind,
        detail: String,
    },
    /// Ask the receiving node to watch one of its processes.
    MonitorRequest {
        monitor_id: String,
        watcher_id: u64,
        target_id: u64,
    },
    /// Acknowledge a monitor registration.
    MonitorAck { monitor_id: String },
    /// Remove a monitor registration.
    DemonitorRequest { monitor_id: String },
    /// A monitored process terminated. Fires at most once per monitor.
    ProcessDown {
        monitor_id: String,
        reason: DownReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Ask the receiving node to link one of its processes to the sender's.
    LinkRequest {
        link_id: String,
        /// The sender-side process participating in the link.
        from_id: u64,
        /// The receiver-side process to link to.
        target_id: u64,
    },
    /// Acknowledge a link registration.
    LinkAck { link_id: String },
    /// Tear down a link without propagating an exit.
    UnlinkRequest { link_id: String },
    /// Exit propagation. With `link_id` set this is one side of a link
    /// firing; without it, it is a direct exit request (supervised remote
    /// shutdown). A `normal` reason never terminates the receiver.
    ExitSignal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link_id: Option<String>,
        target_id: u64,
        reason: DownReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Global registry replication. `full_sync` carries the sender's entire
    /// owned entry set and authorizes the receiver to drop stale entries
    /// owned by the sender that are absent from it.
    RegistrySync {
        entries: Vec<GlobalEntry>,
        full_sync: bool,
    },
    /// Graceful departure announcement.
    NodeDown { node: NodeId, reason: String },
}

impl ClusterMessage {
    /// The kind tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::Heartbeat { .. } => "heartbeat",
            ClusterMessage::Call { .. } => "call",
            ClusterMessage::CallReply { .. } => "call_reply",
            ClusterMessage::CallError { .. } => "call_error",
            ClusterMessage::Cast { .. } => "cast",
            ClusterMessage::SpawnRequest { .. } => "spawn_request",
            ClusterMessage::SpawnReply { .. } => "spawn_reply",
            ClusterMessage::SpawnError { .. } => "spawn_error",
            ClusterMessage::MonitorRequest { .. } => "monitor_request",
            ClusterMessage::MonitorAck { .. } => "monitor_ack",
            ClusterMessage::DemonitorRequest { .. } => "demonitor_request",
            ClusterMessage::ProcessDown { .. } => "process_down",
            ClusterMessage::LinkRequest { .. } => "link_request",
            ClusterMessage::LinkAck { .. } => "link_ack",
            ClusterMessage::UnlinkRequest { .. } => "unlink_request",
            ClusterMessage::ExitSignal { .. } => "exit_signal",
            ClusterMessage::RegistrySync { .. } => "registry_sync",
            ClusterMessage::NodeDown { .. } => "node_down",
        }
    }
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Why a remote call failed on the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// The target process does not exist or is not running.
    ServerNotRunning,
    /// The receiving node's local call timed out.
    Timeout,
    /// The handler raised an application error, carried in `detail`.
    App,
}

/// Why a remote spawn failed on the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnErrorKind {
    BehaviorNotFound,
    InitFailed,
    NameConflict,
}

/// Why a monitored process went down, or the reason carried by an exit
/// signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownReason {
    Normal,
    Shutdown,
    Error,
    /// The target did not exist when the monitor was requested.
    Noproc,
    /// The connection to the target's node was lost.
    Nodedown,
}

impl DownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownReason::Normal => "normal",
            DownReason::Shutdown => "shutdown",
            DownReason::Error => "error",
            DownReason::Noproc => "noproc",
            DownReason::Nodedown => "nodedown",
        }
    }
}

// ---------------------------------------------------------------------------
// GlobalEntry
// ---------------------------------------------------------------------------

/// One cluster-wide name registration, as replicated between nodes.
///
/// Conflicts resolve by comparing `(registered_at, priority)` with smaller
/// winning; `priority` is a deterministic hash of the owning node id so every
/// peer picks the same winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEntry {
    pub name: String,
    pub server_id: u64,
    pub node: NodeId,
    pub registered_at: i64,
    pub priority: u64,
}

impl GlobalEntry {
    /// The LWW sort key: earliest registration wins, priority breaks ties.
    pub fn lww_key(&self) -> (i64, u64) {
        (self.registered_at, self.priority)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
