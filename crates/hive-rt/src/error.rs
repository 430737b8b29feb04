//! Runtime error taxonomy.
//!
//! Every publicly documented failure is a variant here, carrying enough
//! context (ids, names, hosts, reasons) to be logged and acted on. Codec and
//! identifier errors from the wire crate convert in via `From`.

use hive_wire::{CodecError, InvalidNodeId, NodeId};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All failures surfaced by the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A node identifier string failed validation.
    #[error(transparent)]
    InvalidNodeId(#[from] InvalidNodeId),

    /// The cluster configuration is unusable.
    #[error("invalid cluster config: {0}")]
    InvalidClusterConfig(String),

    /// A cluster operation was attempted before `Node::start`.
    #[error("cluster is not started")]
    ClusterNotStarted,

    /// The requested local name is already taken.
    #[error("name '{name}' is already registered")]
    RegistryConflict { name: String },

    /// The requested global name is already taken, or a non-owner attempted
    /// to release it.
    #[error("global name conflict on '{name}'")]
    GlobalNameConflict { name: String },

    /// No process is globally registered under the name.
    #[error("no global registration for '{name}'")]
    GlobalNameNotFound { name: String },

    /// The target process does not exist or is no longer running.
    #[error("server {server_id} is not running")]
    ServerNotRunning {
        server_id: u64,
        node: Option<NodeId>,
    },

    /// A call did not receive its reply in time.
    #[error("call to server {server_id} timed out after {timeout_ms} ms")]
    CallTimeout {
        timeout_ms: u64,
        server_id: u64,
        node: Option<NodeId>,
    },

    /// The peer node is not connected (or was lost mid-flight).
    #[error("node {node} is not reachable")]
    NodeNotReachable { node: NodeId },

    /// Encoding or decoding a wire message failed.
    #[error(transparent)]
    Serialization(#[from] CodecError),

    /// A spawn request named a behavior absent from the catalog.
    #[error("behavior '{name}' is not registered")]
    BehaviorNotFound { name: String },

    /// A behavior name was registered twice with different factories.
    #[error("behavior '{name}' is already registered")]
    BehaviorConflict { name: String },

    /// Distributed placement found no connected node satisfying the selector.
    #[error("no available node for child '{child_id}'")]
    NoAvailableNode { child_id: String },

    /// A supervisor operation named an unknown child id.
    #[error("no child with id '{id}'")]
    ChildNotFound { id: String },

    /// A supervisor exceeded its restart intensity.
    #[error("max restarts exceeded: {max_restarts} within {within_ms} ms")]
    MaxRestartsExceeded { max_restarts: u32, within_ms: u64 },

    /// Persisted-state migration failed; the process was not started.
    #[error("state migration failed for '{key}': {detail}")]
    Migration { key: String, detail: String },

    /// A behavior's `init` callback failed.
    #[error("init failed: {detail}")]
    InitFailed { detail: String },

    /// The call handler raised an application error.
    #[error("call failed: {detail}")]
    CallFailed { detail: String },

    /// A remote spawn was rejected by the receiving node.
    #[error("spawn failed: {detail}")]
    SpawnFailed { detail: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = Error::CallTimeout {
            timeout_ms: 1000,
            server_id: 42,
            node: Some(NodeId::parse("a@h:1").unwrap()),
        };
        let text = err.to_string();
        assert!(text.contains("42"));
        assert!(text.contains("1000"));

        let err = Error::NodeNotReachable {
            node: NodeId::parse("b@h:2").unwrap(),
        };
        assert!(err.to_string().contains("b@h:2"));
    }

    #[test]
    fn test_from_invalid_node_id() {
        let parse_err = NodeId::parse("bogus").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::InvalidNodeId(_)));
    }

    #[test]
    fn test_from_codec_error() {
        let err: Error = CodecError::SignatureMismatch.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
