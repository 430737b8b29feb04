//! Cluster configuration.
//!
//! A [`ClusterConfig`] describes one node: its identity, bind address, seed
//! peers, optional signing secret, and the failure-detection and reconnect
//! tunables. Validation happens once, at `Node::new`; everything downstream
//! trusts the values.

use std::time::Duration;

use hive_wire::NodeId;

use crate::error::{Error, Result};

/// Minimum accepted heartbeat interval.
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Configuration for one cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Local node name (the part before `@`). Required.
    pub node_name: String,
    /// Bind address, also the host part of the node identity.
    pub host: String,
    /// Listen port, also the port part of the node identity.
    pub port: u16,
    /// Peer identifiers dialed unconditionally at startup. Unreachable seeds
    /// never prevent startup; the node waits for inbound connections instead.
    pub seeds: Vec<String>,
    /// Shared secret enabling HMAC signing and verification of envelopes.
    pub cluster_secret: Option<String>,
    /// Heartbeat period.
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a peer is declared down.
    pub heartbeat_miss_threshold: u32,
    /// Initial reconnect backoff.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect backoff plateau.
    pub reconnect_max_delay_ms: u64,
    /// Default timeout for remote calls.
    pub call_timeout_ms: u64,
    /// Optional mailbox high-watermark: casts to a process whose queue is at
    /// or above this length are dropped (and counted). `None` = unbounded,
    /// the default.
    pub mailbox_high_watermark: Option<usize>,
}

impl ClusterConfig {
    /// A config with spec defaults for the given node name.
    pub fn new(node_name: impl Into<String>) -> Self {
        ClusterConfig {
            node_name: node_name.into(),
            host: "0.0.0.0".to_string(),
            port: 4369,
            seeds: Vec::new(),
            cluster_secret: None,
            heartbeat_interval_ms: 5000,
            heartbeat_miss_threshold: 3,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            call_timeout_ms: 5000,
            mailbox_high_watermark: None,
        }
    }

    /// Validate and derive the local node identity.
    pub fn validate(&self) -> Result<NodeId> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidClusterConfig("nodeName is required".into()));
        }
        if self.heartbeat_interval_ms < MIN_HEARTBEAT_INTERVAL_MS {
            return Err(Error::InvalidClusterConfig(format!(
                "heartbeatIntervalMs must be at least {}",
                MIN_HEARTBEAT_INTERVAL_MS
            )));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(Error::InvalidClusterConfig(
                "heartbeatMissThreshold must be at least 1".into(),
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(Error::InvalidClusterConfig(
                "reconnectBaseDelayMs must be positive".into(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(Error::InvalidClusterConfig(
                "reconnectMaxDelayMs must be >= reconnectBaseDelayMs".into(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::InvalidClusterConfig(
                "callTimeoutMs must be positive".into(),
            ));
        }
        // The node identity inherits the grammar checks (name charset and
        // length, host shape, port range).
        let id = NodeId::parse(&format!("{}@{}:{}", self.node_name, self.host, self.port))?;
        // Seeds must parse; unreachable is fine, unparseable is not.
        for seed in &self.seeds {
            NodeId::parse(seed)?;
        }
        Ok(id)
    }

    /// Parsed seed identifiers, excluding self.
    pub(crate) fn seed_ids(&self, local: &NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for seed in &self.seeds {
            let id = NodeId::parse(seed)?;
            if &id != local {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence window after which a peer is declared down.
    pub(crate) fn heartbeat_deadline(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * self.heartbeat_miss_threshold as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
