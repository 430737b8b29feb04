//! Branded node identifiers of the form `name@host:port`.
//!
//! Parsing both validates and brands the string: once a [`NodeId`] exists, the
//! rest of the runtime can rely on the grammar without re-checking. Identifiers
//! compare and hash by their full string form.
//!
//! ## Grammar
//!
//! - `name`: `[A-Za-z][A-Za-z0-9_-]{0,63}`
//! - `host`: an IPv4 dotted quad or an RFC-1123 hostname
//! - `port`: 1..=65535

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of the `name` part.
const MAX_NAME_LEN: usize = 64;

/// Maximum total length of the `host` part (RFC-1123).
const MAX_HOST_LEN: usize = 253;

/// Error raised when a node identifier string does not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node id '{input}': {reason}")]
pub struct InvalidNodeId {
    /// The offending input, verbatim.
    pub input: String,
    /// Human-readable description of the first violation found.
    pub reason: String,
}

impl InvalidNodeId {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        InvalidNodeId {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A validated node identifier.
///
/// Value-equal as a string; the parsed port is cached so routing code never
/// re-parses. Serializes as the plain string form and re-validates on
/// deserialization, so identifiers arriving over the wire carry the same
/// guarantee as locally constructed ones.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    full: String,
    at: usize,
    colon: usize,
    port: u16,
}

impl NodeId {
    /// Parse and validate an identifier string.
    pub fn parse(input: &str) -> Result<NodeId, InvalidNodeId> {
        let at = input
            .find('@')
            .ok_or_else(|| InvalidNodeId::new(input, "missing '@' separator"))?;

        let name = &input[..at];
        validate_name(input, name)?;

        let host_port = &input[at + 1..];
        let colon_rel = host_port
            .rfind(':')
            .ok_or_else(|| InvalidNodeId::new(input, "missing ':port' suffix"))?;
        let host = &host_port[..colon_rel];
        let port_str = &host_port[colon_rel + 1..];

        validate_host(input, host)?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| InvalidNodeId::new(input, format!("invalid port '{}'", port_str)))?;
        if port == 0 {
            return Err(InvalidNodeId::new(input, "port must be 1..=65535"));
        }

        Ok(NodeId {
            full: input.to_string(),
            at,
            colon: at + 1 + colon_rel,
            port,
        })
    }

    /// The `name` part.
    pub fn name(&self) -> &str {
        &self.full[..self.at]
    }

    /// The `host` part.
    pub fn host(&self) -> &str {
        &self.full[self.at + 1..self.colon]
    }

    /// The `port` part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The full `name@host:port` form.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The `host:port` address peers dial to reach this node.
    pub fn addr(&self) -> &str {
        &self.full[self.at + 1..]
    }
}

fn validate_name(input: &str, name: &str) -> Result<(), InvalidNodeId> {
    if name.is_empty() {
        return Err(InvalidNodeId::new(input, "empty name part"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InvalidNodeId::new(
            input,
            format!("name exceeds {} characters", MAX_NAME_LEN),
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() {
        return Err(InvalidNodeId::new(input, "name must start with a letter"));
    }
    if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-') {
        return Err(InvalidNodeId::new(
            input,
            format!("name contains invalid character '{}'", bad),
        ));
    }
    Ok(())
}

fn validate_host(input: &str, host: &str) -> Result<(), InvalidNodeId> {
    if host.is_empty() {
        return Err(InvalidNodeId::new(input, "empty host part"));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(InvalidNodeId::new(input, "host too long"));
    }
    // All digits and dots: must be a well-formed IPv4 dotted quad.
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        let octets: Vec<&str> = host.split('.').collect();
        if octets.len() != 4 {
            return Err(InvalidNodeId::new(input, "malformed IPv4 address"));
        }
        for octet in octets {
            if octet.is_empty() || octet.len() > 3 || octet.parse::<u16>().map_or(true, |v| v > 255)
            {
                return Err(InvalidNodeId::new(input, "malformed IPv4 address"));
            }
        }
        return Ok(());
    }
    // RFC-1123 hostname: dot-separated labels of alphanumerics and hyphens,
    // no label starting or ending with a hyphen.
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(InvalidNodeId::new(input, "malformed hostname label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(InvalidNodeId::new(
                input,
                "hostname label starts or ends with '-'",
            ));
        }
        if label.chars().any(|c| !c.is_ascii_alphanumeric() && c != '-') {
            return Err(InvalidNodeId::new(
                input,
                "hostname contains invalid character",
            ));
        }
    }
    Ok(())
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for NodeId {}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.full.cmp(&other.full)
    }
}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.full)
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodeId::parse(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> String {
        id.full
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
