//! The signed wire envelope.
//!
//! Every framed payload is a JSON envelope carrying the protocol version, the
//! sender's node id, a wall-clock timestamp, an optional HMAC-SHA256
//! signature, and the cluster message body.
//!
//! The signature covers the canonical serialization of the envelope *without*
//! its signature field. Canonical here means: struct fields in declaration
//! order, object keys sorted (both the serde_json default and the term
//! codec's), floats printed by the shortest-roundtrip formatter. Both ends of
//! a connection run this codec, so re-serializing a parsed envelope
//! reproduces the signed bytes exactly.
//!
//! Verification is constant-time. When a secret is configured, unsigned
//! inbound envelopes are rejected outright; a mismatch is grounds for closing
//! the connection, not merely dropping the message.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::message::ClusterMessage;
use crate::node_id::NodeId;
use crate::term::CodecError;

type HmacSha256 = Hmac<Sha256>;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// WireEnvelope
// ---------------------------------------------------------------------------

/// One wire message: version, sender, timestamp, optional signature, body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub version: u32,
    pub from: NodeId,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Hex-encoded HMAC-SHA256 over the unsigned serialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub payload: ClusterMessage,
}

impl WireEnvelope {
    /// Build an unsigned envelope at the current protocol version.
    pub fn new(from: NodeId, timestamp: i64, payload: ClusterMessage) -> Self {
        WireEnvelope {
            version: PROTOCOL_VERSION,
            from,
            timestamp,
            signature: None,
            payload,
        }
    }

    /// Serialize for the wire, signing when a secret is configured.
    ///
    /// The result is the raw JSON payload; framing is the transport's job.
    pub fn to_bytes(&self, secret: Option<&str>) -> Result<Vec<u8>, CodecError> {
        match secret {
            None => serde_json::to_vec(self).map_err(|e| CodecError::Json(e.to_string())),
            Some(secret) => {
                let unsigned = WireEnvelope {
                    signature: None,
                    ..self.clone()
                };
                let unsigned_bytes = serde_json::to_vec(&unsigned)
                    .map_err(|e| CodecError::Json(e.to_string()))?;
                let signed = WireEnvelope {
                    signature: Some(hex::encode(compute_signature(secret, &unsigned_bytes))),
                    ..unsigned
                };
                serde_json::to_vec(&signed).map_err(|e| CodecError::Json(e.to_string()))
            }
        }
    }

    /// Parse an inbound payload, enforcing the version and signature policy.
    pub fn from_bytes(bytes: &[u8], secret: Option<&str>) -> Result<WireEnvelope, CodecError> {
        let envelope: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope.version));
        }
        if let Some(secret) = secret {
            let signature = envelope
                .signature
                .as_deref()
                .ok_or(CodecError::SignatureMissing)?;
            let provided = hex::decode(signature).map_err(|_| CodecError::MalformedSignature)?;

            let unsigned = WireEnvelope {
                signature: None,
                ..envelope.clone()
            };
            let unsigned_bytes =
                serde_json::to_vec(&unsigned).map_err(|e| CodecError::Json(e.to_string()))?;
            verify_signature(secret, &unsigned_bytes, &provided)?;
        }
        Ok(envelope)
    }
}

/// HMAC-SHA256 over the unsigned envelope bytes.
fn compute_signature(secret: &str, unsigned: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(unsigned);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time signature check via `Mac::verify_slice`.
fn verify_signature(secret: &str, unsigned: &[u8], provided: &[u8]) -> Result<(), CodecError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(unsigned);
    mac.verify_slice(provided)
        .map_err(|_| CodecError::SignatureMismatch)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
