//! Wire-level foundations for the hive runtime.
//!
//! This crate owns everything that crosses a node boundary as bytes:
//!
//! - [`node_id`]: the branded `name@host:port` node identifier
//! - [`term`]: the runtime value type and its tagged-JSON codec
//! - [`frame`]: `u32be length || payload` framing with a resumable deframer
//! - [`envelope`]: the signed wire envelope (HMAC-SHA256 over the unsigned form)
//! - [`message`]: the cluster message catalog
//! - [`ident`]: correlation-id generation for calls, spawns, monitors, links
//!
//! The runtime crate (`hive-rt`) builds the transport, membership, and remote
//! messaging layers on top of these types. Nothing in here performs I/O.

pub mod envelope;
pub mod frame;
pub mod ident;
pub mod message;
pub mod node_id;
pub mod term;

pub use envelope::{WireEnvelope, PROTOCOL_VERSION};
pub use frame::{frame, Deframer, MAX_FRAME_PAYLOAD};
pub use ident::{call_id, link_id, monitor_id, spawn_id};
pub use message::{
    CallErrorKind, ClusterMessage, DownReason, GlobalEntry, SpawnErrorKind,
};
pub use node_id::{InvalidNodeId, NodeId};
pub use term::{CodecError, ErrorTerm, Term};
