//! Distribution: transport, membership, remote messaging, monitors/links,
//! the global registry, and distributed supervision.

pub mod global;
pub mod membership;
pub mod monitor;
pub mod remote;
pub mod supervisor;
pub mod transport;
