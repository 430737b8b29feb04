//! OTP-style concurrency and distribution runtime.
//!
//! The runtime gives user code one programming model -- isolated stateful
//! servers communicating only by asynchronous messages -- and keeps those
//! servers alive, supervised, named, and reachable across a peer-to-peer
//! cluster of nodes.
//!
//! ## Layers
//!
//! - [`actor`]: the local process kernel -- behaviors, mailboxes, serialized
//!   dispatch, the local name registry, supervision trees, call accounting,
//!   and the observer service
//! - [`dist`]: the cluster -- TCP transport with reconnect, heartbeat-based
//!   membership with gossip, remote call/cast/spawn, monitors and links
//!   across nodes, the LWW global registry, and distributed supervision
//! - [`node`]: the assembly tying one kernel into one cluster instance
//!
//! ## Quick start
//!
//! ```no_run
//! use hive_rt::{Behavior, ClusterConfig, Node, StartOptions, Term};
//! use std::time::Duration;
//!
//! let mut config = ClusterConfig::new("alpha");
//! config.port = 4401;
//! let node = Node::new(config).unwrap();
//!
//! let counter = Behavior::builder()
//!     .init(|args| Ok(args))
//!     .on_call(|_msg, state| Ok((state.clone(), state)))
//!     .on_cast(|_msg, state| Ok(Term::Int(state.as_i64().unwrap_or(0) + 1)))
//!     .build();
//!
//! let server = node
//!     .start_server(counter, StartOptions::with_args(Term::Int(0)))
//!     .unwrap();
//! node.cast(&server, Term::str("inc"));
//! let count = node
//!     .call(&server, Term::str("get"), Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(count, Term::Int(1));
//! ```

pub mod actor;
pub mod config;
pub mod dist;
pub mod error;
pub mod event;
pub mod node;
pub mod persist;

pub use actor::behavior::{Behavior, BehaviorCatalog, BehaviorFactory, PersistenceSpec};
pub use actor::calls::{CallStats, CallStatsSnapshot};
pub use actor::child_spec::{
    AutoShutdown, ChildSpec, DynamicChildSpec, RestartPolicy, Strategy, SupervisorOptions,
};
pub use actor::kernel::{Kernel, KernelOptions, ProcessInfo, StartOptions};
pub use actor::observer::{observer_behavior, SupervisorIndex, OBSERVER_NAME};
pub use actor::process::{ExitReason, ProcessStatus, ServerRef};
pub use actor::registry::Registry;
pub use actor::supervisor::{ChildInfo, Supervisor};
pub use config::ClusterConfig;
pub use dist::global::{GlobalEvent, GlobalRegistry};
pub use dist::membership::{ClusterEvent, ClusterStatus, NodeInfo};
pub use dist::remote::SpawnOptions;
pub use dist::supervisor::{
    DistChildSpec, DistSupEvent, DistSupervisorOptions, DistributedSupervisor, NodeSelector,
};
pub use error::{Error, Result};
pub use event::{EventHub, LifecycleEvent};
pub use node::{Node, NodeOptions};
pub use persist::{Clock, MemoryStorage, PersistedState, StorageAdapter, SystemClock};

// The wire types are part of the public surface: payloads are `Term`s and
// identities are `NodeId`s.
pub use hive_wire::{NodeId, Term};
