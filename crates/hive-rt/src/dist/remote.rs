//! Location-transparent remote call, cast, and spawn.
//!
//! The client side correlates requests through the pending tables: every
//! outbound call or spawn installs a one-shot reply channel keyed by its
//! correlation id, drained by the reply, by the caller's timeout, or by
//! peer loss. The server side resolves the target locally and answers with
//! a reply or a typed error -- an unknown behavior name is an explicit
//! error, never a silently successful stub.
//!
//! Casts are fire-and-forget by design: delivery failure to an unreachable
//! peer is silent, callers needing confirmation use `call`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::debug;

use hive_wire::{call_id as new_call_id, spawn_id as new_spawn_id};
use hive_wire::{CallErrorKind, ClusterMessage, NodeId, SpawnErrorKind, Term, WireEnvelope};

use super::global::GlobalRegistry;
use super::transport::Transport;
use crate::actor::behavior::BehaviorCatalog;
use crate::actor::calls::{PendingCall, PendingSpawn, PendingTables};
use crate::actor::kernel::{Kernel, StartOptions};
use crate::actor::process::{ExitReason, ServerRef};
use crate::error::{Error, Result};
use crate::persist::Clock;

/// Options for a remote spawn.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Register the spawned process in the receiving node's local registry.
    pub register_name: Option<String>,
    /// Additionally register it in the global registry under the same name.
    pub register_global: bool,
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote messaging endpoints for one node. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Remote {
    pub kernel: Kernel,
    pub transport: Transport,
    pub catalog: Arc<BehaviorCatalog>,
    pub global: GlobalRegistry,
    pub tables: Arc<PendingTables>,
    pub local: NodeId,
    pub clock: Arc<dyn Clock>,
    /// Timeout applied by the receiving side when resolving inbound calls,
    /// and the default for outbound requests.
    pub call_timeout: Duration,
}

impl Remote {
    fn send(&self, peer: &NodeId, message: ClusterMessage) -> Result<()> {
        self.transport.send(
            peer,
            &WireEnvelope::new(self.local.clone(), self.clock.now_ms(), message),
        )
    }

    // -----------------------------------------------------------------------
    // Client side
    // -----------------------------------------------------------------------

    /// Remote request/reply with the same semantics as a local call, plus
    /// the remote failure modes (`NodeNotReachable`, transported errors).
    pub fn call(&self, node: &NodeId, target_id: u64, msg: Term, timeout: Duration) -> Result<Term> {
        self.kernel.stats().record_initiated();
        let call_id = new_call_id();
        let (reply_tx, reply_rx) = bounded(1);
        self.tables.insert_call(
            call_id.clone(),
            PendingCall {
                reply: reply_tx,
                node: node.clone(),
                target_id,
            },
        );

        if let Err(err) = self.send(
            node,
            ClusterMessage::Call {
                call_id: call_id.clone(),
                target_id,
                payload: msg,
            },
        ) {
            self.tables.take_call(&call_id);
            self.kernel.stats().record_rejected();
            return Err(err);
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => {
                self.kernel.stats().record_resolved();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.kernel.stats().record_rejected();
                Err(err)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Remove our own entry; a reply racing in is discarded.
                self.tables.take_call(&call_id);
                self.kernel.stats().record_timed_out();
                Err(Error::CallTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    server_id: target_id,
                    node: Some(node.clone()),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.kernel.stats().record_rejected();
                Err(Error::NodeNotReachable { node: node.clone() })
            }
        }
    }

    /// Fire-and-forget to a remote process. Unreachable peers are silent.
    pub fn cast(&self, node: &NodeId, target_id: u64, msg: Term) {
        self.kernel.stats().record_cast();
        let _ = self.send(
            node,
            ClusterMessage::Cast {
                target_id,
                payload: msg,
            },
        );
    }

    /// Start a cataloged behavior on a peer node.
    pub fn spawn(
        &self,
        node: &NodeId,
        behavior: &str,
        init_args: Term,
        options: SpawnOptions,
        timeout: Duration,
    ) -> Result<ServerRef> {
        let spawn_id = new_spawn_id();
        let (reply_tx, reply_rx) = bounded(1);
        self.tables.insert_spawn(
            spawn_id.clone(),
            PendingSpawn {
                reply: reply_tx,
                node: node.clone(),
            },
        );

        if let Err(err) = self.send(
            node,
            ClusterMessage::SpawnRequest {
                spawn_id: spawn_id.clone(),
                behavior: behavior.to_string(),
                init_args,
                register_name: options.register_name,
                register_global: options.register_global,
            },
        ) {
            self.tables.take_spawn(&spawn_id);
            return Err(err);
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(server_id)) => Ok(ServerRef::remote(server_id, node.clone())),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                self.tables.take_spawn(&spawn_id);
                Err(Error::SpawnFailed {
                    detail: format!(
                        "spawn of '{}' on {} timed out after {} ms",
                        behavior,
                        node,
                        timeout.as_millis()
                    ),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::NodeNotReachable { node: node.clone() })
            }
        }
    }

    /// Ask a peer to shut one of its processes down. Fire-and-forget: the
    /// requester observes completion through its monitor, if it holds one.
    pub fn stop_remote(&self, node: &NodeId, target_id: u64) {
        let _ = self.send(
            node,
            ClusterMessage::ExitSignal {
                link_id: None,
                target_id,
                reason: hive_wire::DownReason::Shutdown,
                detail: None,
            },
        );
    }

    /// Peer lost: fail every in-flight call and spawn addressed to it.
    pub fn on_node_down(&self, peer: &NodeId) {
        self.tables.fail_node(peer);
    }

    // -----------------------------------------------------------------------
    // Server side
    // -----------------------------------------------------------------------

    /// Resolve an inbound call against the local kernel.
    ///
    /// The envelope is enqueued on the caller's (router) thread so ordering
    /// against casts from the same sender is preserved; only the reply wait
    /// runs on a worker thread.
    pub fn handle_call_request(&self, from: &NodeId, call_id: String, target_id: u64, payload: Term) {
        let reply_rx = match self.kernel.call_enqueue(target_id, payload) {
            Ok(reply_rx) => reply_rx,
            Err(err) => {
                let _ = self.send(from, call_response(call_id, Err(err)));
                return;
            }
        };
        let remote = self.clone();
        let from = from.clone();
        let _ = std::thread::Builder::new()
            .name("hive-call-worker".to_string())
            .spawn(move || {
                let result = remote
                    .kernel
                    .call_await(reply_rx, remote.call_timeout, target_id);
                let _ = remote.send(&from, call_response(call_id, result));
            });
    }

    pub fn handle_cast_request(&self, target_id: u64, payload: Term) {
        self.kernel.cast(&ServerRef::local(target_id), payload);
    }

    /// Resolve an inbound spawn: catalog lookup, local start, optional
    /// registrations, typed errors for every failure mode.
    pub fn handle_spawn_request(
        &self,
        from: &NodeId,
        spawn_id: String,
        behavior: String,
        init_args: Term,
        register_name: Option<String>,
        register_global: bool,
    ) {
        let message = self.spawn_response(spawn_id, &behavior, init_args, register_name, register_global);
        let _ = self.send(from, message);
    }

    fn spawn_response(
        &self,
        spawn_id: String,
        behavior: &str,
        init_args: Term,
        register_name: Option<String>,
        register_global: bool,
    ) -> ClusterMessage {
        let factory = match self.catalog.get(behavior) {
            Ok(factory) => factory,
            Err(_) => {
                // The detail carries the bare name; the caller rebuilds the
                // typed error from it.
                return ClusterMessage::SpawnError {
                    spawn_id,
                    kind: SpawnErrorKind::BehaviorNotFound,
                    detail: behavior.to_string(),
                };
            }
        };

        if register_global && register_name.is_none() {
            return ClusterMessage::SpawnError {
                spawn_id,
                kind: SpawnErrorKind::NameConflict,
                detail: "global registration requires a name".to_string(),
            };
        }

        let start = self.kernel.start(
            factory(),
            StartOptions {
                name: register_name.clone(),
                init_args,
            },
        );
        let server = match start {
            Ok(server) => server,
            Err(Error::RegistryConflict { name }) => {
                return ClusterMessage::SpawnError {
                    spawn_id,
                    kind: SpawnErrorKind::NameConflict,
                    detail: format!("name '{}' is taken", name),
                };
            }
            Err(err) => {
                return ClusterMessage::SpawnError {
                    spawn_id,
                    kind: SpawnErrorKind::InitFailed,
                    detail: err.to_string(),
                };
            }
        };

        if register_global {
            let name = register_name.expect("checked above");
            if let Err(err) = self.global.register(&name, server.id) {
                self.kernel.stop_async(&server, ExitReason::Shutdown);
                return ClusterMessage::SpawnError {
                    spawn_id,
                    kind: SpawnErrorKind::NameConflict,
                    detail: err.to_string(),
                };
            }
        }

        ClusterMessage::SpawnReply {
            spawn_id,
            server_id: server.id,
        }
    }

    // -----------------------------------------------------------------------
    // Reply routing
    // -----------------------------------------------------------------------

    pub fn handle_call_reply(&self, call_id: &str, payload: Term) {
        match self.tables.take_call(call_id) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(payload));
            }
            None => debug!("late call reply {} discarded", call_id),
        }
    }

    pub fn handle_call_error(&self, call_id: &str, kind: CallErrorKind, detail: Term) {
        if let Some(pending) = self.tables.take_call(call_id) {
            let err = match kind {
                CallErrorKind::ServerNotRunning => Error::ServerNotRunning {
                    server_id: pending.target_id,
                    node: Some(pending.node.clone()),
                },
                CallErrorKind::Timeout => Error::CallTimeout {
                    timeout_ms: self.call_timeout.as_millis() as u64,
                    server_id: pending.target_id,
                    node: Some(pending.node.clone()),
                },
                CallErrorKind::App => Error::CallFailed {
                    detail: detail_string(&detail),
                },
            };
            let _ = pending.reply.send(Err(err));
        }
    }

    pub fn handle_spawn_reply(&self, spawn_id: &str, server_id: u64) {
        if let Some(pending) = self.tables.take_spawn(spawn_id) {
            let _ = pending.reply.send(Ok(server_id));
        }
    }

    pub fn handle_spawn_error(&self, spawn_id: &str, kind: SpawnErrorKind, detail: String) {
        if let Some(pending) = self.tables.take_spawn(spawn_id) {
            let err = match kind {
                SpawnErrorKind::BehaviorNotFound => Error::BehaviorNotFound {
                    name: detail.clone(),
                },
                SpawnErrorKind::NameConflict | SpawnErrorKind::InitFailed => {
                    Error::SpawnFailed { detail }
                }
            };
            let _ = pending.reply.send(Err(err));
        }
    }
}

/// Map a local call result onto the wire response.
fn call_response(call_id: String, result: Result<Term>) -> ClusterMessage {
    match result {
        Ok(payload) => ClusterMessage::CallReply { call_id, payload },
        Err(Error::ServerNotRunning { .. }) => ClusterMessage::CallError {
            call_id,
            kind: CallErrorKind::ServerNotRunning,
            detail: Term::Null,
        },
        Err(Error::CallTimeout { timeout_ms, .. }) => ClusterMessage::CallError {
            call_id,
            kind: CallErrorKind::Timeout,
            detail: Term::Int(timeout_ms as i64),
        },
        Err(Error::CallFailed { detail }) => ClusterMessage::CallError {
            call_id,
            kind: CallErrorKind::App,
            detail: Term::error("CallError", detail),
        },
        Err(other) => ClusterMessage::CallError {
            call_id,
            kind: CallErrorKind::App,
            detail: Term::error("CallError", other.to_string()),
        },
    }
}

/// Human-readable form of a transported error payload.
fn detail_string(detail: &Term) -> String {
    match detail {
        Term::Error(err) => err.message.clone(),
        Term::Str(s) => s.clone(),
        Term::Null => "remote call failed".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
