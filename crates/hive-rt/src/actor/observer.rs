//! The observer service.
//!
//! A read-only process registered under a well-known name on each node. It
//! answers snapshot queries about local processes, supervisors, and call
//! statistics; cluster-wide observers fan out these calls over remote
//! messaging and aggregate the results elsewhere.
//!
//! The observer never crashes on a bad query -- unknown operations reply with
//! an error term instead of failing the handler.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use hive_wire::{NodeId, Term};

use super::behavior::Behavior;
use super::kernel::Kernel;
use super::process::ProcessStatus;

/// The well-known local registry name of the observer process.
pub const OBSERVER_NAME: &str = "$observer";

// ---------------------------------------------------------------------------
// SupervisorIndex
// ---------------------------------------------------------------------------

/// Live view of one supervisor, produced on demand.
#[derive(Debug, Clone)]
pub struct SupSnapshot {
    pub name: Option<String>,
    /// `(child id, server id if running, running)` in start order.
    pub children: Vec<(String, Option<u64>, bool)>,
}

/// Provider closure returning a supervisor's current snapshot.
pub type SupProvider = Arc<dyn Fn() -> SupSnapshot + Send + Sync>;

/// Registry of live supervisors, keyed by their process id. Supervisors
/// register a provider at start and unregister on termination, so queries
/// always see current child sets without duplicated bookkeeping.
#[derive(Default)]
pub struct SupervisorIndex {
    providers: RwLock<FxHashMap<u64, SupProvider>>,
}

impl SupervisorIndex {
    pub fn new() -> Self {
        SupervisorIndex::default()
    }

    pub fn register(&self, sup_id: u64, provider: SupProvider) {
        self.providers.write().insert(sup_id, provider);
    }

    pub fn unregister(&self, sup_id: u64) {
        self.providers.write().remove(&sup_id);
    }

    /// Snapshots of every live supervisor, sorted by supervisor id.
    pub fn snapshots(&self) -> Vec<(u64, SupSnapshot)> {
        let providers: Vec<(u64, SupProvider)> = self
            .providers
            .read()
            .iter()
            .map(|(id, p)| (*id, Arc::clone(p)))
            .collect();
        let mut out: Vec<(u64, SupSnapshot)> =
            providers.into_iter().map(|(id, p)| (id, p())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

// ---------------------------------------------------------------------------
// Observer behavior
// ---------------------------------------------------------------------------

fn status_str(status: ProcessStatus) -> &'static str {
    match status {
        ProcessStatus::Initializing => "initializing",
        ProcessStatus::Running => "running",
        ProcessStatus::Stopping => "stopping",
        ProcessStatus::Stopped => "stopped",
    }
}

/// Build the observer behavior for a kernel. `node` is included in
/// snapshots when the kernel belongs to a started cluster node.
pub fn observer_behavior(kernel: Kernel, node: Option<NodeId>) -> Behavior {
    Behavior::builder()
        .init(|_| Ok(Term::Null))
        .on_call(move |msg, state| {
            // Accept both a bare string query and `{"op": "..."}`.
            let op = msg
                .as_str()
                .or_else(|| msg.get("op").and_then(Term::as_str))
                .unwrap_or("");
            let reply = match op {
                "get_snapshot" => snapshot(&kernel, node.as_ref()),
                "get_server_stats" => server_stats(&kernel),
                "get_supervisor_stats" => supervisor_stats(&kernel),
                "get_process_tree" => process_tree(&kernel),
                "get_process_count" => Term::Int(kernel.process_count() as i64),
                other => Term::error("UnknownQuery", format!("unknown query '{}'", other)),
            };
            Ok((reply, state))
        })
        .build()
}

fn server_list(kernel: &Kernel) -> Term {
    Term::List(
        kernel
            .list()
            .into_iter()
            .map(|info| {
                Term::object([
                    ("id", Term::Int(info.id as i64)),
                    (
                        "name",
                        info.name.map(Term::Str).unwrap_or(Term::Null),
                    ),
                    ("status", Term::str(status_str(info.status))),
                    ("queue_size", Term::Int(info.queue_len as i64)),
                    ("message_count", Term::Int(info.message_count as i64)),
                    ("uptime_ms", Term::Int(info.uptime_ms as i64)),
                ])
            })
            .collect(),
    )
}

fn call_stats(kernel: &Kernel) -> Term {
    let stats = kernel.stats().snapshot();
    Term::object([
        ("initiated", Term::Int(stats.initiated as i64)),
        ("resolved", Term::Int(stats.resolved as i64)),
        ("rejected", Term::Int(stats.rejected as i64)),
        ("timed_out", Term::Int(stats.timed_out as i64)),
        ("casts", Term::Int(stats.casts as i64)),
    ])
}

fn supervisor_list(kernel: &Kernel) -> Term {
    Term::List(
        kernel
            .sup_index()
            .snapshots()
            .into_iter()
            .map(|(id, snap)| {
                Term::object([
                    ("id", Term::Int(id as i64)),
                    ("name", snap.name.map(Term::Str).unwrap_or(Term::Null)),
                    (
                        "children",
                        Term::List(
                            snap.children
                                .into_iter()
                                .map(|(child_id, server_id, running)| {
                                    Term::object([
                                        ("id", Term::Str(child_id)),
                                        (
                                            "server_id",
                                            server_id
                                                .map(|s| Term::Int(s as i64))
                                                .unwrap_or(Term::Null),
                                        ),
                                        ("running", Term::Bool(running)),
                                    ])
                                })
                                .collect(),
                        ),
                    ),
                ])
            })
            .collect(),
    )
}

fn snapshot(kernel: &Kernel, node: Option<&NodeId>) -> Term {
    Term::object([
        (
            "node",
            node.map(|n| Term::str(n.as_str())).unwrap_or(Term::Null),
        ),
        ("process_count", Term::Int(kernel.process_count() as i64)),
        ("servers", server_list(kernel)),
        ("supervisors", supervisor_list(kernel)),
        ("calls", call_stats(kernel)),
    ])
}

fn server_stats(kernel: &Kernel) -> Term {
    Term::object([
        ("servers", server_list(kernel)),
        ("calls", call_stats(kernel)),
    ])
}

fn supervisor_stats(kernel: &Kernel) -> Term {
    Term::object([("supervisors", supervisor_list(kernel))])
}

/// Supervisors with their children, plus processes under no supervisor.
fn process_tree(kernel: &Kernel) -> Term {
    let supervisors = kernel.sup_index().snapshots();
    let mut supervised: std::collections::BTreeSet<u64> = std::collections::BTreeSet::new();
    for (sup_id, snap) in &supervisors {
        supervised.insert(*sup_id);
        for (_, server_id, _) in &snap.children {
            if let Some(id) = server_id {
                supervised.insert(*id);
            }
        }
    }
    let orphans: Vec<Term> = kernel
        .list()
        .into_iter()
        .filter(|p| !supervised.contains(&p.id))
        .map(|p| Term::Int(p.id as i64))
        .collect();

    Term::object([
        ("supervisors", supervisor_list(kernel)),
        ("orphans", Term::List(orphans)),
    ])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
