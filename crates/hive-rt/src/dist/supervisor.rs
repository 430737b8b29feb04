//! Distributed supervision.
//!
//! Extends the local supervisor across the cluster: the supervisor lives on
//! one node and holds only child metadata; the children themselves run
//! wherever placement puts them. Starts go through remote spawn, liveness
//! through monitors, shutdown through remote exit signals (asynchronous for
//! remote children, awaited for local ones).
//!
//! Failover re-runs placement: when a monitor fires -- including with
//! `nodedown` when a hosting node is lost -- the strategy is applied exactly
//! like the local supervisor's, but each restarted child gets a freshly
//! selected node. A child whose placement finds no candidate stays down and
//! is retried when the next node joins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use hive_wire::{NodeId, Term};

use super::global::GlobalRegistry;
use super::membership::{ClusterEvent, Membership};
use super::monitor::Monitors;
use super::remote::{Remote, SpawnOptions};
use super::transport::Transport;
use crate::actor::behavior::{Behavior, BehaviorCatalog};
use crate::actor::child_spec::{AutoShutdown, RestartPolicy, RestartWindow, Strategy};
use crate::actor::kernel::{Kernel, StartOptions};
use crate::actor::observer::SupSnapshot;
use crate::actor::process::{ExitReason, ServerRef};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Node selection
// ---------------------------------------------------------------------------

/// Picks the node a child runs on. Candidates are always the currently
/// connected nodes plus the local one.
#[derive(Clone)]
pub enum NodeSelector {
    /// Exactly this node, or `NoAvailableNode` if it is not connected.
    Fixed(NodeId),
    /// The supervisor's own node.
    LocalFirst,
    /// Rotate over the candidates in sorted order.
    RoundRobin,
    /// The candidate with the fewest processes; node id breaks ties.
    LeastLoaded,
    /// Uniform choice.
    Random,
    /// User code: `(candidates, child id) -> node`. Returning a node outside
    /// the candidate set counts as no selection.
    Custom(Arc<dyn Fn(&[NodeId], &str) -> Option<NodeId> + Send + Sync>),
}

impl std::fmt::Debug for NodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            NodeSelector::Fixed(node) => return write!(f, "Fixed({})", node),
            NodeSelector::LocalFirst => "LocalFirst",
            NodeSelector::RoundRobin => "RoundRobin",
            NodeSelector::LeastLoaded => "LeastLoaded",
            NodeSelector::Random => "Random",
            NodeSelector::Custom(_) => "Custom",
        };
        f.write_str(tag)
    }
}

/// Specification of one distributed child. The behavior is referenced by
/// catalog name so any node in the cluster can start it.
#[derive(Clone)]
pub struct DistChildSpec {
    pub id: String,
    pub behavior: String,
    pub init_args: Term,
    pub restart: RestartPolicy,
    pub shutdown_timeout_ms: u64,
    pub significant: bool,
    pub selector: NodeSelector,
    /// Register the child in the global registry under its child id.
    pub register_global: bool,
}

impl DistChildSpec {
    pub fn new(id: impl Into<String>, behavior: impl Into<String>) -> Self {
        DistChildSpec {
            id: id.into(),
            behavior: behavior.into(),
            init_args: Term::Null,
            restart: RestartPolicy::Permanent,
            shutdown_timeout_ms: crate::actor::child_spec::DEFAULT_SHUTDOWN_TIMEOUT_MS,
            significant: false,
            selector: NodeSelector::RoundRobin,
            register_global: false,
        }
    }

    pub fn with_args(mut self, args: Term) -> Self {
        self.init_args = args;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_selector(mut self, selector: NodeSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn register_global(mut self, register: bool) -> Self {
        self.register_global = register;
        self
    }

    pub fn significant(mut self, significant: bool) -> Self {
        self.significant = significant;
        self
    }
}

/// Distributed supervisor lifecycle events.
#[derive(Debug, Clone)]
pub enum DistSupEvent {
    SupervisorStarted,
    ChildStarted { id: String, node: NodeId },
    ChildStopped { id: String, reason: String },
    ChildRestarted { id: String, attempt: u32 },
    ChildMigrated {
        id: String,
        from: NodeId,
        to: NodeId,
    },
    NodeFailureDetected {
        node: NodeId,
        affected: Vec<String>,
    },
    SupervisorStopped,
}

/// Everything a distributed supervisor needs from its node.
#[derive(Clone)]
pub(crate) struct DistServices {
    pub kernel: Kernel,
    pub transport: Transport,
    pub remote: Remote,
    pub monitors: Arc<Monitors>,
    pub membership: Membership,
    pub global: GlobalRegistry,
    pub catalog: Arc<BehaviorCatalog>,
    pub local: NodeId,
}

// ---------------------------------------------------------------------------
// DistributedSupervisor
// ---------------------------------------------------------------------------

struct DistChildState {
    spec: DistChildSpec,
    server: Option<ServerRef>,
    node: Option<NodeId>,
    monitor_id: Option<String>,
    running: bool,
    /// Placement found no node; retry when one joins.
    awaiting_node: bool,
    restart_count: u32,
}

impl DistChildState {
    fn new(spec: DistChildSpec) -> Self {
        DistChildState {
            spec,
            server: None,
            node: None,
            monitor_id: None,
            running: false,
            awaiting_node: false,
            restart_count: 0,
        }
    }
}

struct DistInner {
    strategy: Strategy,
    window: RestartWindow,
    auto_shutdown: AutoShutdown,
    children: Vec<DistChildState>,
    /// `simple_one_for_one` template; children derive from it dynamically.
    template: Option<DistChildSpec>,
    next_dynamic_id: u64,
    rr_counter: usize,
    stopping: bool,
}

type WatchMap = Arc<Mutex<FxHashMap<String, String>>>;
type EventSubscriber = Arc<dyn Fn(&DistSupEvent) + Send + Sync>;

/// Handle to a running distributed supervisor.
pub struct DistributedSupervisor {
    services: DistServices,
    server: ServerRef,
    inner: Arc<Mutex<DistInner>>,
    watched: WatchMap,
    events: Arc<EventHubD>,
    membership_token: u64,
}

/// Minimal event fan-out for distributed supervisor events.
#[derive(Default)]
struct EventHubD {
    subscribers: RwLock<Vec<(u64, EventSubscriber)>>,
    next: AtomicU64,
}

impl EventHubD {
    fn subscribe(&self, f: EventSubscriber) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((token, f));
        token
    }

    fn emit(&self, event: &DistSupEvent) {
        let subscribers: Vec<EventSubscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(event)))
                .is_err()
            {
                warn!("distributed supervisor subscriber panicked");
            }
        }
    }
}

/// Options reuse the local supervisor's shape.
pub use crate::actor::child_spec::SupervisorOptions as DistSupervisorOptions;

impl DistributedSupervisor {
    pub(crate) fn start(
        services: DistServices,
        options: DistSupervisorOptions,
        specs: Vec<DistChildSpec>,
    ) -> Result<DistributedSupervisor> {
        if options.strategy == Strategy::SimpleOneForOne {
            return Err(Error::InitFailed {
                detail: "simple_one_for_one distributed supervisors start via start_simple".into(),
            });
        }
        Self::start_with(services, options, specs, None)
    }

    /// Start a `simple_one_for_one` distributed supervisor from a child
    /// template. Children are added via
    /// [`DistributedSupervisor::start_dynamic_child`].
    pub(crate) fn start_simple(
        services: DistServices,
        options: DistSupervisorOptions,
        template: DistChildSpec,
    ) -> Result<DistributedSupervisor> {
        if options.strategy != Strategy::SimpleOneForOne {
            return Err(Error::InitFailed {
                detail: "start_simple requires the simple_one_for_one strategy".into(),
            });
        }
        Self::start_with(services, options, Vec::new(), Some(template))
    }

    fn start_with(
        services: DistServices,
        options: DistSupervisorOptions,
        specs: Vec<DistChildSpec>,
        template: Option<DistChildSpec>,
    ) -> Result<DistributedSupervisor> {
        let inner = Arc::new(Mutex::new(DistInner {
            strategy: options.strategy,
            window: RestartWindow::new(options.max_restarts, options.within_ms),
            auto_shutdown: options.auto_shutdown,
            children: specs.into_iter().map(DistChildState::new).collect(),
            template,
            next_dynamic_id: 1,
            rr_counter: 0,
            stopping: false,
        }));
        let watched: WatchMap = Arc::new(Mutex::new(FxHashMap::default()));
        let events = Arc::new(EventHubD::default());
        let sup_cell: Arc<Mutex<Option<ServerRef>>> = Arc::new(Mutex::new(None));

        let max_restarts = options.max_restarts;
        let within_ms = options.within_ms;

        let init_services = services.clone();
        let init_inner = Arc::clone(&inner);
        let init_watched = Arc::clone(&watched);
        let init_cell = Arc::clone(&sup_cell);
        let init_events = Arc::clone(&events);

        let cast_services = services.clone();
        let cast_inner = Arc::clone(&inner);
        let cast_watched = Arc::clone(&watched);
        let cast_cell = Arc::clone(&sup_cell);
        let cast_events = Arc::clone(&events);

        let term_services = services.clone();
        let term_inner = Arc::clone(&inner);
        let term_watched = Arc::clone(&watched);
        let term_cell = Arc::clone(&sup_cell);
        let term_events = Arc::clone(&events);

        let behavior = Behavior::builder()
            .init(move |_| {
                let mut sup = init_inner.lock();
                // Bootstrap runs after the cell is filled, so the monitors
                // watch the supervisor's own process id.
                let watcher = init_cell.lock().clone().map(|s| s.id).unwrap_or(0);
                for i in 0..sup.children.len() {
                    if let Err(err) = start_child_at(
                        &init_services,
                        &mut sup,
                        i,
                        watcher,
                        &init_watched,
                        &init_events,
                    ) {
                        // NoAvailableNode leaves the child pending; any
                        // other failure aborts the supervisor start.
                        if !matches!(err, Error::NoAvailableNode { .. }) {
                            for j in (0..i).rev() {
                                stop_child(
                                    &init_services,
                                    &mut sup.children[j],
                                    &init_watched,
                                );
                            }
                            return Err(format!("child start failed: {}", err));
                        }
                    }
                }
                Ok(Term::Null)
            })
            .on_cast(move |msg, state| {
                let event = msg.get("event").and_then(Term::as_str).unwrap_or("");
                match event {
                    "process_down" => {
                        let monitor_id = msg
                            .get("monitor_id")
                            .and_then(Term::as_str)
                            .unwrap_or("")
                            .to_string();
                        let reason = msg
                            .get("reason")
                            .and_then(Term::as_str)
                            .unwrap_or("error")
                            .to_string();
                        let watcher = cast_cell.lock().clone().map(|s| s.id).unwrap_or(0);
                        let mut sup = cast_inner.lock();
                        if sup.stopping {
                            return Ok(state);
                        }
                        let child_id = match cast_watched.lock().remove(&monitor_id) {
                            Some(id) => id,
                            None => return Ok(state),
                        };
                        handle_child_down(
                            &cast_services,
                            &mut sup,
                            watcher,
                            &cast_watched,
                            &cast_events,
                            &child_id,
                            &reason,
                            max_restarts,
                            within_ms,
                        )?;
                        drop(sup);
                        maybe_auto_stop(&cast_services, &cast_inner, &cast_cell);
                    }
                    "node_down" => {
                        let node = msg
                            .get("node")
                            .and_then(Term::as_str)
                            .and_then(|s| NodeId::parse(s).ok());
                        if let Some(node) = node {
                            let sup = cast_inner.lock();
                            let affected: Vec<String> = sup
                                .children
                                .iter()
                                .filter(|c| c.node.as_ref() == Some(&node))
                                .map(|c| c.spec.id.clone())
                                .collect();
                            drop(sup);
                            if !affected.is_empty() {
                                warn!(
                                    "node {} down, affecting children {:?}",
                                    node, affected
                                );
                                cast_events.emit(&DistSupEvent::NodeFailureDetected {
                                    node,
                                    affected,
                                });
                            }
                        }
                        // Restarts are driven by the nodedown monitor fires.
                    }
                    "node_up" => {
                        // A node joined: retry children waiting for
                        // placement.
                        let watcher = cast_cell.lock().clone().map(|s| s.id).unwrap_or(0);
                        let mut sup = cast_inner.lock();
                        if !sup.stopping {
                            retry_awaiting(
                                &cast_services,
                                &mut sup,
                                watcher,
                                &cast_watched,
                                &cast_events,
                            );
                        }
                    }
                    _ => {}
                }
                Ok(state)
            })
            .on_terminate(move |_reason, _state| {
                let mut sup = term_inner.lock();
                sup.stopping = true;
                for i in (0..sup.children.len()).rev() {
                    stop_child(&term_services, &mut sup.children[i], &term_watched);
                }
                if let Some(server) = &*term_cell.lock() {
                    term_services.kernel.sup_index().unregister(server.id);
                }
                term_events.emit(&DistSupEvent::SupervisorStopped);
            })
            .build();

        // Child monitors need the supervisor's own ref as their watcher,
        // which does not exist until the process starts. start_shimmed
        // defers the child bootstrap to a first cast that runs after the
        // ref lands in the cell.
        let mut start_options = StartOptions::default();
        start_options.name = options.name.clone();
        let server = start_shimmed(&services.kernel, behavior, start_options, &sup_cell)?;

        let membership = services.membership.clone();
        let cast_target = server.clone();
        let event_kernel = services.kernel.clone();
        let membership_token = membership.subscribe(move |event| match event {
            ClusterEvent::NodeDown(node, _) => {
                event_kernel.cast(
                    &cast_target,
                    Term::object([
                        ("event", Term::str("node_down")),
                        ("node", Term::str(node.as_str())),
                    ]),
                );
            }
            ClusterEvent::NodeUp(info) => {
                event_kernel.cast(
                    &cast_target,
                    Term::object([
                        ("event", Term::str("node_up")),
                        ("node", Term::str(info.id.as_str())),
                    ]),
                );
            }
            ClusterEvent::StatusChange(_) => {}
        });

        // Observer index registration.
        let index_inner = Arc::clone(&inner);
        let index_name = options.name.clone();
        services.kernel.sup_index().register(
            server.id,
            Arc::new(move || {
                let sup = index_inner.lock();
                SupSnapshot {
                    name: index_name.clone(),
                    children: sup
                        .children
                        .iter()
                        .map(|c| {
                            (
                                c.spec.id.clone(),
                                c.server.as_ref().map(|s| s.id),
                                c.running,
                            )
                        })
                        .collect(),
                }
            }),
        );

        events.emit(&DistSupEvent::SupervisorStarted);
        info!("distributed supervisor {} started", server.id);

        Ok(DistributedSupervisor {
            services,
            server,
            inner,
            watched,
            events,
            membership_token,
        })
    }

    pub fn server_ref(&self) -> &ServerRef {
        &self.server
    }

    /// Subscribe to supervisor events.
    pub fn subscribe(&self, f: impl Fn(&DistSupEvent) + Send + Sync + 'static) -> u64 {
        self.events.subscribe(Arc::new(f))
    }

    /// Start a dynamic child from the `simple_one_for_one` template; the
    /// given args replace the template's init args.
    pub fn start_dynamic_child(&self, args: Term) -> Result<ServerRef> {
        let spec = {
            let mut sup = self.inner.lock();
            let template = sup.template.clone().ok_or_else(|| Error::InitFailed {
                detail: "supervisor has no dynamic child template".into(),
            })?;
            let id = format!("{}-{}", template.id, sup.next_dynamic_id);
            sup.next_dynamic_id += 1;
            DistChildSpec {
                id,
                init_args: args,
                ..template
            }
        };
        self.start_child(spec)
    }

    /// Add and start a child dynamically.
    pub fn start_child(&self, spec: DistChildSpec) -> Result<ServerRef> {
        let mut sup = self.inner.lock();
        if sup.children.iter().any(|c| c.spec.id == spec.id) {
            return Err(Error::RegistryConflict { name: spec.id });
        }
        sup.children.push(DistChildState::new(spec));
        let idx = sup.children.len() - 1;
        if let Err(err) = start_child_at(
            &self.services,
            &mut sup,
            idx,
            self.server.id,
            &self.watched,
            &self.events,
        ) {
            // A missing node leaves the child parked for the next join;
            // anything else is a hard failure and the spec is dropped.
            if !matches!(err, Error::NoAvailableNode { .. }) {
                sup.children.remove(idx);
            }
            return Err(err);
        }
        Ok(sup.children[idx]
            .server
            .clone()
            .expect("started child has a ref"))
    }

    /// Stop a child and remove its spec.
    pub fn terminate_child(&self, child_id: &str) -> Result<()> {
        let mut sup = self.inner.lock();
        let idx = sup
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| Error::ChildNotFound {
                id: child_id.to_string(),
            })?;
        stop_child(&self.services, &mut sup.children[idx], &self.watched);
        sup.children.remove(idx);
        Ok(())
    }

    /// Current children with their placements.
    pub fn children(&self) -> Vec<(String, Option<NodeId>, bool)> {
        self.inner
            .lock()
            .children
            .iter()
            .map(|c| (c.spec.id.clone(), c.node.clone(), c.running))
            .collect()
    }

    /// Stop the supervisor and all children (reverse order; remote stops
    /// are asynchronous).
    pub fn stop(&self) {
        self.services.membership.unsubscribe(self.membership_token);
        self.services
            .kernel
            .stop(&self.server, ExitReason::Shutdown);
    }
}

/// Start the supervisor process with its own ref visible to the child
/// bootstrap: the real init is deferred to a first `bootstrap` cast sent
/// after the ref has been stored in the cell, so every child monitor can
/// name the supervisor as its watcher.
fn start_shimmed(
    kernel: &Kernel,
    behavior: Behavior,
    options: StartOptions,
    cell: &Arc<Mutex<Option<ServerRef>>>,
) -> Result<ServerRef> {
    let call_behavior = behavior.clone();
    let server = kernel.start(
        Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_call(move |msg, state| (call_behavior.handle_call)(msg, state))
            .on_cast({
                let behavior = behavior.clone();
                move |msg, state| {
                    if msg.get("event").and_then(Term::as_str) == Some("bootstrap") {
                        (behavior.init)(Term::Null)
                    } else {
                        (behavior.handle_cast)(msg, state)
                    }
                }
            })
            .on_terminate({
                let behavior = behavior.clone();
                move |reason, state| {
                    if let Some(terminate) = &behavior.terminate {
                        terminate(reason, state);
                    }
                }
            })
            .build(),
        options,
    )?;
    *cell.lock() = Some(server.clone());
    kernel.cast(&server, Term::object([("event", Term::str("bootstrap"))]));
    Ok(server)
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

fn candidates(services: &DistServices) -> Vec<NodeId> {
    let mut nodes = services.membership.connected_nodes();
    nodes.push(services.local.clone());
    nodes.sort();
    nodes.dedup();
    nodes
}

fn place(
    services: &DistServices,
    sup: &mut DistInner,
    spec: &DistChildSpec,
) -> Result<NodeId> {
    let candidates = candidates(services);
    match &spec.selector {
        NodeSelector::Fixed(node) => {
            if candidates.contains(node) {
                Ok(node.clone())
            } else {
                Err(Error::NoAvailableNode {
                    child_id: spec.id.clone(),
                })
            }
        }
        NodeSelector::LocalFirst => Ok(services.local.clone()),
        NodeSelector::RoundRobin => {
            let node = candidates[sup.rr_counter % candidates.len()].clone();
            sup.rr_counter += 1;
            Ok(node)
        }
        NodeSelector::LeastLoaded => {
            let mut loads: Vec<(u64, NodeId)> = services
                .membership
                .node_stats()
                .into_iter()
                .map(|info| (info.process_count, info.id))
                .collect();
            loads.push((
                services.kernel.process_count() as u64,
                services.local.clone(),
            ));
            loads.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            Ok(loads[0].1.clone())
        }
        NodeSelector::Random => {
            let index = rand::random::<u64>() as usize % candidates.len();
            Ok(candidates[index].clone())
        }
        NodeSelector::Custom(select) => select(&candidates, &spec.id)
            .filter(|node| candidates.contains(node))
            .ok_or_else(|| Error::NoAvailableNode {
                child_id: spec.id.clone(),
            }),
    }
}

// ---------------------------------------------------------------------------
// Child lifecycle
// ---------------------------------------------------------------------------

/// Place, start, and monitor the child at `idx`. On `NoAvailableNode` the
/// child is marked as awaiting placement and the error is returned.
fn start_child_at(
    services: &DistServices,
    sup: &mut DistInner,
    idx: usize,
    watcher: u64,
    watched: &WatchMap,
    events: &EventHubD,
) -> Result<()> {
    let spec = sup.children[idx].spec.clone();
    let previous_node = sup.children[idx].node.clone();

    let node = match place(services, sup, &spec) {
        Ok(node) => node,
        Err(err) => {
            sup.children[idx].awaiting_node = true;
            return Err(err);
        }
    };

    let server = if node == services.local {
        let factory = services.catalog.get(&spec.behavior)?;
        let started = services.kernel.start(
            factory(),
            StartOptions {
                name: None,
                init_args: spec.init_args.clone(),
            },
        )?;
        if spec.register_global {
            if let Err(err) = services.global.register(&spec.id, started.id) {
                services.kernel.stop_async(&started, ExitReason::Shutdown);
                return Err(err);
            }
        }
        started
    } else {
        services.remote.spawn(
            &node,
            &spec.behavior,
            spec.init_args.clone(),
            SpawnOptions {
                register_name: spec.register_global.then(|| spec.id.clone()),
                register_global: spec.register_global,
            },
            services.remote.call_timeout,
        )?
    };

    let monitor_id = services.monitors.monitor(watcher, &server)?;
    watched.lock().insert(monitor_id.clone(), spec.id.clone());

    let child = &mut sup.children[idx];
    child.server = Some(server);
    child.node = Some(node.clone());
    child.monitor_id = Some(monitor_id);
    child.running = true;
    child.awaiting_node = false;

    events.emit(&DistSupEvent::ChildStarted {
        id: spec.id.clone(),
        node: node.clone(),
    });
    if let Some(previous) = previous_node {
        if previous != node {
            info!("child '{}' migrated {} -> {}", spec.id, previous, node);
            events.emit(&DistSupEvent::ChildMigrated {
                id: spec.id,
                from: previous,
                to: node,
            });
        }
    }
    Ok(())
}

/// Intentional stop: demonitor first so nothing routes back, then stop the
/// process where it lives.
fn stop_child(services: &DistServices, child: &mut DistChildState, watched: &WatchMap) {
    if let Some(monitor_id) = child.monitor_id.take() {
        watched.lock().remove(&monitor_id);
        services.monitors.demonitor(&monitor_id);
    }
    if let Some(server) = child.server.take() {
        match &child.node {
            Some(node) if node != &services.local => {
                // Remote children stop asynchronously; the exit signal is
                // fire-and-forget.
                services.remote.stop_remote(node, server.id);
            }
            _ => {
                let timeout =
                    std::time::Duration::from_millis(child.spec.shutdown_timeout_ms);
                if !services
                    .kernel
                    .stop_timeout(&server, ExitReason::Shutdown, timeout)
                {
                    services.kernel.abandon(server.id, ExitReason::Shutdown);
                }
            }
        }
    }
    child.node = None;
    child.running = false;
}

/// Monitor fired for a watched child: apply policy and strategy with
/// re-placement.
#[allow(clippy::too_many_arguments)]
fn handle_child_down(
    services: &DistServices,
    sup: &mut DistInner,
    watcher: u64,
    watched: &WatchMap,
    events: &EventHubD,
    child_id: &str,
    reason: &str,
    max_restarts: u32,
    within_ms: u64,
) -> std::result::Result<(), String> {
    let idx = match sup.children.iter().position(|c| c.spec.id == child_id) {
        Some(idx) => idx,
        None => return Ok(()),
    };
    sup.children[idx].server = None;
    sup.children[idx].monitor_id = None;
    sup.children[idx].running = false;

    events.emit(&DistSupEvent::ChildStopped {
        id: child_id.to_string(),
        reason: reason.to_string(),
    });

    let abnormal = matches!(reason, "error" | "nodedown" | "noproc");
    let policy = sup.children[idx].spec.restart;
    let should_restart = match policy {
        RestartPolicy::Permanent => true,
        RestartPolicy::Transient => abnormal,
        RestartPolicy::Temporary => false,
    };
    if !should_restart {
        if policy == RestartPolicy::Temporary {
            sup.children.remove(idx);
        }
        return Ok(());
    }

    if !sup.window.try_record() {
        for i in (0..sup.children.len()).rev() {
            stop_child(services, &mut sup.children[i], watched);
        }
        return Err(format!(
            "max restarts exceeded: {} within {} ms",
            max_restarts, within_ms
        ));
    }

    let restart_range = match sup.strategy {
        Strategy::OneForOne | Strategy::SimpleOneForOne => idx..idx + 1,
        Strategy::OneForAll => {
            for i in (0..sup.children.len()).rev() {
                if sup.children[i].running {
                    stop_child(services, &mut sup.children[i], watched);
                }
            }
            0..sup.children.len()
        }
        Strategy::RestForOne => {
            for i in (idx..sup.children.len()).rev() {
                if sup.children[i].running {
                    stop_child(services, &mut sup.children[i], watched);
                }
            }
            idx..sup.children.len()
        }
    };

    for i in restart_range {
        sup.children[i].restart_count += 1;
        let attempt = sup.children[i].restart_count;
        let id = sup.children[i].spec.id.clone();
        match start_child_at(services, sup, i, watcher, watched, events) {
            Ok(()) => {
                events.emit(&DistSupEvent::ChildRestarted { id, attempt });
            }
            Err(Error::NoAvailableNode { .. }) => {
                debug!("child '{}' has no node; deferring restart", id);
            }
            Err(err) => return Err(format!("restart of '{}' failed: {}", id, err)),
        }
    }
    Ok(())
}

/// Retry every child parked on `NoAvailableNode`.
fn retry_awaiting(
    services: &DistServices,
    sup: &mut DistInner,
    watcher: u64,
    watched: &WatchMap,
    events: &EventHubD,
) {
    for i in 0..sup.children.len() {
        if sup.children[i].awaiting_node && !sup.children[i].running {
            let id = sup.children[i].spec.id.clone();
            match start_child_at(services, sup, i, watcher, watched, events) {
                Ok(()) => info!("deferred child '{}' placed after node join", id),
                Err(err) => debug!("deferred child '{}' still unplaceable: {}", id, err),
            }
        }
    }
}

/// After a non-restarted significant child exit, stop the supervisor if the
/// auto-shutdown policy is met.
fn maybe_auto_stop(
    services: &DistServices,
    inner: &Arc<Mutex<DistInner>>,
    cell: &Arc<Mutex<Option<ServerRef>>>,
) {
    let should_stop = {
        let sup = inner.lock();
        // Children parked on placement are pending, not terminated.
        let done = |c: &DistChildState| c.spec.significant && !c.running && !c.awaiting_node;
        match sup.auto_shutdown {
            AutoShutdown::Never => false,
            AutoShutdown::AnySignificant => sup.children.iter().any(done),
            AutoShutdown::AllSignificant => {
                let significant: Vec<&DistChildState> = sup
                    .children
                    .iter()
                    .filter(|c| c.spec.significant)
                    .collect();
                !significant.is_empty() && significant.iter().all(|c| done(c))
            }
        }
    };
    if should_stop {
        if let Some(server) = &*cell.lock() {
            services.kernel.stop_async(server, ExitReason::Normal);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::calls::PendingTables;
    use crate::persist::SystemClock;
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn services() -> DistServices {
        let local = NodeId::parse(&format!("local@127.0.0.1:{}", free_port())).unwrap();
        let (transport, _events, _port) =
            Transport::start(local.clone(), "127.0.0.1", None, 50, 500).unwrap();
        let kernel = Kernel::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let catalog = Arc::new(BehaviorCatalog::new());
        let global = GlobalRegistry::new(local.clone(), clock.clone(), transport.clone());
        let membership = Membership::new(
            local.clone(),
            transport.clone(),
            kernel.clone(),
            clock.clone(),
            Duration::from_millis(500),
            Duration::from_millis(1500),
        );
        let remote = Remote {
            kernel: kernel.clone(),
            transport: transport.clone(),
            catalog: Arc::clone(&catalog),
            global: global.clone(),
            tables: Arc::new(PendingTables::new()),
            local: local.clone(),
            clock: clock.clone(),
            call_timeout: Duration::from_millis(500),
        };
        let monitors = Arc::new(Monitors::new(
            kernel.clone(),
            transport.clone(),
            local.clone(),
            clock.clone(),
        ));
        // Local exits must reach the monitor tables, as the node wires it.
        let event_monitors = Arc::clone(&monitors);
        kernel.events().subscribe(move |event| match event {
            crate::event::LifecycleEvent::Terminated { id, reason } => {
                event_monitors.on_local_exit(*id, reason);
            }
            crate::event::LifecycleEvent::Crashed { id, error } => {
                event_monitors.on_local_exit(*id, &ExitReason::Error(error.clone()));
            }
            crate::event::LifecycleEvent::Started { .. } => {}
        });

        DistServices {
            kernel,
            transport,
            remote,
            monitors,
            membership,
            global,
            catalog,
            local,
        }
    }

    use crate::persist::Clock;

    fn register_crashable(services: &DistServices) {
        services
            .catalog
            .register("worker", || {
                Behavior::builder()
                    .init(|args| Ok(args))
                    .on_call(|_, state| Ok((state.clone(), state)))
                    .on_cast(|msg, state| match msg.as_str() {
                        Some("boom") => Err("boom".into()),
                        _ => Ok(state),
                    })
                    .build()
            })
            .unwrap();
    }

    fn wait_until(ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn event_log(sup: &DistributedSupervisor) -> Arc<StdMutex<Vec<String>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        sup.subscribe(move |event| {
            let line = match event {
                DistSupEvent::SupervisorStarted => "started".to_string(),
                DistSupEvent::ChildStarted { id, .. } => format!("child_started:{}", id),
                DistSupEvent::ChildStopped { id, reason } => {
                    format!("child_stopped:{}:{}", id, reason)
                }
                DistSupEvent::ChildRestarted { id, attempt } => {
                    format!("child_restarted:{}:{}", id, attempt)
                }
                DistSupEvent::ChildMigrated { id, .. } => format!("child_migrated:{}", id),
                DistSupEvent::NodeFailureDetected { node, .. } => {
                    format!("node_failure:{}", node.name())
                }
                DistSupEvent::SupervisorStopped => "stopped".to_string(),
            };
            log2.lock().unwrap().push(line);
        });
        log
    }

    #[test]
    fn test_single_node_children_start_locally() {
        let services = services();
        register_crashable(&services);

        let sup = DistributedSupervisor::start(
            services.clone(),
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![
                DistChildSpec::new("w1", "worker").with_selector(NodeSelector::RoundRobin),
                DistChildSpec::new("w2", "worker").with_selector(NodeSelector::LeastLoaded),
            ],
        )
        .unwrap();

        assert!(wait_until(2000, || {
            sup.children().iter().all(|(_, node, running)| {
                *running && node.as_ref() == Some(&services.local)
            })
        }));
        sup.stop();
    }

    #[test]
    fn test_crashed_child_restarts_with_events() {
        let services = services();
        register_crashable(&services);

        let sup = DistributedSupervisor::start(
            services.clone(),
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![DistChildSpec::new("w1", "worker").with_selector(NodeSelector::LocalFirst)],
        )
        .unwrap();
        let log = event_log(&sup);

        assert!(wait_until(2000, || sup
            .children()
            .iter()
            .any(|(_, _, running)| *running)));

        // Crash the child via its local process.
        let child_info = services
            .kernel
            .sup_index()
            .snapshots()
            .into_iter()
            .find(|(id, _)| *id == sup.server_ref().id)
            .unwrap()
            .1;
        let child_pid = child_info.children[0].1.unwrap();
        services
            .kernel
            .cast(&ServerRef::local(child_pid), Term::str("boom"));

        assert!(wait_until(3000, || log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("child_restarted:w1"))));
        assert!(log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("child_stopped:w1:error")));
        sup.stop();
    }

    #[test]
    fn test_fixed_selector_unknown_node_defers() {
        let services = services();
        register_crashable(&services);
        let elsewhere = NodeId::parse("elsewhere@10.0.0.9:4369").unwrap();

        let sup = DistributedSupervisor::start(
            services,
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![DistChildSpec::new("w1", "worker")
                .with_selector(NodeSelector::Fixed(elsewhere))],
        )
        .unwrap();

        // The supervisor started, the child is parked without a node.
        std::thread::sleep(Duration::from_millis(200));
        let children = sup.children();
        assert_eq!(children.len(), 1);
        assert!(!children[0].2);
        sup.stop();
    }

    #[test]
    fn test_custom_selector() {
        let services = services();
        register_crashable(&services);
        let local = services.local.clone();

        let sup = DistributedSupervisor::start(
            services,
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![DistChildSpec::new("w1", "worker").with_selector(NodeSelector::Custom(
                Arc::new(move |candidates, child_id| {
                    assert_eq!(child_id, "w1");
                    candidates.first().cloned()
                }),
            ))],
        )
        .unwrap();

        assert!(wait_until(2000, || {
            sup.children()
                .iter()
                .any(|(_, node, running)| *running && node.as_ref() == Some(&local))
        }));
        sup.stop();
    }

    #[test]
    fn test_unknown_behavior_fails_start() {
        let services = services();
        let result = DistributedSupervisor::start(
            services,
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![DistChildSpec::new("w1", "ghost").with_selector(NodeSelector::LocalFirst)],
        );
        // The failure surfaces when the bootstrap cast runs; the supervisor
        // process itself crashes. Either way, no running child exists.
        if let Ok(sup) = result {
            assert!(wait_until(2000, || {
                sup.children().iter().all(|(_, _, running)| !running)
                    || !sup
                        .services
                        .kernel
                        .is_running(sup.server_ref().id)
            }));
        }
    }

    #[test]
    fn test_register_global_child() {
        let services = services();
        register_crashable(&services);

        let sup = DistributedSupervisor::start(
            services.clone(),
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![DistChildSpec::new("svc", "worker")
                .with_selector(NodeSelector::LocalFirst)
                .register_global(true)],
        )
        .unwrap();

        assert!(wait_until(2000, || services.global.is_registered("svc")));
        sup.stop();
    }

    #[test]
    fn test_simple_one_for_one_dynamic_children() {
        let services = services();
        register_crashable(&services);

        let sup = DistributedSupervisor::start_simple(
            services.clone(),
            DistSupervisorOptions::new(Strategy::SimpleOneForOne),
            DistChildSpec::new("job", "worker").with_selector(NodeSelector::LocalFirst),
        )
        .unwrap();

        // No static children; the template spawns them on demand.
        assert!(wait_until(2000, || sup.children().is_empty()));
        let a = sup.start_dynamic_child(Term::Int(1)).unwrap();
        let b = sup.start_dynamic_child(Term::Int(2)).unwrap();
        assert_eq!(sup.children().len(), 2);
        assert!(sup
            .children()
            .iter()
            .any(|(id, _, running)| id == "job-1" && *running));

        // Crashing one restarts only it, keeping its init args.
        services.kernel.cast(&a, Term::str("boom"));
        assert!(wait_until(3000, || {
            sup.children()
                .iter()
                .all(|(_, _, running)| *running)
                && services
                    .kernel
                    .call(&b, Term::Null, Duration::from_secs(5))
                    .map(|v| v == Term::Int(2))
                    .unwrap_or(false)
        }));

        // The plain constructor refuses the simple strategy.
        assert!(DistributedSupervisor::start(
            services,
            DistSupervisorOptions::new(Strategy::SimpleOneForOne),
            vec![],
        )
        .is_err());
        sup.stop();
    }

    #[test]
    fn test_terminate_child_removes_it() {
        let services = services();
        register_crashable(&services);

        let sup = DistributedSupervisor::start(
            services,
            DistSupervisorOptions::new(Strategy::OneForOne),
            vec![
                DistChildSpec::new("w1", "worker").with_selector(NodeSelector::LocalFirst),
                DistChildSpec::new("w2", "worker").with_selector(NodeSelector::LocalFirst),
            ],
        )
        .unwrap();
        assert!(wait_until(2000, || sup
            .children()
            .iter()
            .all(|(_, _, running)| *running)));

        sup.terminate_child("w1").unwrap();
        assert_eq!(sup.children().len(), 1);
        assert!(matches!(
            sup.terminate_child("w1").unwrap_err(),
            Error::ChildNotFound { .. }
        ));
        sup.stop();
    }
}
