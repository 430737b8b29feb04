//! Node assembly: one runtime instance wired into a cluster.
//!
//! A [`Node`] owns a kernel, a behavior catalog, and -- once started -- the
//! transport, membership, global registry, remote messaging tables, and
//! monitor tables. Construction and start are two phases so the catalog can
//! be populated before the cluster is reachable: a spawn request arriving
//! for an unregistered behavior is answered with an explicit error, never a
//! stub.
//!
//! The router thread consumes transport events and dispatches inbound
//! messages to their subsystems. Calls and spawns suspend while resolving
//! locally, so they run on short-lived worker threads; everything else is
//! non-blocking and handled inline.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, info};
use parking_lot::Mutex;

use hive_wire::{ClusterMessage, NodeId, Term, WireEnvelope};

use crate::actor::behavior::{Behavior, BehaviorCatalog};
use crate::actor::calls::PendingTables;
use crate::actor::kernel::{Kernel, KernelOptions, StartOptions};
use crate::actor::observer::{observer_behavior, OBSERVER_NAME};
use crate::actor::process::{ExitReason, ServerRef};
use crate::config::ClusterConfig;
use crate::dist::global::GlobalRegistry;
use crate::dist::membership::{ClusterEvent, ClusterStatus, Membership};
use crate::dist::monitor::Monitors;
use crate::dist::remote::{Remote, SpawnOptions};
use crate::dist::supervisor::{
    DistChildSpec, DistServices, DistSupervisorOptions, DistributedSupervisor,
};
use crate::dist::transport::{Transport, TransportEvent};
use crate::error::{Error, Result};
use crate::event::LifecycleEvent;
use crate::persist::{Clock, StorageAdapter, SystemClock};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Injectable collaborators for a node.
pub struct NodeOptions {
    pub clock: Arc<dyn Clock>,
    pub storage: Option<Arc<dyn StorageAdapter>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            clock: Arc::new(SystemClock),
            storage: None,
        }
    }
}

/// Everything that exists only while the cluster is running.
struct Started {
    transport: Transport,
    membership: Membership,
    global: GlobalRegistry,
    remote: Remote,
    monitors: Arc<Monitors>,
    router: Option<std::thread::JoinHandle<()>>,
    kernel_event_token: u64,
}

/// One runtime instance.
pub struct Node {
    config: ClusterConfig,
    id: NodeId,
    kernel: Kernel,
    catalog: Arc<BehaviorCatalog>,
    clock: Arc<dyn Clock>,
    started: Mutex<Option<Started>>,
}

impl Node {
    /// Validate the configuration and build the node. The cluster is not
    /// reachable until [`Node::start`]; use the window in between to
    /// populate the behavior catalog.
    pub fn new(config: ClusterConfig) -> Result<Node> {
        Node::with_options(config, NodeOptions::default())
    }

    pub fn with_options(config: ClusterConfig, options: NodeOptions) -> Result<Node> {
        let id = config.validate()?;
        let kernel = Kernel::with_options(KernelOptions {
            storage: options.storage,
            clock: Arc::clone(&options.clock),
            mailbox_high_watermark: config.mailbox_high_watermark,
        });

        let node = Node {
            config,
            id: id.clone(),
            kernel: kernel.clone(),
            catalog: Arc::new(BehaviorCatalog::new()),
            clock: options.clock,
            started: Mutex::new(None),
        };

        // The observer answers snapshot queries under its well-known name
        // from the moment the node exists.
        kernel.start(
            observer_behavior(kernel.clone(), Some(id)),
            StartOptions::named(OBSERVER_NAME),
        )?;

        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn catalog(&self) -> &BehaviorCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Convenience for starting a local server.
    pub fn start_server(&self, behavior: Behavior, options: StartOptions) -> Result<ServerRef> {
        self.kernel.start(behavior, options)
    }

    // -----------------------------------------------------------------------
    // Cluster lifecycle
    // -----------------------------------------------------------------------

    /// Bind the transport, dial the seeds, and begin participating in the
    /// cluster.
    pub fn start(&self) -> Result<()> {
        let mut started = self.started.lock();
        if started.is_some() {
            return Ok(());
        }

        let (transport, events, _port) = Transport::start(
            self.id.clone(),
            &self.config.host,
            self.config.cluster_secret.clone(),
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        )
        .map_err(|e| Error::InvalidClusterConfig(format!("bind failed: {}", e)))?;

        let membership = Membership::new(
            self.id.clone(),
            transport.clone(),
            self.kernel.clone(),
            Arc::clone(&self.clock),
            self.config.heartbeat_interval(),
            self.config.heartbeat_deadline(),
        );
        let global = GlobalRegistry::new(
            self.id.clone(),
            Arc::clone(&self.clock),
            transport.clone(),
        );
        let remote = Remote {
            kernel: self.kernel.clone(),
            transport: transport.clone(),
            catalog: Arc::clone(&self.catalog),
            global: global.clone(),
            tables: Arc::new(PendingTables::new()),
            local: self.id.clone(),
            clock: Arc::clone(&self.clock),
            call_timeout: Duration::from_millis(self.config.call_timeout_ms),
        };
        let monitors = Arc::new(Monitors::new(
            self.kernel.clone(),
            transport.clone(),
            self.id.clone(),
            Arc::clone(&self.clock),
        ));

        // Local terminations feed the monitor/link tables.
        let event_monitors = Arc::clone(&monitors);
        let kernel_event_token = self.kernel.events().subscribe(move |event| match event {
            LifecycleEvent::Terminated { id, reason } => {
                event_monitors.on_local_exit(*id, reason);
            }
            LifecycleEvent::Crashed { id, error } => {
                event_monitors.on_local_exit(*id, &ExitReason::Error(error.clone()));
            }
            LifecycleEvent::Started { .. } => {}
        });

        // Node-level events feed the registry, the pending tables, and the
        // monitor tables.
        let sub_global = global.clone();
        let sub_remote = remote.clone();
        let sub_monitors = Arc::clone(&monitors);
        membership.subscribe(move |event| match event {
            ClusterEvent::NodeUp(node_info) => {
                sub_global.on_node_up(&node_info.id);
            }
            ClusterEvent::NodeDown(node, _) => {
                sub_global.on_node_down(node);
                sub_remote.on_node_down(node);
                sub_monitors.on_node_down(node);
            }
            ClusterEvent::StatusChange(_) => {}
        });

        let router = {
            let membership = membership.clone();
            let remote = remote.clone();
            let global = global.clone();
            let monitors = Arc::clone(&monitors);
            std::thread::Builder::new()
                .name(format!("hive-router-{}", self.id.name()))
                .spawn(move || router_loop(events, membership, remote, global, monitors))
                .map_err(|e| Error::InvalidClusterConfig(format!("router spawn failed: {}", e)))?
        };

        let seeds = self.config.seed_ids(&self.id)?;
        membership.start(&seeds);
        info!("node {} started with {} seed(s)", self.id, seeds.len());

        *started = Some(Started {
            transport,
            membership,
            global,
            remote,
            monitors,
            router: Some(router),
            kernel_event_token,
        });
        Ok(())
    }

    /// Leave the cluster: announce departure, stop the subsystems in
    /// reverse dependency order, then stop every local process.
    pub fn stop(&self) {
        let started = self.started.lock().take();
        if let Some(mut started) = started {
            info!("node {} stopping", self.id);
            started.transport.broadcast(&WireEnvelope::new(
                self.id.clone(),
                self.clock.now_ms(),
                ClusterMessage::NodeDown {
                    node: self.id.clone(),
                    reason: "graceful_shutdown".to_string(),
                },
            ));
            started.membership.stop();
            started.transport.stop();
            if let Some(router) = started.router.take() {
                let _ = router.join();
            }
            self.kernel.events().unsubscribe(started.kernel_event_token);
        }
        self.kernel.shutdown_all(Duration::from_secs(5));
    }

    pub fn status(&self) -> ClusterStatus {
        match &*self.started.lock() {
            Some(started) => started.membership.status(),
            None => ClusterStatus::Starting,
        }
    }

    fn started<T>(&self, f: impl FnOnce(&Started) -> T) -> Result<T> {
        match &*self.started.lock() {
            Some(started) => Ok(f(started)),
            None => Err(Error::ClusterNotStarted),
        }
    }

    // -----------------------------------------------------------------------
    // Cluster operations
    // -----------------------------------------------------------------------

    /// Dial a peer outside the seed list.
    pub fn connect(&self, peer: &NodeId) -> Result<()> {
        self.started(|s| s.transport.connect(peer))
    }

    pub fn connected_nodes(&self) -> Result<Vec<NodeId>> {
        self.started(|s| s.membership.connected_nodes())
    }

    pub fn subscribe_cluster(
        &self,
        f: impl Fn(&ClusterEvent) + Send + Sync + 'static,
    ) -> Result<u64> {
        self.started(|s| s.membership.subscribe(f))
    }

    /// The cluster-wide name registry.
    pub fn global(&self) -> Result<GlobalRegistry> {
        self.started(|s| s.global.clone())
    }

    /// Location-transparent call: local refs resolve through the kernel,
    /// remote refs through the wire.
    pub fn call(&self, target: &ServerRef, msg: Term, timeout: Duration) -> Result<Term> {
        match &target.node {
            None => self.kernel.call(target, msg, timeout),
            Some(node) if node == &self.id => {
                self.kernel.call(&ServerRef::local(target.id), msg, timeout)
            }
            Some(node) => {
                let remote = self.started(|s| s.remote.clone())?;
                remote.call(node, target.id, msg, timeout)
            }
        }
    }

    /// Location-transparent cast. Remote delivery failure is silent.
    pub fn cast(&self, target: &ServerRef, msg: Term) {
        match &target.node {
            None => self.kernel.cast(target, msg),
            Some(node) if node == &self.id => self.kernel.cast(&ServerRef::local(target.id), msg),
            Some(node) => {
                if let Ok(remote) = self.started(|s| s.remote.clone()) {
                    remote.cast(node, target.id, msg);
                }
            }
        }
    }

    /// Call a globally registered server by name.
    pub fn call_global(&self, name: &str, msg: Term, timeout: Duration) -> Result<Term> {
        let target = self.global()?.lookup(name)?;
        self.call(&target, msg, timeout)
    }

    /// Start a cataloged behavior on a peer (or locally when `node` is us).
    pub fn spawn_at(
        &self,
        node: &NodeId,
        behavior: &str,
        init_args: Term,
        options: SpawnOptions,
    ) -> Result<ServerRef> {
        if node == &self.id {
            return self.spawn_local(behavior, init_args, options);
        }
        let remote = self.started(|s| s.remote.clone())?;
        let timeout = remote.call_timeout;
        remote.spawn(node, behavior, init_args, options, timeout)
    }

    fn spawn_local(&self, behavior: &str, init_args: Term, options: SpawnOptions) -> Result<ServerRef> {
        let factory = self.catalog.get(behavior)?;
        let server = self.kernel.start(
            factory(),
            StartOptions {
                name: options.register_name.clone(),
                init_args,
            },
        )?;
        if options.register_global {
            let name = options.register_name.ok_or_else(|| Error::SpawnFailed {
                detail: "global registration requires a name".to_string(),
            })?;
            let global = self.global()?;
            if let Err(err) = global.register(&name, server.id) {
                self.kernel.stop_async(&server, ExitReason::Shutdown);
                return Err(err);
            }
        }
        Ok(server)
    }

    /// Watch a process anywhere in the cluster. The watcher (a local
    /// process) receives a `process_down` message when the target
    /// terminates or its node is lost.
    pub fn monitor(&self, watcher: &ServerRef, target: &ServerRef) -> Result<String> {
        let monitors = self.started(|s| Arc::clone(&s.monitors))?;
        monitors.monitor(watcher.id, target)
    }

    pub fn demonitor(&self, monitor_id: &str) -> Result<()> {
        let monitors = self.started(|s| Arc::clone(&s.monitors))?;
        monitors.demonitor(monitor_id);
        Ok(())
    }

    /// Link a local process to a process anywhere in the cluster.
    pub fn link(&self, local: &ServerRef, target: &ServerRef) -> Result<String> {
        let monitors = self.started(|s| Arc::clone(&s.monitors))?;
        monitors.link(local.id, target)
    }

    pub fn unlink(&self, link_id: &str) -> Result<()> {
        let monitors = self.started(|s| Arc::clone(&s.monitors))?;
        monitors.unlink(link_id);
        Ok(())
    }

    /// Start a distributed supervisor on this node.
    pub fn start_distributed_supervisor(
        &self,
        options: DistSupervisorOptions,
        specs: Vec<DistChildSpec>,
    ) -> Result<DistributedSupervisor> {
        DistributedSupervisor::start(self.dist_services()?, options, specs)
    }

    /// Start a `simple_one_for_one` distributed supervisor from a template.
    pub fn start_simple_distributed_supervisor(
        &self,
        options: DistSupervisorOptions,
        template: DistChildSpec,
    ) -> Result<DistributedSupervisor> {
        DistributedSupervisor::start_simple(self.dist_services()?, options, template)
    }

    fn dist_services(&self) -> Result<DistServices> {
        self.started(|s| DistServices {
            kernel: self.kernel.clone(),
            transport: s.transport.clone(),
            remote: s.remote.clone(),
            monitors: Arc::clone(&s.monitors),
            membership: s.membership.clone(),
            global: s.global.clone(),
            catalog: Arc::clone(&self.catalog),
            local: self.id.clone(),
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Idempotent; a stopped node is a no-op.
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn router_loop(
    events: Receiver<TransportEvent>,
    membership: Membership,
    remote: Remote,
    global: GlobalRegistry,
    monitors: Arc<Monitors>,
) {
    for event in events {
        match event {
            TransportEvent::Stopped => break,
            TransportEvent::PeerUp(peer) => membership.on_peer_up(&peer),
            TransportEvent::PeerDown(peer, cause) => membership.on_peer_down(&peer, cause),
            TransportEvent::Message(from, envelope) => {
                route(&membership, &remote, &global, &monitors, from, envelope)
            }
        }
    }
    debug!("router loop ended");
}

fn route(
    membership: &Membership,
    remote: &Remote,
    global: &GlobalRegistry,
    monitors: &Arc<Monitors>,
    from: NodeId,
    envelope: WireEnvelope,
) {
    match envelope.payload {
        ClusterMessage::Heartbeat {
            uptime_ms,
            process_count,
            peers,
        } => membership.on_heartbeat(&from, uptime_ms, process_count, &peers),

        // Enqueues in arrival order; only the reply wait leaves this thread.
        ClusterMessage::Call {
            call_id,
            target_id,
            payload,
        } => remote.handle_call_request(&from, call_id, target_id, payload),

        // Spawns suspend while resolving; never block the router.
        ClusterMessage::SpawnRequest {
            spawn_id,
            behavior,
            init_args,
            register_name,
            register_global,
        } => {
            let remote = remote.clone();
            let _ = std::thread::Builder::new()
                .name("hive-spawn-worker".to_string())
                .spawn(move || {
                    remote.handle_spawn_request(
                        &from,
                        spawn_id,
                        behavior,
                        init_args,
                        register_name,
                        register_global,
                    )
                });
        }

        ClusterMessage::Cast { target_id, payload } => {
            remote.handle_cast_request(target_id, payload)
        }
        ClusterMessage::CallReply { call_id, payload } => {
            remote.handle_call_reply(&call_id, payload)
        }
        ClusterMessage::CallError {
            call_id,
            kind,
            detail,
        } => remote.handle_call_error(&call_id, kind, detail),
        ClusterMessage::SpawnReply {
            spawn_id,
            server_id,
        } => remote.handle_spawn_reply(&spawn_id, server_id),
        ClusterMessage::SpawnError {
            spawn_id,
            kind,
            detail,
        } => remote.handle_spawn_error(&spawn_id, kind, detail),

        ClusterMessage::MonitorRequest {
            monitor_id,
            watcher_id,
            target_id,
        } => monitors.handle_monitor_request(&from, monitor_id, watcher_id, target_id),
        ClusterMessage::MonitorAck { monitor_id } => {
            debug!("monitor {} acknowledged by {}", monitor_id, from)
        }
        ClusterMessage::DemonitorRequest { monitor_id } => {
            monitors.handle_demonitor_request(&monitor_id)
        }
        ClusterMessage::ProcessDown {
            monitor_id,
            reason,
            detail,
        } => monitors.handle_process_down(&monitor_id, reason, detail),
        ClusterMessage::LinkRequest {
            link_id,
            from_id,
            target_id,
        } => monitors.handle_link_request(&from, link_id, from_id, target_id),
        ClusterMessage::LinkAck { link_id } => {
            debug!("link {} acknowledged by {}", link_id, from)
        }
        ClusterMessage::UnlinkRequest { link_id } => monitors.handle_unlink_request(&link_id),
        ClusterMessage::ExitSignal {
            link_id,
            target_id,
            reason,
            detail,
        } => monitors.handle_exit_signal(link_id.as_deref(), target_id, reason, detail),

        ClusterMessage::RegistrySync { entries, full_sync } => {
            global.merge(entries, full_sync, &from)
        }
        ClusterMessage::NodeDown { node, reason } => {
            membership.on_node_down_announcement(&node, &reason)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::child_spec::Strategy;
    use crate::dist::supervisor::{DistSupEvent, NodeSelector};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(name: &str, seeds: Vec<String>) -> ClusterConfig {
        let mut cfg = ClusterConfig::new(name);
        cfg.host = "127.0.0.1".into();
        cfg.port = free_port();
        cfg.seeds = seeds;
        cfg.heartbeat_interval_ms = 150;
        cfg.heartbeat_miss_threshold = 3;
        cfg.reconnect_base_delay_ms = 100;
        cfg.reconnect_max_delay_ms = 1000;
        cfg
    }

    fn wait_until(ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn counter_behavior() -> Behavior {
        Behavior::builder()
            .init(|args| Ok(args))
            .on_call(|msg, state| match msg.as_str() {
                Some("get") => Ok((state.clone(), state)),
                Some("slow") => {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok((state.clone(), state))
                }
                Some("hang") => {
                    std::thread::sleep(Duration::from_secs(30));
                    Ok((state.clone(), state))
                }
                Some("fail") => Err("handler failure".into()),
                _ => Ok((Term::Null, state)),
            })
            .on_cast(|msg, state| match msg.as_str() {
                Some("inc") => Ok(Term::Int(state.as_i64().unwrap_or(0) + 1)),
                _ => Ok(state),
            })
            .build()
    }

    fn register_counter(node: &Node) {
        node.catalog().register("counter", counter_behavior).unwrap();
    }

    fn two_connected_nodes() -> (Node, Node) {
        let a = Node::new(config("alpha", vec![])).unwrap();
        register_counter(&a);
        a.start().unwrap();
        let b = Node::new(config("beta", vec![a.id().to_string()])).unwrap();
        register_counter(&b);
        b.start().unwrap();

        assert!(wait_until(5000, || {
            a.connected_nodes().map(|n| n.len()).unwrap_or(0) == 1
                && b.connected_nodes().map(|n| n.len()).unwrap_or(0) == 1
        }));
        (a, b)
    }

    #[test]
    fn test_cluster_ops_before_start_fail() {
        let node = Node::new(config("alpha", vec![])).unwrap();
        assert!(matches!(
            node.connected_nodes(),
            Err(Error::ClusterNotStarted)
        ));
        assert!(matches!(node.global(), Err(Error::ClusterNotStarted)));
        assert_eq!(node.status(), ClusterStatus::Starting);
    }

    #[test]
    fn test_local_ops_work_before_start() {
        let node = Node::new(config("alpha", vec![])).unwrap();
        let server = node
            .start_server(counter_behavior(), StartOptions::with_args(Term::Int(0)))
            .unwrap();
        node.cast(&server, Term::str("inc"));
        let reply = node
            .call(&server, Term::str("get"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply, Term::Int(1));
        // The observer is registered under its well-known name.
        assert!(node.kernel().registry().whereis(OBSERVER_NAME).is_some());
    }

    #[test]
    fn test_two_nodes_form_cluster() {
        let (a, b) = two_connected_nodes();
        assert_eq!(a.connected_nodes().unwrap(), vec![b.id().clone()]);
        assert_eq!(b.connected_nodes().unwrap(), vec![a.id().clone()]);
        assert_eq!(a.status(), ClusterStatus::Running);
        b.stop();
        a.stop();
    }

    #[test]
    fn test_gossip_discovers_third_node() {
        let a = Node::new(config("alpha", vec![])).unwrap();
        a.start().unwrap();
        let b = Node::new(config("beta", vec![a.id().to_string()])).unwrap();
        b.start().unwrap();
        // Gamma only knows alpha; beta must arrive via gossip.
        let c = Node::new(config("gamma", vec![a.id().to_string()])).unwrap();
        c.start().unwrap();

        assert!(wait_until(8000, || {
            c.connected_nodes().map(|n| n.len()).unwrap_or(0) == 2
                && b.connected_nodes().map(|n| n.len()).unwrap_or(0) == 2
        }));
        c.stop();
        b.stop();
        a.stop();
    }

    #[test]
    fn test_remote_spawn_and_call() {
        let (a, b) = two_connected_nodes();

        let server = a
            .spawn_at(
                b.id(),
                "counter",
                Term::Int(10),
                SpawnOptions {
                    register_name: Some("remote-counter".into()),
                    register_global: false,
                },
            )
            .unwrap();
        assert_eq!(server.node.as_ref(), Some(b.id()));

        // A normal remote call returns the handler's reply.
        a.cast(&server, Term::str("inc"));
        a.cast(&server, Term::str("inc"));
        let reply = a
            .call(&server, Term::str("get"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply, Term::Int(12));

        // The name registered on the receiving node.
        assert!(b.kernel().registry().whereis("remote-counter").is_some());
        b.stop();
        a.stop();
    }

    #[test]
    fn test_remote_spawn_unknown_behavior() {
        let (a, b) = two_connected_nodes();
        let err = a
            .spawn_at(b.id(), "ghost", Term::Null, SpawnOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::BehaviorNotFound { .. }));
        b.stop();
        a.stop();
    }

    #[test]
    fn test_remote_call_timeout() {
        let (a, b) = two_connected_nodes();
        let server = a
            .spawn_at(b.id(), "counter", Term::Int(0), SpawnOptions::default())
            .unwrap();

        // The handler never replies in time.
        let err = a
            .call(&server, Term::str("hang"), Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CallTimeout { timeout_ms: 300, .. }
        ));
        b.stop();
        a.stop();
    }

    #[test]
    fn test_remote_call_transports_application_error() {
        let (a, b) = two_connected_nodes();
        let server = a
            .spawn_at(b.id(), "counter", Term::Int(0), SpawnOptions::default())
            .unwrap();
        let err = a
            .call(&server, Term::str("fail"), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::CallFailed { detail } if detail.contains("handler failure")));
        b.stop();
        a.stop();
    }

    #[test]
    fn test_node_loss_rejects_inflight_call() {
        let (a, b) = two_connected_nodes();
        let a = Arc::new(a);
        let server = a
            .spawn_at(b.id(), "counter", Term::Int(0), SpawnOptions::default())
            .unwrap();

        // The peer dies mid-call; the caller sees NodeNotReachable
        // well before its own timeout.
        let caller = Arc::clone(&a);
        let in_flight = std::thread::spawn(move || {
            caller.call(&server, Term::str("hang"), Duration::from_secs(20))
        });

        std::thread::sleep(Duration::from_millis(300));
        b.stop();

        let result = in_flight.join().unwrap();
        assert!(matches!(result, Err(Error::NodeNotReachable { .. })));
        a.stop();
    }

    #[test]
    fn test_global_registry_lww_earlier_wins() {
        // A registers at T, B registered at T-1; everyone converges on
        // B's ref and A observes a conflictResolved event.
        struct ManualClock(AtomicU64);
        impl Clock for ManualClock {
            fn now_ms(&self) -> i64 {
                self.0.load(Ordering::Relaxed) as i64
            }
        }

        let clock_a = Arc::new(ManualClock(AtomicU64::new(2000)));
        let clock_b = Arc::new(ManualClock(AtomicU64::new(1000)));

        let a = Node::with_options(
            config("alpha", vec![]),
            NodeOptions {
                clock: clock_a,
                storage: None,
            },
        )
        .unwrap();
        register_counter(&a);
        a.start().unwrap();

        let b = Node::with_options(
            config("beta", vec![]),
            NodeOptions {
                clock: clock_b,
                storage: None,
            },
        )
        .unwrap();
        register_counter(&b);
        b.start().unwrap();

        // Both register before the nodes ever meet.
        let server_a = a.start_server(counter_behavior(), StartOptions::default()).unwrap();
        let server_b = b.start_server(counter_behavior(), StartOptions::default()).unwrap();
        a.global().unwrap().register("svc", server_a.id).unwrap();
        b.global().unwrap().register("svc", server_b.id).unwrap();

        let conflicts: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let conflicts2 = Arc::clone(&conflicts);
        a.global().unwrap().subscribe(move |event| {
            if let crate::dist::global::GlobalEvent::ConflictResolved { winner, .. } = event {
                conflicts2.lock().unwrap().push(winner.name().to_string());
            }
        });

        // Now introduce them.
        a.connect(b.id()).unwrap();
        assert!(wait_until(5000, || {
            let a_view = a.global().unwrap().whereis("svc");
            let b_view = b.global().unwrap().whereis("svc");
            match (a_view, b_view) {
                (Some(av), Some(bv)) => {
                    av.node.as_ref() == Some(b.id())
                        && bv.node.as_ref() == Some(b.id())
                        && av.id == server_b.id
                        && bv.id == server_b.id
                }
                _ => false,
            }
        }));
        assert_eq!(*conflicts.lock().unwrap(), vec!["beta".to_string()]);
        b.stop();
        a.stop();
    }

    #[test]
    fn test_global_unregister_propagates() {
        let (a, b) = two_connected_nodes();
        let server = a.start_server(counter_behavior(), StartOptions::default()).unwrap();
        a.global().unwrap().register("svc", server.id).unwrap();

        assert!(wait_until(5000, || b.global().unwrap().is_registered("svc")));

        a.global().unwrap().unregister("svc").unwrap();
        assert!(wait_until(5000, || !b.global().unwrap().is_registered("svc")));
        b.stop();
        a.stop();
    }

    #[test]
    fn test_global_cleanup_on_node_loss() {
        let (a, b) = two_connected_nodes();
        let server = b.start_server(counter_behavior(), StartOptions::default()).unwrap();
        b.global().unwrap().register("b-svc", server.id).unwrap();
        assert!(wait_until(5000, || a.global().unwrap().is_registered("b-svc")));

        b.stop();
        assert!(wait_until(5000, || !a.global().unwrap().is_registered("b-svc")));
        a.stop();
    }

    #[test]
    fn test_remote_monitor_fires_on_process_exit() {
        let (a, b) = two_connected_nodes();
        let target = a
            .spawn_at(b.id(), "counter", Term::Int(0), SpawnOptions::default())
            .unwrap();

        let seen: Arc<StdMutex<Vec<Term>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let watcher = a
            .start_server(
                Behavior::builder()
                    .init(|_| Ok(Term::Null))
                    .on_cast(move |msg, state| {
                        seen2.lock().unwrap().push(msg);
                        Ok(state)
                    })
                    .build(),
                StartOptions::default(),
            )
            .unwrap();

        a.monitor(&watcher, &target).unwrap();
        // Crash the remote process.
        a.cast(&target, Term::str("nonsense"));
        let _ = a.call(&target, Term::str("fail"), Duration::from_secs(5));

        assert!(wait_until(5000, || !seen.lock().unwrap().is_empty()));
        let messages = seen.lock().unwrap();
        assert_eq!(
            messages[0].get("event"),
            Some(&Term::str("process_down"))
        );
        assert_eq!(messages[0].get("reason"), Some(&Term::str("error")));
        drop(messages);
        b.stop();
        a.stop();
    }

    #[test]
    fn test_remote_monitor_fires_nodedown() {
        let (a, b) = two_connected_nodes();
        let target = a
            .spawn_at(b.id(), "counter", Term::Int(0), SpawnOptions::default())
            .unwrap();

        let seen: Arc<StdMutex<Vec<Term>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let watcher = a
            .start_server(
                Behavior::builder()
                    .init(|_| Ok(Term::Null))
                    .on_cast(move |msg, state| {
                        seen2.lock().unwrap().push(msg);
                        Ok(state)
                    })
                    .build(),
                StartOptions::default(),
            )
            .unwrap();
        a.monitor(&watcher, &target).unwrap();

        b.stop();
        assert!(wait_until(5000, || !seen.lock().unwrap().is_empty()));
        assert_eq!(
            seen.lock().unwrap()[0].get("reason"),
            Some(&Term::str("nodedown"))
        );
        a.stop();
    }

    #[test]
    fn test_distributed_supervisor_failover() {
        // Three nodes, three round-robin children, supervisor on A.
        // Killing B fires the B-hosted child's monitor with nodedown; the
        // child migrates to a surviving node; nobody else restarts.
        let a = Node::new(config("alpha", vec![])).unwrap();
        register_counter(&a);
        a.start().unwrap();
        let b = Node::new(config("beta", vec![a.id().to_string()])).unwrap();
        register_counter(&b);
        b.start().unwrap();
        let c = Node::new(config("gamma", vec![a.id().to_string()])).unwrap();
        register_counter(&c);
        c.start().unwrap();

        assert!(wait_until(8000, || a
            .connected_nodes()
            .map(|n| n.len())
            .unwrap_or(0)
            == 2));

        let sup = a
            .start_distributed_supervisor(
                DistSupervisorOptions::new(Strategy::OneForOne),
                vec![
                    DistChildSpec::new("w1", "counter").with_selector(NodeSelector::RoundRobin),
                    DistChildSpec::new("w2", "counter").with_selector(NodeSelector::RoundRobin),
                    DistChildSpec::new("w3", "counter").with_selector(NodeSelector::RoundRobin),
                ],
            )
            .unwrap();

        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let events2 = Arc::clone(&events);
        sup.subscribe(move |event| {
            let line = match event {
                DistSupEvent::ChildMigrated { id, from, to } => {
                    format!("migrated:{}:{}:{}", id, from.name(), to.name())
                }
                DistSupEvent::ChildRestarted { id, .. } => format!("restarted:{}", id),
                DistSupEvent::NodeFailureDetected { node, affected } => {
                    format!("failure:{}:{}", node.name(), affected.len())
                }
                _ => return,
            };
            events2.lock().unwrap().push(line);
        });

        // All three children placed, one per node.
        assert!(wait_until(8000, || {
            let children = sup.children();
            children.len() == 3 && children.iter().all(|(_, node, running)| {
                *running && node.is_some()
            })
        }));
        let placements: Vec<(String, NodeId)> = sup
            .children()
            .into_iter()
            .map(|(id, node, _)| (id, node.unwrap()))
            .collect();
        let hosted_on_b: Vec<String> = placements
            .iter()
            .filter(|(_, node)| node == b.id())
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(hosted_on_b.len(), 1, "round robin puts one child on b");
        let moved = hosted_on_b[0].clone();

        b.stop();

        // The B child migrates to one of the survivors.
        assert!(wait_until(10000, || {
            sup.children().into_iter().any(|(id, node, running)| {
                id == moved
                    && running
                    && node.map(|n| n != *b.id()).unwrap_or(false)
            })
        }));
        let log = events.lock().unwrap().clone();
        assert!(log.iter().any(|l| l.starts_with(&format!("migrated:{}:beta", moved))));
        // Only the B-hosted child restarted.
        let restarted: Vec<&String> =
            log.iter().filter(|l| l.starts_with("restarted:")).collect();
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0], &format!("restarted:{}", moved));

        sup.stop();
        c.stop();
        a.stop();
    }

    #[test]
    fn test_observer_reachable_via_remote_call() {
        let (a, b) = two_connected_nodes();
        let observer_id = b.kernel().registry().whereis(OBSERVER_NAME).unwrap();
        let target = ServerRef::remote(observer_id, b.id().clone());

        let snapshot = a
            .call(&target, Term::str("get_snapshot"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            snapshot.get("node"),
            Some(&Term::str(b.id().as_str()))
        );
        assert!(snapshot.get("process_count").and_then(Term::as_i64).unwrap() >= 1);
        b.stop();
        a.stop();
    }

    #[test]
    fn test_signed_cluster_forms_and_mismatch_does_not() {
        let mut cfg_a = config("alpha", vec![]);
        cfg_a.cluster_secret = Some("shared".into());
        let a = Node::new(cfg_a).unwrap();
        a.start().unwrap();

        let mut cfg_b = config("beta", vec![a.id().to_string()]);
        cfg_b.cluster_secret = Some("shared".into());
        let b = Node::new(cfg_b).unwrap();
        b.start().unwrap();

        assert!(wait_until(5000, || a
            .connected_nodes()
            .map(|n| n.len())
            .unwrap_or(0)
            == 1));

        // A third node with the wrong secret never becomes a member.
        let mut cfg_c = config("gamma", vec![a.id().to_string()]);
        cfg_c.cluster_secret = Some("wrong".into());
        let c = Node::new(cfg_c).unwrap();
        c.start().unwrap();
        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(c.connected_nodes().unwrap().len(), 0);
        assert!(!a
            .connected_nodes()
            .unwrap()
            .iter()
            .any(|n| n.name() == "gamma"));

        c.stop();
        b.stop();
        a.stop();
    }

    #[test]
    fn test_seed_unreachable_does_not_prevent_startup() {
        let ghost = format!("ghost@127.0.0.1:{}", free_port());
        let node = Node::new(config("alpha", vec![ghost])).unwrap();
        node.start().unwrap();
        assert_eq!(node.status(), ClusterStatus::Running);
        assert_eq!(node.connected_nodes().unwrap().len(), 0);
        node.stop();
    }
}
