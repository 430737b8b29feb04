//! Process monitors and links, local and across nodes.
//!
//! A monitor is one-way: the watcher's node holds the outgoing half, the
//! target's node the incoming half. When the target terminates (or its node
//! is lost), the watcher receives a `process_down` message in its mailbox,
//! at most once per monitor.
//!
//! A link is bidirectional: termination of either side sends the other an
//! exit signal. A `normal` reason never terminates the peer; any other
//! reason terminates it with the same reason, which propagates transitively
//! through the linked tree (already-stopping processes absorb the echo, so
//! cycles are safe).
//!
//! Local watchers and targets use the same tables with the node half set to
//! `None`, so the distributed supervisor can monitor a child without caring
//! where placement put it.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use hive_wire::{monitor_id as new_monitor_id, link_id as new_link_id};
use hive_wire::{ClusterMessage, DownReason, NodeId, Term, WireEnvelope};

use super::transport::Transport;
use crate::actor::kernel::Kernel;
use crate::actor::process::{ExitReason, ServerRef};
use crate::error::{Error, Result};
use crate::persist::Clock;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Watcher-side record: we are watching `target_id` on `node`.
struct OutgoingMonitor {
    watcher_id: u64,
    target_id: u64,
    node: NodeId,
}

/// Target-side record: `watcher` (here or on `watcher_node`) watches our
/// local process `target_id`.
struct IncomingMonitor {
    watcher_id: u64,
    watcher_node: Option<NodeId>,
    target_id: u64,
}

/// One link. `peer_node` is `None` when both ends are local.
struct LinkRec {
    local_id: u64,
    peer_node: Option<NodeId>,
    remote_id: u64,
}

// ---------------------------------------------------------------------------
// Monitors
// ---------------------------------------------------------------------------

/// Monitor and link tables for one node.
pub(crate) struct Monitors {
    kernel: Kernel,
    transport: Transport,
    local: NodeId,
    clock: Arc<dyn Clock>,
    outgoing: Mutex<FxHashMap<String, OutgoingMonitor>>,
    incoming: Mutex<FxHashMap<String, IncomingMonitor>>,
    links: Mutex<FxHashMap<String, LinkRec>>,
}

/// The message delivered to a watcher when a monitor fires.
pub fn down_message(monitor_id: &str, reason: DownReason, detail: Option<&str>) -> Term {
    Term::object([
        ("event", Term::str("process_down")),
        ("monitor_id", Term::str(monitor_id)),
        ("reason", Term::str(reason.as_str())),
        (
            "detail",
            detail.map(Term::str).unwrap_or(Term::Null),
        ),
    ])
}

impl Monitors {
    pub fn new(kernel: Kernel, transport: Transport, local: NodeId, clock: Arc<dyn Clock>) -> Self {
        Monitors {
            kernel,
            transport,
            local,
            clock,
            outgoing: Mutex::new(FxHashMap::default()),
            incoming: Mutex::new(FxHashMap::default()),
            links: Mutex::new(FxHashMap::default()),
        }
    }

    fn send(&self, peer: &NodeId, message: ClusterMessage) -> Result<()> {
        self.transport.send(
            peer,
            &WireEnvelope::new(self.local.clone(), self.clock.now_ms(), message),
        )
    }

    // -----------------------------------------------------------------------
    // Watcher-side API
    // -----------------------------------------------------------------------

    /// Watch a process. The watcher receives a `process_down` message when
    /// the target terminates; monitoring an already-dead local target fires
    /// immediately with `noproc`.
    pub fn monitor(&self, watcher_id: u64, target: &ServerRef) -> Result<String> {
        let id = new_monitor_id();
        match remote_node(target, &self.local) {
            Some(node) => {
                self.outgoing.lock().insert(
                    id.clone(),
                    OutgoingMonitor {
                        watcher_id,
                        target_id: target.id,
                        node: node.clone(),
                    },
                );
                if let Err(err) = self.send(
                    &node,
                    ClusterMessage::MonitorRequest {
                        monitor_id: id.clone(),
                        watcher_id,
                        target_id: target.id,
                    },
                ) {
                    self.outgoing.lock().remove(&id);
                    return Err(err);
                }
                Ok(id)
            }
            None => {
                if !self.kernel.is_running(target.id) {
                    self.kernel.cast(
                        &ServerRef::local(watcher_id),
                        down_message(&id, DownReason::Noproc, None),
                    );
                    return Ok(id);
                }
                self.incoming.lock().insert(
                    id.clone(),
                    IncomingMonitor {
                        watcher_id,
                        watcher_node: None,
                        target_id: target.id,
                    },
                );
                Ok(id)
            }
        }
    }

    /// Remove a monitor before it fires.
    pub fn demonitor(&self, monitor_id: &str) {
        if let Some(outgoing) = self.outgoing.lock().remove(monitor_id) {
            let _ = self.send(
                &outgoing.node,
                ClusterMessage::DemonitorRequest {
                    monitor_id: monitor_id.to_string(),
                },
            );
        }
        self.incoming.lock().remove(monitor_id);
    }

    /// Link a local process to another process (local or remote).
    pub fn link(&self, local_id: u64, target: &ServerRef) -> Result<String> {
        let id = new_link_id();
        match remote_node(target, &self.local) {
            Some(node) => {
                self.links.lock().insert(
                    id.clone(),
                    LinkRec {
                        local_id,
                        peer_node: Some(node.clone()),
                        remote_id: target.id,
                    },
                );
                if let Err(err) = self.send(
                    &node,
                    ClusterMessage::LinkRequest {
                        link_id: id.clone(),
                        from_id: local_id,
                        target_id: target.id,
                    },
                ) {
                    self.links.lock().remove(&id);
                    return Err(err);
                }
                Ok(id)
            }
            None => {
                if !self.kernel.is_running(target.id) {
                    return Err(Error::ServerNotRunning {
                        server_id: target.id,
                        node: None,
                    });
                }
                self.links.lock().insert(
                    id.clone(),
                    LinkRec {
                        local_id,
                        peer_node: None,
                        remote_id: target.id,
                    },
                );
                Ok(id)
            }
        }
    }

    /// Tear down a link without propagating anything.
    pub fn unlink(&self, link_id: &str) {
        if let Some(link) = self.links.lock().remove(link_id) {
            if let Some(node) = link.peer_node {
                let _ = self.send(
                    &node,
                    ClusterMessage::UnlinkRequest {
                        link_id: link_id.to_string(),
                    },
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Wire handlers (called from the node's router)
    // -----------------------------------------------------------------------

    pub fn handle_monitor_request(
        &self,
        from: &NodeId,
        monitor_id: String,
        watcher_id: u64,
        target_id: u64,
    ) {
        if self.kernel.is_running(target_id) {
            self.incoming.lock().insert(
                monitor_id.clone(),
                IncomingMonitor {
                    watcher_id,
                    watcher_node: Some(from.clone()),
                    target_id,
                },
            );
            let _ = self.send(from, ClusterMessage::MonitorAck { monitor_id });
        } else {
            let _ = self.send(
                from,
                ClusterMessage::ProcessDown {
                    monitor_id,
                    reason: DownReason::Noproc,
                    detail: None,
                },
            );
        }
    }

    pub fn handle_demonitor_request(&self, monitor_id: &str) {
        self.incoming.lock().remove(monitor_id);
    }

    /// A monitor we hold fired on the target's node.
    pub fn handle_process_down(
        &self,
        monitor_id: &str,
        reason: DownReason,
        detail: Option<String>,
    ) {
        if let Some(outgoing) = self.outgoing.lock().remove(monitor_id) {
            self.kernel.cast(
                &ServerRef::local(outgoing.watcher_id),
                down_message(monitor_id, reason, detail.as_deref()),
            );
        }
    }

    pub fn handle_link_request(
        &self,
        from: &NodeId,
        link_id: String,
        from_id: u64,
        target_id: u64,
    ) {
        if self.kernel.is_running(target_id) {
            self.links.lock().insert(
                link_id.clone(),
                LinkRec {
                    local_id: target_id,
                    peer_node: Some(from.clone()),
                    remote_id: from_id,
                },
            );
            let _ = self.send(from, ClusterMessage::LinkAck { link_id });
        } else {
            // Linking to a dead process exits the requester.
            let _ = self.send(
                from,
                ClusterMessage::ExitSignal {
                    link_id: Some(link_id),
                    target_id: from_id,
                    reason: DownReason::Noproc,
                    detail: None,
                },
            );
        }
    }

    pub fn handle_unlink_request(&self, link_id: &str) {
        self.links.lock().remove(link_id);
    }

    /// Inbound exit signal, either one side of a link firing or a direct
    /// exit request. A `normal` reason never terminates the target.
    pub fn handle_exit_signal(
        &self,
        link_id: Option<&str>,
        target_id: u64,
        reason: DownReason,
        detail: Option<String>,
    ) {
        if let Some(link_id) = link_id {
            self.links.lock().remove(link_id);
        }
        if let Some(exit) = exit_reason_from_wire(reason, detail) {
            self.kernel
                .stop_async(&ServerRef::local(target_id), exit);
        }
    }

    // -----------------------------------------------------------------------
    // Local lifecycle and node loss
    // -----------------------------------------------------------------------

    /// A local process terminated: fire incoming monitors and propagate over
    /// links.
    pub fn on_local_exit(&self, id: u64, reason: &ExitReason) {
        let (down_reason, detail) = reason.to_wire();

        let fired: Vec<(String, IncomingMonitor)> = {
            let mut incoming = self.incoming.lock();
            let ids: Vec<String> = incoming
                .iter()
                .filter(|(_, m)| m.target_id == id)
                .map(|(k, _)| k.clone())
                .collect();
            ids.into_iter()
                .filter_map(|k| incoming.remove(&k).map(|m| (k, m)))
                .collect()
        };
        for (monitor_id, monitor) in fired {
            match &monitor.watcher_node {
                Some(node) => {
                    let _ = self.send(
                        node,
                        ClusterMessage::ProcessDown {
                            monitor_id,
                            reason: down_reason,
                            detail: detail.clone(),
                        },
                    );
                }
                None => {
                    self.kernel.cast(
                        &ServerRef::local(monitor.watcher_id),
                        down_message(&monitor_id, down_reason, detail.as_deref()),
                    );
                }
            }
        }

        let linked: Vec<(String, LinkRec)> = {
            let mut links = self.links.lock();
            let ids: Vec<String> = links
                .iter()
                .filter(|(_, l)| {
                    l.local_id == id || (l.peer_node.is_none() && l.remote_id == id)
                })
                .map(|(k, _)| k.clone())
                .collect();
            ids.into_iter()
                .filter_map(|k| links.remove(&k).map(|l| (k, l)))
                .collect()
        };
        for (link_id, link) in linked {
            match &link.peer_node {
                Some(node) => {
                    let _ = self.send(
                        node,
                        ClusterMessage::ExitSignal {
                            link_id: Some(link_id),
                            target_id: link.remote_id,
                            reason: down_reason,
                            detail: detail.clone(),
                        },
                    );
                }
                None => {
                    // Local link: terminate the surviving end unless the
                    // exit was normal.
                    let survivor = if link.local_id == id {
                        link.remote_id
                    } else {
                        link.local_id
                    };
                    if let Some(exit) = exit_reason_from_wire(down_reason, detail.clone()) {
                        self.kernel.stop_async(&ServerRef::local(survivor), exit);
                    }
                }
            }
        }
    }

    /// The connection to a peer is gone: fire every monitor watching that
    /// peer with `nodedown`, exit every process linked across it, and drop
    /// the peer's watcher-side registrations.
    pub fn on_node_down(&self, peer: &NodeId) {
        let fired: Vec<(String, OutgoingMonitor)> = {
            let mut outgoing = self.outgoing.lock();
            let ids: Vec<String> = outgoing
                .iter()
                .filter(|(_, m)| &m.node == peer)
                .map(|(k, _)| k.clone())
                .collect();
            ids.into_iter()
                .filter_map(|k| outgoing.remove(&k).map(|m| (k, m)))
                .collect()
        };
        for (monitor_id, monitor) in fired {
            debug!("monitor {} fired: node {} down", monitor_id, peer);
            self.kernel.cast(
                &ServerRef::local(monitor.watcher_id),
                down_message(&monitor_id, DownReason::Nodedown, Some(peer.as_str())),
            );
        }

        self.incoming
            .lock()
            .retain(|_, m| m.watcher_node.as_ref() != Some(peer));

        let severed: Vec<LinkRec> = {
            let mut links = self.links.lock();
            let ids: Vec<String> = links
                .iter()
                .filter(|(_, l)| l.peer_node.as_ref() == Some(peer))
                .map(|(k, _)| k.clone())
                .collect();
            ids.into_iter().filter_map(|k| links.remove(&k)).collect()
        };
        for link in severed {
            self.kernel.stop_async(
                &ServerRef::local(link.local_id),
                ExitReason::Nodedown(peer.clone()),
            );
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        (
            self.outgoing.lock().len(),
            self.incoming.lock().len(),
            self.links.lock().len(),
        )
    }
}

/// The target node of a ref, unless it is local (absent or equal to us).
fn remote_node(target: &ServerRef, local: &NodeId) -> Option<NodeId> {
    match &target.node {
        Some(node) if node != local => Some(node.clone()),
        _ => None,
    }
}

/// Map a wire exit reason onto the termination to apply locally. `None`
/// means the signal is informational and must not terminate anything.
fn exit_reason_from_wire(reason: DownReason, detail: Option<String>) -> Option<ExitReason> {
    match reason {
        DownReason::Normal => None,
        DownReason::Shutdown => Some(ExitReason::Shutdown),
        DownReason::Error => Some(ExitReason::Error(
            detail.unwrap_or_else(|| "linked process exited".to_string()),
        )),
        DownReason::Noproc => Some(ExitReason::Error("noproc".to_string())),
        DownReason::Nodedown => match detail.and_then(|d| NodeId::parse(&d).ok()) {
            Some(node) => Some(ExitReason::Nodedown(node)),
            None => Some(ExitReason::Error("nodedown".to_string())),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::behavior::Behavior;
    use crate::actor::kernel::StartOptions;
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

    fn setup() -> (Kernel, Monitors) {
        let kernel = Kernel::new();
        let local = NodeId::parse(&format!("local@127.0.0.1:{}", free_port())).unwrap();
        let (transport, _events, _port) =
            Transport::start(local.clone(), "127.0.0.1", None, 50, 500).unwrap();
        let monitors = Monitors::new(kernel.clone(), transport, local, Arc::new(SystemClock));
        (kernel, monitors)
    }

    /// A process that records every message it receives.
    fn recorder(kernel: &Kernel, log: Arc<StdMutex<Vec<Term>>>) -> ServerRef {
        kernel
            .start(
                Behavior::builder()
                    .init(|_| Ok(Term::Null))
                    .on_cast(move |msg, state| {
                        log.lock().unwrap().push(msg);
                        Ok(state)
                    })
                    .build(),
                StartOptions::default(),
            )
            .unwrap()
    }

    fn idle(kernel: &Kernel) -> ServerRef {
        kernel
            .start(
                Behavior::builder().init(|_| Ok(Term::Null)).build(),
                StartOptions::default(),
            )
            .unwrap()
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

    #[test]
    fn test_local_monitor_fires_once_on_exit() {
        let (kernel, monitors) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let watcher = recorder(&kernel, Arc::clone(&log));
        let target = idle(&kernel);

        let monitor_id = monitors.monitor(watcher.id, &target).unwrap();
        kernel.stop(&target, ExitReason::Normal);
        monitors.on_local_exit(target.id, &ExitReason::Normal);

        assert!(wait_until(1000, || !log.lock().unwrap().is_empty()));
        let messages = log.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].get("monitor_id"),
            Some(&Term::str(monitor_id.as_str()))
        );
        assert_eq!(messages[0].get("reason"), Some(&Term::str("normal")));

        // Firing released the registration.
        assert_eq!(monitors.counts().1, 0);
    }

    #[test]
    fn test_monitor_dead_target_fires_noproc() {
        let (kernel, monitors) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let watcher = recorder(&kernel, Arc::clone(&log));
        let target = idle(&kernel);
        kernel.stop(&target, ExitReason::Normal);

        monitors.monitor(watcher.id, &target).unwrap();
        assert!(wait_until(1000, || !log.lock().unwrap().is_empty()));
        assert_eq!(
            log.lock().unwrap()[0].get("reason"),
            Some(&Term::str("noproc"))
        );
    }

    #[test]
    fn test_demonitor_prevents_firing() {
        let (kernel, monitors) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let watcher = recorder(&kernel, Arc::clone(&log));
        let target = idle(&kernel);

        let monitor_id = monitors.monitor(watcher.id, &target).unwrap();
        monitors.demonitor(&monitor_id);
        kernel.stop(&target, ExitReason::Normal);
        monitors.on_local_exit(target.id, &ExitReason::Normal);

        std::thread::sleep(Duration::from_millis(150));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_local_link_propagates_abnormal_exit() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        let b = idle(&kernel);
        monitors.link(a.id, &b).unwrap();

        // Crash-like exit of a: b must terminate with the same reason.
        monitors.on_local_exit(a.id, &ExitReason::Error("boom".into()));
        assert!(wait_until(1000, || !kernel.is_running(b.id)));
        assert_eq!(monitors.counts().2, 0);
    }

    #[test]
    fn test_local_link_normal_exit_spares_peer() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        let b = idle(&kernel);
        monitors.link(a.id, &b).unwrap();

        monitors.on_local_exit(a.id, &ExitReason::Normal);
        std::thread::sleep(Duration::from_millis(150));
        assert!(kernel.is_running(b.id));
        // The link itself is gone either way.
        assert_eq!(monitors.counts().2, 0);
    }

    #[test]
    fn test_link_is_bidirectional() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        let b = idle(&kernel);
        monitors.link(a.id, &b).unwrap();

        // The *target* dying also exits the process that requested the link.
        monitors.on_local_exit(b.id, &ExitReason::Error("late".into()));
        assert!(wait_until(1000, || !kernel.is_running(a.id)));
    }

    #[test]
    fn test_unlink_stops_propagation() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        let b = idle(&kernel);
        let link_id = monitors.link(a.id, &b).unwrap();
        monitors.unlink(&link_id);

        monitors.on_local_exit(a.id, &ExitReason::Error("boom".into()));
        std::thread::sleep(Duration::from_millis(150));
        assert!(kernel.is_running(b.id));
    }

    #[test]
    fn test_link_to_dead_local_target_fails() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        let b = idle(&kernel);
        kernel.stop(&b, ExitReason::Normal);
        assert!(matches!(
            monitors.link(a.id, &b),
            Err(Error::ServerNotRunning { .. })
        ));
    }

    #[test]
    fn test_exit_signal_normal_is_informational() {
        let (kernel, monitors) = setup();
        let a = idle(&kernel);
        monitors.handle_exit_signal(None, a.id, DownReason::Normal, None);
        std::thread::sleep(Duration::from_millis(100));
        assert!(kernel.is_running(a.id));

        monitors.handle_exit_signal(None, a.id, DownReason::Shutdown, None);
        assert!(wait_until(1000, || !kernel.is_running(a.id)));
    }

    #[test]
    fn test_node_down_fires_monitors_and_severs_links() {
        let (kernel, monitors) = setup();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let watcher = recorder(&kernel, Arc::clone(&log));
        let linked = idle(&kernel);
        let peer = NodeId::parse("peer@127.0.0.1:4444").unwrap();

        // Hand-install remote-facing records, as if the wire set them up.
        monitors.outgoing.lock().insert(
            "m1".into(),
            OutgoingMonitor {
                watcher_id: watcher.id,
                target_id: 99,
                node: peer.clone(),
            },
        );
        monitors.links.lock().insert(
            "l1".into(),
            LinkRec {
                local_id: linked.id,
                peer_node: Some(peer.clone()),
                remote_id: 7,
            },
        );

        monitors.on_node_down(&peer);

        assert!(wait_until(1000, || !log.lock().unwrap().is_empty()));
        let messages = log.lock().unwrap();
        assert_eq!(messages[0].get("reason"), Some(&Term::str("nodedown")));
        assert_eq!(
            messages[0].get("detail"),
            Some(&Term::str(peer.as_str()))
        );
        drop(messages);

        assert!(wait_until(1000, || !kernel.is_running(linked.id)));
        let (outgoing, _, links) = monitors.counts();
        assert_eq!(outgoing, 0);
        assert_eq!(links, 0);
    }
}
