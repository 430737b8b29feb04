//! Peer-to-peer TCP transport.
//!
//! Owns one full-duplex stream per peer. Outbound connections are dialed on
//! a dedicated thread that doubles as the connection's reader and drives
//! reconnection with bounded exponential backoff; inbound connections get a
//! reader thread from the accept loop. A connection is keyed by the peer's
//! node id, learned from the first envelope it sends (the dialing side sends
//! an immediate heartbeat as its hello).
//!
//! Write-path rules: sends to a `connected` peer go straight to the socket;
//! sends while `connecting` queue and flush on transition; sends to an
//! unknown or deliberately disconnected peer fail. A disconnect requested
//! locally is final -- only remote closes and failed dials are retried.
//!
//! Signature-policy violations (missing or mismatching HMAC) close the
//! connection. Other codec errors drop the message, bump a counter, and
//! leave the connection up.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use hive_wire::{frame, CodecError, Deframer, NodeId, WireEnvelope};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a peer connection went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDownCause {
    ConnectionClosed,
    ConnectionRefused,
    HeartbeatTimeout,
    GracefulShutdown,
}

impl PeerDownCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerDownCause::ConnectionClosed => "connection_closed",
            PeerDownCause::ConnectionRefused => "connection_refused",
            PeerDownCause::HeartbeatTimeout => "heartbeat_timeout",
            PeerDownCause::GracefulShutdown => "graceful_shutdown",
        }
    }
}

/// Peer-level events surfaced to the node's router loop.
#[derive(Debug)]
pub enum TransportEvent {
    PeerUp(NodeId),
    PeerDown(NodeId, PeerDownCause),
    Message(NodeId, WireEnvelope),
    /// The transport was stopped; the router loop should exit.
    Stopped,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// We dialed; a dedicated thread owns reconnection.
    Dialer,
    /// The peer dialed us; it owns reconnection.
    Acceptor,
}

enum ConnState {
    Disconnected,
    /// Dial in progress; writes queue here until the socket is up.
    Connecting { pending: Vec<Vec<u8>> },
    /// Write half of the live socket.
    Connected { stream: TcpStream },
}

struct Connection {
    peer: NodeId,
    origin: Origin,
    state: Mutex<ConnState>,
    reconnect_attempt: AtomicU32,
    /// Locally requested disconnect: no reconnection, ever.
    local_close: AtomicBool,
}

impl Connection {
    fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), ConnState::Connected { .. })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Handle to the node's transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    local: NodeId,
    secret: Option<String>,
    base_delay_ms: u64,
    max_delay_ms: u64,
    connections: RwLock<FxHashMap<NodeId, Arc<Connection>>>,
    events: Sender<TransportEvent>,
    shutdown: AtomicBool,
    codec_errors: AtomicU64,
}

impl Transport {
    /// Bind the listener and start the accept loop. Returns the transport,
    /// the event stream, and the actually bound port.
    pub fn start(
        local: NodeId,
        bind_host: &str,
        secret: Option<String>,
        base_delay_ms: u64,
        max_delay_ms: u64,
    ) -> std::io::Result<(Transport, Receiver<TransportEvent>, u16)> {
        let listener = TcpListener::bind((bind_host, local.port()))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let (events_tx, events_rx) = unbounded();
        let transport = Transport {
            inner: Arc::new(TransportInner {
                local,
                secret,
                base_delay_ms,
                max_delay_ms,
                connections: RwLock::new(FxHashMap::default()),
                events: events_tx,
                shutdown: AtomicBool::new(false),
                codec_errors: AtomicU64::new(0),
            }),
        };

        let accept_inner = Arc::clone(&transport.inner);
        std::thread::Builder::new()
            .name("hive-accept".to_string())
            .spawn(move || accept_loop(accept_inner, listener))?;

        Ok((transport, events_rx, port))
    }

    pub fn local(&self) -> &NodeId {
        &self.inner.local
    }

    /// Dial a peer. Idempotent: a live or in-progress connection is left
    /// alone. Dialing self is ignored.
    pub fn connect(&self, peer: &NodeId) {
        if peer == &self.inner.local || self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        {
            let mut connections = self.inner.connections.write();
            match connections.get(peer) {
                Some(existing)
                    if !matches!(*existing.state.lock(), ConnState::Disconnected)
                        && !existing.local_close.load(Ordering::Acquire) =>
                {
                    return;
                }
                _ => {}
            }
            let connection = Arc::new(Connection {
                peer: peer.clone(),
                origin: Origin::Dialer,
                state: Mutex::new(ConnState::Connecting {
                    pending: Vec::new(),
                }),
                reconnect_attempt: AtomicU32::new(0),
                local_close: AtomicBool::new(false),
            });
            connections.insert(peer.clone(), Arc::clone(&connection));

            let inner = Arc::clone(&self.inner);
            let thread_peer = peer.clone();
            if std::thread::Builder::new()
                .name(format!("hive-dial-{}", thread_peer.name()))
                .spawn(move || dial_loop(inner, connection, thread_peer))
                .is_err()
            {
                connections.remove(peer);
            }
        }
    }

    /// Deliberate, final disconnect: closes the socket, suppresses all
    /// reconnection, and reports `graceful_shutdown`.
    pub fn disconnect(&self, peer: &NodeId) {
        if let Some(connection) = self.connection_of(peer) {
            connection.local_close.store(true, Ordering::Release);
            close_connection(
                &self.inner,
                &connection,
                ConnState::Disconnected,
                PeerDownCause::GracefulShutdown,
            );
        }
    }

    /// Failure-detector close: drops the socket and reports the given cause.
    /// Dialer-side connections go back to `connecting` and retry.
    pub fn close_peer(&self, peer: &NodeId, cause: PeerDownCause) {
        if let Some(connection) = self.connection_of(peer) {
            let next = match connection.origin {
                Origin::Dialer => ConnState::Connecting {
                    pending: Vec::new(),
                },
                Origin::Acceptor => ConnState::Disconnected,
            };
            close_connection(&self.inner, &connection, next, cause);
        }
    }

    /// Serialize, sign, frame, and send one envelope to a peer.
    pub fn send(&self, peer: &NodeId, envelope: &WireEnvelope) -> Result<()> {
        let bytes = envelope.to_bytes(self.inner.secret.as_deref())?;
        let framed = frame(&bytes)?;
        let connection = self
            .connection_of(peer)
            .ok_or_else(|| Error::NodeNotReachable { node: peer.clone() })?;
        if connection.local_close.load(Ordering::Acquire) {
            return Err(Error::NodeNotReachable { node: peer.clone() });
        }

        let mut state = connection.state.lock();
        match &mut *state {
            ConnState::Connected { stream } => {
                if let Err(e) = stream.write_all(&framed) {
                    drop(state);
                    debug!("write to {} failed: {}", peer, e);
                    conn_lost(&self.inner, &connection, PeerDownCause::ConnectionClosed);
                    return Err(Error::NodeNotReachable { node: peer.clone() });
                }
                Ok(())
            }
            ConnState::Connecting { pending } => {
                pending.push(framed);
                Ok(())
            }
            ConnState::Disconnected => Err(Error::NodeNotReachable { node: peer.clone() }),
        }
    }

    /// Send to every connected peer; unreachable peers are skipped.
    pub fn broadcast(&self, envelope: &WireEnvelope) {
        for peer in self.connected_peers() {
            let _ = self.send(&peer, envelope);
        }
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.peer.clone())
            .collect()
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connection_of(peer)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Inbound messages dropped due to codec errors (connection kept up).
    pub fn codec_error_count(&self) -> u64 {
        self.inner.codec_errors.load(Ordering::Relaxed)
    }

    /// Stop the transport: close every connection, stop accepting, and end
    /// the event stream.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let connections: Vec<Arc<Connection>> =
            self.inner.connections.read().values().cloned().collect();
        for connection in connections {
            connection.local_close.store(true, Ordering::Release);
            let mut state = connection.state.lock();
            if let ConnState::Connected { stream } = &*state {
                let _ = stream.shutdown(Shutdown::Both);
            }
            *state = ConnState::Disconnected;
        }
        let _ = self.inner.events.send(TransportEvent::Stopped);
    }

    fn connection_of(&self, peer: &NodeId) -> Option<Arc<Connection>> {
        self.inner.connections.read().get(peer).cloned()
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle helpers
// ---------------------------------------------------------------------------

fn emit(inner: &TransportInner, event: TransportEvent) {
    if !inner.shutdown.load(Ordering::Acquire) {
        let _ = inner.events.send(event);
    }
}

/// Transition a live connection out of `Connected`, emitting one peer-down
/// event. No-op when the connection is already down or superseded.
fn close_connection(
    inner: &TransportInner,
    connection: &Arc<Connection>,
    next: ConnState,
    cause: PeerDownCause,
) {
    {
        let mut state = connection.state.lock();
        match &*state {
            ConnState::Connected { stream } => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            _ => return,
        }
        *state = next;
    }
    emit(inner, TransportEvent::PeerDown(connection.peer.clone(), cause));
}

/// A reader observed the connection dropping out from under us.
fn conn_lost(inner: &TransportInner, connection: &Arc<Connection>, cause: PeerDownCause) {
    // Superseded connections (replaced by a duplicate-connection tiebreak)
    // stay silent; the replacement is already up.
    let current = inner.connections.read().get(&connection.peer).cloned();
    match current {
        Some(current) if Arc::ptr_eq(&current, connection) => {}
        _ => return,
    }
    let next = if connection.origin == Origin::Dialer
        && !connection.local_close.load(Ordering::Acquire)
        && !inner.shutdown.load(Ordering::Acquire)
    {
        ConnState::Connecting {
            pending: Vec::new(),
        }
    } else {
        ConnState::Disconnected
    };
    close_connection(inner, connection, next, cause);
}

/// Flush writes queued while the dial was in flight.
fn transition_connected(connection: &Connection, stream: TcpStream) -> std::io::Result<bool> {
    let mut state = connection.state.lock();
    match &mut *state {
        // A racing inbound connection won; drop this socket.
        ConnState::Connected { .. } => Ok(false),
        ConnState::Connecting { pending } => {
            let queued = std::mem::take(pending);
            let mut write_half = stream;
            for framed in queued {
                write_half.write_all(&framed)?;
            }
            *state = ConnState::Connected { stream: write_half };
            Ok(true)
        }
        ConnState::Disconnected => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// Dial loop (outbound connections)
// ---------------------------------------------------------------------------

fn backoff_delay(inner: &TransportInner, attempt: u32) -> Duration {
    let exp = inner
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX));
    let capped = exp.min(inner.max_delay_ms);
    let jitter = rand::random::<u64>() % (inner.base_delay_ms / 2 + 1);
    Duration::from_millis(capped + jitter)
}

/// Sleep in small slices so shutdown and local close stay responsive.
fn interruptible_sleep(inner: &TransportInner, connection: &Connection, total: Duration) -> bool {
    let mut remaining = total;
    let slice = Duration::from_millis(50);
    while remaining > Duration::ZERO {
        if inner.shutdown.load(Ordering::Acquire)
            || connection.local_close.load(Ordering::Acquire)
        {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    true
}

fn dial_loop(inner: Arc<TransportInner>, connection: Arc<Connection>, peer: NodeId) {
    loop {
        if inner.shutdown.load(Ordering::Acquire)
            || connection.local_close.load(Ordering::Acquire)
        {
            return;
        }
        // Superseded by a replacement connection: this thread is done.
        match inner.connections.read().get(&peer) {
            Some(current) if Arc::ptr_eq(current, &connection) => {}
            _ => return,
        }

        match TcpStream::connect(peer.addr()) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let read_half = match stream.try_clone() {
                    Ok(clone) => clone,
                    Err(_) => continue,
                };
                match transition_connected(&connection, stream) {
                    Ok(true) => {
                        connection.reconnect_attempt.store(0, Ordering::Relaxed);
                        emit(&inner, TransportEvent::PeerUp(peer.clone()));
                        // This thread now serves as the connection's reader;
                        // it returns when the connection drops.
                        read_frames(&inner, &connection, read_half, Some(peer.clone()));
                        conn_lost(&inner, &connection, PeerDownCause::ConnectionClosed);
                    }
                    Ok(false) => return,
                    Err(_) => {
                        conn_lost(&inner, &connection, PeerDownCause::ConnectionClosed);
                    }
                }
            }
            Err(e) => {
                let attempt = connection.reconnect_attempt.fetch_add(1, Ordering::Relaxed);
                if attempt == 0 {
                    debug!("dial {} failed: {}", peer, e);
                    emit(
                        &inner,
                        TransportEvent::PeerDown(peer.clone(), PeerDownCause::ConnectionRefused),
                    );
                }
                if !interruptible_sleep(&inner, &connection, backoff_delay(&inner, attempt)) {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accept loop (inbound connections)
// ---------------------------------------------------------------------------

fn accept_loop(inner: Arc<TransportInner>, listener: TcpListener) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let _ = stream.set_nodelay(true);
                let reader_inner = Arc::clone(&inner);
                let _ = std::thread::Builder::new()
                    .name("hive-peer-reader".to_string())
                    .spawn(move || inbound_reader(reader_inner, stream));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Register an inbound connection once the peer identified itself.
///
/// Duplicate connections (both sides dialing simultaneously) resolve by the
/// node-name tiebreak: the lexicographically smaller node keeps its outgoing
/// connection, the other side's is replaced.
fn register_inbound(
    inner: &Arc<TransportInner>,
    peer: &NodeId,
    stream: &TcpStream,
) -> Option<Arc<Connection>> {
    let write_half = stream.try_clone().ok()?;
    let mut connections = inner.connections.write();

    if let Some(existing) = connections.get(peer) {
        if existing.is_connected() {
            if inner.local < *peer {
                // We keep our outgoing connection; refuse this one.
                return None;
            }
            // The inbound connection wins; retire the old one silently.
            let mut state = existing.state.lock();
            if let ConnState::Connected { stream } = &*state {
                let _ = stream.shutdown(Shutdown::Both);
            }
            *state = ConnState::Disconnected;
        } else if existing.local_close.load(Ordering::Acquire) {
            // The peer was deliberately disconnected; stay disconnected.
            return None;
        } else {
            // Our dial is still in flight; the inbound connection takes
            // over and queued writes flush onto it.
            let mut state = existing.state.lock();
            if let ConnState::Connecting { pending } = &mut *state {
                let queued = std::mem::take(pending);
                let mut flushing = write_half;
                for framed in queued {
                    if flushing.write_all(&framed).is_err() {
                        return None;
                    }
                }
                *state = ConnState::Connected { stream: flushing };
                drop(state);
                let connection = Arc::clone(existing);
                drop(connections);
                emit(inner, TransportEvent::PeerUp(peer.clone()));
                return Some(connection);
            }
            drop(state);
        }
    }

    let connection = Arc::new(Connection {
        peer: peer.clone(),
        origin: Origin::Acceptor,
        state: Mutex::new(ConnState::Connected { stream: write_half }),
        reconnect_attempt: AtomicU32::new(0),
        local_close: AtomicBool::new(false),
    });
    connections.insert(peer.clone(), Arc::clone(&connection));
    drop(connections);
    emit(inner, TransportEvent::PeerUp(peer.clone()));
    Some(connection)
}

fn inbound_reader(inner: Arc<TransportInner>, stream: TcpStream) {
    read_frames_unidentified(inner, stream);
}

fn read_frames_unidentified(inner: Arc<TransportInner>, stream: TcpStream) {
    read_frames_impl(&inner, None, stream, None);
}

/// Reader for an already-registered (outbound) connection.
fn read_frames(
    inner: &Arc<TransportInner>,
    connection: &Arc<Connection>,
    stream: TcpStream,
    peer: Option<NodeId>,
) {
    read_frames_impl(inner, Some(connection), stream, peer);
}

/// Shared read loop. For inbound streams, the first valid envelope
/// identifies the peer and registers the connection; a handshake reporting
/// our own id is a self-loop and is dropped.
fn read_frames_impl(
    inner: &Arc<TransportInner>,
    mut connection: Option<&Arc<Connection>>,
    mut stream: TcpStream,
    mut peer: Option<NodeId>,
) {
    let mut deframer = Deframer::new();
    let mut buf = [0u8; 16 * 1024];
    let mut inbound_conn: Option<Arc<Connection>> = None;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        deframer.push(&buf[..n]);

        loop {
            let payload = match deframer.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    // Oversized frame announcement: protocol violation.
                    warn!("closing connection: {}", e);
                    let _ = stream.shutdown(Shutdown::Both);
                    finish_reader(inner, connection, &inbound_conn, &peer);
                    return;
                }
            };
            match WireEnvelope::from_bytes(&payload, inner.secret.as_deref()) {
                Ok(envelope) => {
                    if peer.is_none() {
                        let from = envelope.from.clone();
                        if from == inner.local {
                            // Self-loop: drop the connection outright.
                            let _ = stream.shutdown(Shutdown::Both);
                            return;
                        }
                        match register_inbound(inner, &from, &stream) {
                            Some(conn) => {
                                inbound_conn = Some(conn);
                                connection = None;
                                peer = Some(from);
                            }
                            None => {
                                let _ = stream.shutdown(Shutdown::Both);
                                return;
                            }
                        }
                    } else if Some(&envelope.from) != peer.as_ref() {
                        // A peer may not change identity mid-connection.
                        warn!("peer identity changed mid-connection; closing");
                        let _ = stream.shutdown(Shutdown::Both);
                        finish_reader(inner, connection, &inbound_conn, &peer);
                        return;
                    }
                    emit(
                        inner,
                        TransportEvent::Message(peer.clone().expect("identified"), envelope),
                    );
                }
                Err(
                    e @ (CodecError::SignatureMissing
                    | CodecError::SignatureMismatch
                    | CodecError::MalformedSignature),
                ) => {
                    // Authentication failures close the connection.
                    warn!("closing connection: {}", e);
                    let _ = stream.shutdown(Shutdown::Both);
                    finish_reader(inner, connection, &inbound_conn, &peer);
                    return;
                }
                Err(e) => {
                    // Malformed payload: drop the message, keep the link.
                    inner.codec_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping undecodable message: {}", e);
                }
            }
        }
    }
    finish_reader(inner, connection, &inbound_conn, &peer);
}

fn finish_reader(
    inner: &Arc<TransportInner>,
    connection: Option<&Arc<Connection>>,
    inbound_conn: &Option<Arc<Connection>>,
    peer: &Option<NodeId>,
) {
    if peer.is_none() {
        return;
    }
    if let Some(conn) = inbound_conn {
        conn_lost(inner, conn, PeerDownCause::ConnectionClosed);
    } else if let Some(conn) = connection {
        // Outbound reader: the dial loop emits the event after we return,
        // so nothing to do here.
        let _ = conn;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
