//! Process identity, status, exit reasons, and the per-process record.
//!
//! A [`ServerRef`] is the opaque handle user code holds: a node-unique id,
//! optionally paired with a node identifier for remote addressing. The
//! [`ProcessHandle`] is the kernel-private record: mailbox sender, status
//! machine, and counters.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use hive_wire::{DownReason, NodeId};

use super::mailbox::Envelope;

// ---------------------------------------------------------------------------
// ServerRef
// ---------------------------------------------------------------------------

/// Opaque handle identifying a process, locally or across the cluster.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServerRef {
    pub id: u64,
    /// `None` for a local reference.
    pub node: Option<NodeId>,
}

impl ServerRef {
    pub fn local(id: u64) -> Self {
        ServerRef { id, node: None }
    }

    pub fn remote(id: u64, node: NodeId) -> Self {
        ServerRef {
            id,
            node: Some(node),
        }
    }

    pub fn is_local(&self) -> bool {
        self.node.is_none()
    }
}

impl fmt::Display for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            None => write!(f, "<{}>", self.id),
            Some(node) => write!(f, "<{}@{}>", self.id, node),
        }
    }
}

impl fmt::Debug for ServerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerRef({})", self)
    }
}

// ---------------------------------------------------------------------------
// ProcessStatus
// ---------------------------------------------------------------------------

/// Lifecycle states of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// `init` is running; no ref has escaped yet.
    Initializing,
    /// Handling messages.
    Running,
    /// Tearing down: remaining calls are rejected, `terminate` is about to run.
    Stopping,
    /// Fully stopped; the record is (about to be) removed.
    Stopped,
}

// ---------------------------------------------------------------------------
// ExitReason
// ---------------------------------------------------------------------------

/// Why a process terminated.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Deliberate stop with no failure.
    Normal,
    /// Supervisor-initiated shutdown. Non-crashing: transient children do not
    /// restart on it.
    Shutdown,
    /// A handler failed.
    Error(String),
    /// The connection to the process's peer was lost (propagated over links).
    Nodedown(NodeId),
}

impl ExitReason {
    /// Abnormal exits trigger transient restarts and link propagation.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitReason::Error(_) | ExitReason::Nodedown(_))
    }

    /// Wire representation: the down-reason kind plus optional detail.
    pub fn to_wire(&self) -> (DownReason, Option<String>) {
        match self {
            ExitReason::Normal => (DownReason::Normal, None),
            ExitReason::Shutdown => (DownReason::Shutdown, None),
            ExitReason::Error(detail) => (DownReason::Error, Some(detail.clone())),
            ExitReason::Nodedown(node) => (DownReason::Nodedown, Some(node.to_string())),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Error(detail) => write!(f, "error: {}", detail),
            ExitReason::Nodedown(node) => write!(f, "nodedown: {}", node),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// Kernel-private record for one live process.
pub(crate) struct ProcessHandle {
    pub id: u64,
    pub name: Mutex<Option<String>>,
    /// Producer side of the mailbox.
    pub sender: Sender<Envelope>,
    status: Mutex<ProcessStatus>,
    status_changed: Condvar,
    pub message_count: AtomicU64,
    /// Casts dropped by the mailbox high-watermark.
    pub dropped_casts: AtomicU64,
    pub started_at: Instant,
    /// Set when a supervisor gave up waiting for this process to stop; the
    /// dispatch thread then skips its own terminal bookkeeping.
    pub abandoned: AtomicBool,
}

impl ProcessHandle {
    pub fn new(id: u64, name: Option<String>, sender: Sender<Envelope>) -> Self {
        ProcessHandle {
            id,
            name: Mutex::new(name),
            sender,
            status: Mutex::new(ProcessStatus::Initializing),
            status_changed: Condvar::new(),
            message_count: AtomicU64::new(0),
            dropped_casts: AtomicU64::new(0),
            started_at: Instant::now(),
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ProcessStatus) {
        *self.status.lock() = status;
        self.status_changed.notify_all();
    }

    /// Block until the process reaches `Stopped`. With a timeout, returns
    /// `false` when the deadline passes first.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.status.lock();
        match timeout {
            None => {
                while *status != ProcessStatus::Stopped {
                    self.status_changed.wait(&mut status);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *status != ProcessStatus::Stopped {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    if self
                        .status_changed
                        .wait_for(&mut status, deadline - now)
                        .timed_out()
                        && *status != ProcessStatus::Stopped
                    {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Approximate number of queued envelopes.
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
