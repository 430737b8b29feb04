//! The local process kernel.
//!
//! Every process gets a dedicated dispatch thread draining its mailbox, so
//! dispatch is serialized per process and independent across processes: a
//! handler runs to completion before the next envelope is touched, and no
//! process ever observes interleaving of its own handlers.
//!
//! ## Lifecycle
//!
//! `start` runs `init` synchronously on the calling thread -- no ref escapes
//! until the process is viable, and a failed init (or a failed persisted-state
//! migration) fails the start atomically, releasing any reserved name. From
//! then on the dispatch thread owns the state until a stop signal, a handler
//! failure, or a handler panic ends the loop; `terminate` then runs exactly
//! once and the lifecycle event is emitted after the record is removed.
//!
//! ## Calls
//!
//! A call enqueues the message together with a one-shot reply channel. The
//! channel is the awaiter: a reply resolves it, a handler failure rejects it,
//! the timeout elapsing rejects it caller-side (a late reply is then
//! discarded), and the process terminating first rejects it with
//! `ServerNotRunning`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use hive_wire::Term;

use super::behavior::Behavior;
use super::calls::CallStats;
use super::mailbox::{mailbox, CallFault, Envelope};
use super::observer::SupervisorIndex;
use super::process::{ExitReason, ProcessHandle, ProcessStatus, ServerRef};
use super::registry::Registry;
use crate::error::{Error, Result};
use crate::event::{EventHub, LifecycleEvent};
use crate::persist::{Clock, PersistedState, StorageAdapter, SystemClock};

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Handle to this node's process kernel. Cheap to clone.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

pub(crate) struct KernelInner {
    processes: RwLock<FxHashMap<u64, Arc<ProcessHandle>>>,
    next_id: AtomicU64,
    registry: Arc<Registry>,
    events: Arc<EventHub>,
    stats: Arc<CallStats>,
    sup_index: Arc<SupervisorIndex>,
    storage: Option<Arc<dyn StorageAdapter>>,
    clock: Arc<dyn Clock>,
    mailbox_high_watermark: Option<usize>,
}

/// Construction-time knobs for a kernel.
pub struct KernelOptions {
    pub storage: Option<Arc<dyn StorageAdapter>>,
    pub clock: Arc<dyn Clock>,
    pub mailbox_high_watermark: Option<usize>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            storage: None,
            clock: Arc::new(SystemClock),
            mailbox_high_watermark: None,
        }
    }
}

/// Options for starting one process.
#[derive(Default)]
pub struct StartOptions {
    /// Register the process under this local name. A taken name fails the
    /// start with `RegistryConflict`.
    pub name: Option<String>,
    /// Passed to the behavior's `init`.
    pub init_args: Term,
}

impl StartOptions {
    pub fn named(name: impl Into<String>) -> Self {
        StartOptions {
            name: Some(name.into()),
            init_args: Term::Null,
        }
    }

    pub fn with_args(args: Term) -> Self {
        StartOptions {
            name: None,
            init_args: args,
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

impl Kernel {
    pub fn new() -> Kernel {
        Kernel::with_options(KernelOptions::default())
    }

    pub fn with_options(options: KernelOptions) -> Kernel {
        let registry = Arc::new(Registry::new());
        let events = Arc::new(EventHub::new());

        // The registry drops a process's names the moment its terminal
        // lifecycle event fires; user code never unregisters explicitly.
        let registry_sub = Arc::clone(&registry);
        events.subscribe(move |event| match event {
            LifecycleEvent::Terminated { id, .. } | LifecycleEvent::Crashed { id, .. } => {
                registry_sub.cleanup_process(*id);
            }
            LifecycleEvent::Started { .. } => {}
        });

        Kernel {
            inner: Arc::new(KernelInner {
                processes: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
                registry,
                events,
                stats: Arc::new(CallStats::new()),
                sup_index: Arc::new(SupervisorIndex::new()),
                storage: options.storage,
                clock: options.clock,
                mailbox_high_watermark: options.mailbox_high_watermark,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn stats(&self) -> &CallStats {
        &self.inner.stats
    }

    pub fn sup_index(&self) -> &SupervisorIndex {
        &self.inner.sup_index
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Start a process. Returns after `init` has completed successfully.
    pub fn start(&self, behavior: Behavior, options: StartOptions) -> Result<ServerRef> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // Reserve the name first so concurrent starts cannot both win it.
        if let Some(name) = &options.name {
            self.inner.registry.register(name.clone(), id)?;
        }

        let state = match self.initial_state(&behavior, options.init_args) {
            Ok(state) => state,
            Err(err) => {
                if let Some(name) = &options.name {
                    self.inner.registry.unregister(name);
                }
                return Err(err);
            }
        };

        let (sender, receiver) = mailbox();
        let handle = Arc::new(ProcessHandle::new(id, options.name.clone(), sender));
        handle.set_status(ProcessStatus::Running);
        self.inner.processes.write().insert(id, Arc::clone(&handle));

        self.inner.events.emit(&LifecycleEvent::Started {
            id,
            name: options.name,
        });

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name(format!("hive-proc-{}", id))
            .spawn(move || dispatch_loop(inner, handle, behavior, state, receiver))
            .map_err(|e| Error::InitFailed {
                detail: format!("failed to spawn dispatch thread: {}", e),
            })?;

        Ok(ServerRef::local(id))
    }

    /// Resolve the initial state: persisted snapshot (with migration) when
    /// the behavior declares persistence and storage is available, `init`
    /// otherwise. A bad snapshot is a hard failure, never a fallback to init.
    fn initial_state(&self, behavior: &Behavior, args: Term) -> Result<Term> {
        if let (Some(spec), Some(storage)) = (&behavior.persistence, &self.inner.storage) {
            let blob = storage.load(&spec.key).map_err(|e| Error::InitFailed {
                detail: format!("storage load failed: {}", e),
            })?;
            if let Some(blob) = blob {
                let snapshot: PersistedState =
                    serde_json::from_slice(&blob).map_err(|e| Error::Migration {
                        key: spec.key.clone(),
                        detail: format!("unreadable snapshot: {}", e),
                    })?;
                snapshot.verify().map_err(|detail| Error::Migration {
                    key: spec.key.clone(),
                    detail,
                })?;
                let stored_version = snapshot.metadata.schema_version;
                if stored_version == spec.schema_version {
                    return Ok(snapshot.state);
                }
                let migrate = spec.migrate.as_ref().ok_or_else(|| Error::Migration {
                    key: spec.key.clone(),
                    detail: format!(
                        "schema version {} stored, {} expected, no migration defined",
                        stored_version, spec.schema_version
                    ),
                })?;
                return run_contained(|| migrate(stored_version, snapshot.state.clone()))
                    .map_err(|detail| Error::Migration {
                        key: spec.key.clone(),
                        detail,
                    });
            }
        }
        run_contained(|| (behavior.init)(args)).map_err(|detail| Error::InitFailed { detail })
    }

    // -----------------------------------------------------------------------
    // call / cast / stop
    // -----------------------------------------------------------------------

    /// Synchronous request/reply against a local process.
    pub fn call(&self, target: &ServerRef, msg: Term, timeout: Duration) -> Result<Term> {
        let reply_rx = self.call_enqueue(target.id, msg)?;
        self.call_await(reply_rx, timeout, target.id)
    }

    /// Enqueue a call envelope and hand back its awaiter. Split from the
    /// wait so the remote-call handler can enqueue in arrival order on the
    /// router thread and park only the waiting on a worker.
    pub(crate) fn call_enqueue(
        &self,
        server_id: u64,
        msg: Term,
    ) -> Result<Receiver<std::result::Result<Term, CallFault>>> {
        self.inner.stats.record_initiated();
        let handle = match self.handle_of(server_id) {
            Some(handle) if handle.status() == ProcessStatus::Running => handle,
            _ => {
                self.inner.stats.record_rejected();
                return Err(Error::ServerNotRunning {
                    server_id,
                    node: None,
                });
            }
        };

        let (reply_tx, reply_rx) = bounded(1);
        if handle
            .sender
            .send(Envelope::Call {
                reply: reply_tx,
                payload: msg,
            })
            .is_err()
        {
            self.inner.stats.record_rejected();
            return Err(Error::ServerNotRunning {
                server_id,
                node: None,
            });
        }
        Ok(reply_rx)
    }

    /// Await the reply of an enqueued call.
    pub(crate) fn call_await(
        &self,
        reply_rx: Receiver<std::result::Result<Term, CallFault>>,
        timeout: Duration,
        server_id: u64,
    ) -> Result<Term> {
        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(value)) => {
                self.inner.stats.record_resolved();
                Ok(value)
            }
            Ok(Err(CallFault::Handler(detail))) => {
                self.inner.stats.record_rejected();
                Err(Error::CallFailed { detail })
            }
            Ok(Err(CallFault::Stopped)) | Err(RecvTimeoutError::Disconnected) => {
                self.inner.stats.record_rejected();
                Err(Error::ServerNotRunning {
                    server_id,
                    node: None,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                self.inner.stats.record_timed_out();
                // The awaiter is gone with the dropped receiver; a late
                // reply is discarded by the channel.
                Err(Error::CallTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    server_id,
                    node: None,
                })
            }
        }
    }

    /// Fire-and-forget message to a local process. Never fails visibly; a
    /// missing target or a full mailbox (when a high-watermark is configured)
    /// drops the message.
    pub fn cast(&self, target: &ServerRef, msg: Term) {
        self.inner.stats.record_cast();
        if let Some(handle) = self.handle_of(target.id) {
            if let Some(high_watermark) = self.inner.mailbox_high_watermark {
                if handle.queue_len() >= high_watermark {
                    handle.dropped_casts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "cast to {} dropped: mailbox at high-watermark {}",
                        target.id, high_watermark
                    );
                    return;
                }
            }
            let _ = handle.sender.send(Envelope::Cast { payload: msg });
        }
    }

    /// Stop a process and wait for its termination. Missing refs are a no-op.
    pub fn stop(&self, target: &ServerRef, reason: ExitReason) {
        if let Some(handle) = self.handle_of(target.id) {
            let _ = handle.sender.send(Envelope::Stop { reason });
            handle.wait_stopped(None);
        }
    }

    /// Stop with a deadline. Returns `false` when the process failed to stop
    /// in time (the caller decides whether to abandon it).
    pub fn stop_timeout(&self, target: &ServerRef, reason: ExitReason, timeout: Duration) -> bool {
        match self.handle_of(target.id) {
            None => true,
            Some(handle) => {
                let _ = handle.sender.send(Envelope::Stop { reason });
                handle.wait_stopped(Some(timeout))
            }
        }
    }

    /// Enqueue a stop signal without waiting. Used where blocking would
    /// deadlock, e.g. a process stopping itself.
    pub fn stop_async(&self, target: &ServerRef, reason: ExitReason) {
        if let Some(handle) = self.handle_of(target.id) {
            let _ = handle.sender.send(Envelope::Stop { reason });
        }
    }

    /// Force-terminate a process that ignored its shutdown deadline: the
    /// record is removed and the terminal event emitted now; the stuck
    /// dispatch thread skips its own bookkeeping if it ever returns.
    pub(crate) fn abandon(&self, id: u64, reason: ExitReason) {
        let handle = self.inner.processes.write().remove(&id);
        if let Some(handle) = handle {
            warn!("abandoning process {} ({})", id, reason);
            handle.mark_abandoned();
            self.inner.registry.cleanup_process(id);
            self.inner
                .events
                .emit(&LifecycleEvent::Terminated { id, reason });
        }
    }

    // -----------------------------------------------------------------------
    // introspection
    // -----------------------------------------------------------------------

    pub fn is_running(&self, id: u64) -> bool {
        self.handle_of(id)
            .map(|h| h.status() == ProcessStatus::Running)
            .unwrap_or(false)
    }

    pub fn process_count(&self) -> usize {
        self.inner.processes.read().len()
    }

    pub fn info(&self, id: u64) -> Option<ProcessInfo> {
        self.handle_of(id).map(|h| ProcessInfo::from_handle(&h))
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .inner
            .processes
            .read()
            .values()
            .map(|h| ProcessInfo::from_handle(h))
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    /// Stop every process, used at node shutdown. Processes that ignore the
    /// deadline are abandoned.
    pub fn shutdown_all(&self, timeout: Duration) {
        let ids: Vec<u64> = self.inner.processes.read().keys().copied().collect();
        for id in ids {
            let target = ServerRef::local(id);
            if !self.stop_timeout(&target, ExitReason::Shutdown, timeout) {
                self.abandon(id, ExitReason::Shutdown);
            }
        }
    }

    fn handle_of(&self, id: u64) -> Option<Arc<ProcessHandle>> {
        self.inner.processes.read().get(&id).cloned()
    }
}

/// Public snapshot of one process, as reported by the observer.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: u64,
    pub name: Option<String>,
    pub status: ProcessStatus,
    pub queue_len: usize,
    pub message_count: u64,
    pub uptime_ms: u64,
}

impl ProcessInfo {
    fn from_handle(handle: &ProcessHandle) -> ProcessInfo {
        ProcessInfo {
            id: handle.id,
            name: handle.name.lock().clone(),
            status: handle.status(),
            queue_len: handle.queue_len(),
            message_count: handle.message_count.load(Ordering::Relaxed),
            uptime_ms: handle.uptime_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

/// Run a fallible handler, turning panics into error strings so a panicking
/// behavior crashes its process instead of unwinding through the runtime.
fn run_contained<T>(
    f: impl FnOnce() -> std::result::Result<T, String>,
) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

fn dispatch_loop(
    inner: Arc<KernelInner>,
    handle: Arc<ProcessHandle>,
    behavior: Behavior,
    mut state: Term,
    receiver: Receiver<Envelope>,
) {
    let reason = loop {
        match receiver.recv() {
            Ok(Envelope::Call { reply, payload }) => {
                let call = behavior.handle_call.clone();
                let current = state.clone();
                match run_contained(move || call(payload, current)) {
                    Ok((value, new_state)) => {
                        state = new_state;
                        handle.message_count.fetch_add(1, Ordering::Relaxed);
                        persist_state(&inner, &behavior, handle.id, &state);
                        let _ = reply.send(Ok(value));
                    }
                    Err(detail) => {
                        let _ = reply.send(Err(CallFault::Handler(detail.clone())));
                        break ExitReason::Error(detail);
                    }
                }
            }
            Ok(Envelope::Cast { payload }) => {
                let cast = behavior.handle_cast.clone();
                let current = state.clone();
                match run_contained(move || cast(payload, current)) {
                    Ok(new_state) => {
                        state = new_state;
                        handle.message_count.fetch_add(1, Ordering::Relaxed);
                        persist_state(&inner, &behavior, handle.id, &state);
                    }
                    Err(detail) => break ExitReason::Error(detail),
                }
            }
            Ok(Envelope::Stop { reason }) => break reason,
            // Every sender is gone: the record was removed underneath us.
            Err(_) => break ExitReason::Normal,
        }
    };
    finish(inner, handle, behavior, state, receiver, reason);
}

/// Terminal sequence: reject queued calls, run `terminate` once, clean the
/// registry, remove the record, emit the terminal event.
fn finish(
    inner: Arc<KernelInner>,
    handle: Arc<ProcessHandle>,
    behavior: Behavior,
    state: Term,
    receiver: Receiver<Envelope>,
    reason: ExitReason,
) {
    handle.set_status(ProcessStatus::Stopping);

    // The stopping state drains nothing: queued calls are rejected, casts
    // and further stop signals dropped.
    while let Ok(envelope) = receiver.try_recv() {
        if let Envelope::Call { reply, .. } = envelope {
            let _ = reply.send(Err(CallFault::Stopped));
        }
    }

    if let Some(terminate) = &behavior.terminate {
        let terminate = terminate.clone();
        let final_state = state;
        let term_reason = reason.clone();
        if catch_unwind(AssertUnwindSafe(move || terminate(&term_reason, final_state))).is_err() {
            warn!("terminate callback panicked for process {}", handle.id);
        }
    }

    inner.registry.cleanup_process(handle.id);
    inner.processes.write().remove(&handle.id);

    if !handle.is_abandoned() {
        let event = match &reason {
            ExitReason::Error(detail) => LifecycleEvent::Crashed {
                id: handle.id,
                error: detail.clone(),
            },
            other => LifecycleEvent::Terminated {
                id: handle.id,
                reason: other.clone(),
            },
        };
        inner.events.emit(&event);
    }

    handle.set_status(ProcessStatus::Stopped);
}

fn persist_state(inner: &KernelInner, behavior: &Behavior, id: u64, state: &Term) {
    if let (Some(spec), Some(storage)) = (&behavior.persistence, &inner.storage) {
        let snapshot = PersistedState::new(
            state.clone(),
            id,
            spec.schema_version,
            inner.clock.now_ms(),
        );
        match serde_json::to_vec(&snapshot) {
            Ok(blob) => {
                if let Err(e) = storage.save(&spec.key, &blob) {
                    warn!("state save failed for process {}: {}", id, e);
                }
            }
            Err(e) => warn!("state snapshot failed for process {}: {}", id, e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::behavior::PersistenceSpec;
    use crate::persist::MemoryStorage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// A counter: `init -> args`, `get` replies the count,
    /// `inc` bumps it.
    fn counter() -> Behavior {
        Behavior::builder()
            .init(|args| Ok(args))
            .on_call(|msg, state| match msg.as_str() {
                Some("get") => Ok((state.clone(), state)),
                _ => Err(format!("unhandled call: {}", msg)),
            })
            .on_cast(|msg, state| match msg.as_str() {
                Some("inc") => Ok(Term::Int(state.as_i64().unwrap_or(0) + 1)),
                _ => Ok(state),
            })
            .build()
    }

    fn call_timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn test_counter_scenario() {
        // Three casts then a call observes 3; a call after stop fails.
        let kernel = Kernel::new();
        let server = kernel
            .start(counter(), StartOptions::with_args(Term::Int(0)))
            .unwrap();

        kernel.cast(&server, Term::str("inc"));
        kernel.cast(&server, Term::str("inc"));
        kernel.cast(&server, Term::str("inc"));

        let reply = kernel.call(&server, Term::str("get"), call_timeout()).unwrap();
        assert_eq!(reply, Term::Int(3));

        kernel.stop(&server, ExitReason::Normal);
        let err = kernel
            .call(&server, Term::str("get"), call_timeout())
            .unwrap_err();
        assert!(matches!(err, Error::ServerNotRunning { server_id, .. } if server_id == server.id));
    }

    #[test]
    fn test_call_reply_matches_handler_return() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_call(|msg, state| {
                let n = msg.as_i64().unwrap_or(0);
                Ok((Term::Int(n * 2), state))
            })
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();
        assert_eq!(
            kernel.call(&server, Term::Int(21), call_timeout()).unwrap(),
            Term::Int(42)
        );
    }

    #[test]
    fn test_init_failure_is_atomic() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder().init(|_| Err("refused".into())).build();
        let err = kernel
            .start(behavior, StartOptions::named("doomed"))
            .unwrap_err();
        assert!(matches!(err, Error::InitFailed { detail } if detail == "refused"));
        // The reserved name was released and no process exists.
        assert_eq!(kernel.registry().whereis("doomed"), None);
        assert_eq!(kernel.process_count(), 0);
    }

    #[test]
    fn test_init_panic_is_contained() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder()
            .init(|_| panic!("init exploded"))
            .build();
        let err = kernel.start(behavior, StartOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InitFailed { detail } if detail.contains("init exploded")));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let kernel = Kernel::new();
        kernel
            .start(counter(), StartOptions::named("svc"))
            .unwrap();
        let err = kernel
            .start(counter(), StartOptions::named("svc"))
            .unwrap_err();
        assert!(matches!(err, Error::RegistryConflict { name } if name == "svc"));
    }

    #[test]
    fn test_name_released_on_stop() {
        let kernel = Kernel::new();
        let server = kernel
            .start(counter(), StartOptions::named("svc"))
            .unwrap();
        assert_eq!(kernel.registry().whereis("svc"), Some(server.id));
        kernel.stop(&server, ExitReason::Normal);
        assert_eq!(kernel.registry().whereis("svc"), None);
    }

    #[test]
    fn test_call_timeout_and_late_reply_discarded() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_call(|_, state| {
                std::thread::sleep(Duration::from_millis(300));
                Ok((Term::str("late"), state))
            })
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();

        let err = kernel
            .call(&server, Term::Null, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CallTimeout { timeout_ms: 50, .. }
        ));

        // The orphaned handler finishes and its late reply is discarded; the
        // process keeps running and serves the next call.
        let reply = kernel.call(&server, Term::Null, call_timeout()).unwrap();
        assert_eq!(reply, Term::str("late"));
    }

    #[test]
    fn test_handler_error_crashes_process_and_rejects_awaiter() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_call(|_, _| Err("kaboom".into()))
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();

        let err = kernel.call(&server, Term::Null, call_timeout()).unwrap_err();
        assert!(matches!(err, Error::CallFailed { detail } if detail == "kaboom"));

        // The process crashed; later calls fail.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while kernel.is_running(server.id) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            kernel.call(&server, Term::Null, call_timeout()),
            Err(Error::ServerNotRunning { .. })
        ));
    }

    #[test]
    fn test_handler_panic_crashes_process() {
        let kernel = Kernel::new();
        let crashed = Arc::new(AtomicUsize::new(0));
        let crashed2 = Arc::clone(&crashed);
        kernel.events().subscribe(move |event| {
            if matches!(event, LifecycleEvent::Crashed { .. }) {
                crashed2.fetch_add(1, Ordering::SeqCst);
            }
        });

        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_cast(|_, _| panic!("cast panic"))
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();
        kernel.cast(&server, Term::Null);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while crashed.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(crashed.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.process_count(), 0);
    }

    #[test]
    fn test_terminate_runs_exactly_once_with_reason_and_state() {
        let kernel = Kernel::new();
        let seen: Arc<StdMutex<Vec<(String, Term)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);

        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Int(7)))
            .on_terminate(move |reason, state| {
                seen2.lock().unwrap().push((reason.to_string(), state));
            })
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();
        kernel.stop(&server, ExitReason::Shutdown);

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "shutdown");
        assert_eq!(calls[0].1, Term::Int(7));
    }

    #[test]
    fn test_terminate_runs_on_crash() {
        let kernel = Kernel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_cast(|_, _| Err("died".into()))
            .on_terminate(move |reason, _| {
                assert!(matches!(reason, ExitReason::Error(_)));
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();
        kernel.cast(&server, Term::Null);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_calls_rejected_when_stopping() {
        let kernel = Kernel::new();
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Null))
            .on_cast(|_, state| {
                // Slow handler so envelopes pile up behind it.
                std::thread::sleep(Duration::from_millis(150));
                Ok(state)
            })
            .on_call(|_, state| Ok((Term::str("ok"), state)))
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();

        kernel.cast(&server, Term::Null);
        kernel.stop_async(&server, ExitReason::Normal);

        // This call is queued behind the stop signal and must be rejected.
        let err = kernel.call(&server, Term::Null, call_timeout()).unwrap_err();
        assert!(matches!(err, Error::ServerNotRunning { .. }));
    }

    #[test]
    fn test_stop_missing_ref_is_noop() {
        let kernel = Kernel::new();
        kernel.stop(&ServerRef::local(9999), ExitReason::Normal);
    }

    #[test]
    fn test_lifecycle_event_order() {
        let kernel = Kernel::new();
        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let events2 = Arc::clone(&events);
        kernel.events().subscribe(move |event| {
            let tag = match event {
                LifecycleEvent::Started { .. } => "started",
                LifecycleEvent::Terminated { .. } => "terminated",
                LifecycleEvent::Crashed { .. } => "crashed",
            };
            events2.lock().unwrap().push(tag.to_string());
        });

        let server = kernel.start(counter(), StartOptions::default()).unwrap();
        kernel.stop(&server, ExitReason::Normal);

        let log = events.lock().unwrap();
        assert_eq!(*log, vec!["started", "terminated"]);
    }

    #[test]
    fn test_message_count_and_info() {
        let kernel = Kernel::new();
        let server = kernel
            .start(counter(), StartOptions::with_args(Term::Int(0)))
            .unwrap();
        kernel.cast(&server, Term::str("inc"));
        kernel.cast(&server, Term::str("inc"));
        kernel.call(&server, Term::str("get"), call_timeout()).unwrap();

        let info = kernel.info(server.id).unwrap();
        assert_eq!(info.message_count, 3);
        assert_eq!(info.status, ProcessStatus::Running);
    }

    #[test]
    fn test_mailbox_high_watermark_drops_casts() {
        let kernel = Kernel::with_options(KernelOptions {
            mailbox_high_watermark: Some(2),
            ..KernelOptions::default()
        });
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Int(0)))
            .on_cast(|_, state| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(Term::Int(state.as_i64().unwrap_or(0) + 1))
            })
            .on_call(|_, state| Ok((state.clone(), state)))
            .build();
        let server = kernel.start(behavior, StartOptions::default()).unwrap();

        // Flood well past the watermark while the first cast is in flight.
        for _ in 0..10 {
            kernel.cast(&server, Term::Null);
        }
        let handled = kernel
            .call(&server, Term::Null, call_timeout())
            .unwrap()
            .as_i64()
            .unwrap();
        assert!(handled < 10, "watermark should have dropped casts");
    }

    #[test]
    fn test_persistence_restores_state_across_restarts() {
        let storage = MemoryStorage::new();
        let kernel = Kernel::with_options(KernelOptions {
            storage: Some(storage.clone()),
            ..KernelOptions::default()
        });

        let make = || {
            Behavior::builder()
                .init(|_| Ok(Term::Int(0)))
                .on_cast(|_, state| Ok(Term::Int(state.as_i64().unwrap_or(0) + 1)))
                .on_call(|_, state| Ok((state.clone(), state)))
                .persistence(PersistenceSpec::new("counter", 1))
                .build()
        };

        let server = kernel.start(make(), StartOptions::default()).unwrap();
        kernel.cast(&server, Term::Null);
        kernel.cast(&server, Term::Null);
        kernel.call(&server, Term::Null, call_timeout()).unwrap();
        kernel.stop(&server, ExitReason::Normal);

        // A fresh start restores the persisted count instead of re-running init.
        let restarted = kernel.start(make(), StartOptions::default()).unwrap();
        let reply = kernel.call(&restarted, Term::Null, call_timeout()).unwrap();
        assert_eq!(reply, Term::Int(2));
    }

    #[test]
    fn test_migration_runs_on_schema_mismatch() {
        let storage = MemoryStorage::new();
        // Seed a version-1 snapshot by hand.
        let old = PersistedState::new(Term::Int(5), 1, 1, 1000);
        storage
            .save("svc", &serde_json::to_vec(&old).unwrap())
            .unwrap();

        let kernel = Kernel::with_options(KernelOptions {
            storage: Some(storage),
            ..KernelOptions::default()
        });
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Int(0)))
            .on_call(|_, state| Ok((state.clone(), state)))
            .persistence(
                PersistenceSpec::new("svc", 2).with_migration(|from, state| {
                    assert_eq!(from, 1);
                    // v2 stores the count times ten.
                    Ok(Term::Int(state.as_i64().unwrap_or(0) * 10))
                }),
            )
            .build();

        let server = kernel.start(behavior, StartOptions::default()).unwrap();
        let reply = kernel.call(&server, Term::Null, call_timeout()).unwrap();
        assert_eq!(reply, Term::Int(50));
    }

    #[test]
    fn test_migration_failure_fails_start() {
        let storage = MemoryStorage::new();
        let old = PersistedState::new(Term::Int(5), 1, 1, 1000);
        storage
            .save("svc", &serde_json::to_vec(&old).unwrap())
            .unwrap();

        let kernel = Kernel::with_options(KernelOptions {
            storage: Some(storage),
            ..KernelOptions::default()
        });

        // Schema mismatch without a migration: start must fail, not fall
        // back to init.
        let behavior = Behavior::builder()
            .init(|_| Ok(Term::Int(0)))
            .persistence(PersistenceSpec::new("svc", 2))
            .build();
        let err = kernel.start(behavior, StartOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Migration { .. }));
        assert_eq!(kernel.process_count(), 0);
    }

    #[test]
    fn test_shutdown_all() {
        let kernel = Kernel::new();
        for _ in 0..5 {
            kernel.start(counter(), StartOptions::default()).unwrap();
        }
        assert_eq!(kernel.process_count(), 5);
        kernel.shutdown_all(Duration::from_secs(1));
        assert_eq!(kernel.process_count(), 0);
    }

    #[test]
    fn test_per_process_serialization_under_concurrent_casts() {
        // Many producer threads cast concurrently; the handler increments
        // unguarded state. Serialized dispatch means no increment is lost.
        let kernel = Kernel::new();
        let server = kernel
            .start(counter(), StartOptions::with_args(Term::Int(0)))
            .unwrap();

        let threads = 8;
        let per_thread = 50;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let kernel = kernel.clone();
                let server = server.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        kernel.cast(&server, Term::str("inc"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reply = kernel.call(&server, Term::str("get"), call_timeout()).unwrap();
        assert_eq!(reply, Term::Int((threads * per_thread) as i64));
    }
}
