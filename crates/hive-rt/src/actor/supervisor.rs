//! Local supervision trees.
//!
//! A supervisor is itself a kernel process: it can be registered, stopped,
//! and -- crucially -- supervised, so trees nest and an exceeded restart
//! intensity propagates to the parent as an ordinary child exit.
//!
//! Child exits reach the supervisor as casts: a lifecycle subscription
//! forwards terminal events for watched children into the supervisor's
//! mailbox, where the configured strategy is applied with restart-intensity
//! accounting. Children the supervisor stops on purpose are unwatched first,
//! so intentional stops never loop back as failures.
//!
//! Shutdown stops children in reverse start order, waiting up to each
//! child's own deadline before abandoning it. This ordering is a contract,
//! not an optimization.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use hive_wire::Term;

use super::child_spec::{
    AutoShutdown, ChildSpec, ChildState, DynamicChildSpec, RestartPolicy, RestartWindow, Strategy,
    SupervisorOptions,
};
use super::kernel::{Kernel, StartOptions};
use super::observer::SupSnapshot;
use super::process::{ExitReason, ServerRef};
use crate::error::{Error, Result};
use crate::event::LifecycleEvent;

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Handle to a running supervisor.
pub struct Supervisor {
    kernel: Kernel,
    server: ServerRef,
    inner: Arc<Mutex<SupInner>>,
    watched: WatchMap,
    event_token: u64,
}

struct SupInner {
    strategy: Strategy,
    window: RestartWindow,
    auto_shutdown: AutoShutdown,
    children: Vec<ChildState>,
    template: Option<DynamicChildSpec>,
    next_dynamic_id: u64,
    stopping: bool,
}

/// Child server-id -> child-spec id, for routing exit events. Children
/// stopped deliberately are removed before the stop, so only unexpected
/// exits route back to the supervisor.
type WatchMap = Arc<Mutex<FxHashMap<u64, String>>>;

/// The supervisor's own ref, filled in right after start. Exit events that
/// race the start are buffered and flushed once the ref is known.
struct SupCell {
    server: Option<ServerRef>,
    pending: Vec<Term>,
}

/// Public view of one child.
#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub id: String,
    pub server: Option<ServerRef>,
    pub running: bool,
    pub restart_count: u32,
    pub significant: bool,
}

impl Supervisor {
    /// Start a supervisor with static children, started sequentially in spec
    /// order before this returns. If any child fails to start, the already
    /// started ones are stopped in reverse order and the start fails.
    pub fn start(
        kernel: &Kernel,
        options: SupervisorOptions,
        specs: Vec<ChildSpec>,
    ) -> Result<Supervisor> {
        if options.strategy == Strategy::SimpleOneForOne {
            return Err(Error::InitFailed {
                detail: "simple_one_for_one supervisors start via start_simple".into(),
            });
        }
        Self::start_with(kernel, options, specs, None)
    }

    /// Start a `simple_one_for_one` supervisor from a child template.
    /// Children are added later via [`Supervisor::start_dynamic_child`].
    pub fn start_simple(
        kernel: &Kernel,
        options: SupervisorOptions,
        template: DynamicChildSpec,
    ) -> Result<Supervisor> {
        if options.strategy != Strategy::SimpleOneForOne {
            return Err(Error::InitFailed {
                detail: "start_simple requires the simple_one_for_one strategy".into(),
            });
        }
        Self::start_with(kernel, options, Vec::new(), Some(template))
    }

    fn start_with(
        kernel: &Kernel,
        options: SupervisorOptions,
        specs: Vec<ChildSpec>,
        template: Option<DynamicChildSpec>,
    ) -> Result<Supervisor> {
        let inner = Arc::new(Mutex::new(SupInner {
            strategy: options.strategy,
            window: RestartWindow::new(options.max_restarts, options.within_ms),
            auto_shutdown: options.auto_shutdown,
            children: specs.into_iter().map(ChildState::new).collect(),
            template,
            next_dynamic_id: 1,
            stopping: false,
        }));
        let watched: WatchMap = Arc::new(Mutex::new(FxHashMap::default()));
        let cell = Arc::new(Mutex::new(SupCell {
            server: None,
            pending: Vec::new(),
        }));

        let max_restarts = options.max_restarts;
        let within_ms = options.within_ms;

        // Exit events for watched children become casts into the
        // supervisor's own mailbox, serializing strategy handling with
        // everything else the supervisor does.
        let sub_kernel = kernel.clone();
        let sub_watched = Arc::clone(&watched);
        let sub_cell = Arc::clone(&cell);
        let event_token = kernel.events().subscribe(move |event| {
            let (id, reason_kind, detail) = match event {
                LifecycleEvent::Terminated { id, reason } => {
                    let (kind, detail) = reason.to_wire();
                    (*id, kind.as_str(), detail)
                }
                LifecycleEvent::Crashed { id, error } => (*id, "error", Some(error.clone())),
                LifecycleEvent::Started { .. } => return,
            };
            if !sub_watched.lock().contains_key(&id) {
                return;
            }
            let msg = Term::object([
                ("sup_event", Term::str("child_exit")),
                ("child", Term::Int(id as i64)),
                ("reason", Term::str(reason_kind)),
                (
                    "detail",
                    detail.map(Term::Str).unwrap_or(Term::Null),
                ),
            ]);
            let mut cell = sub_cell.lock();
            match &cell.server {
                Some(server) => sub_kernel.cast(server, msg),
                None => cell.pending.push(msg),
            }
        });

        let init_kernel = kernel.clone();
        let init_inner = Arc::clone(&inner);
        let init_watched = Arc::clone(&watched);

        let cast_kernel = kernel.clone();
        let cast_inner = Arc::clone(&inner);
        let cast_watched = Arc::clone(&watched);
        let cast_cell = Arc::clone(&cell);

        let term_kernel = kernel.clone();
        let term_inner = Arc::clone(&inner);
        let term_watched = Arc::clone(&watched);
        let term_cell = Arc::clone(&cell);

        let behavior = super::behavior::Behavior::builder()
            .init(move |_| {
                let mut sup = init_inner.lock();
                start_children_range(&mut sup, &init_kernel, &init_watched, 0)
                    .map_err(|e| format!("child start failed: {}", e))?;
                Ok(Term::Null)
            })
            .on_cast(move |msg, state| {
                if msg.get("sup_event").and_then(Term::as_str) != Some("child_exit") {
                    return Ok(state);
                }
                let child_server_id = msg
                    .get("child")
                    .and_then(Term::as_i64)
                    .ok_or("malformed child_exit message")? as u64;
                let abnormal = matches!(
                    msg.get("reason").and_then(Term::as_str),
                    Some("error") | Some("nodedown")
                );

                let mut sup = cast_inner.lock();
                if sup.stopping {
                    return Ok(state);
                }
                // Claim the watch entry; a missing entry means the exit was
                // intentional or belongs to an older incarnation.
                let child_id = match cast_watched.lock().remove(&child_server_id) {
                    Some(id) => id,
                    None => return Ok(state),
                };

                let self_stop = handle_child_exit(
                    &mut sup,
                    &cast_kernel,
                    &cast_watched,
                    &child_id,
                    abnormal,
                    max_restarts,
                    within_ms,
                )?;
                drop(sup);

                if self_stop {
                    let cell = cast_cell.lock();
                    if let Some(server) = &cell.server {
                        debug!("supervisor {} auto-shutdown", server.id);
                        cast_kernel.stop_async(server, ExitReason::Normal);
                    }
                }
                Ok(state)
            })
            .on_terminate(move |_reason, _state| {
                let mut sup = term_inner.lock();
                sup.stopping = true;
                stop_children_reverse(&mut sup, &term_kernel, &term_watched, 0);
                if let Some(server) = &term_cell.lock().server {
                    term_kernel.sup_index().unregister(server.id);
                }
            })
            .build();

        let mut start_options = StartOptions::default();
        start_options.name = options.name.clone();
        let server = match kernel.start(behavior, start_options) {
            Ok(server) => server,
            Err(err) => {
                kernel.events().unsubscribe(event_token);
                return Err(err);
            }
        };

        // Publish the ref and flush exits that raced the start.
        let pending = {
            let mut cell = cell.lock();
            cell.server = Some(server.clone());
            std::mem::take(&mut cell.pending)
        };
        for msg in pending {
            kernel.cast(&server, msg);
        }

        // Register with the observer's supervisor index.
        let index_inner = Arc::clone(&inner);
        let index_name = options.name.clone();
        kernel.sup_index().register(
            server.id,
            Arc::new(move || {
                let sup = index_inner.lock();
                SupSnapshot {
                    name: index_name.clone(),
                    children: sup
                        .children
                        .iter()
                        .map(|c| (c.spec.id.clone(), c.server.as_ref().map(|s| s.id), c.running))
                        .collect(),
                }
            }),
        );

        Ok(Supervisor {
            kernel: kernel.clone(),
            server,
            inner,
            watched,
            event_token,
        })
    }

    /// The supervisor's own process reference.
    pub fn server_ref(&self) -> &ServerRef {
        &self.server
    }

    /// Add and start a child dynamically. Fails with `RegistryConflict` on a
    /// duplicate child id. Not available under `simple_one_for_one`.
    pub fn start_child(&self, spec: ChildSpec) -> Result<ServerRef> {
        let watched = self.watched_of();
        let mut sup = self.inner.lock();
        if sup.strategy == Strategy::SimpleOneForOne {
            return Err(Error::InitFailed {
                detail: "simple_one_for_one supervisors take start_dynamic_child".into(),
            });
        }
        if sup.children.iter().any(|c| c.spec.id == spec.id) {
            return Err(Error::RegistryConflict { name: spec.id });
        }
        let mut child = ChildState::new(spec);
        start_single_child(&mut child, &self.kernel, &watched)?;
        let server = child.server.clone().expect("started child has a ref");
        sup.children.push(child);
        Ok(server)
    }

    /// Start a dynamic child from the `simple_one_for_one` template.
    pub fn start_dynamic_child(&self, args: Term) -> Result<ServerRef> {
        let watched = self.watched_of();
        let mut sup = self.inner.lock();
        let template = sup.template.clone().ok_or_else(|| Error::InitFailed {
            detail: "supervisor has no dynamic child template".into(),
        })?;
        let id = format!("{}-{}", template.id_prefix, sup.next_dynamic_id);
        sup.next_dynamic_id += 1;

        let start = Arc::clone(&template.start);
        let spec = ChildSpec {
            id,
            start: Arc::new(move |kernel: &Kernel| start(kernel, args.clone())),
            restart: template.restart,
            shutdown_timeout_ms: template.shutdown_timeout_ms,
            significant: template.significant,
        };
        let mut child = ChildState::new(spec);
        start_single_child(&mut child, &self.kernel, &watched)?;
        let server = child.server.clone().expect("started child has a ref");
        sup.children.push(child);
        Ok(server)
    }

    /// Stop a child and remove its spec.
    pub fn terminate_child(&self, child_id: &str) -> Result<()> {
        let watched = self.watched_of();
        let mut sup = self.inner.lock();
        let idx = sup
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| Error::ChildNotFound {
                id: child_id.to_string(),
            })?;
        stop_single_child(&mut sup.children[idx], &self.kernel, &watched);
        sup.children.remove(idx);
        Ok(())
    }

    /// Stop and restart a child, keeping its spec. Manual restarts do not
    /// count toward restart intensity.
    pub fn restart_child(&self, child_id: &str) -> Result<ServerRef> {
        let watched = self.watched_of();
        let mut sup = self.inner.lock();
        let idx = sup
            .children
            .iter()
            .position(|c| c.spec.id == child_id)
            .ok_or_else(|| Error::ChildNotFound {
                id: child_id.to_string(),
            })?;
        stop_single_child(&mut sup.children[idx], &self.kernel, &watched);
        start_single_child(&mut sup.children[idx], &self.kernel, &watched)?;
        Ok(sup.children[idx]
            .server
            .clone()
            .expect("restarted child has a ref"))
    }

    /// Current child states, in start order.
    pub fn children(&self) -> Vec<ChildInfo> {
        self.inner
            .lock()
            .children
            .iter()
            .map(|c| ChildInfo {
                id: c.spec.id.clone(),
                server: c.server.clone(),
                running: c.running,
                restart_count: c.restart_count,
                significant: c.spec.significant,
            })
            .collect()
    }

    /// Stop the supervisor and, through its terminate callback, every child
    /// in reverse start order.
    pub fn stop(&self) {
        self.kernel.events().unsubscribe(self.event_token);
        self.kernel.stop(&self.server, ExitReason::Shutdown);
    }

    fn watched_of(&self) -> WatchMap {
        Arc::clone(&self.watched)
    }
}

// ---------------------------------------------------------------------------
// Child lifecycle helpers
// ---------------------------------------------------------------------------

fn start_single_child(
    child: &mut ChildState,
    kernel: &Kernel,
    watched: &Mutex<FxHashMap<u64, String>>,
) -> Result<()> {
    let server = (child.spec.start)(kernel)?;
    watched.lock().insert(server.id, child.spec.id.clone());
    child.server = Some(server);
    child.running = true;
    Ok(())
}

/// Stop one child on purpose: unwatch first so the exit never routes back,
/// then wait up to the child's deadline, abandoning it if it ignores the
/// stop.
fn stop_single_child(
    child: &mut ChildState,
    kernel: &Kernel,
    watched: &Mutex<FxHashMap<u64, String>>,
) {
    if let Some(server) = child.server.take() {
        watched.lock().remove(&server.id);
        let timeout = std::time::Duration::from_millis(child.spec.shutdown_timeout_ms);
        if !kernel.stop_timeout(&server, ExitReason::Shutdown, timeout) {
            warn!(
                "child '{}' ignored its {}ms shutdown deadline",
                child.spec.id, child.spec.shutdown_timeout_ms
            );
            kernel.abandon(server.id, ExitReason::Shutdown);
        }
    }
    child.running = false;
}

/// Start children `[from..]` sequentially in spec order; on failure, stop
/// the ones started in this pass (reverse order) and report the failure.
fn start_children_range(
    sup: &mut SupInner,
    kernel: &Kernel,
    watched: &Mutex<FxHashMap<u64, String>>,
    from: usize,
) -> Result<()> {
    for i in from..sup.children.len() {
        if let Err(err) = start_single_child(&mut sup.children[i], kernel, watched) {
            for j in (from..i).rev() {
                stop_single_child(&mut sup.children[j], kernel, watched);
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Stop children `[from..]` in reverse order.
fn stop_children_reverse(
    sup: &mut SupInner,
    kernel: &Kernel,
    watched: &Mutex<FxHashMap<u64, String>>,
    from: usize,
) {
    for i in (from..sup.children.len()).rev() {
        if sup.children[i].running {
            stop_single_child(&mut sup.children[i], kernel, watched);
        }
    }
}

/// Apply the restart policy and strategy to one child exit.
///
/// Returns `Ok(true)` when the auto-shutdown policy says the supervisor
/// should now stop itself, and `Err` when restart intensity was exceeded
/// (which crashes the supervisor process).
fn handle_child_exit(
    sup: &mut SupInner,
    kernel: &Kernel,
    watched: &WatchMap,
    child_id: &str,
    abnormal: bool,
    max_restarts: u32,
    within_ms: u64,
) -> std::result::Result<bool, String> {
    let idx = match sup.children.iter().position(|c| c.spec.id == child_id) {
        Some(idx) => idx,
        None => return Ok(false),
    };
    sup.children[idx].server = None;
    sup.children[idx].running = false;

    let policy = sup.children[idx].spec.restart;
    let significant = sup.children[idx].spec.significant;
    let should_restart = match policy {
        RestartPolicy::Permanent => true,
        RestartPolicy::Transient => abnormal,
        RestartPolicy::Temporary => false,
    };

    if !should_restart {
        if policy == RestartPolicy::Temporary {
            sup.children.remove(idx);
        }
        return Ok(auto_shutdown_due(sup, significant));
    }

    if !sup.window.try_record() {
        // Intensity exceeded: tear the tree down and fail the supervisor.
        stop_children_reverse(sup, kernel, watched, 0);
        return Err(format!(
            "max restarts exceeded: {} within {} ms",
            max_restarts, within_ms
        ));
    }

    match sup.strategy {
        Strategy::OneForOne | Strategy::SimpleOneForOne => {
            sup.children[idx].restart_count += 1;
            start_single_child(&mut sup.children[idx], kernel, watched)
                .map_err(|e| format!("restart of '{}' failed: {}", child_id, e))?;
        }
        Strategy::OneForAll => {
            stop_children_reverse(sup, kernel, watched, 0);
            sup.children[idx].restart_count += 1;
            start_children_range(sup, kernel, watched, 0)
                .map_err(|e| format!("one_for_all restart failed: {}", e))?;
        }
        Strategy::RestForOne => {
            stop_children_reverse(sup, kernel, watched, idx);
            sup.children[idx].restart_count += 1;
            start_children_range(sup, kernel, watched, idx)
                .map_err(|e| format!("rest_for_one restart failed: {}", e))?;
        }
    }
    Ok(false)
}

/// A significant child just terminated without restart; does the policy call
/// for self-stop?
fn auto_shutdown_due(sup: &SupInner, exited_significant: bool) -> bool {
    if !exited_significant {
        return false;
    }
    match sup.auto_shutdown {
        AutoShutdown::Never => false,
        AutoShutdown::AnySignificant => true,
        AutoShutdown::AllSignificant => !sup
            .children
            .iter()
            .any(|c| c.spec.significant && c.running),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
