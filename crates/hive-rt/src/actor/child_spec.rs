//! Child specifications and supervisor configuration types.
//!
//! A [`ChildSpec`] describes one supervised child: an id unique within its
//! supervisor, a start closure, a restart policy, a shutdown deadline, and a
//! significance flag for auto-shutdown. [`DynamicChildSpec`] is the template
//! form used by `simple_one_for_one` supervisors, whose children only exist
//! dynamically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hive_wire::Term;

use super::behavior::Behavior;
use super::kernel::{Kernel, StartOptions};
use super::process::ServerRef;
use crate::error::Result;

/// Starts (or restarts) a child, returning its fresh reference.
pub type ChildStart = Arc<dyn Fn(&Kernel) -> Result<ServerRef> + Send + Sync>;

/// Starts a dynamic child from per-child arguments.
pub type DynamicChildStart = Arc<dyn Fn(&Kernel, Term) -> Result<ServerRef> + Send + Sync>;

// ---------------------------------------------------------------------------
// Strategy / RestartPolicy / AutoShutdown
// ---------------------------------------------------------------------------

/// Which children are restarted when one exits abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Restart only the failed child.
    OneForOne,
    /// Stop all children (reverse order), then restart all (forward order).
    OneForAll,
    /// Stop and restart the failed child and every child declared after it.
    RestForOne,
    /// One template behavior; children exist only dynamically. On failure
    /// only that specific child is restarted.
    SimpleOneForOne,
}

/// When a child is restarted after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart, whatever the exit reason.
    Permanent,
    /// Restart only on abnormal exit; `normal` and `shutdown` do not restart.
    Transient,
    /// Never restart; the child is removed from the supervisor on exit.
    Temporary,
}

/// When a supervisor stops itself because its significant children are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoShutdown {
    Never,
    /// Stop when any significant child terminates without restart.
    AnySignificant,
    /// Stop when every significant child has terminated without restart.
    AllSignificant,
}

// ---------------------------------------------------------------------------
// ChildSpec
// ---------------------------------------------------------------------------

/// Default shutdown deadline, matching the OTP worker default.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Specification of one supervised child.
#[derive(Clone)]
pub struct ChildSpec {
    /// Unique identifier within the supervisor.
    pub id: String,
    pub start: ChildStart,
    pub restart: RestartPolicy,
    /// How long an ordered shutdown waits before force-terminating.
    pub shutdown_timeout_ms: u64,
    /// Participates in the supervisor's auto-shutdown policy.
    pub significant: bool,
}

impl ChildSpec {
    pub fn new(
        id: impl Into<String>,
        start: impl Fn(&Kernel) -> Result<ServerRef> + Send + Sync + 'static,
    ) -> Self {
        ChildSpec {
            id: id.into(),
            start: Arc::new(start),
            restart: RestartPolicy::Permanent,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            significant: false,
        }
    }

    /// Spec whose start runs a behavior factory with fixed init args. A
    /// restart re-runs the factory, so state always resets to init.
    pub fn from_behavior(
        id: impl Into<String>,
        factory: impl Fn() -> Behavior + Send + Sync + 'static,
        init_args: Term,
    ) -> Self {
        ChildSpec::new(id, move |kernel: &Kernel| {
            kernel.start(factory(), StartOptions::with_args(init_args.clone()))
        })
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    pub fn significant(mut self, significant: bool) -> Self {
        self.significant = significant;
        self
    }
}

/// Template spec for `simple_one_for_one` supervisors.
#[derive(Clone)]
pub struct DynamicChildSpec {
    /// Dynamic children are named `<id_prefix>-<n>`.
    pub id_prefix: String,
    pub start: DynamicChildStart,
    pub restart: RestartPolicy,
    pub shutdown_timeout_ms: u64,
    pub significant: bool,
}

impl DynamicChildSpec {
    pub fn new(
        id_prefix: impl Into<String>,
        start: impl Fn(&Kernel, Term) -> Result<ServerRef> + Send + Sync + 'static,
    ) -> Self {
        DynamicChildSpec {
            id_prefix: id_prefix.into(),
            start: Arc::new(start),
            restart: RestartPolicy::Permanent,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            significant: false,
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

// ---------------------------------------------------------------------------
// ChildState
// ---------------------------------------------------------------------------

/// Runtime state of one supervised child.
#[derive(Clone)]
pub(crate) struct ChildState {
    pub spec: ChildSpec,
    pub server: Option<ServerRef>,
    pub running: bool,
    pub restart_count: u32,
}

impl ChildState {
    pub fn new(spec: ChildSpec) -> Self {
        ChildState {
            spec,
            server: None,
            running: false,
            restart_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorOptions
// ---------------------------------------------------------------------------

/// Supervisor-level configuration.
#[derive(Clone)]
pub struct SupervisorOptions {
    pub strategy: Strategy,
    /// Restart intensity: at most `max_restarts` restarts...
    pub max_restarts: u32,
    /// ...within this window.
    pub within_ms: u64,
    pub auto_shutdown: AutoShutdown,
    /// Optional local registry name for the supervisor process.
    pub name: Option<String>,
}

impl SupervisorOptions {
    pub fn new(strategy: Strategy) -> Self {
        SupervisorOptions {
            strategy,
            max_restarts: 3,
            within_ms: 5000,
            auto_shutdown: AutoShutdown::Never,
            name: None,
        }
    }

    pub fn with_intensity(mut self, max_restarts: u32, within_ms: u64) -> Self {
        self.max_restarts = max_restarts;
        self.within_ms = within_ms;
        self
    }

    pub fn with_auto_shutdown(mut self, auto_shutdown: AutoShutdown) -> Self {
        self.auto_shutdown = auto_shutdown;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RestartWindow
// ---------------------------------------------------------------------------

/// Sliding window of restart timestamps enforcing restart intensity.
pub(crate) struct RestartWindow {
    history: VecDeque<Instant>,
    max_restarts: u32,
    within: Duration,
}

impl RestartWindow {
    pub fn new(max_restarts: u32, within_ms: u64) -> Self {
        RestartWindow {
            history: VecDeque::new(),
            max_restarts,
            within: Duration::from_millis(within_ms),
        }
    }

    /// Record a restart if the bound allows it. Returns `false` when the
    /// restart would exceed `max_restarts` within the window.
    pub fn try_record(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) > self.within {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.max_restarts as usize {
            false
        } else {
            self.history.push_back(now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_spec_defaults() {
        let spec = ChildSpec::new("w1", |_| unreachable!());
        assert_eq!(spec.id, "w1");
        assert_eq!(spec.restart, RestartPolicy::Permanent);
        assert_eq!(spec.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS);
        assert!(!spec.significant);
    }

    #[test]
    fn test_child_spec_builders() {
        let spec = ChildSpec::new("w1", |_| unreachable!())
            .with_restart(RestartPolicy::Transient)
            .with_shutdown_timeout_ms(100)
            .significant(true);
        assert_eq!(spec.restart, RestartPolicy::Transient);
        assert_eq!(spec.shutdown_timeout_ms, 100);
        assert!(spec.significant);
    }

    #[test]
    fn test_restart_window_respects_limit() {
        let mut window = RestartWindow::new(2, 60_000);
        assert!(window.try_record());
        assert!(window.try_record());
        assert!(!window.try_record());
    }

    #[test]
    fn test_restart_window_slides() {
        let mut window = RestartWindow::new(2, 50);
        assert!(window.try_record());
        assert!(window.try_record());
        assert!(!window.try_record());

        // After the window passes, old entries expire.
        std::thread::sleep(Duration::from_millis(80));
        assert!(window.try_record());
    }

    #[test]
    fn test_zero_max_restarts_always_exceeds() {
        let mut window = RestartWindow::new(0, 1000);
        assert!(!window.try_record());
    }

    #[test]
    fn test_supervisor_options_defaults() {
        let options = SupervisorOptions::new(Strategy::OneForOne);
        assert_eq!(options.max_restarts, 3);
        assert_eq!(options.within_ms, 5000);
        assert_eq!(options.auto_shutdown, AutoShutdown::Never);
        assert!(options.name.is_none());
    }
}
