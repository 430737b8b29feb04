//! Process lifecycle events.
//!
//! The kernel emits one `Started` per process and, later, exactly one
//! `Terminated` or `Crashed`. Registries, supervisors, monitors, and the
//! observer subscribe here instead of polling.
//!
//! Subscribers run isolated: a panicking subscriber is logged and skipped so
//! the remaining subscribers still see the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;

use crate::actor::process::ExitReason;

/// A process lifecycle transition.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The process finished `init` and entered the running state.
    Started { id: u64, name: Option<String> },
    /// The process stopped deliberately (stop request, normal exit, shutdown).
    Terminated { id: u64, reason: ExitReason },
    /// A handler failed; the process was torn down with an error reason.
    Crashed { id: u64, error: String },
}

impl LifecycleEvent {
    /// The id of the process this event concerns.
    pub fn process_id(&self) -> u64 {
        match self {
            LifecycleEvent::Started { id, .. }
            | LifecycleEvent::Terminated { id, .. }
            | LifecycleEvent::Crashed { id, .. } => *id,
        }
    }
}

type Subscriber = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

/// Fan-out point for lifecycle events.
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    /// Register a subscriber; returns a token for `unsubscribe`.
    pub fn subscribe(&self, f: impl Fn(&LifecycleEvent) + Send + Sync + 'static) -> u64 {
        let token = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((token, Arc::new(f)));
        token
    }

    /// Remove a subscriber. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: u64) {
        self.subscribers.write().retain(|(t, _)| *t != token);
    }

    /// Deliver an event to every subscriber, isolating panics.
    pub fn emit(&self, event: &LifecycleEvent) {
        // Snapshot under the read lock so subscribers may themselves
        // subscribe or unsubscribe without deadlocking.
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!("lifecycle subscriber panicked on {:?}", event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        hub.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&LifecycleEvent::Started { id: 1, name: None });
        hub.emit(&LifecycleEvent::Terminated {
            id: 1,
            reason: ExitReason::Normal,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let token = hub.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        hub.unsubscribe(token);
        hub.emit(&LifecycleEvent::Started { id: 1, name: None });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));

        hub.subscribe(|_| panic!("bad subscriber"));
        let seen2 = Arc::clone(&seen);
        hub.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&LifecycleEvent::Crashed {
            id: 9,
            error: "boom".into(),
        });
        // The second subscriber still ran.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_id_accessor() {
        assert_eq!(
            LifecycleEvent::Started { id: 7, name: None }.process_id(),
            7
        );
        assert_eq!(
            LifecycleEvent::Crashed {
                id: 8,
                error: String::new()
            }
            .process_id(),
            8
        );
    }
}
