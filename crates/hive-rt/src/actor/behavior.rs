//! Behaviors and the behavior catalog.
//!
//! A behavior is the immutable record of callbacks defining a server's
//! semantics: `init`, `handle_call`, `handle_cast`, and an optional
//! `terminate`. State and messages are [`Term`]s, so any state a behavior
//! holds can be persisted and any message it accepts can cross a node
//! boundary.
//!
//! Because code cannot be serialized, remote spawn works by *name*: both
//! nodes register the same factory under the same name in their catalog
//! before the cluster starts, and a spawn request carries only the name.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use hive_wire::Term;

use super::process::ExitReason;
use crate::error::{Error, Result};

/// `init(args) -> initial state`.
pub type InitFn = dyn Fn(Term) -> std::result::Result<Term, String> + Send + Sync;
/// `handle_call(msg, state) -> (reply, new state)`.
pub type CallFn = dyn Fn(Term, Term) -> std::result::Result<(Term, Term), String> + Send + Sync;
/// `handle_cast(msg, state) -> new state`.
pub type CastFn = dyn Fn(Term, Term) -> std::result::Result<Term, String> + Send + Sync;
/// `terminate(reason, last state)`. Must not fail; panics are contained.
pub type TerminateFn = dyn Fn(&ExitReason, Term) + Send + Sync;
/// Migration callback: `(stored schema version, stored state) -> state`.
pub type MigrateFn = dyn Fn(u32, Term) -> std::result::Result<Term, String> + Send + Sync;

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// Immutable record of server callbacks.
#[derive(Clone)]
pub struct Behavior {
    pub(crate) init: Arc<InitFn>,
    pub(crate) handle_call: Arc<CallFn>,
    pub(crate) handle_cast: Arc<CastFn>,
    pub(crate) terminate: Option<Arc<TerminateFn>>,
    pub(crate) persistence: Option<PersistenceSpec>,
}

impl Behavior {
    pub fn builder() -> BehaviorBuilder {
        BehaviorBuilder::default()
    }
}

/// Builder for [`Behavior`].
///
/// Defaults: `init` returns `Term::Null`; an unhandled call is a handler
/// failure (crashing the server); an unhandled cast leaves the state as-is.
#[derive(Default)]
pub struct BehaviorBuilder {
    init: Option<Arc<InitFn>>,
    handle_call: Option<Arc<CallFn>>,
    handle_cast: Option<Arc<CastFn>>,
    terminate: Option<Arc<TerminateFn>>,
    persistence: Option<PersistenceSpec>,
}

impl BehaviorBuilder {
    pub fn init(
        mut self,
        f: impl Fn(Term) -> std::result::Result<Term, String> + Send + Sync + 'static,
    ) -> Self {
        self.init = Some(Arc::new(f));
        self
    }

    pub fn on_call(
        mut self,
        f: impl Fn(Term, Term) -> std::result::Result<(Term, Term), String> + Send + Sync + 'static,
    ) -> Self {
        self.handle_call = Some(Arc::new(f));
        self
    }

    pub fn on_cast(
        mut self,
        f: impl Fn(Term, Term) -> std::result::Result<Term, String> + Send + Sync + 'static,
    ) -> Self {
        self.handle_cast = Some(Arc::new(f));
        self
    }

    pub fn on_terminate(
        mut self,
        f: impl Fn(&ExitReason, Term) + Send + Sync + 'static,
    ) -> Self {
        self.terminate = Some(Arc::new(f));
        self
    }

    /// Declare persisted state for this behavior.
    pub fn persistence(mut self, spec: PersistenceSpec) -> Self {
        self.persistence = Some(spec);
        self
    }

    pub fn build(self) -> Behavior {
        Behavior {
            init: self.init.unwrap_or_else(|| Arc::new(|_| Ok(Term::Null))),
            handle_call: self
                .handle_call
                .unwrap_or_else(|| Arc::new(|msg, _| Err(format!("unhandled call: {}", msg)))),
            handle_cast: self
                .handle_cast
                .unwrap_or_else(|| Arc::new(|_, state| Ok(state))),
            terminate: self.terminate,
            persistence: self.persistence,
        }
    }
}

// ---------------------------------------------------------------------------
// PersistenceSpec
// ---------------------------------------------------------------------------

/// Persistence declaration for a behavior.
///
/// When present (and the node has a storage adapter), the kernel loads prior
/// state under `key` before running `init`. A stored snapshot whose schema
/// version differs must migrate successfully or the start fails; `init` is
/// never used as a silent fallback for a bad snapshot.
#[derive(Clone)]
pub struct PersistenceSpec {
    pub key: String,
    pub schema_version: u32,
    pub migrate: Option<Arc<MigrateFn>>,
}

impl PersistenceSpec {
    pub fn new(key: impl Into<String>, schema_version: u32) -> Self {
        PersistenceSpec {
            key: key.into(),
            schema_version,
            migrate: None,
        }
    }

    pub fn with_migration(
        mut self,
        f: impl Fn(u32, Term) -> std::result::Result<Term, String> + Send + Sync + 'static,
    ) -> Self {
        self.migrate = Some(Arc::new(f));
        self
    }
}

// ---------------------------------------------------------------------------
// BehaviorCatalog
// ---------------------------------------------------------------------------

/// A factory producing a fresh behavior per spawn.
pub type BehaviorFactory = Arc<dyn Fn() -> Behavior + Send + Sync>;

/// Node-wide map from behavior name to factory, populated before the cluster
/// starts.
///
/// Duplicate registration is rejected: factories cannot be compared, so a
/// second registration under an existing name always fails rather than
/// silently shadowing the first.
#[derive(Default)]
pub struct BehaviorCatalog {
    factories: RwLock<FxHashMap<String, BehaviorFactory>>,
}

impl BehaviorCatalog {
    pub fn new() -> Self {
        BehaviorCatalog::default()
    }

    /// Register a factory under a name.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Behavior + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(Error::BehaviorConflict { name });
        }
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Look up a factory.
    pub fn get(&self, name: &str) -> Result<BehaviorFactory> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BehaviorNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Behavior {
        Behavior::builder()
            .init(|args| Ok(args))
            .on_call(|_msg, state| Ok((state.clone(), state)))
            .on_cast(|_msg, state| Ok(Term::Int(state.as_i64().unwrap_or(0) + 1)))
            .build()
    }

    #[test]
    fn test_builder_wires_callbacks() {
        let behavior = counter();
        let state = (behavior.init)(Term::Int(5)).unwrap();
        assert_eq!(state, Term::Int(5));

        let (reply, state) = (behavior.handle_call)(Term::Null, state).unwrap();
        assert_eq!(reply, Term::Int(5));

        let state = (behavior.handle_cast)(Term::Null, state).unwrap();
        assert_eq!(state, Term::Int(6));
    }

    #[test]
    fn test_default_init_and_cast() {
        let behavior = Behavior::builder().build();
        assert_eq!((behavior.init)(Term::Int(9)).unwrap(), Term::Null);
        // Default cast keeps the state.
        assert_eq!(
            (behavior.handle_cast)(Term::Null, Term::Int(3)).unwrap(),
            Term::Int(3)
        );
    }

    #[test]
    fn test_default_call_is_a_failure() {
        let behavior = Behavior::builder().build();
        let result = (behavior.handle_call)(Term::str("ping"), Term::Null);
        assert!(result.is_err());
    }

    #[test]
    fn test_catalog_register_and_get() {
        let catalog = BehaviorCatalog::new();
        catalog.register("counter", counter).unwrap();
        assert!(catalog.contains("counter"));

        let factory = catalog.get("counter").unwrap();
        let behavior = factory();
        assert_eq!((behavior.init)(Term::Int(0)).unwrap(), Term::Int(0));
    }

    #[test]
    fn test_catalog_duplicate_rejected() {
        let catalog = BehaviorCatalog::new();
        catalog.register("svc", counter).unwrap();
        let err = catalog.register("svc", counter).unwrap_err();
        assert!(matches!(err, Error::BehaviorConflict { name } if name == "svc"));
    }

    #[test]
    fn test_catalog_missing_name() {
        let catalog = BehaviorCatalog::new();
        let err = match catalog.get("ghost") {
            Ok(_) => panic!("expected BehaviorNotFound error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::BehaviorNotFound { name } if name == "ghost"));
    }

    #[test]
    fn test_catalog_names_sorted() {
        let catalog = BehaviorCatalog::new();
        catalog.register("zeta", counter).unwrap();
        catalog.register("alpha", counter).unwrap();
        assert_eq!(catalog.names(), vec!["alpha", "zeta"]);
    }
}
