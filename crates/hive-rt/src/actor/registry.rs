//! Local name registry.
//!
//! Maps flat string names to live process ids on this node. Entries are
//! removed automatically when the named process terminates -- the kernel wires
//! this registry to its lifecycle events, so terminating code never has to
//! clean up after itself.
//!
//! Names are flat; any namespacing (`"cache/users"`) is a convention, not a
//! mechanism.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// Name-to-process mapping with a reverse index for cleanup.
#[derive(Default)]
pub struct Registry {
    names: RwLock<FxHashMap<String, u64>>,
    /// id -> names reverse index, so process exit cleanup is O(names held).
    id_names: RwLock<FxHashMap<u64, Vec<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a process under a name. Fails with `RegistryConflict` if the
    /// name is taken.
    pub fn register(&self, name: impl Into<String>, id: u64) -> Result<()> {
        let name = name.into();
        let mut names = self.names.write();
        if names.contains_key(&name) {
            return Err(Error::RegistryConflict { name });
        }
        names.insert(name.clone(), id);
        self.id_names.write().entry(id).or_default().push(name);
        Ok(())
    }

    /// Remove a name. Returns `true` if it existed; double-unregister is a
    /// no-op returning `false`.
    pub fn unregister(&self, name: &str) -> bool {
        let mut names = self.names.write();
        match names.remove(name) {
            None => false,
            Some(id) => {
                let mut id_names = self.id_names.write();
                if let Some(list) = id_names.get_mut(&id) {
                    list.retain(|n| n != name);
                    if list.is_empty() {
                        id_names.remove(&id);
                    }
                }
                true
            }
        }
    }

    /// Resolve a name, failing if absent.
    pub fn lookup(&self, name: &str) -> Result<u64> {
        self.whereis(name).ok_or_else(|| Error::ServerNotRunning {
            server_id: 0,
            node: None,
        })
    }

    /// Resolve a name, `None` if absent.
    pub fn whereis(&self, name: &str) -> Option<u64> {
        self.names.read().get(name).copied()
    }

    /// Names currently registered for a process.
    pub fn names_of(&self, id: u64) -> Vec<String> {
        self.id_names.read().get(&id).cloned().unwrap_or_default()
    }

    /// Drop every registration for a process. Called from the kernel's
    /// lifecycle subscription when the process terminates.
    pub fn cleanup_process(&self, id: u64) {
        let removed = self.id_names.write().remove(&id).unwrap_or_default();
        if !removed.is_empty() {
            let mut names = self.names.write();
            for name in &removed {
                names.remove(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
