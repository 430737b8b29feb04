//! External collaborator interfaces: storage, clock, and persisted state.
//!
//! The core consumes persistence and time through the narrow traits below.
//! Durable adapters (files, databases) live outside this crate; an in-memory
//! adapter ships here for tests and for behaviors that only need state to
//! survive restarts within one node lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hive_wire::Term;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source. Injectable so registration timestamps are testable.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The system wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// StorageAdapter
// ---------------------------------------------------------------------------

/// Narrow key/blob storage interface the kernel persists server state
/// through. All methods are infallible-or-string so adapters in any backend
/// can implement them without leaking backend error types into the core.
pub trait StorageAdapter: Send + Sync {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), String>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    fn delete(&self, key: &str) -> Result<bool, String>;
    fn exists(&self, key: &str) -> Result<bool, String>;
    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, String>;

    /// Drop entries older than `max_age_ms`. Optional; default is a no-op.
    fn cleanup(&self, _max_age_ms: u64) -> Result<u64, String> {
        Ok(0)
    }

    /// Release backend resources. Optional; default is a no-op.
    fn close(&self) -> Result<(), String> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PersistedState
// ---------------------------------------------------------------------------

/// The stored form of a server's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: Term,
    pub metadata: PersistedMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMetadata {
    pub persisted_at: i64,
    pub server_id: u64,
    pub schema_version: u32,
}

impl PersistedState {
    /// Build a checksummed snapshot.
    pub fn new(state: Term, server_id: u64, schema_version: u32, persisted_at: i64) -> Self {
        let checksum = Some(state_checksum(&state));
        PersistedState {
            state,
            metadata: PersistedMetadata {
                persisted_at,
                server_id,
                schema_version,
            },
            checksum,
        }
    }

    /// Verify the checksum, if one is present. Snapshots written without a
    /// checksum are accepted as-is.
    pub fn verify(&self) -> Result<(), String> {
        match &self.checksum {
            None => Ok(()),
            Some(expected) => {
                let actual = state_checksum(&self.state);
                if &actual == expected {
                    Ok(())
                } else {
                    Err("checksum mismatch".to_string())
                }
            }
        }
    }
}

/// SHA-256 over the canonical JSON serialization of the state.
fn state_checksum(state: &Term) -> String {
    let json = serde_json::to_vec(state).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// In-memory storage adapter.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStorage::default())
    }
}

impl StorageAdapter for MemoryStorage {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), String> {
        self.entries.write().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, String> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, String> {
        Ok(self.entries.read().contains_key(key))
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, String> {
        let entries = self.entries.read();
        Ok(entries
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_crud() {
        let storage = MemoryStorage::new();
        assert!(!storage.exists("k").unwrap());
        storage.save("k", b"v1").unwrap();
        assert!(storage.exists("k").unwrap());
        assert_eq!(storage.load("k").unwrap(), Some(b"v1".to_vec()));
        storage.save("k", b"v2").unwrap();
        assert_eq!(storage.load("k").unwrap(), Some(b"v2".to_vec()));
        assert!(storage.delete("k").unwrap());
        assert!(!storage.delete("k").unwrap());
        assert_eq!(storage.load("k").unwrap(), None);
    }

    #[test]
    fn test_list_keys_with_prefix() {
        let storage = MemoryStorage::new();
        storage.save("srv/a", b"1").unwrap();
        storage.save("srv/b", b"2").unwrap();
        storage.save("other", b"3").unwrap();
        let keys = storage.list_keys(Some("srv/")).unwrap();
        assert_eq!(keys, vec!["srv/a".to_string(), "srv/b".to_string()]);
        assert_eq!(storage.list_keys(None).unwrap().len(), 3);
    }

    #[test]
    fn test_persisted_state_roundtrip() {
        let snapshot = PersistedState::new(Term::Int(42), 7, 2, 1000);
        let blob = serde_json::to_vec(&snapshot).unwrap();
        let back: PersistedState = serde_json::from_slice(&blob).unwrap();
        assert_eq!(back, snapshot);
        assert!(back.verify().is_ok());
        assert_eq!(back.metadata.schema_version, 2);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut snapshot = PersistedState::new(Term::Int(42), 7, 1, 1000);
        snapshot.state = Term::Int(43);
        assert!(snapshot.verify().is_err());
    }

    #[test]
    fn test_missing_checksum_accepted() {
        let mut snapshot = PersistedState::new(Term::Int(1), 1, 1, 1);
        snapshot.checksum = None;
        assert!(snapshot.verify().is_ok());
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000); // later than 2017
    }
}
