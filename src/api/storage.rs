//! Storage API — namespaced JSON key/value persistence for scripts.
//!
//! Values are JSON-serialized into the host's durable key/value store under
//! a fixed `dashboard_script_` prefix, so script data cannot collide with
//! anything else the host keeps there. Corrupt or missing entries read as
//! absent rather than erroring: stale data from an older script version
//! must not break the current one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Key prefix isolating script storage inside the host's store.
pub const STORAGE_PREFIX: &str = "dashboard_script_";

// =============================================================================
// STORE TRAIT
// =============================================================================

/// The host's durable local key/value store. String-typed on both sides;
/// the facade owns JSON encoding.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// In-memory [`KeyValueStore`]. The default backend, and the test double.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

// =============================================================================
// FACADE
// =============================================================================

/// Storage capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct StorageApi {
    store: Arc<dyn KeyValueStore>,
}

impl StorageApi {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Write a JSON value under the namespaced key.
    pub fn set(&self, key: &str, value: &Value) {
        self.store.set(&namespaced(key), value.to_string());
    }

    /// Read a JSON value. Missing and corrupt entries both read as `None`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let raw = self.store.get(&namespaced(key))?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "discarding corrupt storage entry");
                None
            }
        }
    }

    /// Remove one entry.
    pub fn remove(&self, key: &str) {
        self.store.remove(&namespaced(key));
    }

    /// Remove every entry in the script namespace. Entries outside the
    /// prefix are untouched.
    pub fn clear(&self) {
        for key in self.store.keys() {
            if key.starts_with(STORAGE_PREFIX) {
                self.store.remove(&key);
            }
        }
    }
}

fn namespaced(key: &str) -> String {
    format!("{STORAGE_PREFIX}{key}")
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_json_values() {
        let api = StorageApi::new(Arc::new(MemoryStore::new()));
        api.set("counts", &json!({"a": 1, "b": [2, 3]}));
        assert_eq!(api.get("counts"), Some(json!({"a": 1, "b": [2, 3]})));
        assert_eq!(api.get("missing"), None);
    }

    #[test]
    fn keys_are_namespaced() {
        let store = Arc::new(MemoryStore::new());
        let api = StorageApi::new(store.clone());
        api.set("k", &json!(1));
        assert_eq!(store.get("dashboard_script_k"), Some("1".to_owned()));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn corrupt_entries_read_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set("dashboard_script_bad", "{not json".to_owned());
        let api = StorageApi::new(store);
        assert_eq!(api.get("bad"), None);
    }

    #[test]
    fn remove_and_clear() {
        let store = Arc::new(MemoryStore::new());
        store.set("unrelated", "kept".to_owned());
        let api = StorageApi::new(store.clone());
        api.set("a", &json!(1));
        api.set("b", &json!(2));

        api.remove("a");
        assert_eq!(api.get("a"), None);
        assert_eq!(api.get("b"), Some(json!(2)));

        api.clear();
        assert_eq!(api.get("b"), None);
        assert_eq!(store.get("unrelated"), Some("kept".to_owned()));
    }
}
