//! Export surface for downstream automation
//!
//! A flat key -> value map populated while a plan is applied and read
//! by consumers afterwards (inventory generation, kubeconfig assembly).
//! Append-only: a key may be written repeatedly with the same value,
//! but a conflicting value is fatal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// Two operations produced different values for the same export key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("duplicate export {key:?}: already {existing:?}, refusing {proposed:?}")]
pub struct DuplicateExportError {
    pub key: String,
    pub existing: String,
    pub proposed: String,
}

/// Concurrent-append, read-after accumulator of export values.
#[derive(Debug, Default)]
pub struct ExportStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl ExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value. Idempotent for identical values; the
    /// duplicate-key check happens atomically under the lock.
    pub fn publish(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DuplicateExportError> {
        let key = key.into();
        let value = value.into();

        let mut values = self.values.lock().expect("export store poisoned");
        if let Some(existing) = values.get(&key) {
            if existing != &value {
                return Err(DuplicateExportError {
                    key,
                    existing: existing.clone(),
                    proposed: value,
                });
            }
            return Ok(());
        }

        tracing::debug!(key = %key, value = %value, "published export");
        values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("export store poisoned")
            .get(key)
            .cloned()
    }

    /// Snapshot of the current surface, in key order.
    pub fn snapshot(&self) -> ExportSnapshot {
        ExportSnapshot {
            values: self.values.lock().expect("export store poisoned").clone(),
        }
    }
}

/// Immutable view of the export surface after an apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportSnapshot {
    values: BTreeMap<String, String>,
}

impl ExportSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_read_back() {
        let store = ExportStore::new();
        store.publish("edgeNodeIP", "203.0.113.10").unwrap();
        assert_eq!(store.get("edgeNodeIP").as_deref(), Some("203.0.113.10"));
    }

    #[test]
    fn republishing_same_value_is_noop() {
        let store = ExportStore::new();
        store.publish("controlPlaneIP", "192.168.1.100").unwrap();
        store.publish("controlPlaneIP", "192.168.1.100").unwrap();
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn conflicting_value_is_rejected() {
        let store = ExportStore::new();
        store.publish("controlPlaneIP", "192.168.1.100").unwrap();
        let err = store
            .publish("controlPlaneIP", "192.168.1.101")
            .unwrap_err();
        assert_eq!(err.key, "controlPlaneIP");
        assert_eq!(err.existing, "192.168.1.100");
        assert_eq!(err.proposed, "192.168.1.101");
        // Original value survives the failed publish.
        assert_eq!(
            store.get("controlPlaneIP").as_deref(),
            Some("192.168.1.100")
        );
    }

    #[test]
    fn snapshot_is_key_ordered() {
        let store = ExportStore::new();
        store.publish("b", "2").unwrap();
        store.publish("a", "1").unwrap();
        let snapshot = store.snapshot();
        let keys: Vec<&str> = snapshot.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
