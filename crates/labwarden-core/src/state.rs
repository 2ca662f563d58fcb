//! Observed state and its persistence
//!
//! [`ObservedState`] is the last-known provider view of the fleet: one
//! [`ResourceRecord`] per resource that exists (or existed) on a
//! provider. [`StateManager`] persists it to `.labwarden/state.json`
//! with a backup copy and a lock file.

use crate::error::StateError;
use crate::resource::{Attributes, ResourceKey, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".labwarden";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Last-known state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,

    pub name: String,

    /// Provider that owns the resource.
    pub provider: String,

    /// Provider-assigned identifier.
    pub id: String,

    /// Attributes as last read from or written to the provider.
    pub attributes: Attributes,

    /// Dependency names captured when the resource was applied, so
    /// orphan deletes can still be ordered.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Protected resources are never deleted as orphans.
    #[serde(default)]
    pub protected: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        provider: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            kind,
            name: name.into(),
            provider: provider.into(),
            id: id.into(),
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
            protected: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.name.clone())
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn with_depends_on(mut self, depends_on: BTreeSet<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// The provider's last-known view of every managed resource. May be
/// empty (first run) or partial (interrupted apply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedState {
    /// State file version.
    pub version: u32,

    /// Last modified timestamp.
    pub updated_at: DateTime<Utc>,

    /// Records keyed by `kind:name`.
    resources: BTreeMap<String, ResourceRecord>,
}

impl Default for ObservedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl ObservedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRecord> {
        self.resources.get(&key.storage_key())
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceRecord> {
        self.updated_at = Utc::now();
        self.resources.get_mut(&key.storage_key())
    }

    pub fn insert(&mut self, record: ResourceRecord) {
        self.resources.insert(record.key().storage_key(), record);
        self.updated_at = Utc::now();
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<ResourceRecord> {
        let removed = self.resources.remove(&key.storage_key());
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Records in storage-key order (deterministic).
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.values()
    }
}

/// Persistence for [`ObservedState`]: `.labwarden/state.json` under the
/// project root, with the previous file kept as `state.json.backup` and
/// a JSON lock file serialising concurrent runs.
pub struct StateManager {
    dir: PathBuf,
}

/// A lock older than this is treated as left behind by a crashed run
/// and taken over.
const LOCK_STALE_SECS: i64 = 3600;

impl StateManager {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            dir: project_root.as_ref().join(STATE_DIR),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Load the last saved state. A missing file is a first run, not an
    /// error.
    pub async fn load(&self) -> Result<ObservedState, StateError> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("no state file yet, starting empty");
            return Ok(ObservedState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: ObservedState = serde_json::from_str(&content)?;

        // Refuse files written by a newer labwarden; older versions are
        // handled by serde defaults.
        if state.version > STATE_VERSION {
            return Err(StateError::VersionMismatch {
                found: state.version,
                supported: STATE_VERSION,
            });
        }

        tracing::debug!(resources = state.len(), "loaded observed state");
        Ok(state)
    }

    /// Save the state. The previous file survives one generation as the
    /// backup.
    pub async fn save(&self, state: &ObservedState) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.state_path();
        if path.exists() {
            let backup = self.backup_path();
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        fs::write(&path, serde_json::to_string_pretty(state)?).await?;
        tracing::debug!(resources = state.len(), "saved observed state");
        Ok(())
    }

    /// Take the state lock, or fail with [`StateError::Locked`] naming
    /// the current holder. Stale locks are stolen with a warning.
    pub async fn acquire_lock(&self) -> Result<StateLock, StateError> {
        fs::create_dir_all(&self.dir).await?;
        let lock_path = self.lock_path();

        if lock_path.exists() {
            let holder: LockInfo = serde_json::from_str(&fs::read_to_string(&lock_path).await?)?;
            let age = Utc::now().signed_duration_since(holder.acquired_at);
            if age.num_seconds() < LOCK_STALE_SECS {
                return Err(StateError::Locked {
                    holder: holder.holder,
                    since: holder.acquired_at.to_rfc3339(),
                });
            }
            tracing::warn!(holder = %holder.holder, "taking over stale state lock");
        }

        let info = LockInfo {
            holder: hostname(),
            acquired_at: Utc::now(),
        };
        fs::write(&lock_path, serde_json::to_string_pretty(&info)?).await?;
        tracing::debug!("acquired state lock");

        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Guard for the state lock. Prefer the explicit [`StateLock::release`];
/// the `Drop` impl is the fallback when a run errors out early.
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub async fn release(mut self) -> Result<(), StateError> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            // Best effort; a leftover lock goes stale and gets stolen.
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn state_save_load() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let mut state = ObservedState::new();
        state.insert(
            ResourceRecord::new(ResourceKind::Vm, "k3s-master-01", "proxmox", "200")
                .with_attribute("ip", serde_json::json!("192.168.1.100")),
        );

        manager.save(&state).await.unwrap();

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let key = ResourceKey::new(ResourceKind::Vm, "k3s-master-01");
        let record = loaded.get(&key).unwrap();
        assert_eq!(record.id, "200");
        assert_eq!(
            record.get_attribute::<String>("ip").as_deref(),
            Some("192.168.1.100")
        );
    }

    #[tokio::test]
    async fn empty_state_when_no_file() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let state = manager.load().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn save_keeps_backup() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        manager.save(&ObservedState::new()).await.unwrap();
        manager.save(&ObservedState::new()).await.unwrap();

        assert!(temp_dir.path().join(".labwarden/state.json.backup").exists());
    }

    #[tokio::test]
    async fn lock_conflict_reported() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let lock = manager.acquire_lock().await.unwrap();
        let second = manager.acquire_lock().await;
        assert!(matches!(second, Err(StateError::Locked { .. })));
        lock.release().await.unwrap();

        let third = manager.acquire_lock().await;
        assert!(third.is_ok());
    }
}
