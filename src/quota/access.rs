use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::platform::{atomic_write, read_optional};

/// Current access file version
const ACCESS_VERSION: &str = "1.0";

/// Allow-list of monitored packages plus the selection lock
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowListState {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub allowed: BTreeSet<String>,
    #[serde(default)]
    pub selection_locked: bool,
}

fn default_version() -> String {
    ACCESS_VERSION.to_string()
}

impl Default for AllowListState {
    fn default() -> Self {
        Self {
            version: default_version(),
            allowed: BTreeSet::new(),
            selection_locked: false,
        }
    }
}

/// Persisted allow-list store
pub trait AccessControlStore: Send + Sync {
    fn allowed(&self) -> Result<BTreeSet<String>>;
    fn set_allowed(&self, allowed: &BTreeSet<String>) -> Result<()>;
    fn is_locked(&self) -> Result<bool>;
    fn set_locked(&self, locked: bool) -> Result<()>;

    /// Remove `packages` in one read-modify-write, returning those that were
    /// present. Nothing is written when none were.
    fn remove_allowed(&self, packages: &[String]) -> Result<Vec<String>>;
}

/// Remove one package from the allow-list
///
/// Returns `true` when the package was present and the store was rewritten.
pub fn revoke(store: &dyn AccessControlStore, package_id: &str) -> Result<bool> {
    Ok(!store.remove_allowed(&[package_id.to_string()])?.is_empty())
}

fn remove_from(state: &mut AllowListState, packages: &[String]) -> Vec<String> {
    packages
        .iter()
        .filter(|package_id| state.allowed.remove(package_id.as_str()))
        .cloned()
        .collect()
}

/// In-memory allow-list store
#[derive(Debug, Default)]
pub struct MemoryAccessStore {
    inner: Mutex<AllowListState>,
}

impl MemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Mutex::new(AllowListState {
                allowed: packages.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AllowListState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("access store lock poisoned"))
    }
}

impl AccessControlStore for MemoryAccessStore {
    fn allowed(&self) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.allowed.clone())
    }

    fn set_allowed(&self, allowed: &BTreeSet<String>) -> Result<()> {
        self.lock()?.allowed = allowed.clone();
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.lock()?.selection_locked)
    }

    fn set_locked(&self, locked: bool) -> Result<()> {
        self.lock()?.selection_locked = locked;
        Ok(())
    }

    fn remove_allowed(&self, packages: &[String]) -> Result<Vec<String>> {
        Ok(remove_from(&mut *self.lock()?, packages))
    }
}

/// Allow-list persisted as a single JSON document
#[derive(Debug)]
pub struct FileAccessStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAccessStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<AllowListState> {
        let Some(content) = read_optional(&self.path)? else {
            return Ok(AllowListState::default());
        };

        match serde_json::from_str::<AllowListState>(&content) {
            Ok(state) if state.version == ACCESS_VERSION => Ok(state),
            Ok(state) => {
                warn!(
                    "Access file version mismatch (expected {}, got {}). Treating as empty.",
                    ACCESS_VERSION, state.version
                );
                Ok(AllowListState::default())
            }
            Err(e) => {
                warn!("Ignoring malformed access file {}: {}", self.path.display(), e);
                Ok(AllowListState::default())
            }
        }
    }

    fn save(&self, state: &AllowListState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).context("Failed to serialize allow-list")?;
        atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write access file: {}", self.path.display()))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("access store lock poisoned"))
    }

    fn update(&self, f: impl FnOnce(&mut AllowListState)) -> Result<()> {
        let _guard = self.guard()?;
        let mut state = self.load()?;
        f(&mut state);
        self.save(&state)
    }

    fn read(&self) -> Result<AllowListState> {
        let _guard = self.guard()?;
        self.load()
    }
}

impl AccessControlStore for FileAccessStore {
    fn allowed(&self) -> Result<BTreeSet<String>> {
        Ok(self.read()?.allowed)
    }

    fn set_allowed(&self, allowed: &BTreeSet<String>) -> Result<()> {
        self.update(|state| state.allowed = allowed.clone())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.read()?.selection_locked)
    }

    fn set_locked(&self, locked: bool) -> Result<()> {
        self.update(|state| state.selection_locked = locked)
    }

    fn remove_allowed(&self, packages: &[String]) -> Result<Vec<String>> {
        let _guard = self.guard()?;
        let mut state = self.load()?;
        let removed = remove_from(&mut state, packages);
        if !removed.is_empty() {
            self.save(&state)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryAccessStore::new();
        assert!(store.allowed().unwrap().is_empty());
        assert!(!store.is_locked().unwrap());

        store.set_allowed(&set(&["a", "b"])).unwrap();
        store.set_locked(true).unwrap();
        assert_eq!(store.allowed().unwrap(), set(&["a", "b"]));
        assert!(store.is_locked().unwrap());
    }

    #[test]
    fn test_revoke_only_writes_when_present() {
        let store = MemoryAccessStore::with_allowed(["a", "b"]);
        assert!(revoke(&store, "a").unwrap());
        assert!(!revoke(&store, "a").unwrap());
        assert_eq!(store.allowed().unwrap(), set(&["b"]));
    }

    #[test]
    fn test_file_store_persists_allowed_and_lock_independently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.json");

        let store = FileAccessStore::new(&path);
        store.set_allowed(&set(&["com.example.game"])).unwrap();
        store.set_locked(true).unwrap();

        let reopened = FileAccessStore::new(&path);
        assert_eq!(reopened.allowed().unwrap(), set(&["com.example.game"]));
        assert!(reopened.is_locked().unwrap());
    }

    #[test]
    fn test_concurrent_removals_are_not_lost() {
        let dir = tempdir().unwrap();
        let packages: Vec<String> = (0..8).map(|i| format!("com.example.app{}", i)).collect();
        let store = FileAccessStore::new(dir.path().join("access.json"));
        store.set_allowed(&packages.iter().cloned().collect()).unwrap();
        store.set_locked(true).unwrap();

        std::thread::scope(|scope| {
            for package_id in &packages {
                let store = &store;
                scope.spawn(move || assert!(revoke(store, package_id).unwrap()));
            }
        });

        assert!(store.allowed().unwrap().is_empty());
        assert!(store.is_locked().unwrap());
    }

    #[test]
    fn test_remove_allowed_reports_only_present_packages() {
        let store = MemoryAccessStore::with_allowed(["a", "b", "c"]);
        let removed = store
            .remove_allowed(&["b".to_string(), "x".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(removed, vec!["b", "c"]);
        assert_eq!(store.allowed().unwrap(), set(&["a"]));
    }

    #[test]
    fn test_file_store_missing_or_malformed_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.json");

        let store = FileAccessStore::new(&path);
        assert!(store.allowed().unwrap().is_empty());

        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(store.allowed().unwrap().is_empty());
        assert!(!store.is_locked().unwrap());
    }
}
