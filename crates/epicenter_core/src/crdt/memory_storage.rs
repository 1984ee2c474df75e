//! In-memory storage implementation for testing.
//!
//! This provides a simple in-memory implementation of [`PersistenceProvider`]
//! for use in unit tests and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::storage::{PersistenceProvider, StorageResult};

/// In-memory snapshot storage for testing.
///
/// Thread-safe via `RwLock`, but data is lost when dropped. Clones share the
/// same underlying maps, so a test can keep a handle while a workspace owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Human-readable artifacts (file name -> contents)
    artifacts: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of an artifact written through
    /// [`PersistenceProvider::write_artifact`].
    pub fn artifact(&self, file_name: &str) -> Option<String> {
        let artifacts = self.artifacts.read().unwrap_or_else(|e| e.into_inner());
        artifacts.get(file_name).cloned()
    }
}

impl PersistenceProvider for MemoryStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(name).cloned())
    }

    fn save(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(name.to_string(), state.to_vec());
        Ok(())
    }

    fn write_artifact(&self, file_name: &str, contents: &str) -> StorageResult<()> {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
        artifacts.insert(file_name.to_string(), contents.to_string());
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = docs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
