//! Storage abstraction for document persistence.
//!
//! This module defines the [`PersistenceProvider`] trait which abstracts over
//! the backends (filesystem, SQLite, in-memory) that hold binary document
//! snapshots.

use crate::error::EpicenterError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, EpicenterError>;

/// Trait for document snapshot storage backends.
///
/// A snapshot is the full encoded state of one document, addressed by its
/// document name (`{workspaceId}-{epoch}` for data documents,
/// `{workspaceId}` for the epoch head).
///
/// # Ordering
///
/// A document must be loaded and applied before any table or KV helper is
/// built on top of it; [`WorkspaceDocument::load`](super::WorkspaceDocument::load)
/// is the only loader and returns the document already populated.
pub trait PersistenceProvider: Send + Sync {
    /// Load the full document state as a binary blob.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state, overwriting any existing state.
    fn save(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Write a human-readable artifact (`definition.json`, `kv.json`).
    ///
    /// Backends without a browsable layout ignore artifacts.
    fn write_artifact(&self, _file_name: &str, _contents: &str) -> StorageResult<()> {
        Ok(())
    }

    /// List all document names in storage.
    fn list(&self) -> StorageResult<Vec<String>>;
}
