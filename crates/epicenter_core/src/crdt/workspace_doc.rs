//! The CRDT document that holds a workspace epoch.
//!
//! [`WorkspaceDocument`] wraps a yrs [`Doc`]. Every container lives at the
//! root of the document so that two peers creating the same container
//! concurrently merge instead of one replacing the other:
//!
//! ```text
//! Y.Doc "{workspaceId}-{epoch}"
//! ├── Y.Map "tables"          tableId → createdAt
//! ├── Y.Map "table:{id}"      name, icon, description, deletedAt
//! ├── Y.Map "fields:{id}"     fieldId → Field (JSON)
//! ├── Y.Map "rows:{id}"       rowId → Y.Map { fieldId → cell, deletedAt }
//! └── Y.Map "kv"              key → KvEntry (JSON)
//! ```
//!
//! # Synchronization
//!
//! [`encode_state_vector`](WorkspaceDocument::encode_state_vector),
//! [`encode_diff`](WorkspaceDocument::encode_diff) and
//! [`apply_remote_update`](WorkspaceDocument::apply_remote_update) are the
//! three primitives the sync handshake is built from. Updates applied with the
//! remote origin are reported as remote by
//! [`observe_updates`](WorkspaceDocument::observe_updates) so they are not
//! echoed back to the peer they came from.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, MapRef, Origin, ReadTxn, StateVector, Subscription, Transact, Transaction, TransactionMut,
    Update, WriteTxn,
};

use super::kv::KvHelper;
use super::storage::PersistenceProvider;
use super::tables::Tables;
use super::types::WorkspaceDefinition;
use crate::error::{EpicenterError, Result};
use crate::field::Value;

/// Origin attached to transactions that integrate updates from other peers.
pub const REMOTE_ORIGIN: &str = "epicenter:remote";

pub(crate) const TABLES_MAP: &str = "tables";
pub(crate) const KV_MAP: &str = "kv";
pub(crate) const DELETED_AT: &str = "deletedAt";

pub(crate) fn table_map_name(table_id: &str) -> String {
    format!("table:{}", table_id)
}

pub(crate) fn fields_map_name(table_id: &str) -> String {
    format!("fields:{}", table_id)
}

pub(crate) fn rows_map_name(table_id: &str) -> String {
    format!("rows:{}", table_id)
}

/// Milliseconds since the Unix epoch, used for `createdAt` and `deletedAt`.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A CRDT document addressed by name.
///
/// Data documents are named `{workspaceId}-{epoch}`; the epoch head uses a
/// bare `{workspaceId}`. Cloning is cheap and every clone refers to the same
/// underlying document.
#[derive(Clone)]
pub struct WorkspaceDocument {
    doc: Doc,
    name: String,
    workspace_id: String,
    epoch: u64,
}

impl WorkspaceDocument {
    /// Create an empty data document for `(workspace_id, epoch)`.
    pub fn new(workspace_id: impl Into<String>, epoch: u64) -> Self {
        let workspace_id = workspace_id.into();
        Self {
            doc: Doc::new(),
            name: Self::doc_name_for(&workspace_id, epoch),
            workspace_id,
            epoch,
        }
    }

    /// Create an empty document with an arbitrary name.
    ///
    /// Used for the epoch head and for server-side replicas that only relay
    /// updates.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            doc: Doc::new(),
            workspace_id: name.clone(),
            name,
            epoch: 0,
        }
    }

    /// Storage name of a data document.
    pub fn doc_name_for(workspace_id: &str, epoch: u64) -> String {
        format!("{}-{}", workspace_id, epoch)
    }

    /// Load a data document from storage.
    ///
    /// A missing, unreadable or corrupt snapshot yields an empty document and
    /// a warning; loading never fails.
    pub fn load(provider: &dyn PersistenceProvider, workspace_id: &str, epoch: u64) -> Self {
        let document = Self::new(workspace_id, epoch);
        document.restore_from(provider);
        document
    }

    /// Load a named document from storage, falling back to empty like
    /// [`load`](Self::load).
    pub fn load_named(provider: &dyn PersistenceProvider, name: &str) -> Self {
        let document = Self::named(name);
        document.restore_from(provider);
        document
    }

    fn restore_from(&self, provider: &dyn PersistenceProvider) {
        let state = match provider.load(&self.name) {
            Ok(Some(state)) => state,
            Ok(None) => {
                log::debug!("No snapshot for '{}', starting empty", self.name);
                return;
            }
            Err(e) => {
                log::warn!("Failed to read snapshot '{}', starting empty: {}", self.name, e);
                return;
            }
        };

        match self.apply_with_origin(&state, None) {
            Ok(()) => log::debug!("Loaded '{}' ({} bytes)", self.name, state.len()),
            Err(e) => {
                log::warn!("Snapshot '{}' is corrupt, starting empty: {}", self.name, e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Typed access to the tables of this document.
    pub fn tables(&self) -> Tables {
        Tables::new(self.clone())
    }

    /// Typed access to the KV settings of this document.
    pub fn kv(&self) -> KvHelper {
        KvHelper::new(self.clone())
    }

    // ==================== Transactions ====================

    /// Open a read transaction.
    ///
    /// Must not be called from an observer callback or while this thread
    /// already holds a write transaction on the same document.
    pub(crate) fn read_txn(&self) -> Transaction<'_> {
        loop {
            match self.doc.try_transact() {
                Ok(txn) => return txn,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    /// Open a local write transaction. Same reentrancy rules as
    /// [`read_txn`](Self::read_txn).
    pub(crate) fn write_txn(&self) -> TransactionMut<'_> {
        loop {
            match self.doc.try_transact_mut() {
                Ok(txn) => return txn,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    fn write_txn_with(&self, origin: &str) -> TransactionMut<'_> {
        loop {
            match self.doc.try_transact_mut_with(origin) {
                Ok(txn) => return txn,
                Err(_) => std::thread::yield_now(),
            }
        }
    }

    /// Get (creating if needed) a root map, outside of any transaction.
    pub(crate) fn root_map(&self, name: &str) -> MapRef {
        let mut txn = self.write_txn();
        txn.get_or_insert_map(name)
    }

    // ==================== Sync primitives ====================

    pub fn state_vector(&self) -> StateVector {
        self.read_txn().state_vector()
    }

    /// Encode the current state vector (SyncStep1 payload).
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.read_txn()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode everything the holder of `remote_state_vector` is missing
    /// (SyncStep2 payload).
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EpicenterError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        Ok(self.read_txn().encode_diff_v1(&sv))
    }

    /// Apply an update produced locally (e.g. restored from storage).
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        self.apply_with_origin(update, None)
    }

    /// Apply an update received from another peer.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<()> {
        self.apply_with_origin(update, Some(REMOTE_ORIGIN))
    }

    fn apply_with_origin(&self, update: &[u8], origin: Option<&str>) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| EpicenterError::Crdt(format!("Failed to decode update: {}", e)))?;

        // Integration of a well-formed but semantically broken update can
        // panic inside yrs; contain it so a bad peer or file cannot take the
        // process down.
        let applied = catch_unwind(AssertUnwindSafe(|| {
            let mut txn = match origin {
                Some(origin) => self.write_txn_with(origin),
                None => self.write_txn(),
            };
            txn.apply_update(decoded)
        }));

        match applied {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EpicenterError::Crdt(format!("Failed to apply update: {}", e))),
            Err(_) => Err(EpicenterError::Crdt("update integration panicked".to_string())),
        }
    }

    /// Subscribe to encoded updates as they are committed.
    ///
    /// The callback receives the update and whether it came from a remote
    /// peer. It runs inside the committing transaction and must not open
    /// another one.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&[u8], bool) + Send + Sync + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                let is_remote = txn.origin() == Some(&remote);
                callback(&event.update, is_remote);
            })
            .map_err(|e| EpicenterError::Crdt(format!("Failed to observe updates: {}", e)))
    }

    // ==================== Exports ====================

    /// Human-readable schema of this document.
    pub fn definition(&self) -> WorkspaceDefinition {
        WorkspaceDefinition {
            workspace_id: self.workspace_id.clone(),
            epoch: self.epoch,
            tables: self
                .tables()
                .definitions()
                .into_iter()
                .collect(),
            kv: self
                .kv()
                .list()
                .into_iter()
                .map(|(key, entry)| (key, entry.definition()))
                .collect(),
        }
    }

    /// Flat key → value view of the KV settings.
    pub fn kv_values(&self) -> BTreeMap<String, Value> {
        self.kv()
            .list()
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }
}

impl std::fmt::Debug for WorkspaceDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceDocument")
            .field("name", &self.name)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
