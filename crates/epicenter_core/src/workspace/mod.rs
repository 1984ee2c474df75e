//! Workspace lifecycle.
//!
//! A [`Workspace`] pairs the epoch head with the data document of the
//! current epoch:
//!
//! ```text
//! {workspaceId}            head: peer -> proposed epoch, epoch history
//! {workspaceId}-0          data, epoch 0
//! {workspaceId}-1          data, epoch 1 (after a migration or compaction)
//! ```
//!
//! Opening resolves the effective epoch from the head and only then loads
//! the matching data document, so helpers are always built on a populated
//! document. Migrations write the next epoch in full before the head is
//! advanced; a failing transform leaves the head untouched. Older epochs
//! stay in storage and can be read back with [`Workspace::read_epoch`].
//!
//! [`WorkspaceRegistry`] owns open workspaces together with their
//! persistence, indexes and sync client.

mod registry;

pub use registry::{OpenWorkspace, WorkspaceRegistry};

use std::sync::Arc;

use crate::crdt::{
    EpochCoordinator, EpochKind, KvHelper, Lifecycle, PersistenceProvider, Row, TableSnapshot,
    Tables, WorkspaceDefinition, WorkspaceDocument, WorkspaceSnapshot, save_document,
};
use crate::error::{EpicenterError, Result};

/// One workspace at its current epoch.
pub struct Workspace {
    id: String,
    provider: Arc<dyn PersistenceProvider>,
    head: EpochCoordinator,
    document: WorkspaceDocument,
}

impl Workspace {
    /// Open a workspace from storage.
    ///
    /// Never fails: a missing or corrupt head or data snapshot is logged and
    /// replaced by an empty document.
    pub fn open(id: &str, provider: Arc<dyn PersistenceProvider>, peer_id: impl Into<String>) -> Self {
        let head = EpochCoordinator::load(provider.as_ref(), id, peer_id);
        let epoch = head.current();
        let document = WorkspaceDocument::load(provider.as_ref(), id, epoch);
        log::info!("Opened workspace '{}' at epoch {}", id, epoch);
        Self {
            id: id.to_string(),
            provider,
            head,
            document,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Epoch of the loaded data document.
    pub fn epoch(&self) -> u64 {
        self.document.epoch()
    }

    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    pub fn head(&self) -> &EpochCoordinator {
        &self.head
    }

    pub fn provider(&self) -> &Arc<dyn PersistenceProvider> {
        &self.provider
    }

    pub fn tables(&self) -> Tables {
        self.document.tables()
    }

    pub fn kv(&self) -> KvHelper {
        self.document.kv()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.head.lifecycle()
    }

    /// True when some peer has published a newer epoch than the one loaded.
    pub fn is_stale(&self) -> bool {
        self.head.current() > self.epoch()
    }

    /// Switch to the head's epoch if some peer has published a newer one.
    /// Returns the epoch switched to; the old epoch stays in storage as it
    /// was.
    pub fn follow_head(&mut self) -> Option<u64> {
        let head = self.head.current();
        if head <= self.epoch() {
            return None;
        }
        self.document = WorkspaceDocument::load(self.provider.as_ref(), &self.id, head);
        log::info!("Workspace '{}' moved to epoch {} published by a peer", self.id, head);
        Some(head)
    }

    /// Schema of the current epoch.
    pub fn definition(&self) -> WorkspaceDefinition {
        self.document.definition()
    }

    /// Live tables, rows and settings of the current epoch.
    pub fn snapshot(&self) -> WorkspaceSnapshot {
        snapshot_of(&self.document)
    }

    /// Read an older (or the current) epoch without touching the live one.
    pub fn read_epoch(&self, epoch: u64) -> Result<WorkspaceSnapshot> {
        let name = WorkspaceDocument::doc_name_for(&self.id, epoch);
        if epoch > self.head.current() || self.provider.load(&name)?.is_none() {
            return Err(EpicenterError::Persistence(format!(
                "no snapshot for epoch {} of '{}'",
                epoch, self.id
            )));
        }
        let document = WorkspaceDocument::load(self.provider.as_ref(), &self.id, epoch);
        Ok(snapshot_of(&document))
    }

    /// Save the data document and the head now.
    pub fn save(&self) -> Result<()> {
        save_document(&self.document, self.provider.as_ref(), true)?;
        self.head.save(self.provider.as_ref())
    }

    /// Transform the current epoch into a fresh document at the next epoch
    /// and publish it. Returns the new epoch.
    ///
    /// If `transform` fails, or its result does not validate against its own
    /// schema, nothing is published and the workspace stays where it was.
    pub fn migrate<F>(&mut self, transform: F) -> Result<u64>
    where
        F: FnOnce(WorkspaceSnapshot) -> Result<WorkspaceSnapshot>,
    {
        self.advance(EpochKind::Migrated, transform)
    }

    /// Copy live state into the next epoch, dropping tombstones and history.
    pub fn compact(&mut self) -> Result<u64> {
        self.advance(EpochKind::Compacted, Ok)
    }

    fn advance<F>(&mut self, kind: EpochKind, transform: F) -> Result<u64>
    where
        F: FnOnce(WorkspaceSnapshot) -> Result<WorkspaceSnapshot>,
    {
        if self.is_stale() {
            return Err(EpicenterError::StaleEpoch {
                current: self.epoch(),
                head: self.head.current(),
            });
        }

        let snapshot = transform(self.snapshot()).map_err(|e| match e {
            EpicenterError::Migration(_) => e,
            other => EpicenterError::Migration(other.to_string()),
        })?;

        let next = self.epoch() + 1;
        let document = WorkspaceDocument::new(self.id.as_str(), next);
        import(&document, &snapshot)
            .map_err(|e| EpicenterError::Migration(format!("epoch {} rejected: {}", next, e)))?;
        save_document(&document, self.provider.as_ref(), true)?;

        // The new epoch is complete in storage; publish it.
        self.head.propose(next);
        self.head.record(next, kind)?;
        self.head.save(self.provider.as_ref())?;
        self.document = document;
        log::info!("Workspace '{}' {:?} to epoch {}", self.id, kind, next);
        Ok(next)
    }
}

fn snapshot_of(document: &WorkspaceDocument) -> WorkspaceSnapshot {
    let tables = document.tables();
    let mut snapshot = WorkspaceSnapshot {
        kv: document.kv().list(),
        ..WorkspaceSnapshot::default()
    };
    for (id, definition) in tables.definitions() {
        let rows = match tables.get(&id) {
            Ok(helper) => helper.get_all().into_iter().map(|row| (row.id, row.cells)).collect(),
            Err(_) => continue,
        };
        snapshot.tables.insert(id, TableSnapshot { definition, rows });
    }
    snapshot
}

fn import(document: &WorkspaceDocument, snapshot: &WorkspaceSnapshot) -> Result<()> {
    let tables = document.tables();
    for (id, table) in &snapshot.tables {
        let helper = tables.define(id, &table.definition)?;
        helper.upsert_many(
            table
                .rows
                .iter()
                .map(|(row_id, cells)| Row::with_id(row_id.as_str(), cells.clone())),
        )?;
    }
    let kv = document.kv();
    for (key, entry) in &snapshot.kv {
        kv.restore(key, entry)?;
    }
    Ok(())
}
