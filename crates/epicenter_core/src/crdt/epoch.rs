//! Epoch pointer for migrations and compaction.
//!
//! The head document (`{workspaceId}`) holds one entry per peer in its
//! `epochs` map: the highest epoch that peer has proposed. The effective
//! epoch is the maximum over all entries, so concurrent bumps from several
//! peers can never make it go backwards. A `history` map records how each
//! epoch came to be.

use serde::{Deserialize, Serialize};
use yrs::{Any, Map, MapRef, Observable, Out, ReadTxn, Subscription};

use super::storage::PersistenceProvider;
use super::workspace_doc::{WorkspaceDocument, now_millis};
use crate::error::Result;

const EPOCHS_MAP: &str = "epochs";
const HISTORY_MAP: &str = "history";

/// How an epoch was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochKind {
    Migrated,
    Compacted,
}

/// One entry of the epoch history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochRecord {
    pub epoch: u64,
    pub kind: EpochKind,
    pub created_at: i64,
}

/// Where a workspace is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Epoch 0, never migrated.
    Initial,
    /// The live epoch was produced by a schema migration.
    Migrated(u64),
    /// The live epoch was produced by compaction and carries no history.
    Compacted(u64),
}

/// Reads and advances the effective epoch of a workspace.
#[derive(Clone)]
pub struct EpochCoordinator {
    document: WorkspaceDocument,
    peer_id: String,
    epochs: MapRef,
    history: MapRef,
}

impl EpochCoordinator {
    /// A coordinator over a fresh, empty head document.
    pub fn new(workspace_id: &str, peer_id: impl Into<String>) -> Self {
        Self::with_document(WorkspaceDocument::named(workspace_id), peer_id)
    }

    /// Load the head document from storage (empty if missing or corrupt).
    pub fn load(
        provider: &dyn PersistenceProvider,
        workspace_id: &str,
        peer_id: impl Into<String>,
    ) -> Self {
        Self::with_document(WorkspaceDocument::load_named(provider, workspace_id), peer_id)
    }

    fn with_document(document: WorkspaceDocument, peer_id: impl Into<String>) -> Self {
        let epochs = document.root_map(EPOCHS_MAP);
        let history = document.root_map(HISTORY_MAP);
        Self {
            document,
            peer_id: peer_id.into(),
            epochs,
            history,
        }
    }

    /// The head document, for persistence and sync.
    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The effective epoch: the maximum proposal of any peer.
    pub fn current(&self) -> u64 {
        let txn = self.document.read_txn();
        max_epoch(&txn, &self.epochs)
    }

    /// The highest epoch this peer has proposed.
    pub fn own(&self) -> u64 {
        let txn = self.document.read_txn();
        read_epoch(self.epochs.get(&txn, &self.peer_id))
    }

    /// Propose `epoch`. The own entry only ever grows; returns the effective
    /// epoch afterwards.
    pub fn propose(&self, epoch: u64) -> u64 {
        let mut txn = self.document.write_txn();
        let own = read_epoch(self.epochs.get(&txn, &self.peer_id));
        if epoch > own {
            self.epochs
                .insert(&mut txn, self.peer_id.as_str(), Any::Number(epoch as f64));
            log::debug!("Peer {} proposed epoch {}", self.peer_id, epoch);
        }
        max_epoch(&txn, &self.epochs)
    }

    /// Propose one past the effective epoch.
    pub fn bump(&self) -> u64 {
        self.propose(self.current() + 1)
    }

    /// Record how `epoch` was produced.
    pub fn record(&self, epoch: u64, kind: EpochKind) -> Result<()> {
        let record = EpochRecord {
            epoch,
            kind,
            created_at: now_millis(),
        };
        let json = serde_json::to_string(&record)?;
        let mut txn = self.document.write_txn();
        self.history.insert(&mut txn, epoch.to_string(), json);
        Ok(())
    }

    /// History entries ordered by epoch.
    pub fn history(&self) -> Vec<EpochRecord> {
        let txn = self.document.read_txn();
        let mut records: Vec<EpochRecord> = self
            .history
            .iter(&txn)
            .filter_map(|(_, out)| match out {
                Out::Any(Any::String(json)) => serde_json::from_str(&json).ok(),
                _ => None,
            })
            .collect();
        records.sort_by_key(|r| r.epoch);
        records
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let current = self.current();
        if current == 0 {
            return Lifecycle::Initial;
        }
        match self.history().into_iter().find(|r| r.epoch == current) {
            Some(EpochRecord {
                kind: EpochKind::Compacted,
                ..
            }) => Lifecycle::Compacted(current),
            _ => Lifecycle::Migrated(current),
        }
    }

    /// Persist the head document.
    pub fn save(&self, provider: &dyn PersistenceProvider) -> Result<()> {
        provider.save(self.document.name(), &self.document.encode_state_as_update())
    }

    /// Subscribe to effective-epoch changes. Fires with the new effective
    /// epoch whenever any peer's proposal changes.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let epochs = self.epochs.clone();
        self.epochs.observe(move |txn, _event| {
            callback(max_epoch(txn, &epochs));
        })
    }
}

fn read_epoch(out: Option<Out>) -> u64 {
    match out {
        Some(Out::Any(Any::Number(n))) if n >= 0.0 => n as u64,
        Some(Out::Any(Any::BigInt(n))) if n >= 0 => n as u64,
        _ => 0,
    }
}

fn max_epoch<T: ReadTxn>(txn: &T, epochs: &MapRef) -> u64 {
    epochs
        .iter(txn)
        .map(|(_, out)| read_epoch(Some(out)))
        .max()
        .unwrap_or(0)
}
