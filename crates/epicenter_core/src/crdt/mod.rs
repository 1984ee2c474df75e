//! CRDT document model.
//!
//! A workspace epoch is one [`WorkspaceDocument`]. [`Tables`] and
//! [`KvHelper`] give typed, validated access to it, [`EpochCoordinator`]
//! tracks which epoch is live, and [`PersistenceProvider`] implementations
//! store snapshots.

mod epoch;
mod filesystem_storage;
mod kv;
mod memory_storage;
mod persistence;
mod sqlite_storage;
mod storage;
mod tables;
pub mod types;
mod workspace_doc;

pub use epoch::{EpochCoordinator, EpochKind, EpochRecord, Lifecycle};
pub use filesystem_storage::{FilesystemStorage, SNAPSHOT_DIR};
pub(crate) use filesystem_storage::write_atomic;
pub use kv::{KvChange, KvHelper};
pub use memory_storage::MemoryStorage;
pub use persistence::{DEFINITION_FILE, KV_FILE, PersistenceHandle, save_document};
pub use sqlite_storage::SqliteStorage;
pub use storage::{PersistenceProvider, StorageResult};
pub use tables::{FieldChange, FieldsHelper, TableHelper, Tables, is_reserved_table_id};
pub use types::{
    Cells, KvDefinition, KvEntry, Row, RowChange, Schema, TableDefinition, TableMetadata,
    TableSnapshot, WorkspaceDefinition, WorkspaceSnapshot, cells,
};
pub use workspace_doc::{REMOTE_ORIGIN, WorkspaceDocument};
