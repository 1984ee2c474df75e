//! Plain data types read out of and written into the workspace document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field::{Field, Value, new_id};
use crate::icon::Icon;

/// Cells of a row keyed by field identifier.
pub type Cells = BTreeMap<String, Value>;

/// Field definitions of a table keyed by field identifier.
pub type Schema = BTreeMap<String, Field>;

/// A live (non-tombstoned) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    #[serde(flatten)]
    pub cells: Cells,
}

impl Row {
    /// A row with a freshly generated identifier.
    pub fn new(cells: Cells) -> Self {
        Self { id: new_id(), cells }
    }

    pub fn with_id(id: impl Into<String>, cells: Cells) -> Self {
        Self {
            id: id.into(),
            cells,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.cells.get(field)
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.cells.insert(field.into(), value);
        self
    }
}

/// Build a [`Cells`] map from `(field, value)` pairs.
pub fn cells<I, K>(pairs: I) -> Cells
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Schema of a table together with its display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Icon>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Schema,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn icon(mut self, icon: Icon) -> Self {
        self.icon = Some(icon);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }
}

/// Display metadata of a table as stored in its `table:{id}` map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub id: String,
    pub name: String,
    pub icon: Option<Icon>,
    pub description: String,
    pub deleted_at: Option<i64>,
}

impl TableMetadata {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Definition of a KV setting, without its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Icon>,
    #[serde(default)]
    pub description: String,
    pub field: Field,
}

impl KvDefinition {
    pub fn new(name: impl Into<String>, field: Field) -> Self {
        Self {
            name: name.into(),
            icon: None,
            description: String::new(),
            field,
        }
    }
}

/// A KV setting: definition and value stored as one scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Icon>,
    #[serde(default)]
    pub description: String,
    pub field: Field,
    pub value: Value,
}

impl KvEntry {
    pub fn definition(&self) -> KvDefinition {
        KvDefinition {
            name: self.name.clone(),
            icon: self.icon.clone(),
            description: self.description.clone(),
            field: self.field.clone(),
        }
    }
}

/// A row-level change reported by row observers.
///
/// `row` is `None` when the row was tombstoned or its entry disappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub id: String,
    pub row: Option<Row>,
}

/// Active content of one table, as exported for migrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableSnapshot {
    pub definition: TableDefinition,
    #[serde(default)]
    pub rows: BTreeMap<String, Cells>,
}

/// Active content of a whole workspace epoch.
///
/// Tombstoned tables and rows are not part of a snapshot, so importing one
/// into a fresh document is also a compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub tables: BTreeMap<String, TableSnapshot>,
    #[serde(default)]
    pub kv: BTreeMap<String, KvEntry>,
}

/// Human-readable schema of a workspace, written as `definition.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkspaceDefinition {
    pub workspace_id: String,
    pub epoch: u64,
    pub tables: BTreeMap<String, TableDefinition>,
    pub kv: BTreeMap<String, KvDefinition>,
}
