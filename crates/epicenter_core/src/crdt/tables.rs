//! Typed table access over a [`WorkspaceDocument`].
//!
//! [`Tables`] manages the table registry, [`TableHelper`] gives row CRUD for
//! one table and [`FieldsHelper`] edits its field definitions. All writes are
//! validated against the table's schema inside the same transaction that
//! performs them, so a rejected write leaves the document untouched.
//!
//! Each table exposes three independent observation sources backed by three
//! different root maps: metadata, field definitions and rows. A change in one
//! category can never wake a subscriber of another.

use std::collections::BTreeSet;
use std::sync::Arc;

use yrs::types::{Event, PathSegment};
use yrs::{
    Any, DeepObservable, GetString, Map, MapPrelim, MapRef, Observable, Out, ReadTxn, Subscription,
    Text, TextPrelim, TextRef, TransactionMut, WriteTxn,
};

use super::types::{Cells, Row, RowChange, Schema, TableDefinition, TableMetadata};
use super::workspace_doc::{
    DELETED_AT, TABLES_MAP, WorkspaceDocument, fields_map_name, now_millis, rows_map_name,
    table_map_name,
};
use crate::error::{EpicenterError, Result};
use crate::field::{Field, Value, check_field_name, new_id};
use crate::icon::{Icon, parse_stored};

/// A change to one field definition, reported by
/// [`TableHelper::observe_fields`]. `field` is `None` when it was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub name: String,
    pub field: Option<Field>,
}

/// The table registry of a workspace document.
#[derive(Clone)]
pub struct Tables {
    document: WorkspaceDocument,
    registry: MapRef,
}

impl Tables {
    pub(crate) fn new(document: WorkspaceDocument) -> Self {
        let registry = document.root_map(TABLES_MAP);
        Self { document, registry }
    }

    /// Create a user table under a fresh UUID.
    ///
    /// Two peers creating tables with the same display name end up with two
    /// distinct tables.
    pub fn create(
        &self,
        name: &str,
        icon: Option<Icon>,
        description: &str,
    ) -> Result<TableHelper> {
        let mut definition = TableDefinition::new(name).description(description);
        definition.icon = icon;
        self.define(&new_id(), &definition)
    }

    /// Declare a table under a caller-chosen identifier.
    ///
    /// Metadata is written only where it differs, fields are added or
    /// replaced (existing rows are backfilled in the same transaction) and a
    /// tombstoned table is revived. Fields present in the document but absent
    /// from `definition` are kept.
    pub fn define(&self, id: &str, definition: &TableDefinition) -> Result<TableHelper> {
        if id.is_empty() {
            return Err(EpicenterError::validation("id", "table id must not be empty"));
        }
        if is_reserved_table_id(id) {
            return Err(EpicenterError::validation(
                "id",
                format!("table id '{}' is reserved", id),
            ));
        }
        for (name, field) in &definition.fields {
            check_field(name, field)?;
        }

        let helper = TableHelper::new(self.document.clone(), id);
        {
            let mut txn = self.document.write_txn();
            let plans = definition
                .fields
                .iter()
                .map(|(name, field)| plan_field(&txn, &helper.fields, &helper.rows, name, field))
                .collect::<Result<Vec<_>>>()?;

            if self.registry.get(&txn, id).is_none() {
                self.registry
                    .insert(&mut txn, id, Any::Number(now_millis() as f64));
            }

            set_if_changed(&mut txn, &helper.meta, "name", Any::from(definition.name.clone()));
            let icon = match &definition.icon {
                Some(icon) => Any::from(icon.to_string()),
                None => Any::Null,
            };
            set_if_changed(&mut txn, &helper.meta, "icon", icon);
            set_if_changed(
                &mut txn,
                &helper.meta,
                "description",
                Any::from(definition.description.clone()),
            );
            if is_deleted(&txn, &helper.meta) {
                helper.meta.insert(&mut txn, DELETED_AT, Any::Null);
            }

            for plan in plans {
                apply_field(&mut txn, &helper.fields, plan)?;
            }
        }
        log::debug!("Defined table '{}' ({})", definition.name, id);
        Ok(helper)
    }

    /// Helper for a live table.
    pub fn get(&self, id: &str) -> Result<TableHelper> {
        let registered = {
            let txn = self.document.read_txn();
            self.registry.get(&txn, id).is_some()
        };
        if !registered {
            return Err(EpicenterError::TableNotFound(id.to_string()));
        }
        let helper = TableHelper::new(self.document.clone(), id);
        if helper.metadata().is_deleted() {
            return Err(EpicenterError::TableNotFound(id.to_string()));
        }
        Ok(helper)
    }

    /// Helper for a table whether or not it is live. Projections use it to
    /// keep observing a table across tombstoning and revival.
    pub(crate) fn open_any(&self, id: &str) -> TableHelper {
        TableHelper::new(self.document.clone(), id)
    }

    /// Identifiers of every registered table, tombstoned ones included.
    pub fn ids(&self) -> Vec<String> {
        let txn = self.document.read_txn();
        let mut ids: Vec<String> = self.registry.keys(&txn).map(String::from).collect();
        ids.sort();
        ids
    }

    /// Metadata of every live table, ordered by id.
    pub fn list(&self) -> Vec<TableMetadata> {
        self.ids()
            .into_iter()
            .map(|id| TableHelper::new(self.document.clone(), &id).metadata())
            .filter(|meta| !meta.is_deleted())
            .collect()
    }

    /// Definitions of every live table keyed by id.
    pub fn definitions(&self) -> Vec<(String, TableDefinition)> {
        self.list()
            .into_iter()
            .map(|meta| {
                let helper = TableHelper::new(self.document.clone(), &meta.id);
                let definition = TableDefinition {
                    name: meta.name,
                    icon: meta.icon,
                    description: meta.description,
                    fields: helper.schema(),
                };
                (meta.id, definition)
            })
            .collect()
    }

    /// Tombstone a table. Deleting a tombstoned table is a no-op.
    pub fn delete(&self, id: &str) -> Result<()> {
        let helper = match self.get(id) {
            Ok(helper) => helper,
            Err(EpicenterError::TableNotFound(_)) if self.ids().iter().any(|t| t == id) => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut txn = self.document.write_txn();
        helper
            .meta
            .insert(&mut txn, DELETED_AT, Any::Number(now_millis() as f64));
        log::debug!("Tombstoned table {}", id);
        Ok(())
    }

    /// Subscribe to tables being registered. The callback receives the ids
    /// that appeared.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.registry.observe(move |txn, event| {
            let mut ids: Vec<String> = event.keys(txn).keys().map(|k| k.to_string()).collect();
            ids.sort();
            if !ids.is_empty() {
                callback(&ids);
            }
        })
    }
}

/// Row access for one table.
#[derive(Clone, Debug)]
pub struct TableHelper {
    document: WorkspaceDocument,
    id: Arc<str>,
    meta: MapRef,
    fields: MapRef,
    rows: MapRef,
}

impl TableHelper {
    fn new(document: WorkspaceDocument, id: &str) -> Self {
        let meta = document.root_map(&table_map_name(id));
        let fields = document.root_map(&fields_map_name(id));
        let rows = document.root_map(&rows_map_name(id));
        Self {
            document,
            id: Arc::from(id),
            meta,
            fields,
            rows,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> TableMetadata {
        let txn = self.document.read_txn();
        read_metadata(&txn, &self.id, &self.meta)
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        let mut txn = self.document.write_txn();
        set_if_changed(&mut txn, &self.meta, "name", Any::from(name.to_string()));
        Ok(())
    }

    pub fn set_icon(&self, icon: Option<Icon>) -> Result<()> {
        let value = match icon {
            Some(icon) => Any::from(icon.to_string()),
            None => Any::Null,
        };
        let mut txn = self.document.write_txn();
        set_if_changed(&mut txn, &self.meta, "icon", value);
        Ok(())
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        let mut txn = self.document.write_txn();
        set_if_changed(
            &mut txn,
            &self.meta,
            "description",
            Any::from(description.to_string()),
        );
        Ok(())
    }

    /// Current field definitions.
    pub fn schema(&self) -> Schema {
        let txn = self.document.read_txn();
        read_schema(&txn, &self.fields)
    }

    pub fn fields(&self) -> FieldsHelper {
        FieldsHelper {
            document: self.document.clone(),
            table_id: Arc::clone(&self.id),
            fields: self.fields.clone(),
            rows: self.rows.clone(),
        }
    }

    // ==================== Rows ====================

    /// Insert or fully replace a row, reviving it if it was tombstoned.
    ///
    /// Cells missing from `row` take the field's default (or null); unknown
    /// cells are rejected.
    pub fn upsert(&self, row: Row) -> Result<()> {
        self.upsert_many(std::iter::once(row))
    }

    /// Upsert several rows in one transaction. Either all rows are written or
    /// none is.
    pub fn upsert_many<I>(&self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut txn = self.document.write_txn();
        let schema = read_schema(&txn, &self.fields);

        let mut prepared = Vec::new();
        for row in rows {
            if row.id.is_empty() {
                return Err(EpicenterError::validation("id", "row id must not be empty"));
            }
            let cells = self.complete_cells(&schema, row.cells)?;
            prepared.push((row.id, cells));
        }

        for (id, cells) in prepared {
            let row_map = match self.rows.get(&txn, &id) {
                Some(Out::YMap(map)) => map,
                _ => self.rows.insert(&mut txn, id.as_str(), MapPrelim::default()),
            };
            write_cells(&mut txn, &row_map, &schema, &cells);
            if is_deleted(&txn, &row_map) {
                row_map.insert(&mut txn, DELETED_AT, Any::Null);
            }
        }
        Ok(())
    }

    fn complete_cells(&self, schema: &Schema, mut cells: Cells) -> Result<Cells> {
        if let Some(unknown) = cells.keys().find(|k| !schema.contains_key(*k)) {
            return Err(EpicenterError::UnknownField {
                table: self.id.to_string(),
                field: unknown.clone(),
            });
        }
        let mut complete = Cells::new();
        for (name, field) in schema {
            let value = match cells.remove(name) {
                Some(value) => value,
                None => field
                    .fallback()
                    .ok_or_else(|| EpicenterError::validation(name, "required field is missing"))?,
            };
            field.validate(name, &value)?;
            complete.insert(name.clone(), value);
        }
        Ok(complete)
    }

    /// Read a live row. Tombstoned and unknown rows are both not found.
    pub fn get(&self, id: &str) -> Result<Row> {
        let txn = self.document.read_txn();
        let schema = read_schema(&txn, &self.fields);
        let row = match self.rows.get(&txn, id) {
            Some(Out::YMap(map)) => read_row(&txn, &schema, id, &map),
            _ => None,
        };
        row.ok_or_else(|| EpicenterError::RowNotFound {
            table: self.id.to_string(),
            row: id.to_string(),
        })
    }

    pub fn has(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    /// Whether the document holds an entry for `id`, live or tombstoned.
    pub fn exists(&self, id: &str) -> bool {
        let txn = self.document.read_txn();
        matches!(self.rows.get(&txn, id), Some(Out::YMap(_)))
    }

    /// Change some cells of a live row.
    pub fn update(&self, id: &str, partial: Cells) -> Result<()> {
        let mut txn = self.document.write_txn();
        let schema = read_schema(&txn, &self.fields);

        let row_map = match self.rows.get(&txn, id) {
            Some(Out::YMap(map)) if !is_deleted(&txn, &map) => map,
            _ => {
                return Err(EpicenterError::RowNotFound {
                    table: self.id.to_string(),
                    row: id.to_string(),
                });
            }
        };

        for (name, value) in &partial {
            let field = schema.get(name).ok_or_else(|| EpicenterError::UnknownField {
                table: self.id.to_string(),
                field: name.clone(),
            })?;
            field.validate(name, value)?;
        }

        write_cells(&mut txn, &row_map, &schema, &partial);
        Ok(())
    }

    /// Tombstone a row. Deleting a missing or already deleted row is not an
    /// error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut txn = self.document.write_txn();
        match self.rows.get(&txn, id) {
            Some(Out::YMap(map)) if !is_deleted(&txn, &map) => {
                map.insert(&mut txn, DELETED_AT, Any::Number(now_millis() as f64));
            }
            _ => log::debug!("Row {} in {} is already gone", id, self.id),
        }
        Ok(())
    }

    /// Every live row, ordered by id.
    pub fn get_all(&self) -> Vec<Row> {
        let txn = self.document.read_txn();
        let schema = read_schema(&txn, &self.fields);
        let mut rows: Vec<Row> = self
            .rows
            .iter(&txn)
            .filter_map(|(id, out)| match out {
                Out::YMap(map) => read_row(&txn, &schema, id, &map),
                _ => None,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<Row>
    where
        P: Fn(&Row) -> bool,
    {
        self.get_all().into_iter().filter(|row| predicate(row)).collect()
    }

    pub fn count(&self) -> usize {
        let txn = self.document.read_txn();
        self.rows
            .iter(&txn)
            .filter(|(_, out)| matches!(out, Out::YMap(map) if !is_deleted(&txn, map)))
            .count()
    }

    // ==================== Observation ====================

    /// Subscribe to name, icon, description and tombstone changes.
    pub fn observe_metadata<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TableMetadata) + Send + Sync + 'static,
    {
        let id = Arc::clone(&self.id);
        let meta = self.meta.clone();
        self.meta.observe(move |txn, _event| {
            callback(&read_metadata(txn, &id, &meta));
        })
    }

    /// Subscribe to field definitions being added, replaced or removed.
    pub fn observe_fields<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[FieldChange]) + Send + Sync + 'static,
    {
        let fields = self.fields.clone();
        self.fields.observe(move |txn, event| {
            let mut names: Vec<String> = event.keys(txn).keys().map(|k| k.to_string()).collect();
            names.sort();
            let changes: Vec<FieldChange> = names
                .into_iter()
                .map(|name| {
                    let field = read_field(txn, &fields, &name);
                    FieldChange { name, field }
                })
                .collect();
            callback(&changes);
        })
    }

    /// Subscribe to row and cell changes, including edits inside long-text
    /// cells. Each affected row is reported once per transaction with its
    /// state after the transaction.
    pub fn observe_rows<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[RowChange]) + Send + Sync + 'static,
    {
        let fields = self.fields.clone();
        let rows = self.rows.clone();
        self.rows.observe_deep(move |txn, events| {
            let mut ids = BTreeSet::new();
            for event in events.iter() {
                let path = event.path();
                match path.front() {
                    Some(PathSegment::Key(row_id)) => {
                        ids.insert(row_id.to_string());
                    }
                    Some(PathSegment::Index(_)) => {}
                    None => {
                        if let Event::Map(map_event) = event {
                            ids.extend(map_event.keys(txn).keys().map(|k| k.to_string()));
                        }
                    }
                }
            }
            if ids.is_empty() {
                return;
            }

            let schema = read_schema(txn, &fields);
            let changes: Vec<RowChange> = ids
                .into_iter()
                .map(|id| {
                    let row = match rows.get(txn, &id) {
                        Some(Out::YMap(map)) => read_row(txn, &schema, &id, &map),
                        _ => None,
                    };
                    RowChange { id, row }
                })
                .collect();
            callback(&changes);
        })
    }
}

/// Field-definition editing for one table.
#[derive(Clone)]
pub struct FieldsHelper {
    document: WorkspaceDocument,
    table_id: Arc<str>,
    fields: MapRef,
    rows: MapRef,
}

impl FieldsHelper {
    pub fn get(&self, name: &str) -> Result<Field> {
        let txn = self.document.read_txn();
        read_field(&txn, &self.fields, name).ok_or_else(|| EpicenterError::UnknownField {
            table: self.table_id.to_string(),
            field: name.to_string(),
        })
    }

    pub fn list(&self) -> Schema {
        let txn = self.document.read_txn();
        read_schema(&txn, &self.fields)
    }

    /// Add or replace a field. Rows lacking a valid value for it are
    /// backfilled with the field's default in the same transaction.
    pub fn set(&self, name: &str, field: Field) -> Result<()> {
        check_field(name, &field)?;
        let mut txn = self.document.write_txn();
        let plan = plan_field(&txn, &self.fields, &self.rows, name, &field)?;
        apply_field(&mut txn, &self.fields, plan)?;
        log::debug!("Set field '{}' on table {}", name, self.table_id);
        Ok(())
    }

    /// Remove a field definition. Existing cells stay in the document until
    /// the next compaction but are no longer read.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut txn = self.document.write_txn();
        if self.fields.remove(&mut txn, name).is_some() {
            log::debug!("Removed field '{}' from table {}", name, self.table_id);
        }
        Ok(())
    }
}

// ==================== Document access ====================

/// Ids starting with `_` are kept for projection bookkeeping, such as the
/// SQLite catalog.
pub fn is_reserved_table_id(id: &str) -> bool {
    id.starts_with('_')
}

fn check_field(name: &str, field: &Field) -> Result<()> {
    check_field_name(name)?;
    if let Some(default) = &field.default {
        field.validate(name, default)?;
    }
    Ok(())
}

/// A field write computed against the current document state.
struct FieldPlan {
    name: String,
    field: Field,
    write_definition: bool,
    backfill: Option<(Value, Vec<MapRef>)>,
}

/// Work out how to write a field and which rows need backfilling. Fails,
/// before anything is written, when live rows lack a valid value and the
/// field has no fallback.
fn plan_field(
    txn: &TransactionMut,
    fields: &MapRef,
    rows: &MapRef,
    name: &str,
    field: &Field,
) -> Result<FieldPlan> {
    let write_definition = read_field(txn, fields, name).as_ref() != Some(field);

    let stale: Vec<MapRef> = rows
        .iter(txn)
        .filter_map(|(_, out)| match out {
            Out::YMap(map) if !is_deleted(txn, &map) => Some(map),
            _ => None,
        })
        .filter(|map| {
            read_cell(txn, map, name).is_none_or(|value| field.validate(name, &value).is_err())
        })
        .collect();

    let backfill = match (stale.is_empty(), field.fallback()) {
        (true, _) => None,
        (false, Some(fallback)) => Some((fallback, stale)),
        (false, None) => {
            return Err(EpicenterError::validation(
                name,
                "field has no default and existing rows cannot be backfilled",
            ));
        }
    };

    Ok(FieldPlan {
        name: name.to_string(),
        field: field.clone(),
        write_definition,
        backfill,
    })
}

fn apply_field(txn: &mut TransactionMut, fields: &MapRef, plan: FieldPlan) -> Result<()> {
    if plan.write_definition {
        let json = serde_json::to_string(&plan.field)?;
        fields.insert(txn, plan.name.as_str(), json);
    }
    if let Some((fallback, stale)) = plan.backfill {
        let schema = Schema::from([(plan.name.clone(), plan.field)]);
        let cell = Cells::from([(plan.name.clone(), fallback)]);
        for map in &stale {
            write_cells(txn, map, &schema, &cell);
        }
        log::debug!("Backfilled '{}' on {} rows", plan.name, stale.len());
    }
    Ok(())
}

fn read_field<T: ReadTxn>(txn: &T, fields: &MapRef, name: &str) -> Option<Field> {
    match fields.get(txn, name)? {
        Out::Any(Any::String(json)) => match serde_json::from_str(&json) {
            Ok(field) => Some(field),
            Err(e) => {
                log::warn!("Ignoring unreadable definition of field '{}': {}", name, e);
                None
            }
        },
        _ => None,
    }
}

pub(crate) fn read_schema<T: ReadTxn>(txn: &T, fields: &MapRef) -> Schema {
    fields
        .keys(txn)
        .filter_map(|name| read_field(txn, fields, name).map(|f| (name.to_string(), f)))
        .collect()
}

fn read_metadata<T: ReadTxn>(txn: &T, id: &str, meta: &MapRef) -> TableMetadata {
    let text = |key: &str| match meta.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    };
    TableMetadata {
        id: id.to_string(),
        name: text("name").unwrap_or_default(),
        icon: parse_stored(text("icon")),
        description: text("description").unwrap_or_default(),
        deleted_at: deleted_at(txn, meta),
    }
}

fn deleted_at<T: ReadTxn>(txn: &T, map: &MapRef) -> Option<i64> {
    match map.get(txn, DELETED_AT) {
        Some(Out::Any(Any::Number(n))) => Some(n as i64),
        Some(Out::Any(Any::BigInt(n))) => Some(n),
        _ => None,
    }
}

pub(crate) fn is_deleted<T: ReadTxn>(txn: &T, map: &MapRef) -> bool {
    deleted_at(txn, map).is_some()
}

fn read_cell<T: ReadTxn>(txn: &T, row: &MapRef, name: &str) -> Option<Value> {
    match row.get(txn, name)? {
        Out::YText(text) => Some(Value::Text(text.get_string(txn))),
        Out::Any(any) => Value::from_any(&any),
        _ => None,
    }
}

/// Read a live row restricted to the fields of `schema`.
pub(crate) fn read_row<T: ReadTxn>(txn: &T, schema: &Schema, id: &str, map: &MapRef) -> Option<Row> {
    if is_deleted(txn, map) {
        return None;
    }
    let cells = schema
        .iter()
        .filter_map(|(name, field)| {
            read_cell(txn, map, name)
                .or_else(|| field.fallback())
                .map(|value| (name.clone(), value))
        })
        .collect();
    Some(Row::with_id(id, cells))
}

/// Write validated cells into a row map, touching only cells that change.
fn write_cells(txn: &mut TransactionMut, row: &MapRef, schema: &Schema, cells: &Cells) {
    for (name, value) in cells {
        let long_text = schema.get(name).is_some_and(Field::is_long_text);
        match (long_text, value) {
            (true, Value::Text(content)) => match row.get(txn, name) {
                Some(Out::YText(text)) => set_text(txn, &text, content),
                _ => {
                    row.insert(txn, name.as_str(), TextPrelim::new(content.as_str()));
                }
            },
            _ => set_if_changed(txn, row, name, value.to_any()),
        }
    }
}

fn set_if_changed(txn: &mut TransactionMut, map: &MapRef, key: &str, value: Any) {
    if let Some(Out::Any(current)) = map.get(txn, key)
        && current == value
    {
        return;
    }
    map.insert(txn, key, value);
}

/// Replace the content of a text with the smallest prefix/suffix-preserving
/// edit, so concurrent edits elsewhere in the text survive.
fn set_text(txn: &mut TransactionMut, text: &TextRef, content: &str) {
    let current = text.get_string(txn);
    if current == content {
        return;
    }

    let prefix = current
        .char_indices()
        .zip(content.chars())
        .take_while(|((_, a), b)| a == b)
        .last()
        .map(|((i, c), _)| i + c.len_utf8())
        .unwrap_or(0);

    let suffix = current[prefix..]
        .chars()
        .rev()
        .zip(content[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum::<usize>();

    // Offsets are byte offsets, the document's default offset kind.
    let delete_end = current.len() - suffix;
    let insert_end = content.len() - suffix;
    if delete_end > prefix {
        text.remove_range(txn, prefix as u32, (delete_end - prefix) as u32);
    }
    if insert_end > prefix {
        text.insert(txn, prefix as u32, &content[prefix..insert_end]);
    }
}
