//! Relational projection of a workspace document.
//!
//! Every live table becomes one SQLite table named by its id, with an `id`
//! primary key and one column per field. A `_tables` catalog lists names,
//! icons and descriptions. The projection is read-only for callers: writes
//! go through the document and reach SQLite on a debounced background task.
//!
//! Row edits are applied incrementally. Any field-definition or metadata
//! change drops and rebuilds the affected table instead of altering it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Transaction, params, params_from_iter};
use tokio::sync::mpsc;

use super::observers::TableObservers;
use super::write_behind::WriteBehind;
use crate::crdt::{Row, Schema, TableHelper, WorkspaceDocument, is_reserved_table_id};
use crate::error::{EpicenterError, Result};
use crate::field::{FieldKind, Value};

/// Name of the catalog table.
pub const CATALOG_TABLE: &str = "_tables";

/// A JSON object per result row, keyed by column name.
pub type QueryRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexTask {
    /// Start observing a newly registered table and project it.
    Attach(String),
    Rebuild(String),
    Row { table: String, row: String },
}

struct Inner {
    conn: Mutex<Connection>,
    observers: TableObservers,
    tx: OnceLock<mpsc::UnboundedSender<IndexTask>>,
}

/// Debounced SQLite projection of one document.
pub struct SqliteIndex {
    inner: Arc<Inner>,
    writer: WriteBehind<IndexTask>,
}

impl SqliteIndex {
    /// Open (or create) the database at `path` and project `document` into
    /// it. Must be called inside a tokio runtime.
    pub fn open(document: &WorkspaceDocument, path: &Path, debounce: Duration) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::start(document, Connection::open(path)?, debounce)
    }

    /// Project into a private in-memory database.
    pub fn in_memory(document: &WorkspaceDocument, debounce: Duration) -> Result<Self> {
        Self::start(document, Connection::open_in_memory()?, debounce)
    }

    fn start(document: &WorkspaceDocument, conn: Connection, debounce: Duration) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                icon TEXT,
                description TEXT NOT NULL
            );",
            CATALOG_TABLE
        ))?;

        let inner = Arc::new(Inner {
            conn: Mutex::new(conn),
            observers: TableObservers::new(document),
            tx: OnceLock::new(),
        });
        let writer = {
            let inner = Arc::clone(&inner);
            WriteBehind::spawn(debounce, move |batch| inner.flush(batch))
        };
        let tx = writer.sender();
        let _ = inner.tx.set(tx.clone());

        let registry = inner.observers.tables().observe(move |ids| {
            for id in ids {
                let _ = tx.send(IndexTask::Attach(id.clone()));
            }
        });
        inner.observers.watch_registry(registry);

        let index = Self { inner, writer };
        index.rebuild()?;
        log::info!("SQLite index started for '{}'", document.name());
        Ok(index)
    }

    /// Drop every projected table and project the document again.
    pub fn rebuild(&self) -> Result<()> {
        let ids: Vec<String> = self
            .inner
            .observers
            .tables()
            .ids()
            .into_iter()
            .filter(|id| projectable(id))
            .collect();
        for id in &ids {
            self.inner.attach(id);
        }

        let mut conn = self.inner.conn();
        let tx = conn.transaction()?;
        for stale in projected_tables(&tx)? {
            if !ids.contains(&stale) {
                drop_table(&tx, &stale)?;
            }
        }
        for id in &ids {
            rebuild_table(&tx, &self.inner.observers.helper(id))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Run a read-only statement and return the rows as JSON objects.
    ///
    /// Booleans come back as `0`/`1`. Any statement that could modify the
    /// database is rejected with [`EpicenterError::ReadOnlyIndex`].
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<QueryRow>> {
        let conn = self.inner.conn();
        let mut stmt = conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(EpicenterError::ReadOnlyIndex);
        }
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = QueryRow::new();
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), json_from_sql(row.get_ref(i)?));
            }
            results.push(object);
        }
        Ok(results)
    }

    /// Number of projected rows in a table.
    pub fn count(&self, table_id: &str) -> Result<usize> {
        let conn = self.inner.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(table_id)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Stop observing and cancel pending flushes. Nothing is written after
    /// this returns.
    pub async fn shutdown(self) {
        self.inner.observers.clear();
        self.writer.shutdown().await;
        log::info!("SQLite index stopped");
    }
}

impl Inner {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self, id: &str) -> bool {
        let Some(tx) = self.tx.get() else {
            return false;
        };
        self.observers.attach(id, |helper| {
            let table = helper.id().to_string();
            let rows_tx = tx.clone();
            let rows_table = table.clone();
            let fields_tx = tx.clone();
            let fields_table = table.clone();
            let meta_tx = tx.clone();
            vec![
                helper.observe_rows(move |changes| {
                    for change in changes {
                        let _ = rows_tx.send(IndexTask::Row {
                            table: rows_table.clone(),
                            row: change.id.clone(),
                        });
                    }
                }),
                helper.observe_fields(move |_| {
                    let _ = fields_tx.send(IndexTask::Rebuild(fields_table.clone()));
                }),
                helper.observe_metadata(move |_| {
                    let _ = meta_tx.send(IndexTask::Rebuild(table.clone()));
                }),
            ]
        })
    }

    fn flush(&self, batch: Vec<IndexTask>) {
        let mut rebuild = BTreeSet::new();
        let mut rows: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for task in batch {
            match task {
                IndexTask::Attach(id) => {
                    self.attach(&id);
                    rebuild.insert(id);
                }
                IndexTask::Rebuild(id) => {
                    rebuild.insert(id);
                }
                IndexTask::Row { table, row } => {
                    rows.entry(table).or_default().insert(row);
                }
            }
        }
        rows.retain(|table, _| !rebuild.contains(table));

        match self.apply(&rebuild, &rows) {
            Ok(()) => log::debug!(
                "SQLite index flushed {} rebuild(s), {} table(s) with row changes",
                rebuild.len(),
                rows.len()
            ),
            Err(e) => log::warn!("SQLite index flush failed: {}", e),
        }
    }

    fn apply(
        &self,
        rebuild: &BTreeSet<String>,
        rows: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for id in rebuild.iter().filter(|id| projectable(id)) {
            rebuild_table(&tx, &self.observers.helper(id))?;
        }
        for (table, ids) in rows.iter().filter(|(table, _)| projectable(table)) {
            let helper = self.observers.helper(table);
            if helper.metadata().is_deleted() {
                continue;
            }
            if let Err(e) = project_rows(&tx, &helper, ids) {
                // The schema moved under us; the rebuild it triggers will
                // also arrive, but catch up now.
                log::debug!("Row projection of {} failed ({}), rebuilding", table, e);
                rebuild_table(&tx, &helper)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn project_rows(tx: &Transaction<'_>, helper: &TableHelper, ids: &BTreeSet<String>) -> Result<()> {
    let schema = helper.schema();
    for id in ids {
        match helper.get(id) {
            Ok(row) => insert_row(tx, helper.id(), &schema, &row)?,
            Err(EpicenterError::RowNotFound { .. }) => {
                tx.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", quote(helper.id())),
                    params![id],
                )?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn rebuild_table(tx: &Transaction<'_>, helper: &TableHelper) -> Result<()> {
    let id = helper.id();
    drop_table(tx, id)?;

    let meta = helper.metadata();
    if meta.is_deleted() {
        log::debug!("Dropped projection of tombstoned table {}", id);
        return Ok(());
    }

    let schema = helper.schema();
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
    columns.extend(
        schema
            .iter()
            .map(|(name, field)| format!("{} {}", quote(name), column_type(&field.kind))),
    );
    tx.execute_batch(&format!("CREATE TABLE {} ({});", quote(id), columns.join(", ")))?;
    tx.execute(
        &format!(
            "INSERT INTO {} (id, name, icon, description) VALUES (?1, ?2, ?3, ?4)",
            CATALOG_TABLE
        ),
        params![
            id,
            meta.name,
            meta.icon.map(|icon| icon.to_string()),
            meta.description
        ],
    )?;

    let rows = helper.get_all();
    for row in &rows {
        insert_row(tx, id, &schema, row)?;
    }
    log::debug!("Rebuilt projection of {} ({} rows)", id, rows.len());
    Ok(())
}

fn drop_table(tx: &Transaction<'_>, id: &str) -> Result<()> {
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(id)))?;
    tx.execute(
        &format!("DELETE FROM {} WHERE id = ?1", CATALOG_TABLE),
        params![id],
    )?;
    Ok(())
}

/// Tables currently listed in the catalog.
fn projected_tables(tx: &Transaction<'_>) -> Result<Vec<String>> {
    let mut stmt = tx.prepare(&format!("SELECT id FROM {}", CATALOG_TABLE))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn insert_row(tx: &Transaction<'_>, table: &str, schema: &Schema, row: &Row) -> Result<()> {
    let mut columns = vec![quote("id")];
    let mut values = vec![SqlValue::Text(row.id.clone())];
    for name in schema.keys() {
        columns.push(quote(name));
        values.push(sql_value(row.get(name).unwrap_or(&Value::Null)));
    }
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(table),
            columns.join(", "),
            placeholders.join(", ")
        ),
        params_from_iter(values.iter()),
    )?;
    Ok(())
}

fn column_type(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Number => "REAL",
        FieldKind::Boolean => "INTEGER",
        _ => "TEXT",
    }
}

/// Whether a table gets a SQLite table. Reserved ids would collide with the
/// catalog or SQLite's own tables; a peer that bypassed `define` can still
/// write them, so they are skipped here too.
fn projectable(id: &str) -> bool {
    let skip = is_reserved_table_id(id) || id.to_ascii_lowercase().starts_with("sqlite_");
    if skip {
        log::warn!("Not projecting table '{}' into SQLite, its id is reserved", id);
    }
    !skip
}

/// Quote an identifier for SQLite.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => SqlValue::Real(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn json_from_sql(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::from(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{TableDefinition, cells};
    use crate::field::Field;
    use crate::icon::Icon;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    fn blog() -> WorkspaceDocument {
        let document = WorkspaceDocument::new("blog", 0);
        let posts = document
            .tables()
            .define(
                "posts",
                &TableDefinition::new("Posts")
                    .icon(Icon::Emoji("📝".into()))
                    .field("title", Field::text())
                    .field("views", Field::number().with_default(Value::Number(0.0)))
                    .field("draft", Field::boolean().with_default(Value::Boolean(true))),
            )
            .unwrap();
        posts
            .upsert(Row::with_id("p1", cells([("title", Value::text("Hello"))])))
            .unwrap();
        document
    }

    async fn settle() {
        tokio::time::sleep(DEBOUNCE * 10).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_projection() {
        let document = blog();
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();

        let rows = index.query("SELECT * FROM posts", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "p1");
        assert_eq!(rows[0]["title"], "Hello");
        assert_eq!(rows[0]["views"], 0.0);
        assert_eq!(rows[0]["draft"], 1);

        let catalog = index.query("SELECT name, icon FROM _tables", &[]).unwrap();
        assert_eq!(catalog[0]["name"], "Posts");
        assert_eq!(catalog[0]["icon"], "emoji:📝");
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_changes_are_debounced() {
        let document = blog();
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();
        let posts = document.tables().get("posts").unwrap();

        posts
            .upsert(Row::with_id("p2", cells([("title", Value::text("Second"))])))
            .unwrap();
        posts.delete("p1").unwrap();
        assert_eq!(index.count("posts").unwrap(), 1);

        settle().await;
        let rows = index
            .query("SELECT id FROM posts WHERE title = ?1", &[SqlValue::Text("Second".into())])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(index.count("posts").unwrap(), 1);
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_change_rebuilds_table() {
        let document = blog();
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();
        let posts = document.tables().get("posts").unwrap();

        posts
            .fields()
            .set("author", Field::text().with_default(Value::text("anon")))
            .unwrap();
        settle().await;

        let rows = index.query("SELECT author FROM posts", &[]).unwrap();
        assert_eq!(rows[0]["author"], "anon");
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_and_deleted_tables() {
        let document = blog();
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();

        let tags = document
            .tables()
            .define("tags", &TableDefinition::new("Tags").field("label", Field::text()))
            .unwrap();
        tags.upsert(Row::with_id("t1", cells([("label", Value::text("rust"))])))
            .unwrap();
        settle().await;
        assert_eq!(index.count("tags").unwrap(), 1);

        document.tables().delete("posts").unwrap();
        settle().await;
        assert!(index.count("posts").is_err());
        let catalog = index.query("SELECT id FROM _tables", &[]).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0]["id"], "tags");
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserved_table_id_keeps_catalog() {
        use yrs::Map;

        let document = blog();
        assert!(
            document
                .tables()
                .define("_tables", &TableDefinition::new("Shadow"))
                .is_err()
        );

        // A remote peer can still register the id directly.
        {
            let registry = document.root_map("tables");
            let mut txn = document.write_txn();
            registry.insert(&mut txn, "_tables", yrs::Any::Number(0.0));
        }
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();
        index.rebuild().unwrap();

        let catalog = index.query("SELECT id FROM _tables", &[]).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0]["id"], "posts");
        assert_eq!(index.count("posts").unwrap(), 1);
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_rejects_writes() {
        let document = blog();
        let index = SqliteIndex::in_memory(&document, DEBOUNCE).unwrap();

        for sql in ["DELETE FROM posts", "INSERT INTO posts (id, title) VALUES ('x', 'y')", "DROP TABLE posts"] {
            assert!(matches!(index.query(sql, &[]), Err(EpicenterError::ReadOnlyIndex)));
        }
        assert_eq!(index.count("posts").unwrap(), 1);
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writes_after_shutdown() {
        let document = blog();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tables.sqlite");
        let index = SqliteIndex::open(&document, &path, DEBOUNCE).unwrap();
        let posts = document.tables().get("posts").unwrap();

        posts
            .upsert(Row::with_id("p2", cells([("title", Value::text("Late"))])))
            .unwrap();
        index.shutdown().await;
        settle().await;

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
