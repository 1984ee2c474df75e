//! File-tree projection of a workspace document.
//!
//! Each live row is written to `{dir}/{tableId}/{rowId}.md`: the structured
//! fields become YAML frontmatter (`id` first, then fields by name) and one
//! long-text field becomes the body. This is the one projection that also
//! flows back: a watcher picks up edited files and applies them to the
//! document through the table helper, like any other write.
//!
//! ```text
//! document ──(row/field/meta observers)──► outbound WriteBehind ──► files
//! files ──(notify watcher)──► inbound WriteBehind ──► apply_file ──► document
//! ```
//!
//! The two directions settle because both skip work when the other side
//! already matches: outbound writes leave identical files untouched and
//! inbound files whose values equal the document are not applied.
//!
//! Deleting a row or table never removes files directly. Files of tombstoned
//! rows are renamed to `{rowId}.md.deleted` and only [`MarkdownIndex::purge`]
//! removes them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use indexmap::IndexMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::observers::TableObservers;
use super::write_behind::WriteBehind;
use crate::config::MarkdownConfig;
use crate::crdt::{Cells, Row, Schema, TableHelper, WorkspaceDocument, write_atomic};
use crate::error::{EpicenterError, Result};
use crate::field::{FieldKind, Value};
use crate::frontmatter;

const MARKDOWN_EXT: &str = "md";
/// Suffix appended to the file of a tombstoned row.
pub const DELETED_SUFFIX: &str = ".deleted";

/// A file that could not be applied to the document.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownParseError {
    pub path: PathBuf,
    pub message: String,
}

/// What [`MarkdownIndex::apply_file`] did with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Changed cells were written to the document.
    Applied,
    /// The file already matches the document.
    Unchanged,
    /// The file is gone and its row was tombstoned.
    Deleted,
    /// Not a row file.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileTask {
    Attach(String),
    Table(String),
    Row { table: String, row: String },
}

/// How rows map to files.
#[derive(Debug, Clone, Default)]
struct Layout {
    dir: PathBuf,
    sync_only: BTreeSet<String>,
    body_fields: BTreeMap<String, String>,
}

impl Layout {
    fn row_path(&self, table: &str, row: &str) -> PathBuf {
        self.dir.join(table).join(format!("{}.{}", row, MARKDOWN_EXT))
    }

    /// `(tableId, rowId)` of a row file, `None` for anything else.
    fn locate(&self, path: &Path) -> Option<(String, String)> {
        let relative = path.strip_prefix(&self.dir).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        let [table, file] = parts.as_slice() else {
            return None;
        };
        let row = file.strip_suffix(".md")?;
        if table.is_empty() || row.is_empty() {
            return None;
        }
        Some((table.to_string(), row.to_string()))
    }

    /// The field rendered as the body: the configured one, else the first
    /// long-text field.
    fn body_field<'a>(&'a self, table: &str, schema: &'a Schema) -> Option<&'a str> {
        if let Some(configured) = self.body_fields.get(table)
            && schema.contains_key(configured)
        {
            return Some(configured);
        }
        schema
            .iter()
            .find(|(_, field)| field.kind == FieldKind::LongText)
            .map(|(name, _)| name.as_str())
    }

    fn render(&self, table: &str, schema: &Schema, row: &Row) -> Result<String> {
        let body_field = self.body_field(table, schema);
        let mut frontmatter = IndexMap::new();
        frontmatter.insert("id".to_string(), serde_yaml::Value::String(row.id.clone()));
        for name in schema.keys() {
            if Some(name.as_str()) == body_field || self.sync_only.contains(name) {
                continue;
            }
            let value = row.get(name).unwrap_or(&Value::Null);
            frontmatter.insert(name.clone(), value.to_yaml());
        }
        let body = body_field
            .and_then(|name| row.get(name))
            .and_then(Value::as_str)
            .unwrap_or("");
        frontmatter::serialize(&frontmatter, body)
    }

    /// Parse a row file into its id and the cells it carries.
    fn parse(&self, path: &Path, table: &str, row_id: &str, schema: &Schema, content: &str) -> Result<Cells> {
        let parsed = frontmatter::parse(content, path)?;
        let invalid = |message: String| EpicenterError::InvalidFrontmatter {
            path: path.to_path_buf(),
            message,
        };
        let body_field = self.body_field(table, schema);

        let mut cells = Cells::new();
        for (key, yaml) in &parsed.frontmatter {
            if key == "id" {
                match yaml.as_str() {
                    Some(id) if id == row_id => continue,
                    _ => return Err(invalid(format!("id does not match file name '{}'", row_id))),
                }
            }
            if self.sync_only.contains(key) {
                continue;
            }
            if Some(key.as_str()) == body_field {
                return Err(invalid(format!("'{}' is the body field", key)));
            }
            let field = schema.get(key).ok_or_else(|| EpicenterError::UnknownField {
                table: table.to_string(),
                field: key.clone(),
            })?;
            cells.insert(key.clone(), field.coerce_yaml(key, yaml)?);
        }

        if let Some(name) = body_field
            && let Some(field) = schema.get(name)
        {
            let value = if parsed.body.is_empty() && field.nullable {
                Value::Null
            } else {
                Value::Text(parsed.body)
            };
            field.validate(name, &value)?;
            cells.insert(name.to_string(), value);
        }
        Ok(cells)
    }
}

struct Inner {
    layout: Layout,
    observers: TableObservers,
    errors: Mutex<Vec<MarkdownParseError>>,
    tx: OnceLock<mpsc::UnboundedSender<FileTask>>,
}

/// Debounced, bidirectional markdown projection of one document.
pub struct MarkdownIndex {
    inner: Arc<Inner>,
    outbound: WriteBehind<FileTask>,
    inbound: WriteBehind<PathBuf>,
    watcher: Option<RecommendedWatcher>,
}

impl MarkdownIndex {
    /// Project `document` into `dir` and, if configured, start watching it.
    /// Must be called inside a tokio runtime.
    pub fn start(document: &WorkspaceDocument, dir: impl Into<PathBuf>, config: &MarkdownConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| EpicenterError::FileWrite {
            path: dir.clone(),
            source,
        })?;
        // Watch events carry canonical paths on some platforms.
        let dir = dir.canonicalize().unwrap_or(dir);

        let inner = Arc::new(Inner {
            layout: Layout {
                dir,
                sync_only: config.sync_only_fields.iter().cloned().collect(),
                body_fields: config.body_fields.clone(),
            },
            observers: TableObservers::new(document),
            errors: Mutex::new(Vec::new()),
            tx: OnceLock::new(),
        });

        let outbound = {
            let inner = Arc::clone(&inner);
            WriteBehind::spawn(config.debounce(), move |batch| inner.flush(batch))
        };
        let tx = outbound.sender();
        let _ = inner.tx.set(tx.clone());
        let registry = inner.observers.tables().observe(move |ids| {
            for id in ids {
                let _ = tx.send(FileTask::Attach(id.clone()));
            }
        });
        inner.observers.watch_registry(registry);

        let inbound = {
            let inner = Arc::clone(&inner);
            WriteBehind::spawn(config.debounce(), move |paths: Vec<PathBuf>| {
                for path in paths {
                    // Failures are recorded by apply_file.
                    let _ = inner.apply_file(&path);
                }
            })
        };

        let watcher = if config.watch {
            Some(watch(&inner.layout.dir, inbound.sender())?)
        } else {
            None
        };

        let index = Self {
            inner,
            outbound,
            inbound,
            watcher,
        };
        index.export_all()?;
        log::info!(
            "Markdown index started for '{}' in {}",
            document.name(),
            index.dir().display()
        );
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.layout.dir
    }

    /// Path of a row's file.
    pub fn row_path(&self, table: &str, row: &str) -> PathBuf {
        self.inner.layout.row_path(table, row)
    }

    /// Write every table to disk now.
    pub fn export_all(&self) -> Result<()> {
        for id in self.inner.observers.tables().ids() {
            self.inner.attach(&id);
            self.inner.export_table(&id)?;
        }
        Ok(())
    }

    /// Apply one file to the document right away.
    pub fn apply_file(&self, path: &Path) -> Result<FileOutcome> {
        self.inner.apply_file(path)
    }

    /// Queue a file for the debounced inbound path, as the watcher does.
    pub fn schedule_file(&self, path: impl Into<PathBuf>) {
        self.inbound.schedule(path.into());
    }

    /// Apply every row file under the content directory.
    pub fn import_all(&self) -> Vec<(PathBuf, FileOutcome)> {
        let mut outcomes = Vec::new();
        for path in row_files(&self.inner.layout.dir) {
            if let Ok(outcome) = self.inner.apply_file(&path) {
                outcomes.push((path, outcome));
            }
        }
        outcomes
    }

    /// Drain the parse errors recorded since the last call.
    pub fn take_errors(&self) -> Vec<MarkdownParseError> {
        std::mem::take(&mut *self.inner.errors())
    }

    /// Remove the files of tombstoned rows. Returns how many were removed.
    pub fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for table_dir in read_dirs(&self.inner.layout.dir) {
            for entry in std::fs::read_dir(&table_dir)?.flatten() {
                let path = entry.path();
                let is_tombstone = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(DELETED_SUFFIX));
                if is_tombstone && path.is_file() {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        log::debug!("Purged {} tombstoned file(s)", removed);
        Ok(removed)
    }

    /// Stop the watcher and both debounce tasks. No file is written and no
    /// file is applied after this returns.
    pub async fn shutdown(mut self) {
        self.watcher.take();
        self.inner.observers.clear();
        self.outbound.shutdown().await;
        self.inbound.shutdown().await;
        log::info!("Markdown index stopped");
    }
}

fn watch(dir: &Path, tx: mpsc::UnboundedSender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    if path.extension().is_some_and(|ext| ext == MARKDOWN_EXT) {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => log::warn!("Markdown watcher error: {}", e),
        },
        notify::Config::default(),
    )
    .map_err(|e| EpicenterError::Io(std::io::Error::other(e)))?;
    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|e| EpicenterError::Io(std::io::Error::other(e)))?;
    Ok(watcher)
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn row_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for table_dir in read_dirs(dir) {
        let Ok(entries) = std::fs::read_dir(&table_dir) else {
            continue;
        };
        files.extend(
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == MARKDOWN_EXT)),
        );
    }
    files.sort();
    files
}

impl Inner {
    fn errors(&self) -> MutexGuard<'_, Vec<MarkdownParseError>> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner())
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
                        let _ = rows_tx.send(FileTask::Row {
                            table: rows_table.clone(),
                            row: change.id.clone(),
                        });
                    }
                }),
                helper.observe_fields(move |_| {
                    let _ = fields_tx.send(FileTask::Table(fields_table.clone()));
                }),
                helper.observe_metadata(move |_| {
                    let _ = meta_tx.send(FileTask::Table(table.clone()));
                }),
            ]
        })
    }

    fn flush(&self, batch: Vec<FileTask>) {
        let mut tables = BTreeSet::new();
        let mut rows: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for task in batch {
            match task {
                FileTask::Attach(id) => {
                    self.attach(&id);
                    tables.insert(id);
                }
                FileTask::Table(id) => {
                    tables.insert(id);
                }
                FileTask::Row { table, row } => {
                    rows.entry(table).or_default().insert(row);
                }
            }
        }
        rows.retain(|table, _| !tables.contains(table));

        for id in &tables {
            if let Err(e) = self.export_table(id) {
                log::warn!("Failed to export table {} to markdown: {}", id, e);
            }
        }
        for (table, ids) in &rows {
            let helper = self.observers.helper(table);
            if helper.metadata().is_deleted() {
                continue;
            }
            let schema = helper.schema();
            for id in ids {
                if let Err(e) = self.export_row(&helper, &schema, id) {
                    log::warn!("Failed to export row {} of {} to markdown: {}", id, table, e);
                }
            }
        }
    }

    fn export_table(&self, id: &str) -> Result<()> {
        let helper = self.observers.helper(id);
        let table_dir = self.layout.dir.join(id);

        if helper.metadata().is_deleted() {
            for path in row_files(&self.layout.dir)
                .into_iter()
                .filter(|p| p.parent() == Some(table_dir.as_path()))
            {
                tombstone_file(&path)?;
            }
            log::debug!("Tombstoned markdown files of table {}", id);
            return Ok(());
        }

        let schema = helper.schema();
        let rows = helper.get_all();
        let live: BTreeSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        for row in &rows {
            let content = self.layout.render(id, &schema, row)?;
            write_if_changed(&self.layout.row_path(id, &row.id), &content)?;
        }
        // Files whose row exists in the document but is tombstoned.
        for path in row_files(&table_dir) {
            if let Some((_, row_id)) = self.layout.locate(&path)
                && !live.contains(row_id.as_str())
                && helper.exists(&row_id)
            {
                tombstone_file(&path)?;
            }
        }
        Ok(())
    }

    fn export_row(&self, helper: &TableHelper, schema: &Schema, id: &str) -> Result<()> {
        let path = self.layout.row_path(helper.id(), id);
        match helper.get(id) {
            Ok(row) => {
                let content = self.layout.render(helper.id(), schema, &row)?;
                write_if_changed(&path, &content)
            }
            Err(EpicenterError::RowNotFound { .. }) => tombstone_file(&path),
            Err(e) => Err(e),
        }
    }

    fn apply_file(&self, path: &Path) -> Result<FileOutcome> {
        let result = self.try_apply_file(path);
        if let Err(e) = &result {
            log::warn!("Skipping markdown file {}: {}", path.display(), e);
            self.errors().push(MarkdownParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
        result
    }

    fn try_apply_file(&self, path: &Path) -> Result<FileOutcome> {
        let Some((table, row_id)) = self.layout.locate(path) else {
            return Ok(FileOutcome::Ignored);
        };
        let helper = self.observers.tables().get(&table)?;

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if helper.has(&row_id) {
                    helper.delete(&row_id)?;
                    log::debug!("Row {} of {} tombstoned, its file was removed", row_id, table);
                    return Ok(FileOutcome::Deleted);
                }
                return Ok(FileOutcome::Unchanged);
            }
            Err(source) => {
                return Err(EpicenterError::FileRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let schema = helper.schema();
        let cells = self.layout.parse(path, &table, &row_id, &schema, &content)?;
        let body_field = self.layout.body_field(&table, &schema).map(str::to_string);

        match helper.get(&row_id) {
            Ok(current) => {
                let changed: Cells = cells
                    .into_iter()
                    .filter(|(name, value)| {
                        let existing = current.get(name);
                        if body_field.as_deref() == Some(name.as_str()) {
                            // Null and "" render as the same empty body.
                            return body_text(existing) != body_text(Some(value));
                        }
                        existing != Some(value)
                    })
                    .collect();
                if changed.is_empty() {
                    return Ok(FileOutcome::Unchanged);
                }
                helper.update(&row_id, changed)?;
            }
            Err(EpicenterError::RowNotFound { .. }) => {
                helper.upsert(Row::with_id(row_id.as_str(), cells))?;
            }
            Err(e) => return Err(e),
        }
        log::debug!("Applied {} to row {} of {}", path.display(), row_id, table);
        Ok(FileOutcome::Applied)
    }
}

fn body_text(value: Option<&Value>) -> &str {
    value.and_then(Value::as_str).unwrap_or("")
}

fn write_if_changed(path: &Path, content: &str) -> Result<()> {
    if std::fs::read_to_string(path).is_ok_and(|existing| existing == content) {
        return Ok(());
    }
    write_atomic(path, content.as_bytes())
}

/// Rename `{row}.md` to `{row}.md.deleted`, if present.
fn tombstone_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut target = path.as_os_str().to_owned();
    target.push(DELETED_SUFFIX);
    std::fs::rename(path, &target).map_err(|source| EpicenterError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Tombstoned {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{TableDefinition, cells};
    use crate::field::Field;
    use tempfile::TempDir;

    const DEBOUNCE: Duration = Duration::from_millis(20);

    fn config() -> MarkdownConfig {
        MarkdownConfig {
            debounce_ms: 20,
            watch: false,
            sync_only_fields: vec!["syncedAt".into()],
            ..MarkdownConfig::default()
        }
    }

    fn blog() -> WorkspaceDocument {
        let document = WorkspaceDocument::new("blog", 0);
        let posts = document
            .tables()
            .define(
                "posts",
                &TableDefinition::new("Posts")
                    .field("title", Field::text())
                    .field("views", Field::number().with_default(Value::Number(0.0)))
                    .field("published", Field::date().nullable())
                    .field("content", Field::long_text().with_default(Value::text("")))
                    .field("syncedAt", Field::number().nullable()),
            )
            .unwrap();
        posts
            .upsert(Row::with_id(
                "p1",
                cells([
                    ("title", Value::text("Hello")),
                    ("views", Value::Number(3.0)),
                    ("content", Value::text("# Hello\n\nFirst post.\n")),
                    ("syncedAt", Value::Number(99.0)),
                ]),
            ))
            .unwrap();
        document
    }

    async fn settle() {
        tokio::time::sleep(DEBOUNCE * 10).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_layout() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();

        let content = std::fs::read_to_string(index.row_path("posts", "p1")).unwrap();
        assert_eq!(
            content,
            "---\nid: p1\npublished: null\ntitle: Hello\nviews: 3\n---\n# Hello\n\nFirst post.\n"
        );
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_is_identity() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let before = document.tables().get("posts").unwrap().get("p1").unwrap();

        let outcome = index.apply_file(&index.row_path("posts", "p1")).unwrap();
        assert_eq!(outcome, FileOutcome::Unchanged);
        let after = document.tables().get("posts").unwrap().get("p1").unwrap();
        assert_eq!(before, after);
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_nullable_body_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let document = WorkspaceDocument::new("blog", 0);
        let notes = document
            .tables()
            .define(
                "notes",
                &TableDefinition::new("Notes")
                    .field("title", Field::text())
                    .field("body", Field::long_text().nullable()),
            )
            .unwrap();
        notes
            .upsert(Row::with_id(
                "n1",
                cells([("title", Value::text("Blank")), ("body", Value::text(""))]),
            ))
            .unwrap();
        notes
            .upsert(Row::with_id(
                "n2",
                cells([("title", Value::text("Unset")), ("body", Value::Null)]),
            ))
            .unwrap();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();

        for id in ["n1", "n2"] {
            let before = notes.get(id).unwrap();
            let outcome = index.apply_file(&index.row_path("notes", id)).unwrap();
            assert_eq!(outcome, FileOutcome::Unchanged, "row {}", id);
            assert_eq!(notes.get(id).unwrap(), before);
        }
        assert_eq!(notes.get("n1").unwrap().get("body"), Some(&Value::text("")));

        // Writing a body still lands.
        let path = index.row_path("notes", "n2");
        std::fs::write(&path, "---\nid: n2\ntitle: Unset\n---\nNow set").unwrap();
        assert_eq!(index.apply_file(&path).unwrap(), FileOutcome::Applied);
        assert_eq!(notes.get("n2").unwrap().get("body"), Some(&Value::text("Now set")));
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_edit_is_applied() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let path = index.row_path("posts", "p1");

        std::fs::write(&path, "---\nid: p1\ntitle: Edited\nviews: 4\n---\nNew body").unwrap();
        assert_eq!(index.apply_file(&path).unwrap(), FileOutcome::Applied);

        let row = document.tables().get("posts").unwrap().get("p1").unwrap();
        assert_eq!(row.get("title"), Some(&Value::text("Edited")));
        assert_eq!(row.get("views"), Some(&Value::Number(4.0)));
        assert_eq!(row.get("content"), Some(&Value::text("New body")));
        // Sync-only cells are untouched by file edits.
        assert_eq!(row.get("syncedAt"), Some(&Value::Number(99.0)));
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_file_creates_row() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let path = index.row_path("posts", "p2");

        std::fs::write(&path, "---\ntitle: 2024\n---\n").unwrap();
        index.schedule_file(&path);
        settle().await;

        let row = document.tables().get("posts").unwrap().get("p2").unwrap();
        assert_eq!(row.get("title"), Some(&Value::text("2024")));
        assert_eq!(row.get("views"), Some(&Value::Number(0.0)));
        assert!(index.take_errors().is_empty());
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_files_are_skipped_and_reported() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let p1 = index.row_path("posts", "p1");
        let before = document.encode_state_vector();

        let bad = [
            (p1.clone(), "no frontmatter at all"),
            (p1.clone(), "---\ntitle: [broken\n---\n"),
            (p1.clone(), "---\nviews: many\n---\n"),
            (p1.clone(), "---\ntitle: Ok\nunknown: 1\n---\n"),
            (index.row_path("posts", "p3"), "---\nviews: 1\n---\n"),
        ];
        for (path, content) in &bad {
            std::fs::write(path, content).unwrap();
            assert!(index.apply_file(path).is_err(), "{} should fail", content);
        }

        assert_eq!(document.encode_state_vector(), before);
        let errors = index.take_errors();
        assert_eq!(errors.len(), bad.len());
        assert_eq!(errors[0].path, p1);
        assert!(index.take_errors().is_empty());
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_changes_reach_files() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let posts = document.tables().get("posts").unwrap();

        posts
            .update("p1", cells([("title", Value::text("Renamed"))]))
            .unwrap();
        settle().await;
        let content = std::fs::read_to_string(index.row_path("posts", "p1")).unwrap();
        assert!(content.contains("title: Renamed"));
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_tombstones_file_then_purge() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let path = index.row_path("posts", "p1");

        document.tables().get("posts").unwrap().delete("p1").unwrap();
        settle().await;
        assert!(!path.exists());
        let mut tombstone = path.clone().into_os_string();
        tombstone.push(DELETED_SUFFIX);
        assert!(Path::new(&tombstone).exists());

        assert_eq!(index.purge().unwrap(), 1);
        assert!(!Path::new(&tombstone).exists());
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_file_tombstones_row() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let path = index.row_path("posts", "p1");

        std::fs::remove_file(&path).unwrap();
        assert_eq!(index.apply_file(&path).unwrap(), FileOutcome::Deleted);
        assert!(!document.tables().get("posts").unwrap().has("p1"));
        index.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writes_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let document = blog();
        let index = MarkdownIndex::start(&document, dir.path(), &config()).unwrap();
        let path = index.row_path("posts", "p2");

        document
            .tables()
            .get("posts")
            .unwrap()
            .upsert(Row::with_id("p2", cells([("title", Value::text("Late"))])))
            .unwrap();
        index.shutdown().await;
        settle().await;
        assert!(!path.exists());
    }

    #[test]
    fn test_locate() {
        let layout = Layout {
            dir: PathBuf::from("/ws/content"),
            ..Layout::default()
        };
        assert_eq!(
            layout.locate(Path::new("/ws/content/posts/p1.md")),
            Some(("posts".into(), "p1".into()))
        );
        assert_eq!(layout.locate(Path::new("/ws/content/posts/p1.md.deleted")), None);
        assert_eq!(layout.locate(Path::new("/ws/content/p1.md")), None);
        assert_eq!(layout.locate(Path::new("/elsewhere/posts/p1.md")), None);
    }
}
