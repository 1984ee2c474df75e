//! Filesystem storage for workspace snapshots.
//!
//! Layout under the workspace root:
//!
//! ```text
//! {root}/
//! ├── .epicenter/
//! │   ├── {workspaceId}.bin          epoch head
//! │   └── {workspaceId}-{epoch}.bin  data documents
//! ├── definition.json
//! └── kv.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use super::storage::{PersistenceProvider, StorageResult};
use crate::error::EpicenterError;

/// Directory holding binary snapshots, relative to the workspace root.
pub const SNAPSHOT_DIR: &str = ".epicenter";

const SNAPSHOT_EXT: &str = "bin";

/// Snapshot storage in a workspace directory.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the snapshot for a document name.
    pub fn snapshot_path(&self, name: &str) -> PathBuf {
        self.root
            .join(SNAPSHOT_DIR)
            .join(format!("{}.{}", name, SNAPSHOT_EXT))
    }
}

/// Write `contents` next to `path` and rename it into place, so readers see
/// either the old or the new file, never a partial one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| EpicenterError::FileWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(|source| EpicenterError::FileWrite {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| EpicenterError::FileWrite {
        path: path.to_path_buf(),
        source,
    })
}

impl PersistenceProvider for FilesystemStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.snapshot_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(EpicenterError::FileRead { path, source }),
        }
    }

    fn save(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        write_atomic(&self.snapshot_path(name), state)
    }

    fn write_artifact(&self, file_name: &str, contents: &str) -> StorageResult<()> {
        write_atomic(&self.root.join(file_name), contents.as_bytes())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let dir = self.root.join(SNAPSHOT_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(EpicenterError::FileRead { path: dir, source }),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }
}
