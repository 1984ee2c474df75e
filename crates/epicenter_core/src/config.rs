//! Workspace configuration.
//!
//! A workspace directory holds an `epicenter.toml` next to its snapshots and
//! projections:
//!
//! ```toml
//! workspace_id = "blog"
//! peer_id = "laptop"
//!
//! [persistence]
//! debounce_ms = 50
//!
//! [sqlite]
//! enabled = true
//! debounce_ms = 100
//! file = "tables.sqlite"
//!
//! [markdown]
//! enabled = true
//! watch = true
//! dir = "content"
//! sync_only_fields = ["syncedAt"]
//! body_fields = { posts = "content" }
//!
//! [sync]
//! server_url = "ws://localhost:3030"
//! ```
//!
//! Every section may be omitted and falls back to the defaults shown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EpicenterError, Result};

/// Name of the config file inside a workspace directory.
pub const CONFIG_FILE: &str = "epicenter.toml";

/// Settings of one workspace directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory the workspace lives in. Not stored; set on load.
    #[serde(skip)]
    pub root: PathBuf,

    pub workspace_id: String,

    /// Identity of this replica in the epoch head. A random one is used when
    /// unset, which costs one extra head entry per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub sqlite: SqliteConfig,

    #[serde(default)]
    pub markdown: MarkdownConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub debounce_ms: u64,
    /// Write `definition.json` and `kv.json` next to the snapshot.
    pub artifacts: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            artifacts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// Database file, relative to the workspace root.
    pub file: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 100,
            file: PathBuf::from("tables.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkdownConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// Watch the content directory for external edits.
    pub watch: bool,
    /// Content directory, relative to the workspace root.
    pub dir: PathBuf,
    /// Fields that exist for sync bookkeeping and never appear in files.
    pub sync_only_fields: Vec<String>,
    /// Body field per table id. Tables not listed use their first
    /// long-text field.
    pub body_fields: BTreeMap<String, String>,
}

impl Default for MarkdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 200,
            watch: true,
            dir: PathBuf::from("content"),
            sync_only_fields: Vec::new(),
            body_fields: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay server, e.g. `ws://localhost:3030`. Sync is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms)
    }
}

impl SqliteConfig {
    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms)
    }
}

impl MarkdownConfig {
    pub fn debounce(&self) -> Duration {
        millis(self.debounce_ms)
    }
}

impl WorkspaceConfig {
    /// A config with default sections.
    pub fn new(root: impl Into<PathBuf>, workspace_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            workspace_id: workspace_id.into(),
            peer_id: None,
            persistence: PersistenceConfig::default(),
            sqlite: SqliteConfig::default(),
            markdown: MarkdownConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    /// Path of `epicenter.toml` for a workspace directory.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load `epicenter.toml` from `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path_in(root);
        let contents = std::fs::read_to_string(&path).map_err(|e| EpicenterError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let mut config: WorkspaceConfig = toml::from_str(&contents)?;
        config.root = root.to_path_buf();
        Ok(config)
    }

    /// Load `epicenter.toml`, or return defaults for `workspace_id` if the
    /// file is missing. A file that exists but does not parse is an error.
    pub fn load_or_default(root: &Path, workspace_id: &str) -> Result<Self> {
        if Self::path_in(root).exists() {
            Self::load(root)
        } else {
            Ok(Self::new(root, workspace_id))
        }
    }

    /// Write `epicenter.toml` into the workspace root.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let path = Self::path_in(&self.root);
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| EpicenterError::FileWrite { path, source: e })?;
        Ok(())
    }

    /// The configured peer id, or a fresh random one.
    pub fn resolve_peer_id(&self) -> String {
        self.peer_id
            .clone()
            .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()))
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.root.join(&self.sqlite.file)
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join(&self.markdown.dir)
    }
}
