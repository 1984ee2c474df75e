use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use epicenter_core::crdt::{FilesystemStorage, PersistenceProvider, SqliteStorage};

/// Where room snapshots are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// One `.bin` file per document under `{DATA_DIR}/.epicenter/`.
    Filesystem,
    /// One `documents.sqlite` database in `DATA_DIR`.
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Filesystem),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(ConfigError::InvalidStorageBackend(other.to_string())),
        }
    }
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Directory holding document snapshots (default: ./data)
    pub data_dir: PathBuf,
    /// Snapshot backend (default: fs)
    pub storage_backend: StorageBackend,
    /// Quiet period before a room's document is saved (default: 50ms)
    pub save_debounce: Duration,
    /// CORS allowed origins (comma-separated, empty allows any)
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            data_dir: PathBuf::from("./data"),
            storage_backend: StorageBackend::Filesystem,
            save_debounce: Duration::from_millis(50),
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup, falling back to defaults
    /// for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = match lookup("PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };
        let data_dir = lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);
        let storage_backend = match lookup("STORAGE_BACKEND") {
            Some(backend) => backend.parse()?,
            None => defaults.storage_backend,
        };
        let save_debounce = match lookup("SAVE_DEBOUNCE_MS") {
            Some(ms) => Duration::from_millis(ms.parse().map_err(|_| ConfigError::InvalidDebounce)?),
            None => defaults.save_debounce,
        };
        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            data_dir,
            storage_backend,
            save_debounce,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open the configured snapshot storage, creating the data directory.
    pub fn open_storage(&self) -> epicenter_core::Result<Arc<dyn PersistenceProvider>> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(match self.storage_backend {
            StorageBackend::Filesystem => Arc::new(FilesystemStorage::new(&self.data_dir)),
            StorageBackend::Sqlite => {
                Arc::new(SqliteStorage::open(self.data_dir.join("documents.sqlite"))?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidPort,
    InvalidStorageBackend(String),
    InvalidDebounce,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidStorageBackend(value) => write!(
                f,
                "Invalid STORAGE_BACKEND '{}', expected 'fs' or 'sqlite'",
                value
            ),
            ConfigError::InvalidDebounce => {
                write!(f, "Invalid SAVE_DEBOUNCE_MS environment variable")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
