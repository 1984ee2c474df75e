use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::sync::ProtocolError;

/// Unified error type for epicenter operations
#[derive(Debug, Error)]
pub enum EpicenterError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // Serialization errors
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Frontmatter errors
    #[error("No frontmatter found in '{0}'")]
    NoFrontmatter(PathBuf),

    #[error("Invalid frontmatter in '{path}': {message}")]
    InvalidFrontmatter { path: PathBuf, message: String },

    // Document errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Statement is not read-only; the index only accepts queries")]
    ReadOnlyIndex,

    // Validation errors
    #[error("Invalid value for field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Unknown field '{field}' in table '{table}'")]
    UnknownField { table: String, field: String },

    #[error("Invalid icon '{0}': expected 'emoji:', 'lucide:' or 'url:' prefix")]
    InvalidIcon(String),

    // Lookup errors
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Row '{row}' not found in table '{table}'")]
    RowNotFound { table: String, row: String },

    #[error("KV key '{0}' is not defined")]
    KeyNotFound(String),

    // Epoch errors
    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Workspace is at epoch {current} but the head already points at epoch {head}")]
    StaleEpoch { current: u64, head: u64 },

    // Sync errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Sync error: {0}")]
    Sync(String),
}

/// Result type alias for epicenter operations
pub type Result<T> = std::result::Result<T, EpicenterError>;

/// Closed error taxonomy surfaced across the action boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Persistence,
    Protocol,
    Validation,
    NotFound,
    Parse,
    Migration,
    Io,
    Crdt,
    Config,
    Sync,
}

impl EpicenterError {
    /// Classify this error into the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EpicenterError::Io(_)
            | EpicenterError::FileRead { .. }
            | EpicenterError::FileWrite { .. } => ErrorKind::Io,
            EpicenterError::Yaml(_)
            | EpicenterError::Json(_)
            | EpicenterError::NoFrontmatter(_)
            | EpicenterError::InvalidFrontmatter { .. } => ErrorKind::Parse,
            EpicenterError::ConfigParse(_) | EpicenterError::ConfigSerialize(_) => {
                ErrorKind::Config
            }
            EpicenterError::Crdt(_) => ErrorKind::Crdt,
            EpicenterError::Persistence(_)
            | EpicenterError::Sqlite(_)
            | EpicenterError::ReadOnlyIndex => ErrorKind::Persistence,
            EpicenterError::Validation { .. }
            | EpicenterError::UnknownField { .. }
            | EpicenterError::InvalidIcon(_) => ErrorKind::Validation,
            EpicenterError::TableNotFound(_)
            | EpicenterError::RowNotFound { .. }
            | EpicenterError::KeyNotFound(_) => ErrorKind::NotFound,
            EpicenterError::Migration(_) | EpicenterError::StaleEpoch { .. } => {
                ErrorKind::Migration
            }
            EpicenterError::Protocol(_) => ErrorKind::Protocol,
            EpicenterError::Sync(_) => ErrorKind::Sync,
        }
    }

    /// Shorthand for a validation failure on one field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EpicenterError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of EpicenterError for IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl From<&EpicenterError> for SerializableError {
    fn from(err: &EpicenterError) -> Self {
        let path = match err {
            EpicenterError::FileRead { path, .. } => Some(path.clone()),
            EpicenterError::FileWrite { path, .. } => Some(path.clone()),
            EpicenterError::NoFrontmatter(path) => Some(path.clone()),
            EpicenterError::InvalidFrontmatter { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind: err.kind(),
            message: err.to_string(),
            path,
        }
    }
}

impl From<EpicenterError> for SerializableError {
    fn from(err: EpicenterError) -> Self {
        SerializableError::from(&err)
    }
}

/// Tagged result handed to the action layer.
///
/// Serializes as `{"status":"ok","value":...}` or
/// `{"status":"err","kind":...,"message":...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionResult<T> {
    Ok { value: T },
    Err { kind: ErrorKind, message: String },
}

impl<T> ActionResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ActionResult::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ActionResult::Ok { .. } => None,
            ActionResult::Err { kind, .. } => Some(*kind),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ActionResult::Ok { value } => Some(value),
            ActionResult::Err { .. } => None,
        }
    }
}

impl<T> From<Result<T>> for ActionResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => ActionResult::Ok { value },
            Err(e) => ActionResult::Err {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_result_ok_serializes_tagged() {
        let result: ActionResult<u32> = Ok(7).into();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok", "value": 7}));
    }

    #[test]
    fn test_action_result_err_carries_kind() {
        let result: ActionResult<u32> = Err(EpicenterError::RowNotFound {
            table: "posts".into(),
            row: "r1".into(),
        })
        .into();
        assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "err");
        assert_eq!(json["kind"], "not_found");
    }

    #[test]
    fn test_serializable_error_keeps_path() {
        let err = EpicenterError::NoFrontmatter(PathBuf::from("content/posts/a.md"));
        let serializable = err.to_serializable();
        assert_eq!(serializable.kind, ErrorKind::Parse);
        assert_eq!(serializable.path, Some(PathBuf::from("content/posts/a.md")));
    }
}
