//! Materialized views of a workspace document.
//!
//! Both indexes are derived state: they observe the document through the
//! table helpers and catch up after a debounce on a background task. Neither
//! is ever written to directly by callers. The markdown index is the one
//! exception in direction, feeding edited files back through the helpers.

mod markdown;
mod observers;
mod sqlite;
mod write_behind;

pub use markdown::{DELETED_SUFFIX, FileOutcome, MarkdownIndex, MarkdownParseError};
pub use sqlite::{CATALOG_TABLE, QueryRow, SqliteIndex};
pub use write_behind::WriteBehind;
