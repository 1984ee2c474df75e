//! Local-first workspace data on a CRDT document.
//!
//! A workspace is one yrs document holding tables, rows and settings. Table
//! and KV helpers validate every write against the schema stored in the same
//! document. Two projections follow the document in the background: a
//! read-only SQLite database and a tree of markdown files that can also be
//! edited by hand. Peers converge through a WebSocket relay.
//!
//! ```no_run
//! use std::sync::Arc;
//! use epicenter_core::crdt::{MemoryStorage, Row, TableDefinition, cells};
//! use epicenter_core::field::{Field, Value};
//! use epicenter_core::workspace::Workspace;
//!
//! # fn main() -> epicenter_core::error::Result<()> {
//! let workspace = Workspace::open("blog", Arc::new(MemoryStorage::new()), "laptop");
//! let posts = workspace
//!     .tables()
//!     .define("posts", &TableDefinition::new("Posts").field("title", Field::text()))?;
//! posts.upsert(Row::new(cells([("title", Value::text("Hello"))])))?;
//! # Ok(())
//! # }
//! ```

/// Workspace configuration (`epicenter.toml`)
pub mod config;

/// CRDT document model, epochs and persistence
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Field definitions and cell values
pub mod field;

/// Frontmatter parsing and serialization
pub mod frontmatter;

/// Icon codec
pub mod icon;

/// SQLite and markdown projections
pub mod index;

/// Sync wire protocol, awareness and client
pub mod sync;

/// Workspace lifecycle and registry
pub mod workspace;

pub use error::{ActionResult, EpicenterError, ErrorKind, Result};
pub use field::{Field, FieldKind, Value};
pub use icon::Icon;
pub use workspace::{Workspace, WorkspaceRegistry};
