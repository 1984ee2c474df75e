//! Epicenter Sync Server
//!
//! A WebSocket relay that lets independent processes converge on the same
//! workspace document.
//!
//! ## Features
//!
//! - **Rooms**: one server replica per document name, loaded on first join
//!   and saved after edits settle
//! - **Relay**: step1/step2 handshake on connect, updates rebroadcast to
//!   every other connection of the room
//! - **Presence**: awareness states forwarded between peers and withdrawn
//!   when a connection closes
//!
//! ## Endpoints
//!
//! - `GET /`, `GET /health`: liveness
//! - `GET /sync/{doc}`: WebSocket sync for document `doc`
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATA_DIR`: Directory holding document snapshots (default: ./data)
//! - `STORAGE_BACKEND`: `fs` or `sqlite` (default: fs)
//! - `SAVE_DEBOUNCE_MS`: Quiet period before a room is saved (default: 50)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `RUST_LOG`: Log filter (default: `epicenter_sync_server=debug,epicenter_core=info,tower_http=debug`)

pub mod config;
pub mod handlers;
pub mod sync;

pub use config::Config;
