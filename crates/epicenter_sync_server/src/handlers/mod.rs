pub mod ws;

pub use ws::ws_handler;

use crate::sync::SyncState;
use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Build the HTTP router: health checks and the sync WebSocket endpoint.
///
/// An empty `cors_origins` allows any origin.
pub fn router(state: Arc<SyncState>, cors_origins: &[String]) -> Router {
    let cors = CorsLayer::new().allow_methods([Method::GET, Method::OPTIONS]);
    let cors = if cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin {:?}", origin);
                    None
                }
            })
            .collect();
        cors.allow_origin(origins)
    };

    Router::new()
        // Health check
        .route("/", get(|| async { "Epicenter Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync/{doc}", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
