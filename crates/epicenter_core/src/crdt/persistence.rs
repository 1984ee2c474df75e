//! Background persistence of a live document.
//!
//! [`PersistenceHandle`] subscribes to a document's updates and saves the
//! full state through a [`PersistenceProvider`] once edits settle. A failed
//! save is logged; the next update schedules another attempt with the then
//! current state, so nothing is lost as long as the process keeps running.

use std::sync::Arc;
use std::time::Duration;

use yrs::Subscription;

use super::storage::PersistenceProvider;
use super::workspace_doc::WorkspaceDocument;
use crate::error::Result;
use crate::index::WriteBehind;

/// File name of the schema artifact.
pub const DEFINITION_FILE: &str = "definition.json";
/// File name of the settings artifact.
pub const KV_FILE: &str = "kv.json";

/// Save a document and, for data documents, refresh the JSON artifacts.
pub fn save_document(
    document: &WorkspaceDocument,
    provider: &dyn PersistenceProvider,
    artifacts: bool,
) -> Result<()> {
    provider.save(document.name(), &document.encode_state_as_update())?;
    if artifacts {
        let definition = serde_json::to_string_pretty(&document.definition())?;
        provider.write_artifact(DEFINITION_FILE, &definition)?;
        let kv = serde_json::to_string_pretty(&document.kv_values())?;
        provider.write_artifact(KV_FILE, &kv)?;
    }
    Ok(())
}

/// Keeps a document persisted while it is alive.
pub struct PersistenceHandle {
    document: WorkspaceDocument,
    provider: Arc<dyn PersistenceProvider>,
    artifacts: bool,
    writer: WriteBehind<()>,
    _subscription: Subscription,
}

impl PersistenceHandle {
    /// Start persisting `document`. Must be called inside a tokio runtime.
    ///
    /// With `artifacts` set, `definition.json` and `kv.json` are rewritten
    /// alongside every snapshot.
    pub fn attach(
        document: WorkspaceDocument,
        provider: Arc<dyn PersistenceProvider>,
        debounce: Duration,
        artifacts: bool,
    ) -> Result<Self> {
        let writer = {
            let document = document.clone();
            let provider = Arc::clone(&provider);
            WriteBehind::spawn(debounce, move |_: Vec<()>| {
                match save_document(&document, provider.as_ref(), artifacts) {
                    Ok(()) => log::debug!("Saved '{}'", document.name()),
                    Err(e) => log::warn!(
                        "Failed to save '{}', will retry on next update: {}",
                        document.name(),
                        e
                    ),
                }
            })
        };

        let tx = writer.sender();
        let subscription = document.observe_updates(move |_update, _remote| {
            let _ = tx.send(());
        })?;

        log::info!("Persisting '{}'", document.name());
        Ok(Self {
            document,
            provider,
            artifacts,
            writer,
            _subscription: subscription,
        })
    }

    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    /// Save immediately, bypassing the debounce.
    pub fn flush(&self) -> Result<()> {
        save_document(&self.document, self.provider.as_ref(), self.artifacts)
    }

    /// Stop observing, cancel any pending save and write one final snapshot.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            document,
            provider,
            artifacts,
            writer,
            _subscription,
        } = self;
        drop(_subscription);
        writer.shutdown().await;
        save_document(&document, provider.as_ref(), artifacts)?;
        log::info!("Stopped persisting '{}'", document.name());
        Ok(())
    }
}
