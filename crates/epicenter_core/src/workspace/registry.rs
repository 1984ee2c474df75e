//! Open workspaces and the services attached to them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use yrs::Subscription;

use super::Workspace;
use crate::config::WorkspaceConfig;
use crate::crdt::{FilesystemStorage, PersistenceHandle, PersistenceProvider, WorkspaceSnapshot};
#[cfg(feature = "native-sync")]
use crate::crdt::WorkspaceDocument;
use crate::error::{EpicenterError, Result};
use crate::index::{MarkdownIndex, SqliteIndex};
#[cfg(feature = "native-sync")]
use crate::sync::SyncClient;

/// Background services of one workspace, started in this field order and
/// stopped in reverse.
struct Services {
    persistence: PersistenceHandle,
    sqlite: Option<SqliteIndex>,
    markdown: Option<MarkdownIndex>,
    #[cfg(feature = "native-sync")]
    sync: Option<SyncClient>,
}

impl Services {
    async fn start(workspace: &Workspace, config: &WorkspaceConfig) -> Result<Self> {
        let document = workspace.document();
        let persistence = PersistenceHandle::attach(
            document.clone(),
            Arc::clone(workspace.provider()),
            config.persistence.debounce(),
            config.persistence.artifacts,
        )?;

        let sqlite = if config.sqlite.enabled {
            Some(SqliteIndex::open(
                document,
                &config.sqlite_path(),
                config.sqlite.debounce(),
            )?)
        } else {
            None
        };

        let markdown = if config.markdown.enabled {
            Some(MarkdownIndex::start(
                document,
                config.content_dir(),
                &config.markdown,
            )?)
        } else {
            None
        };

        #[cfg(feature = "native-sync")]
        let sync = connect_sync(config, document).await;

        Ok(Self {
            persistence,
            sqlite,
            markdown,
            #[cfg(feature = "native-sync")]
            sync,
        })
    }

    async fn stop(self) -> Result<()> {
        #[cfg(feature = "native-sync")]
        if let Some(sync) = self.sync {
            sync.close().await;
        }
        if let Some(markdown) = self.markdown {
            markdown.shutdown().await;
        }
        if let Some(sqlite) = self.sqlite {
            sqlite.shutdown().await;
        }
        self.persistence.shutdown().await
    }
}

/// Sync is best effort; the workspace stays usable offline.
#[cfg(feature = "native-sync")]
async fn connect_sync(config: &WorkspaceConfig, document: &WorkspaceDocument) -> Option<SyncClient> {
    let server = config.sync.server_url.as_deref()?;
    match SyncClient::connect(server, document.clone()).await {
        Ok(client) => Some(client),
        Err(e) => {
            log::warn!(
                "Working offline on '{}', could not reach {}: {}",
                document.name(),
                server,
                e
            );
            None
        }
    }
}

/// The epoch head of an open workspace. Unlike [`Services`] it stays up
/// across epoch changes: it is saved, synced with the server and watched
/// for epochs published by other peers for as long as the workspace is open.
struct HeadLink {
    persistence: PersistenceHandle,
    epochs: watch::Receiver<u64>,
    subscription: Subscription,
    #[cfg(feature = "native-sync")]
    sync: Option<SyncClient>,
}

impl HeadLink {
    async fn start(workspace: &Workspace, config: &WorkspaceConfig) -> Result<Self> {
        let head = workspace.head();
        let persistence = PersistenceHandle::attach(
            head.document().clone(),
            Arc::clone(workspace.provider()),
            config.persistence.debounce(),
            false,
        )?;

        let (tx, epochs) = watch::channel(head.current());
        let id = workspace.id().to_string();
        let subscription = head.observe(move |epoch| {
            let advanced = tx.send_if_modified(|seen| {
                let newer = epoch > *seen;
                if newer {
                    *seen = epoch;
                }
                newer
            });
            if advanced {
                log::info!("Epoch {} of '{}' published", epoch, id);
            }
        });

        #[cfg(feature = "native-sync")]
        let sync = connect_sync(config, head.document()).await;

        Ok(Self {
            persistence,
            epochs,
            subscription,
            #[cfg(feature = "native-sync")]
            sync,
        })
    }

    async fn stop(self) -> Result<()> {
        #[cfg(feature = "native-sync")]
        if let Some(sync) = self.sync {
            sync.close().await;
        }
        drop(self.subscription);
        self.persistence.shutdown().await
    }
}

/// A workspace opened through a [`WorkspaceRegistry`].
pub struct OpenWorkspace {
    workspace: Workspace,
    config: WorkspaceConfig,
    head: Option<HeadLink>,
    services: Option<Services>,
}

impl OpenWorkspace {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn sqlite(&self) -> Option<&SqliteIndex> {
        self.services.as_ref()?.sqlite.as_ref()
    }

    pub fn markdown(&self) -> Option<&MarkdownIndex> {
        self.services.as_ref()?.markdown.as_ref()
    }

    /// Sync client of the current epoch's data document.
    #[cfg(feature = "native-sync")]
    pub fn sync(&self) -> Option<&SyncClient> {
        self.services.as_ref()?.sync.as_ref()
    }

    /// Sync client of the epoch head.
    #[cfg(feature = "native-sync")]
    pub fn head_sync(&self) -> Option<&SyncClient> {
        self.head.as_ref()?.sync.as_ref()
    }

    /// Effective epoch as seen by this process. Changes when any peer
    /// publishes a newer epoch; follow it with
    /// [`WorkspaceRegistry::follow_epoch`].
    pub fn epoch_changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.head.as_ref()?.epochs.clone())
    }

    /// True when a newer epoch than the loaded one has been published.
    pub fn is_stale(&self) -> bool {
        self.workspace.is_stale()
    }

    async fn stop_services(&mut self) -> Result<()> {
        match self.services.take() {
            Some(services) => services.stop().await,
            None => Ok(()),
        }
    }

    async fn stop_all(&mut self) -> Result<()> {
        let services = self.stop_services().await;
        let head = match self.head.take() {
            Some(head) => head.stop().await,
            None => Ok(()),
        };
        services.and(head)
    }
}

/// Every workspace this process has open.
///
/// The registry is an ordinary value: create one at startup, pass it to
/// whatever needs workspaces and call [`close_all`](Self::close_all) before
/// exiting so that pending saves are written and watchers stop.
#[derive(Default)]
pub struct WorkspaceRegistry {
    open: BTreeMap<String, OpenWorkspace>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the workspace described by `config`, or return it if it is
    /// already open. Snapshots are stored under `config.root`.
    pub async fn open(&mut self, config: WorkspaceConfig) -> Result<&OpenWorkspace> {
        let provider: Arc<dyn PersistenceProvider> = Arc::new(FilesystemStorage::new(&config.root));
        self.open_with(config, provider).await
    }

    /// Like [`open`](Self::open) with a caller-chosen storage backend.
    pub async fn open_with(
        &mut self,
        config: WorkspaceConfig,
        provider: Arc<dyn PersistenceProvider>,
    ) -> Result<&OpenWorkspace> {
        let id = config.workspace_id.clone();
        if !self.open.contains_key(&id) {
            let workspace = Workspace::open(&id, provider, config.resolve_peer_id());
            let head = HeadLink::start(&workspace, &config).await?;
            let services = match Services::start(&workspace, &config).await {
                Ok(services) => services,
                Err(e) => {
                    // Best effort; the start error is the one worth returning.
                    let _ = head.stop().await;
                    return Err(e);
                }
            };
            self.open.insert(
                id.clone(),
                OpenWorkspace {
                    workspace,
                    config,
                    head: Some(head),
                    services: Some(services),
                },
            );
        }
        self.get(&id)
            .ok_or_else(|| EpicenterError::Persistence(format!("workspace '{}' did not open", id)))
    }

    pub fn get(&self, id: &str) -> Option<&OpenWorkspace> {
        self.open.get(id)
    }

    /// Identifiers of open workspaces, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }

    /// Stop a workspace's services and drop it. Closing an unknown id is a
    /// no-op.
    pub async fn close(&mut self, id: &str) -> Result<()> {
        let Some(mut open) = self.open.remove(id) else {
            return Ok(());
        };
        open.stop_all().await?;
        log::info!("Closed workspace '{}'", id);
        Ok(())
    }

    /// Close every workspace. All are closed even if one fails; the first
    /// error is returned.
    pub async fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.close(&id).await {
                log::warn!("Failed to close workspace '{}': {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Migrate an open workspace to its next epoch.
    ///
    /// Services are stopped while the new epoch is built and restarted on
    /// whichever epoch is current afterwards, so on failure the workspace
    /// keeps running on the old epoch.
    pub async fn migrate<F>(&mut self, id: &str, transform: F) -> Result<u64>
    where
        F: FnOnce(WorkspaceSnapshot) -> Result<WorkspaceSnapshot>,
    {
        let open = self
            .open
            .get_mut(id)
            .ok_or_else(|| EpicenterError::Persistence(format!("workspace '{}' is not open", id)))?;
        open.stop_services().await?;
        let result = open.workspace.migrate(transform);
        open.services = Some(Services::start(&open.workspace, &open.config).await?);
        result
    }

    /// Move an open workspace onto the effective epoch if a peer has
    /// published a newer one. Services on the old epoch are stopped first,
    /// so nothing more is written to it. Returns the epoch moved to.
    pub async fn follow_epoch(&mut self, id: &str) -> Result<Option<u64>> {
        let open = self
            .open
            .get_mut(id)
            .ok_or_else(|| EpicenterError::Persistence(format!("workspace '{}' is not open", id)))?;
        if !open.is_stale() {
            return Ok(None);
        }
        open.stop_services().await?;
        let moved = open.workspace.follow_head();
        open.services = Some(Services::start(&open.workspace, &open.config).await?);
        Ok(moved)
    }

    /// [`follow_epoch`](Self::follow_epoch) for every open workspace.
    /// Returns the workspaces that moved with their new epochs.
    pub async fn follow_epochs(&mut self) -> Result<Vec<(String, u64)>> {
        let mut moved = Vec::new();
        for id in self.ids() {
            if let Some(epoch) = self.follow_epoch(&id).await? {
                moved.push((id, epoch));
            }
        }
        Ok(moved)
    }
}
