// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download service: the public face of the download subsystem.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::bridge::EventBridge;
use super::engine::DownloadEngine;
use super::reconciler::{LifecycleSignal, ReconcileReport, Reconciler};
use super::registry::{JobRegistry, Snapshot};
use super::resolver::{is_segmented_manifest, ResolveRequest, StreamResolver};
use super::store::{AssetStore, MetadataStore};
use super::types::{
    is_valid_job_id, Artifact, DownloadJob, DownloadMetadata, DownloadNotice, DownloadedAsset, EngineFailure,
    StartRequest,
};
use crate::config::Config;
use crate::error::{DownloadError, ResolveError, StoreError};

/// Channel sizes for the service's queues.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub command_buffer: usize,
    pub notice_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            command_buffer: 256,
            notice_buffer: 256,
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            command_buffer: config.command_buffer,
            notice_buffer: config.event_buffer,
        }
    }
}

/// Orchestrates downloads against an engine, a resolver and a store.
///
/// All tasks are owned by the service and stopped by [`DownloadService::shutdown`].
pub struct DownloadService {
    engine: Arc<dyn DownloadEngine>,
    resolver: Arc<dyn StreamResolver>,
    store: Arc<dyn AssetStore>,
    registry: JobRegistry,
    reconciler: Reconciler,
    notices: broadcast::Sender<DownloadNotice>,
    library: watch::Sender<Vec<DownloadedAsset>>,
    bridge: EventBridge,
    registry_task: JoinHandle<()>,
    reconciler_task: JoinHandle<()>,
}

impl DownloadService {
    /// Start the service with a metadata store in the configured downloads
    /// directory.
    pub async fn start(
        config: &Config,
        engine: Arc<dyn DownloadEngine>,
        resolver: Arc<dyn StreamResolver>,
    ) -> anyhow::Result<Self> {
        let dir = config.downloads_dir()?;
        let store = MetadataStore::open(&dir, config.lock_timeout())?;
        Ok(Self::with_store(ServiceSettings::from(config), engine, resolver, Arc::new(store)).await)
    }

    /// Start the service over any store.
    pub async fn with_store(
        settings: ServiceSettings,
        engine: Arc<dyn DownloadEngine>,
        resolver: Arc<dyn StreamResolver>,
        store: Arc<dyn AssetStore>,
    ) -> Self {
        let (notices, _) = broadcast::channel(settings.notice_buffer.max(1));
        let (library, _) = watch::channel(Vec::new());

        let (registry, registry_task) = JobRegistry::spawn(
            Arc::clone(&store),
            notices.clone(),
            library.clone(),
            settings.command_buffer,
        );
        let (reconciler, reconciler_task) = Reconciler::spawn(
            Arc::clone(&engine),
            registry.clone(),
            Arc::clone(&store),
            library.clone(),
            settings.command_buffer,
        );
        let bridge = EventBridge::spawn(engine.subscribe(), registry.clone(), Some(reconciler.clone()));

        let service = Self {
            engine,
            resolver,
            store,
            registry,
            reconciler,
            notices,
            library,
            bridge,
            registry_task,
            reconciler_task,
        };
        service.load_library().await;
        tracing::info!("DOWNLOAD_SERVICE_STARTED | downloaded={}", service.library.borrow().len());
        service
    }

    async fn load_library(&self) {
        match self.blocking(|store| store.list()).await {
            Ok(assets) => {
                self.library.send_replace(assets);
            }
            Err(e) => tracing::warn!("LIBRARY_LOAD_FAILED | error={}", e),
        }
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AssetStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::io(".", std::io::Error::other(e.to_string())))?
    }

    /// Start downloading an item. Returns once the engine has accepted the
    /// job; progress and the outcome arrive as registry updates and notices.
    pub async fn start_job(&self, request: StartRequest) -> Result<(), DownloadError> {
        let id = request
            .item
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DownloadError::Validation("item id is required".to_string()))?;
        if request.item.name.as_deref().map_or(true, str::is_empty) {
            return Err(DownloadError::Validation(format!("item {} has no name", id)));
        }
        if !is_valid_job_id(&id) {
            return Err(DownloadError::Validation(format!("{:?} is not a usable id", id)));
        }

        self.registry.reserve(&id).await?;
        let result = self.launch(&id, request).await;
        if result.is_err() {
            self.registry.release(&id).await;
        }
        result
    }

    async fn launch(&self, id: &str, request: StartRequest) -> Result<(), DownloadError> {
        let lookup = id.to_string();
        let existing = self
            .blocking(move |store| store.get(&lookup))
            .await
            .map_err(|source| DownloadError::Persistence {
                id: id.to_string(),
                source,
            })?;
        if existing.is_some() {
            return Err(DownloadError::Validation(format!("{} is already downloaded", id)));
        }

        let StartRequest { item, options, preview } = request;
        let stream = self
            .resolver
            .resolve(ResolveRequest {
                item: &item,
                media_source: &options.media_source,
                audio_stream_index: options.audio_stream_index,
                subtitle_stream_index: options.subtitle_stream_index,
                max_bitrate: options.max_bitrate,
            })
            .await
            .map_err(|source| DownloadError::Resolution {
                id: id.to_string(),
                source,
            })?;

        let resolution = |source: ResolveError| DownloadError::Resolution {
            id: id.to_string(),
            source,
        };
        let url = stream.url.ok_or_else(|| resolution(ResolveError::MissingUrl))?;
        let media_source = stream
            .media_source
            .ok_or_else(|| resolution(ResolveError::MissingMediaSource))?;

        if !is_segmented_manifest(&url) {
            return Err(DownloadError::UnsupportedFormat {
                id: id.to_string(),
                url,
            });
        }

        let metadata = DownloadMetadata {
            item,
            media_source,
            options,
        };
        let artifacts: Vec<Artifact> = preview.map(Artifact::preview).into_iter().collect();
        self.registry
            .insert(DownloadJob::queued(id, metadata.clone()), artifacts)
            .await?;

        if let Err(e) = self.engine.start_job(id, &url, &metadata).await {
            tracing::error!("ENGINE_HANDOFF_FAILED | id={} error={:#}", id, e);
            self.registry.fail(id, EngineFailure::Failed).await?;
            return Err(DownloadError::Engine {
                id: id.to_string(),
                reason: EngineFailure::Failed,
            });
        }

        tracing::info!("DOWNLOAD_STARTED | id={} url={}", id, url);
        Ok(())
    }

    /// Ask the engine to cancel `id`. Unknown or finished ids are a no-op.
    /// The cancellation itself arrives later as a notice.
    pub async fn cancel_job(&self, id: &str) -> Result<(), DownloadError> {
        if !self.registry.is_tracked(id).await? {
            tracing::debug!("CANCEL_IGNORED | id={} reason=untracked", id);
            return Ok(());
        }
        if let Err(e) = self.engine.cancel_job(id).await {
            // The job keeps running; the user can retry.
            tracing::warn!("CANCEL_FAILED | id={} error={:#}", id, e);
        }
        Ok(())
    }

    /// Active jobs, ordered by start time.
    pub fn snapshot(&self) -> Vec<DownloadJob> {
        self.registry.snapshot()
    }

    pub fn job(&self, id: &str) -> Option<DownloadJob> {
        self.registry.get(id)
    }

    /// Watch the active job set.
    pub fn watch_jobs(&self) -> watch::Receiver<Snapshot> {
        self.registry.watch()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<DownloadNotice> {
        self.notices.subscribe()
    }

    /// Watch the list of finished downloads.
    pub fn library(&self) -> watch::Receiver<Vec<DownloadedAsset>> {
        self.library.subscribe()
    }

    /// Finished downloads, read from the store.
    pub async fn downloaded(&self) -> Result<Vec<DownloadedAsset>, DownloadError> {
        self.blocking(|store| store.list())
            .await
            .map_err(|source| DownloadError::Persistence {
                id: "*".to_string(),
                source,
            })
    }

    pub async fn get_downloaded(&self, id: &str) -> Result<Option<DownloadedAsset>, DownloadError> {
        let lookup = id.to_string();
        self.blocking(move |store| store.get(&lookup))
            .await
            .map_err(|source| DownloadError::Persistence {
                id: id.to_string(),
                source,
            })
    }

    /// Delete a finished download. Returns false if it was not stored.
    pub async fn delete_downloaded(&self, id: &str) -> Result<bool, DownloadError> {
        let target = id.to_string();
        let removed = self
            .blocking(move |store| store.delete(&target))
            .await
            .map_err(|source| DownloadError::Persistence {
                id: id.to_string(),
                source,
            })?;
        self.library.send_modify(|assets| assets.retain(|a| a.id != id));
        Ok(removed)
    }

    /// The process came to the foreground.
    pub async fn on_foreground(&self) -> Result<ReconcileReport, DownloadError> {
        self.reconciler.signal(LifecycleSignal::Foreground).await
    }

    /// The process went to the background.
    pub async fn on_background(&self) -> Result<ReconcileReport, DownloadError> {
        self.reconciler.signal(LifecycleSignal::Background).await
    }

    /// Stop all tasks. Terminal events still queued for the registry are
    /// applied first; persistence already dispatched runs to completion.
    pub async fn shutdown(self) {
        let Self {
            registry,
            bridge,
            registry_task,
            reconciler_task,
            ..
        } = self;

        bridge.unsubscribe();
        reconciler_task.abort();
        registry.shutdown().await;
        if let Err(e) = registry_task.await {
            tracing::warn!("REGISTRY_JOIN_FAILED | error={}", e);
        }
        tracing::info!("DOWNLOAD_SERVICE_STOPPED");
    }
}
