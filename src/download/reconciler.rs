// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle reconciliation.
//!
//! Foreground and background transitions are delivered as explicit signals
//! on the reconciler's queue and handled one at a time:
//!
//! - **Foreground**: the engine's active list is authoritative. Everything it
//!   lists is adopted, everything else the registry held before the pass
//!   started is dropped as abandoned, and the store is re-listed into the
//!   library since jobs may have completed while suspended.
//! - **Background**: the visible registry map is cleared. The engine keeps
//!   running; the next foreground pass rebuilds the map.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::engine::DownloadEngine;
use super::registry::JobRegistry;
use super::store::AssetStore;
use super::types::DownloadedAsset;
use crate::error::{DownloadError, StoreError};

/// Platform lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Foreground,
    Background,
}

impl fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleSignal::Foreground => f.write_str("foreground"),
            LifecycleSignal::Background => f.write_str("background"),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub signal: LifecycleSignal,
    /// Jobs in the registry after the pass
    pub adopted: usize,
    /// Ids dropped as abandoned
    pub dropped: Vec<String>,
    /// Jobs the engine listed as already finished
    pub finished: usize,
    /// Jobs removed by a background clear
    pub cleared: usize,
    /// Assets in the store after re-listing
    pub downloaded: usize,
    /// Set when the engine could not be queried; the registry is untouched
    pub engine_error: Option<String>,
}

impl ReconcileReport {
    fn new(signal: LifecycleSignal) -> Self {
        Self {
            signal,
            adopted: 0,
            dropped: Vec::new(),
            finished: 0,
            cleared: 0,
            downloaded: 0,
            engine_error: None,
        }
    }
}

struct ReconcileRequest {
    signal: LifecycleSignal,
    ack: Option<oneshot::Sender<ReconcileReport>>,
}

/// Handle to the reconciler task.
#[derive(Clone)]
pub struct Reconciler {
    tx: mpsc::Sender<ReconcileRequest>,
}

impl Reconciler {
    pub fn spawn(
        engine: Arc<dyn DownloadEngine>,
        registry: JobRegistry,
        store: Arc<dyn AssetStore>,
        library: watch::Sender<Vec<DownloadedAsset>>,
        buffer: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let task = ReconcileTask {
            engine,
            registry,
            store,
            library,
        };
        (Self { tx }, tokio::spawn(task.run(rx)))
    }

    /// Deliver `signal` and wait for the pass to finish.
    pub async fn signal(&self, signal: LifecycleSignal) -> Result<ReconcileReport, DownloadError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ReconcileRequest { signal, ack: Some(ack) })
            .await
            .map_err(|_| DownloadError::ServiceStopped)?;
        rx.await.map_err(|_| DownloadError::ServiceStopped)
    }

    /// Queue `signal` without waiting. Returns false if the queue is full or
    /// the reconciler has stopped.
    pub fn notify(&self, signal: LifecycleSignal) -> bool {
        self.tx.try_send(ReconcileRequest { signal, ack: None }).is_ok()
    }
}

struct ReconcileTask {
    engine: Arc<dyn DownloadEngine>,
    registry: JobRegistry,
    store: Arc<dyn AssetStore>,
    library: watch::Sender<Vec<DownloadedAsset>>,
}

impl ReconcileTask {
    async fn run(self, mut rx: mpsc::Receiver<ReconcileRequest>) {
        while let Some(request) = rx.recv().await {
            let report = match request.signal {
                LifecycleSignal::Foreground => self.foreground().await,
                LifecycleSignal::Background => self.background().await,
            };
            match report {
                Ok(report) => {
                    if let Some(ack) = request.ack {
                        let _ = ack.send(report);
                    }
                }
                Err(e) => {
                    tracing::debug!("RECONCILER_STOPPED | reason={}", e);
                    break;
                }
            }
        }
    }

    async fn background(&self) -> Result<ReconcileReport, DownloadError> {
        let mut report = ReconcileReport::new(LifecycleSignal::Background);
        report.cleared = self.registry.clear().await?;
        tracing::info!("LIFECYCLE_BACKGROUND | cleared={}", report.cleared);
        Ok(report)
    }

    async fn foreground(&self) -> Result<ReconcileReport, DownloadError> {
        let mut report = ReconcileReport::new(LifecycleSignal::Foreground);

        let mark = self.registry.mark().await?;
        match self.engine.list_active_jobs().await {
            Ok(jobs) => {
                let outcome = self.registry.reconcile(jobs, mark).await?;
                report.adopted = outcome.adopted;
                report.dropped = outcome.dropped;
                report.finished = outcome.finished;
            }
            Err(e) => {
                tracing::warn!("ENGINE_LIST_FAILED | error={:#}", e);
                report.engine_error = Some(format!("{:#}", e));
            }
        }

        report.downloaded = self.refresh_library().await;
        tracing::info!(
            "LIFECYCLE_FOREGROUND | adopted={} dropped={} downloaded={}",
            report.adopted,
            report.dropped.len(),
            report.downloaded
        );
        Ok(report)
    }

    /// Re-list the store into the library. Keeps the previous listing if the
    /// store cannot be read.
    async fn refresh_library(&self) -> usize {
        let store = Arc::clone(&self.store);
        let library = self.library.clone();
        match tokio::task::spawn_blocking(move || merge_listing(&*store, &library)).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                tracing::warn!("LIBRARY_REFRESH_FAILED | error={}", e);
                self.library.borrow().len()
            }
            Err(e) => {
                tracing::warn!("LIBRARY_REFRESH_FAILED | error=task aborted: {}", e);
                self.library.borrow().len()
            }
        }
    }
}

/// Replace the library with a fresh listing without losing assets persisted
/// while the listing ran.
///
/// Entries the listing missed were either written after the directory scan
/// or removed behind our back; their descriptors tell which. Entries pushed
/// after that check are newer than the scan and always kept.
fn merge_listing(store: &dyn AssetStore, library: &watch::Sender<Vec<DownloadedAsset>>) -> Result<usize, StoreError> {
    let listed = store.list()?;
    let listed_ids: HashSet<String> = listed.iter().map(|a| a.id.clone()).collect();

    let unlisted: Vec<String> = library
        .borrow()
        .iter()
        .filter(|a| !listed_ids.contains(&a.id))
        .map(|a| a.id.clone())
        .collect();
    let gone: HashSet<String> = unlisted
        .into_iter()
        .filter(|id| !matches!(store.get(id), Ok(Some(_))))
        .collect();

    let mut count = 0;
    library.send_modify(|assets| {
        let mut merged = listed;
        merged.extend(
            assets
                .drain(..)
                .filter(|a| !listed_ids.contains(&a.id) && !gone.contains(&a.id)),
        );
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        count = merged.len();
        *assets = merged;
    });
    Ok(count)
}
