// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reeldown::download::{
    Artifact, AssetStore, DownloadJob, DownloadNotice, DownloadOptions, DownloadService, DownloadedAsset, MediaItem,
    MediaSource, MetadataStore, ServiceSettings, SimulatedEngine, StartRequest, TemplateResolver,
};
use reeldown::StoreError;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

/// Metadata store that counts descriptor writes and can be made to fail them.
pub struct CountingStore {
    inner: MetadataStore,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// While set, every write fails as if the disk were full.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AssetStore for CountingStore {
    fn persist(&self, job: &DownloadJob, artifacts: &[Artifact]) -> Result<DownloadedAsset, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: self.inner.dir().join(format!("{}.json", job.id)),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.persist(job, artifacts)
    }

    fn list(&self) -> Result<Vec<DownloadedAsset>, StoreError> {
        self.inner.list()
    }

    fn get(&self, id: &str) -> Result<Option<DownloadedAsset>, StoreError> {
        self.inner.get(id)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
}

pub struct Harness {
    pub service: DownloadService,
    pub engine: Arc<SimulatedEngine>,
    pub store: Arc<CountingStore>,
    pub dir: TempDir,
}

pub async fn harness() -> Harness {
    harness_with(SimulatedEngine::new(), TempDir::new().expect("Failed to create temp dir")).await
}

/// Build a service over `dir`, which may already hold downloads.
pub async fn harness_with(engine: SimulatedEngine, dir: TempDir) -> Harness {
    let store = Arc::new(CountingStore {
        inner: MetadataStore::open(dir.path(), Duration::from_secs(5)).expect("Failed to open store"),
        writes: AtomicUsize::new(0),
        failing: AtomicBool::new(false),
    });
    let engine = Arc::new(engine);
    let resolver = Arc::new(TemplateResolver::new("http://media.local:8096").expect("valid base url"));
    let service = DownloadService::with_store(ServiceSettings::default(), engine.clone(), resolver, store.clone()).await;
    Harness {
        service,
        engine,
        store,
        dir,
    }
}

pub fn request(id: &str) -> StartRequest {
    StartRequest::new(
        MediaItem::new(id, format!("Title {}", id)),
        DownloadOptions {
            media_source: MediaSource::with_id(format!("{}-src", id)),
            ..DownloadOptions::default()
        },
    )
}

/// Wait until the active job set satisfies `check`.
pub async fn wait_for_jobs(service: &DownloadService, check: impl Fn(&[DownloadJob]) -> bool) {
    let mut rx = service.watch_jobs();
    tokio::time::timeout(WAIT, rx.wait_for(|jobs| check(jobs)))
        .await
        .expect("registry never reached expected state")
        .expect("registry stopped");
}

/// Wait for the first notice matching `pred`.
pub async fn wait_for_notice(
    notices: &mut broadcast::Receiver<DownloadNotice>,
    pred: impl Fn(&DownloadNotice) -> bool,
) -> DownloadNotice {
    tokio::time::timeout(WAIT, async {
        loop {
            match notices.recv().await {
                Ok(notice) if pred(&notice) => return notice,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notice channel closed"),
            }
        }
    })
    .await
    .expect("notice never arrived")
}

/// No id is both active and stored.
pub fn assert_exclusive(harness: &Harness) {
    for job in harness.service.snapshot() {
        assert!(
            harness.store.get(&job.id).expect("store readable").is_none(),
            "{} is both active and stored",
            job.id
        );
    }
}
