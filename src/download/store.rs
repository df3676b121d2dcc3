// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable store of completed downloads.
//!
//! One directory holds, per completed job, a JSON descriptor named
//! `<id>.json` plus any sibling files named `<id>.<ext>` (thumbnails) and the
//! asset data itself at `<id>`. The descriptor is written last: its presence
//! is what makes a download count as finished, so a crash before it lands
//! leaves the job absent from [`AssetStore::list`].
//!
//! Writers take an exclusive advisory lock on `<dir>/.lock`, readers a shared
//! one, so two processes sharing a downloads directory do not interleave.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{
    is_valid_job_id, Artifact, DownloadJob, DownloadMetadata, DownloadOptions, DownloadedAsset, MediaItem,
    MediaSource,
};
use crate::error::StoreError;

/// Default timeout for acquiring the directory lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const DESCRIPTOR_EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";
const DESCRIPTOR_VERSION: u32 = 1;

/// Storage for completed downloads.
///
/// Implementations are synchronous; async callers dispatch them onto the
/// blocking pool.
pub trait AssetStore: Send + Sync {
    /// Write `artifacts`, then the descriptor for `job`.
    fn persist(&self, job: &DownloadJob, artifacts: &[Artifact]) -> Result<DownloadedAsset, StoreError>;

    /// Every well-formed descriptor, sorted by id.
    fn list(&self) -> Result<Vec<DownloadedAsset>, StoreError>;

    /// The descriptor for `id`, or `None` if there is none.
    fn get(&self, id: &str) -> Result<Option<DownloadedAsset>, StoreError>;

    /// Remove the descriptor and every sibling file. Returns whether a
    /// descriptor existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// On-disk descriptor format.
#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    #[serde(default = "default_version")]
    version: u32,
    id: String,
    item: MediaItem,
    media_source: MediaSource,
    #[serde(default)]
    options: DownloadOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    DESCRIPTOR_VERSION
}

/// Result of a directory scan.
#[derive(Debug, Default)]
pub struct Listing {
    pub assets: Vec<DownloadedAsset>,
    /// Descriptor files that were skipped as unreadable or invalid
    pub skipped: Vec<PathBuf>,
}

/// File-backed [`AssetStore`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl MetadataStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, lock_timeout })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn descriptor_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, DESCRIPTOR_EXTENSION))
    }

    fn asset_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn open_lock_file(&self) -> Result<File, StoreError> {
        let path = self.lock_path();
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(path, e))
    }

    /// Acquire an exclusive lock with timeout. The lock is held until the
    /// returned file is dropped.
    fn acquire_exclusive_lock(&self) -> Result<File, StoreError> {
        let file = self.open_lock_file()?;
        self.wait_for_lock(|| FileExt::try_lock_exclusive(&file))?;
        Ok(file)
    }

    /// Acquire a shared lock with timeout.
    fn acquire_shared_lock(&self) -> Result<File, StoreError> {
        let file = self.open_lock_file()?;
        self.wait_for_lock(|| FileExt::try_lock_shared(&file))?;
        Ok(file)
    }

    fn wait_for_lock(&self, mut try_lock: impl FnMut() -> std::io::Result<()>) -> Result<(), StoreError> {
        let start = Instant::now();
        loop {
            match try_lock() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock || is_lock_contended(&e) => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            path: self.lock_path(),
                            timeout_ms: self.lock_timeout.as_millis(),
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(StoreError::io(self.lock_path(), e)),
            }
        }
    }

    /// Write `bytes` to `path` through a temp file and an atomic rename.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.dir.join(format!(".{}.tmp", file_name));

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(|e| StoreError::io(&temp_path, e))?;
            temp_file
                .write_all(bytes)
                .map_err(|e| StoreError::io(&temp_path, e))?;
            temp_file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
        }

        fs::rename(&temp_path, path).map_err(|e| StoreError::io(path, e))
    }

    fn check_id(&self, id: &str) -> Result<(), StoreError> {
        if is_valid_job_id(id) {
            Ok(())
        } else {
            Err(StoreError::Invalid {
                path: self.dir.join(id),
                reason: "id is not usable as a file name".to_string(),
            })
        }
    }

    fn read_descriptor(&self, path: &Path) -> Result<DownloadedAsset, StoreError> {
        let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        let descriptor: Descriptor = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let invalid = |reason: &str| StoreError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if descriptor.id != stem {
            return Err(invalid("descriptor id does not match its file name"));
        }
        if descriptor.item.id.as_deref() != Some(descriptor.id.as_str()) {
            return Err(invalid("item id is missing or does not match"));
        }

        Ok(DownloadedAsset {
            path: self.asset_path(&descriptor.id),
            id: descriptor.id,
            metadata: DownloadMetadata {
                item: descriptor.item,
                media_source: descriptor.media_source,
                options: descriptor.options,
            },
        })
    }

    /// Scan the directory, keeping track of skipped descriptors.
    pub fn list_with_report(&self) -> Result<Listing, StoreError> {
        let mut listing = Listing::default();
        if !self.dir.exists() {
            return Ok(listing);
        }

        let _lock = self.acquire_shared_lock()?;
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_descriptor_file(&path) || !path.is_file() {
                continue;
            }
            match self.read_descriptor(&path) {
                Ok(asset) => listing.assets.push(asset),
                Err(e) => {
                    tracing::debug!("DESCRIPTOR_SKIPPED | path={} error={}", path.display(), e);
                    listing.skipped.push(path);
                }
            }
        }

        if !listing.skipped.is_empty() {
            let names: Vec<String> = listing
                .skipped
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            tracing::warn!(
                "DESCRIPTORS_SKIPPED | dir={} count={} files={}",
                self.dir.display(),
                names.len(),
                names.join(",")
            );
        }

        listing.assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listing)
    }
}

impl AssetStore for MetadataStore {
    fn persist(&self, job: &DownloadJob, artifacts: &[Artifact]) -> Result<DownloadedAsset, StoreError> {
        self.check_id(&job.id)?;

        let descriptor = Descriptor {
            version: DESCRIPTOR_VERSION,
            id: job.id.clone(),
            item: job.metadata.item.clone(),
            media_source: job.metadata.media_source.clone(),
            options: job.metadata.options.clone(),
            completed_at: Some(Utc::now()),
        };
        let content = serde_json::to_vec_pretty(&descriptor)?;

        if let Some(bad) = artifacts.iter().find(|a| !is_artifact_extension(&a.extension)) {
            return Err(StoreError::Invalid {
                path: self.dir.join(format!("{}.{}", job.id, bad.extension)),
                reason: "artifact extension must be alphanumeric and not the descriptor's".to_string(),
            });
        }

        let _lock = self.acquire_exclusive_lock()?;

        // Artifacts first; the descriptor marks the download as complete.
        for artifact in artifacts {
            let path = self.dir.join(format!("{}.{}", job.id, artifact.extension));
            self.write_atomic(&path, &artifact.bytes)?;
        }
        self.write_atomic(&self.descriptor_path(&job.id), &content)?;

        tracing::info!(
            "DESCRIPTOR_WRITTEN | id={} artifacts={}",
            job.id,
            artifacts.len()
        );

        Ok(DownloadedAsset {
            id: job.id.clone(),
            path: self.asset_path(&job.id),
            metadata: job.metadata.clone(),
        })
    }

    fn list(&self) -> Result<Vec<DownloadedAsset>, StoreError> {
        Ok(self.list_with_report()?.assets)
    }

    fn get(&self, id: &str) -> Result<Option<DownloadedAsset>, StoreError> {
        if !is_valid_job_id(id) {
            return Ok(None);
        }
        let path = self.descriptor_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let _lock = self.acquire_shared_lock()?;
        match self.read_descriptor(&path) {
            Ok(asset) => Ok(Some(asset)),
            Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(e @ (StoreError::Parse { .. } | StoreError::Invalid { .. })) => {
                tracing::warn!("DESCRIPTOR_INVALID | id={} error={}", id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.check_id(id)?;
        let _lock = self.acquire_exclusive_lock()?;

        // Descriptor goes first so a partial delete reads as "not downloaded".
        let descriptor = self.descriptor_path(id);
        let existed = match fs::remove_file(&descriptor) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(descriptor, e)),
        };

        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !is_sibling_of(&name.to_string_lossy(), id) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }

        if existed {
            tracing::info!("DOWNLOAD_DELETED | id={}", id);
        }
        Ok(existed)
    }
}

fn is_artifact_extension(ext: &str) -> bool {
    !ext.is_empty() && ext != DESCRIPTOR_EXTENSION && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `<id>` itself or `<id>.<ext>` with a single extension.
fn is_sibling_of(name: &str, id: &str) -> bool {
    match name.strip_prefix(id) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|ext| !ext.is_empty() && !ext.contains('.')),
        None => false,
    }
}

fn is_descriptor_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().map(|e| e == DESCRIPTOR_EXTENSION).unwrap_or(false)
}

/// Some platforms report a held lock as a raw OS error instead of
/// `WouldBlock`.
fn is_lock_contended(e: &std::io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
