// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the registry, the event bridge and the store.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Handed to the engine, no progress reported yet
    Queued,
    /// Engine is transferring data
    Downloading,
    /// Successfully completed
    Done,
    /// Failed in the engine
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobState {
    /// Returns true for the absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Source media item. Only `id` and `name` are interpreted; everything else
/// is carried through to the stored descriptor untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            extra: Map::new(),
        }
    }
}

/// Media source selected for the download.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Server-relative transcoding URL, when the server transcodes this source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcoding_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaSource {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Options chosen by the user when starting a download.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadOptions {
    pub media_source: MediaSource,
    #[serde(default)]
    pub audio_stream_index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_stream_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,
}

/// Descriptor carried by a job and persisted with the finished asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadMetadata {
    pub item: MediaItem,
    pub media_source: MediaSource,
    #[serde(default)]
    pub options: DownloadOptions,
}

/// A sibling file written next to the descriptor (e.g. a thumbnail).
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// File extension, without the leading dot
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn preview(bytes: Vec<u8>) -> Self {
        Self {
            extension: "jpg".to_string(),
            bytes,
        }
    }
}

/// Request to start a download.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub item: MediaItem,
    pub options: DownloadOptions,
    /// Thumbnail to persist with the asset once it completes
    pub preview: Option<Vec<u8>>,
}

impl StartRequest {
    pub fn new(item: MediaItem, options: DownloadOptions) -> Self {
        Self {
            item,
            options,
            preview: None,
        }
    }

    pub fn with_preview(mut self, bytes: Vec<u8>) -> Self {
        self.preview = Some(bytes);
        self
    }
}

/// An in-flight download, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadJob {
    /// Same as the source item's id
    pub id: String,
    pub state: JobState,
    /// Fraction in [0, 1]
    pub progress: f64,
    pub seconds_downloaded: u64,
    pub seconds_total: u64,
    pub metadata: DownloadMetadata,
    pub start_time: DateTime<Utc>,
}

impl DownloadJob {
    /// Create a queued job.
    pub fn queued(id: impl Into<String>, metadata: DownloadMetadata) -> Self {
        Self {
            id: id.into(),
            state: JobState::Queued,
            progress: 0.0,
            seconds_downloaded: 0,
            seconds_total: 0,
            metadata,
            start_time: Utc::now(),
        }
    }

    /// Apply a progress report. Queued jobs move to downloading.
    pub fn record_progress(&mut self, progress: f64, seconds_downloaded: u64, seconds_total: u64) {
        self.progress = clamp_progress(progress);
        self.seconds_downloaded = seconds_downloaded;
        self.seconds_total = seconds_total;
        if self.state == JobState::Queued {
            self.state = JobState::Downloading;
        }
    }

    /// Progress as a whole percentage.
    pub fn percent(&self) -> u8 {
        (self.progress * 100.0).round() as u8
    }
}

/// Engine view of an active job, as returned by `list_active_jobs`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineJob {
    pub id: String,
    pub state: JobState,
    pub progress: f64,
    pub seconds_downloaded: u64,
    pub seconds_total: u64,
    pub metadata: DownloadMetadata,
    pub start_time: DateTime<Utc>,
}

impl EngineJob {
    /// Convert into a registry job. Jobs that already report progress are
    /// adopted as downloading even if the engine still says queued.
    pub fn into_job(self) -> DownloadJob {
        let progress = clamp_progress(self.progress);
        let state = match self.state {
            JobState::Queued if progress > 0.0 || self.seconds_downloaded > 0 => JobState::Downloading,
            other => other,
        };
        DownloadJob {
            id: self.id,
            state,
            progress,
            seconds_downloaded: self.seconds_downloaded,
            seconds_total: self.seconds_total,
            metadata: self.metadata,
            start_time: self.start_time,
        }
    }
}

/// A completed download, owned by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadedAsset {
    pub id: String,
    /// Location of the asset data (sibling of the descriptor, named by id)
    pub path: PathBuf,
    pub metadata: DownloadMetadata,
}

/// Why the engine ended a job without success.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineFailure {
    Cancelled,
    Failed,
}

impl EngineFailure {
    pub fn as_state(&self) -> JobState {
        match self {
            EngineFailure::Cancelled => JobState::Cancelled,
            EngineFailure::Failed => JobState::Failed,
        }
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFailure::Cancelled => f.write_str("was cancelled"),
            EngineFailure::Failed => f.write_str("failed"),
        }
    }
}

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// User-facing outcome of a job, published on the notice channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadNotice {
    Started { id: String },
    Completed { asset: DownloadedAsset },
    Cancelled { id: String },
    Failed { id: String },
    PersistFailed { id: String, message: String },
}

impl DownloadNotice {
    pub fn id(&self) -> &str {
        match self {
            DownloadNotice::Started { id }
            | DownloadNotice::Cancelled { id }
            | DownloadNotice::Failed { id }
            | DownloadNotice::PersistFailed { id, .. } => id,
            DownloadNotice::Completed { asset } => &asset.id,
        }
    }

    pub fn level(&self) -> NoticeLevel {
        match self {
            DownloadNotice::Failed { .. } | DownloadNotice::PersistFailed { .. } => NoticeLevel::Error,
            _ => NoticeLevel::Info,
        }
    }

    /// Returns true if no further notices follow for this job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadNotice::Started { .. })
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            DownloadNotice::Started { id } => format!("Download started: {}", id),
            DownloadNotice::Completed { asset } => format!("Download complete: {}", asset.id),
            DownloadNotice::Cancelled { id } => format!("Download cancelled: {}", id),
            DownloadNotice::Failed { id } => format!("Download failed: {}", id),
            DownloadNotice::PersistFailed { id, message } => {
                format!("Download of {} finished but could not be saved: {}", id, message)
            }
        }
    }
}

pub(crate) fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Check that an id can double as a file name in the downloads directory.
///
/// Dots are rejected: sibling files are named `<id>.<ext>`, so a dotted id
/// could collide with another id's files.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['.', '/', '\\', '\0'])
}

#[cfg(test)]
pub(crate) fn sample_metadata(id: &str) -> DownloadMetadata {
    let source = MediaSource::with_id(format!("{}-src", id));
    DownloadMetadata {
        item: MediaItem::new(id, format!("Title {}", id)),
        media_source: source.clone(),
        options: DownloadOptions {
            media_source: source,
            ..DownloadOptions::default()
        },
    }
}
