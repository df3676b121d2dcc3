// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for reeldown.
//!
//! `DownloadError` is what callers of the download service see. Validation,
//! resolution and format errors are returned synchronously from
//! `start_job`; engine failures arrive later as notices and are only
//! represented here when the engine refuses a hand-off outright.

use std::path::PathBuf;

use thiserror::Error;

use crate::download::types::EngineFailure;

/// Errors surfaced by the download service.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Missing fields, malformed or duplicate id
    #[error("invalid download request: {0}")]
    Validation(String),

    /// The resolver could not produce a playable URL
    #[error("could not resolve a stream for {id}: {source}")]
    Resolution {
        id: String,
        #[source]
        source: ResolveError,
    },

    /// The resolved URL is not a segmented stream manifest
    #[error("{id} cannot be downloaded: only segmented stream manifests are supported (got {url})")]
    UnsupportedFormat { id: String, url: String },

    /// The engine ended or refused the job
    #[error("download {id} {reason}")]
    Engine { id: String, reason: EngineFailure },

    /// Reading or writing a descriptor failed
    #[error("could not persist {id}: {source}")]
    Persistence {
        id: String,
        #[source]
        source: StoreError,
    },

    /// The service has been shut down
    #[error("download service is not running")]
    ServiceStopped,
}

impl DownloadError {
    /// Suggested next steps for the user, used by the CLI.
    pub fn fixes(&self) -> Vec<&'static str> {
        match self {
            DownloadError::Validation(_) => vec![
                "Check the item id and name",
                "List finished downloads: reeldown list",
            ],
            DownloadError::Resolution { .. } => vec![
                "Check server_url in ~/.reeldown/config.json",
                "Pick another media source",
            ],
            DownloadError::UnsupportedFormat { .. } => vec!["Choose a source the server can serve as HLS"],
            DownloadError::Engine { .. } => vec!["Retry the download"],
            DownloadError::Persistence { .. } => vec![
                "Check free space and permissions of the downloads directory",
                "Retry the download",
            ],
            DownloadError::ServiceStopped => vec![],
        }
    }
}

/// Errors returned by a stream resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("item has no id")]
    MissingItemId,

    #[error("no media source available")]
    MissingMediaSource,

    #[error("no stream url returned")]
    MissingUrl,

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid descriptor {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("could not serialize descriptor: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("timed out after {timeout_ms}ms waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout_ms: u128 },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Formats an error message with title, causes and fixes.
///
/// # Example
///
/// ```
/// use reeldown::error::format_error;
///
/// let msg = format_error(
///     "Failed to start download",
///     &["Item is already downloading"],
///     &["Check progress: reeldown list"],
/// );
/// assert!(msg.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}
