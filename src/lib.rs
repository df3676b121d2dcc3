// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! reeldown - media download orchestration library
//!
//! Start long-running media downloads, follow their progress, and keep the
//! finished ones on disk across restarts.
//!
//! # Core Modules
//!
//! - [`download`] - Job registry, engine event bridge, metadata store and
//!   lifecycle reconciler
//! - [`config`] - User configuration (`~/.reeldown/config.json`)
//! - [`error`] - Error types and consistent error formatting
//! - [`locks`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod locks;

pub use config::{load_config, Config};
pub use download::{
    DownloadEngine, DownloadJob, DownloadNotice, DownloadService, DownloadedAsset, JobState, MetadataStore,
    SimulatedEngine, StartRequest, StreamResolver, TemplateResolver,
};
pub use error::{format_error, DownloadError, ResolveError, StoreError};
