// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration for reeldown
//!
//! This module keeps track of long-running media downloads:
//! - A registry of active jobs, mutated by a single actor task
//! - An event bridge from the download engine into the registry
//! - A metadata store of finished downloads (one JSON file per job)
//! - A reconciler that re-syncs with the engine on foreground/background
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  start/cancel   ┌─────────────────┐
//! │ DownloadService │────────────────▶│ DownloadEngine  │
//! └────────┬────────┘                 └────────┬────────┘
//!          │ insert                            │ events (broadcast)
//!          ▼                                   ▼
//! ┌─────────────────┐    commands     ┌─────────────────┐
//! │ JobRegistry     │◀────────────────│ EventBridge     │
//! │ (actor)         │◀──────┐         └─────────────────┘
//! └────────┬────────┘       │ adopt/clear
//!          │ persist        │
//!          ▼                │
//! ┌─────────────────┐  ┌────┴────────────┐
//! │ MetadataStore   │  │ Reconciler      │
//! │ (<id>.json)     │  │ (lifecycle)     │
//! └─────────────────┘  └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reeldown::config::Config;
//! use reeldown::download::{
//!     DownloadOptions, DownloadService, MediaItem, MediaSource, SimulatedEngine, StartRequest,
//!     TemplateResolver,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let engine = Arc::new(SimulatedEngine::paced_with_capacity(config.pacing(), config.event_buffer));
//! let resolver = Arc::new(TemplateResolver::new(&config.server_url)?);
//! let service = DownloadService::start(&config, engine, resolver).await?;
//!
//! let options = DownloadOptions {
//!     media_source: MediaSource::with_id("source-1"),
//!     ..DownloadOptions::default()
//! };
//! service
//!     .start_job(StartRequest::new(MediaItem::new("movie-1", "Movie"), options))
//!     .await?;
//!
//! let mut notices = service.subscribe_notices();
//! while let Ok(notice) = notices.recv().await {
//!     println!("{}", notice.message());
//!     if notice.is_terminal() {
//!         break;
//!     }
//! }
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod engine;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use bridge::EventBridge;
pub use engine::{DownloadEngine, EngineEvent, Pacing, SimulatedEngine};
pub use reconciler::{LifecycleSignal, ReconcileReport, Reconciler};
pub use registry::{JobRegistry, ReconcileOutcome, Snapshot};
pub use resolver::{is_segmented_manifest, ResolveRequest, ResolvedStream, StreamResolver, TemplateResolver};
pub use service::{DownloadService, ServiceSettings};
pub use store::{AssetStore, MetadataStore};
pub use types::{
    is_valid_job_id, Artifact, DownloadJob, DownloadMetadata, DownloadNotice, DownloadOptions, DownloadedAsset,
    EngineFailure, EngineJob, JobState, MediaItem, MediaSource, NoticeLevel, StartRequest,
};
