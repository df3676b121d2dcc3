// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Forwards engine events into the registry.
//!
//! The bridge owns one subscription to the engine's bus and turns each
//! event into a registry command. It never touches the job map itself, and
//! it never waits on persistence: the registry dispatches that to the
//! blocking pool.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::engine::EngineEvent;
use super::reconciler::{LifecycleSignal, Reconciler};
use super::registry::JobRegistry;
use crate::error::DownloadError;

/// Running subscription. Dropping it unsubscribes.
pub struct EventBridge {
    task: JoinHandle<()>,
}

impl EventBridge {
    /// Start forwarding `events` to `registry`.
    ///
    /// The bus is bounded; when the bridge falls behind and events are lost,
    /// it asks `resync` for a foreground pass so the engine's list repairs
    /// whatever was missed.
    pub fn spawn(events: broadcast::Receiver<EngineEvent>, registry: JobRegistry, resync: Option<Reconciler>) -> Self {
        let task = tokio::spawn(run(events, registry, resync));
        Self { task }
    }

    /// Stop forwarding events.
    pub fn unsubscribe(self) {
        self.task.abort();
        tracing::debug!("EVENT_BRIDGE_UNSUBSCRIBED");
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut events: broadcast::Receiver<EngineEvent>, registry: JobRegistry, resync: Option<Reconciler>) {
    tracing::debug!("EVENT_BRIDGE_STARTED");
    loop {
        match events.recv().await {
            Ok(event) => {
                if forward(&registry, event).await.is_err() {
                    tracing::debug!("EVENT_BRIDGE_STOPPED | reason=registry stopped");
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("ENGINE_EVENTS_LAGGED | skipped={}", skipped);
                if let Some(reconciler) = &resync {
                    if !reconciler.notify(LifecycleSignal::Foreground) {
                        tracing::warn!("RESYNC_NOT_QUEUED | reason=reconciler busy");
                    }
                }
            }
            Err(RecvError::Closed) => {
                tracing::debug!("EVENT_BRIDGE_STOPPED | reason=engine bus closed");
                return;
            }
        }
    }
}

async fn forward(registry: &JobRegistry, event: EngineEvent) -> Result<(), DownloadError> {
    match event {
        EngineEvent::Progress {
            id,
            progress,
            seconds_downloaded,
            seconds_total,
            state,
        } => {
            registry
                .progress(&id, progress, seconds_downloaded, seconds_total, state)
                .await
        }
        EngineEvent::Complete { id } => registry.complete(&id).await,
        EngineEvent::Error { id, reason } => registry.fail(&id, reason).await,
    }
}
