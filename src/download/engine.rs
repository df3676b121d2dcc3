// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download engine seam.
//!
//! The engine performs the byte transfer and is the source of truth for
//! what is actually downloading. Its calls return as soon as the request
//! is handed off; outcomes arrive later as [`EngineEvent`]s on the
//! broadcast bus returned by [`DownloadEngine::subscribe`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use super::types::{clamp_progress, DownloadMetadata, EngineFailure, EngineJob, JobState};
use crate::locks::{resilient_read, resilient_write};

/// Capacity of the simulated engine's event bus
const EVENT_BUS_CAPACITY: usize = 256;

/// Signals emitted by a download engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Progress report. `state` is the engine's own view of the job; a
    /// `Done` here is treated like a `Complete`.
    Progress {
        id: String,
        progress: f64,
        seconds_downloaded: u64,
        seconds_total: u64,
        state: JobState,
    },
    /// The transfer finished successfully
    Complete { id: String },
    /// The transfer ended without success
    Error { id: String, reason: EngineFailure },
}

impl EngineEvent {
    pub fn id(&self) -> &str {
        match self {
            EngineEvent::Progress { id, .. } | EngineEvent::Complete { id } | EngineEvent::Error { id, .. } => id,
        }
    }
}

/// External download engine.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Hand a job to the engine.
    async fn start_job(&self, id: &str, url: &str, metadata: &DownloadMetadata) -> Result<()>;

    /// Request cancellation. The outcome arrives as an `Error` event.
    async fn cancel_job(&self, id: &str) -> Result<()>;

    /// Jobs the engine is currently running.
    async fn list_active_jobs(&self) -> Result<Vec<EngineJob>>;

    /// Subscribe to the engine's event bus.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Pacing for [`SimulatedEngine`]'s built-in transfer loop.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Delay between progress reports
    pub step: Duration,
    /// Number of reports until completion
    pub steps: u32,
    /// Media length reported for every job
    pub seconds_total: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(250),
            steps: 20,
            seconds_total: 5400,
        }
    }
}

/// A start request as received by the simulated engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    pub id: String,
    pub url: String,
}

/// In-process engine.
///
/// With [`Pacing`] every started job ticks towards completion on its own
/// task. Without it the engine only records jobs, and the `emit_*` methods
/// drive events by hand.
pub struct SimulatedEngine {
    jobs: Arc<RwLock<HashMap<String, EngineJob>>>,
    runners: RwLock<HashMap<String, AbortHandle>>,
    starts: RwLock<Vec<StartCall>>,
    events: broadcast::Sender<EngineEvent>,
    pacing: Option<Pacing>,
    offline: RwLock<bool>,
}

impl SimulatedEngine {
    /// Engine driven by hand.
    pub fn new() -> Self {
        Self::build(None, EVENT_BUS_CAPACITY)
    }

    /// Engine that completes every job on a timer.
    pub fn paced(pacing: Pacing) -> Self {
        Self::build(Some(pacing), EVENT_BUS_CAPACITY)
    }

    /// Self-completing engine with a custom bus capacity.
    pub fn paced_with_capacity(pacing: Pacing, capacity: usize) -> Self {
        Self::build(Some(pacing), capacity)
    }

    /// Hand-driven engine with a custom bus capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(None, capacity)
    }

    fn build(pacing: Option<Pacing>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            runners: RwLock::new(HashMap::new()),
            starts: RwLock::new(Vec::new()),
            events,
            pacing,
            offline: RwLock::new(false),
        }
    }

    /// Make hand-offs fail, as if the engine process were unreachable.
    pub fn set_offline(&self, offline: bool) {
        *resilient_write(&self.offline) = offline;
    }

    /// Every `start_job` call received so far.
    pub fn start_calls(&self) -> Vec<StartCall> {
        resilient_read(&self.starts).clone()
    }

    /// Report progress for `id`, updating the engine's own table.
    pub fn emit_progress(&self, id: &str, progress: f64, seconds_downloaded: u64, seconds_total: u64) {
        Self::record_progress(&self.jobs, id, progress, seconds_downloaded, seconds_total);
        self.send(EngineEvent::Progress {
            id: id.to_string(),
            progress: clamp_progress(progress),
            seconds_downloaded,
            seconds_total,
            state: JobState::Downloading,
        });
    }

    /// Report success for `id` and forget it.
    pub fn emit_complete(&self, id: &str) {
        self.forget(id);
        self.send(EngineEvent::Complete { id: id.to_string() });
    }

    /// Report failure or cancellation for `id` and forget it.
    pub fn emit_error(&self, id: &str, reason: EngineFailure) {
        self.forget(id);
        self.send(EngineEvent::Error {
            id: id.to_string(),
            reason,
        });
    }

    /// Publish a raw event without touching the job table.
    pub fn emit(&self, event: EngineEvent) {
        self.send(event);
    }

    /// Drop a job without emitting anything, as if the platform killed it
    /// while the app was suspended.
    pub fn forget(&self, id: &str) {
        resilient_write(&self.jobs).remove(id);
        if let Some(runner) = resilient_write(&self.runners).remove(id) {
            runner.abort();
        }
    }

    /// Register a job the engine is running on behalf of a previous process.
    pub fn insert_active(&self, job: EngineJob) {
        resilient_write(&self.jobs).insert(job.id.clone(), job);
    }

    fn send(&self, event: EngineEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    fn record_progress(
        jobs: &RwLock<HashMap<String, EngineJob>>,
        id: &str,
        progress: f64,
        seconds_downloaded: u64,
        seconds_total: u64,
    ) -> bool {
        match resilient_write(jobs).get_mut(id) {
            Some(job) => {
                job.state = JobState::Downloading;
                job.progress = clamp_progress(progress);
                job.seconds_downloaded = seconds_downloaded;
                job.seconds_total = seconds_total;
                true
            }
            None => false,
        }
    }

    fn spawn_runner(&self, id: String, pacing: Pacing) -> AbortHandle {
        let jobs = Arc::clone(&self.jobs);
        let events = self.events.clone();
        let steps = pacing.steps.max(1);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pacing.step.max(Duration::from_millis(1)));
            interval.tick().await;
            for step in 1..=steps {
                interval.tick().await;
                let progress = step as f64 / steps as f64;
                let seconds = (pacing.seconds_total as f64 * progress) as u64;
                if !Self::record_progress(&jobs, &id, progress, seconds, pacing.seconds_total) {
                    return;
                }
                let _ = events.send(EngineEvent::Progress {
                    id: id.clone(),
                    progress,
                    seconds_downloaded: seconds,
                    seconds_total: pacing.seconds_total,
                    state: JobState::Downloading,
                });
            }
            if resilient_write(&jobs).remove(&id).is_some() {
                tracing::debug!("ENGINE_COMPLETE | id={}", id);
                let _ = events.send(EngineEvent::Complete { id });
            }
        });
        task.abort_handle()
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadEngine for SimulatedEngine {
    async fn start_job(&self, id: &str, url: &str, metadata: &DownloadMetadata) -> Result<()> {
        if *resilient_read(&self.offline) {
            bail!("engine unavailable");
        }

        resilient_write(&self.starts).push(StartCall {
            id: id.to_string(),
            url: url.to_string(),
        });
        resilient_write(&self.jobs).insert(
            id.to_string(),
            EngineJob {
                id: id.to_string(),
                state: JobState::Queued,
                progress: 0.0,
                seconds_downloaded: 0,
                seconds_total: 0,
                metadata: metadata.clone(),
                start_time: Utc::now(),
            },
        );

        if let Some(pacing) = self.pacing {
            let runner = self.spawn_runner(id.to_string(), pacing);
            resilient_write(&self.runners).insert(id.to_string(), runner);
        }
        Ok(())
    }

    async fn cancel_job(&self, id: &str) -> Result<()> {
        if *resilient_read(&self.offline) {
            bail!("engine unavailable");
        }
        let known = resilient_read(&self.jobs).contains_key(id);
        if known {
            self.emit_error(id, EngineFailure::Cancelled);
        }
        Ok(())
    }

    async fn list_active_jobs(&self) -> Result<Vec<EngineJob>> {
        if *resilient_read(&self.offline) {
            bail!("engine unavailable");
        }
        Ok(resilient_read(&self.jobs).values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::sample_metadata;

    #[tokio::test]
    async fn test_manual_engine_tracks_jobs() {
        let engine = SimulatedEngine::new();
        let mut events = engine.subscribe();

        engine
            .start_job("a", "http://host/a/master.m3u8", &sample_metadata("a"))
            .await
            .unwrap();
        engine.emit_progress("a", 0.5, 30, 60);

        let active = engine.list_active_jobs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].progress, 0.5);
        assert_eq!(active[0].state, JobState::Downloading);

        match events.recv().await.unwrap() {
            EngineEvent::Progress { id, progress, .. } => {
                assert_eq!(id, "a");
                assert_eq!(progress, 0.5);
            }
            other => panic!("unexpected event {:?}", other),
        }

        engine.emit_complete("a");
        assert_eq!(events.recv().await.unwrap(), EngineEvent::Complete { id: "a".into() });
        assert!(engine.list_active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_emits_cancelled_only_for_known_jobs() {
        let engine = SimulatedEngine::new();
        let mut events = engine.subscribe();

        engine.cancel_job("ghost").await.unwrap();
        engine
            .start_job("a", "http://host/a/master.m3u8", &sample_metadata("a"))
            .await
            .unwrap();
        engine.cancel_job("a").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::Error {
                id: "a".into(),
                reason: EngineFailure::Cancelled
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_paced_engine_completes() {
        let engine = SimulatedEngine::paced(Pacing {
            step: Duration::from_millis(5),
            steps: 4,
            seconds_total: 100,
        });
        let mut events = engine.subscribe();
        engine
            .start_job("a", "http://host/a/master.m3u8", &sample_metadata("a"))
            .await
            .unwrap();

        let mut progress_events = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("engine stalled")
                .unwrap();
            match event {
                EngineEvent::Progress { .. } => progress_events += 1,
                EngineEvent::Complete { id } => {
                    assert_eq!(id, "a");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(progress_events, 4);
    }

    #[tokio::test]
    async fn test_bus_capacity_is_configurable() {
        let engine = SimulatedEngine::paced_with_capacity(Pacing::default(), 2);
        let mut events = engine.subscribe();
        for id in ["a", "b", "c"] {
            engine.emit_complete(id);
        }

        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(events.recv().await.unwrap(), EngineEvent::Complete { id: "b".into() });
    }

    #[tokio::test]
    async fn test_offline_engine_refuses_hand_off() {
        let engine = SimulatedEngine::new();
        engine.set_offline(true);
        let result = engine
            .start_job("a", "http://host/a/master.m3u8", &sample_metadata("a"))
            .await;
        assert!(result.is_err());
        assert!(engine.start_calls().is_empty());
    }
}
