// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory registry of active download jobs.
//!
//! A single actor task owns the job map and applies every mutation in the
//! order commands arrive on its queue, so concurrent progress, completion
//! and reconciliation traffic cannot lose updates. Readers never go through
//! the queue: each mutation republishes an immutable snapshot on a watch
//! channel.
//!
//! Besides the visible map the actor keeps a ledger with the descriptor of
//! every job it started or adopted that has not reached a terminal state.
//! The visible map is dropped on a background transition; the ledger is not,
//! so a completion that arrives while the map is empty still persists.
//! Terminal signals remove the ledger entry, which makes duplicates no-ops.
//! Jobs dropped by reconciliation linger in the ledger for one more pass, as
//! their terminal event may still be on its way.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::store::AssetStore;
use super::types::{
    Artifact, DownloadJob, DownloadMetadata, DownloadNotice, DownloadedAsset, EngineFailure, EngineJob, JobState,
};
use crate::error::DownloadError;

/// Immutable view of the active jobs.
pub type Snapshot = Arc<Vec<DownloadJob>>;

/// Commands processed by the registry actor.
#[derive(Debug)]
enum RegistryCommand {
    /// Claim an id for a start in progress
    Reserve {
        id: String,
        reply: oneshot::Sender<Result<(), DownloadError>>,
    },
    /// Give up a reservation after a failed start
    Release { id: String },
    /// Add a freshly started job
    Insert {
        job: DownloadJob,
        artifacts: Vec<Artifact>,
        reply: oneshot::Sender<()>,
    },
    Progress {
        id: String,
        progress: f64,
        seconds_downloaded: u64,
        seconds_total: u64,
        state: JobState,
    },
    Complete { id: String },
    Fail { id: String, reason: EngineFailure },
    /// Background persistence for `id` finished
    Persisted { id: String },
    Tracked {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Start of a reconciliation pass
    Mark { reply: oneshot::Sender<u64> },
    /// Replace the map with the engine's view as of `mark`
    Reconcile {
        jobs: Vec<EngineJob>,
        mark: u64,
        reply: oneshot::Sender<ReconcileOutcome>,
    },
    Clear { reply: oneshot::Sender<usize> },
    Shutdown,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Jobs taken from the engine's list
    pub adopted: usize,
    /// Jobs dropped because the engine no longer runs them
    pub dropped: Vec<String>,
    /// Jobs the engine listed as finished that had not been handled yet
    pub finished: usize,
}

#[derive(Debug)]
struct LedgerEntry {
    metadata: DownloadMetadata,
    start_time: chrono::DateTime<chrono::Utc>,
    artifacts: Vec<Artifact>,
    /// Sequence number at insertion
    seq: u64,
    /// Missing from the engine's last listing. Kept for one more pass so a
    /// terminal event already in flight still finds its descriptor.
    abandoned: bool,
}

impl LedgerEntry {
    fn adopted(job: &EngineJob) -> Self {
        Self {
            metadata: job.metadata.clone(),
            start_time: job.start_time,
            artifacts: Vec::new(),
            seq: 0,
            abandoned: false,
        }
    }
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    tx: mpsc::Sender<RegistryCommand>,
    snapshot: watch::Receiver<Snapshot>,
}

impl JobRegistry {
    /// Spawn the actor.
    ///
    /// Completed jobs are written to `store`; outcomes go to `notices`, and
    /// newly persisted assets are appended to `library`.
    pub fn spawn(
        store: Arc<dyn AssetStore>,
        notices: broadcast::Sender<DownloadNotice>,
        library: watch::Sender<Vec<DownloadedAsset>>,
        buffer: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let actor = RegistryActor {
            jobs: HashMap::new(),
            ledger: HashMap::new(),
            reserved: HashSet::new(),
            persisting: HashSet::new(),
            terminated: HashMap::new(),
            seq: 0,
            store,
            notices,
            library,
            snapshot: snapshot_tx,
            commands: tx.downgrade(),
        };
        let handle = tokio::spawn(actor.run(rx));

        (
            Self {
                tx,
                snapshot: snapshot_rx,
            },
            handle,
        )
    }

    async fn send(&self, command: RegistryCommand) -> Result<(), DownloadError> {
        self.tx.send(command).await.map_err(|_| DownloadError::ServiceStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| DownloadError::ServiceStopped)
    }

    /// Current active jobs, ordered by start time. Never blocks on the actor.
    pub fn snapshot(&self) -> Vec<DownloadJob> {
        self.snapshot.borrow().as_ref().clone()
    }

    /// Active job with `id`, from the latest snapshot.
    pub fn get(&self, id: &str) -> Option<DownloadJob> {
        self.snapshot.borrow().iter().find(|j| j.id == id).cloned()
    }

    /// Watch the snapshot for changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Claim `id` for a start. Fails if the id is already active.
    pub async fn reserve(&self, id: &str) -> Result<(), DownloadError> {
        let id = id.to_string();
        self.request(|reply| RegistryCommand::Reserve { id, reply }).await?
    }

    pub async fn release(&self, id: &str) {
        let _ = self.send(RegistryCommand::Release { id: id.to_string() }).await;
    }

    /// Insert a reserved job as queued.
    pub async fn insert(&self, job: DownloadJob, artifacts: Vec<Artifact>) -> Result<(), DownloadError> {
        self.request(|reply| RegistryCommand::Insert { job, artifacts, reply })
            .await
    }

    pub async fn progress(
        &self,
        id: &str,
        progress: f64,
        seconds_downloaded: u64,
        seconds_total: u64,
        state: JobState,
    ) -> Result<(), DownloadError> {
        self.send(RegistryCommand::Progress {
            id: id.to_string(),
            progress,
            seconds_downloaded,
            seconds_total,
            state,
        })
        .await
    }

    pub async fn complete(&self, id: &str) -> Result<(), DownloadError> {
        self.send(RegistryCommand::Complete { id: id.to_string() }).await
    }

    pub async fn fail(&self, id: &str, reason: EngineFailure) -> Result<(), DownloadError> {
        self.send(RegistryCommand::Fail {
            id: id.to_string(),
            reason,
        })
        .await
    }

    /// Whether `id` is visible or still tracked in the ledger.
    pub async fn is_tracked(&self, id: &str) -> Result<bool, DownloadError> {
        let id = id.to_string();
        self.request(|reply| RegistryCommand::Tracked { id, reply }).await
    }

    /// Mark the start of a reconciliation pass. Pass the result to
    /// [`JobRegistry::reconcile`] with the engine's list fetched afterwards.
    pub async fn mark(&self) -> Result<u64, DownloadError> {
        self.request(|reply| RegistryCommand::Mark { reply }).await
    }

    /// Adopt the engine's active jobs and drop everything else that existed
    /// before `mark`. Dropped jobs stay in the ledger until the next pass.
    pub async fn reconcile(&self, jobs: Vec<EngineJob>, mark: u64) -> Result<ReconcileOutcome, DownloadError> {
        self.request(|reply| RegistryCommand::Reconcile { jobs, mark, reply })
            .await
    }

    /// Empty the visible map. Returns how many jobs were dropped.
    pub async fn clear(&self) -> Result<usize, DownloadError> {
        self.request(|reply| RegistryCommand::Clear { reply }).await
    }

    /// Stop the actor after it drains already-queued commands.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(RegistryCommand::Shutdown).await;
    }
}

struct RegistryActor {
    jobs: HashMap<String, DownloadJob>,
    ledger: HashMap<String, LedgerEntry>,
    reserved: HashSet<String>,
    persisting: HashSet<String>,
    /// Sequence number at which each id last reached a terminal state
    terminated: HashMap<String, u64>,
    seq: u64,
    store: Arc<dyn AssetStore>,
    notices: broadcast::Sender<DownloadNotice>,
    library: watch::Sender<Vec<DownloadedAsset>>,
    snapshot: watch::Sender<Snapshot>,
    commands: mpsc::WeakSender<RegistryCommand>,
}

impl RegistryActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        tracing::debug!("REGISTRY_STOPPED | active={}", self.jobs.len());
    }

    /// Apply one command. Returns false to stop the actor.
    fn handle(&mut self, command: RegistryCommand) -> bool {
        match command {
            RegistryCommand::Reserve { id, reply } => {
                let _ = reply.send(self.reserve(id));
            }
            RegistryCommand::Release { id } => {
                self.reserved.remove(&id);
            }
            RegistryCommand::Insert { job, artifacts, reply } => {
                self.insert(job, artifacts);
                let _ = reply.send(());
            }
            RegistryCommand::Progress {
                id,
                progress,
                seconds_downloaded,
                seconds_total,
                state,
            } => match state {
                JobState::Done => self.complete(&id),
                JobState::Failed => self.fail(&id, EngineFailure::Failed),
                JobState::Cancelled => self.fail(&id, EngineFailure::Cancelled),
                JobState::Queued | JobState::Downloading => {
                    self.progress(&id, progress, seconds_downloaded, seconds_total)
                }
            },
            RegistryCommand::Complete { id } => self.complete(&id),
            RegistryCommand::Fail { id, reason } => self.fail(&id, reason),
            RegistryCommand::Persisted { id } => {
                self.persisting.remove(&id);
            }
            RegistryCommand::Tracked { id, reply } => {
                let tracked = self.jobs.contains_key(&id) || self.ledger.get(&id).is_some_and(|e| !e.abandoned);
                let _ = reply.send(tracked);
            }
            RegistryCommand::Mark { reply } => {
                let _ = reply.send(self.seq);
            }
            RegistryCommand::Reconcile { jobs, mark, reply } => {
                let _ = reply.send(self.reconcile(jobs, mark));
            }
            RegistryCommand::Clear { reply } => {
                let dropped = self.jobs.len();
                self.jobs.clear();
                self.publish();
                tracing::debug!("REGISTRY_CLEARED | dropped={} tracked={}", dropped, self.ledger.len());
                let _ = reply.send(dropped);
            }
            RegistryCommand::Shutdown => return false,
        }
        true
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn reserve(&mut self, id: String) -> Result<(), DownloadError> {
        if self.ledger.get(&id).is_some_and(|e| e.abandoned) {
            tracing::debug!("ABANDONED_SUPERSEDED | id={}", id);
            self.ledger.remove(&id);
        }
        if self.jobs.contains_key(&id) || self.ledger.contains_key(&id) || self.reserved.contains(&id) {
            return Err(DownloadError::Validation(format!("{} is already downloading", id)));
        }
        if self.persisting.contains(&id) {
            return Err(DownloadError::Validation(format!("{} is being saved", id)));
        }
        self.reserved.insert(id);
        Ok(())
    }

    fn insert(&mut self, job: DownloadJob, artifacts: Vec<Artifact>) {
        self.reserved.remove(&job.id);
        self.terminated.remove(&job.id);
        let seq = self.next_seq();
        self.ledger.insert(
            job.id.clone(),
            LedgerEntry {
                metadata: job.metadata.clone(),
                start_time: job.start_time,
                artifacts,
                seq,
                abandoned: false,
            },
        );
        tracing::info!("DOWNLOAD_QUEUED | id={}", job.id);
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        self.publish();
        let _ = self.notices.send(DownloadNotice::Started { id });
    }

    fn progress(&mut self, id: &str, progress: f64, seconds_downloaded: u64, seconds_total: u64) {
        match self.jobs.get_mut(id) {
            Some(job) => {
                job.record_progress(progress, seconds_downloaded, seconds_total);
                tracing::trace!("DOWNLOAD_PROGRESS | id={} progress={:.3}", id, job.progress);
                self.publish();
            }
            None => {
                tracing::debug!("PROGRESS_DISCARDED | id={} reason=untracked", id);
            }
        }
    }

    fn complete(&mut self, id: &str) {
        self.finish(id, false);
    }

    /// Success path. `adopted` jobs were first seen already finished, so a
    /// previous process may have stored them.
    fn finish(&mut self, id: &str, adopted: bool) {
        let visible = self.jobs.remove(id);
        let entry = self.ledger.remove(id);

        let (mut job, artifacts) = match (visible, entry) {
            (Some(job), entry) => (job, entry.map(|e| e.artifacts).unwrap_or_default()),
            (None, Some(entry)) => {
                let mut job = DownloadJob::queued(id, entry.metadata);
                job.start_time = entry.start_time;
                (job, entry.artifacts)
            }
            (None, None) => {
                tracing::debug!("COMPLETE_IGNORED | id={} reason=untracked", id);
                return;
            }
        };

        job.state = JobState::Done;
        job.progress = 1.0;
        let seq = self.next_seq();
        self.terminated.insert(id.to_string(), seq);
        self.persisting.insert(id.to_string());
        self.publish();
        tracing::info!("DOWNLOAD_COMPLETE | id={}", id);
        self.dispatch_persist(job, artifacts, adopted);
    }

    /// Persist on the blocking pool so later events are not held up by I/O.
    fn dispatch_persist(&self, job: DownloadJob, artifacts: Vec<Artifact>, skip_if_stored: bool) {
        let store = Arc::clone(&self.store);
        let notices = self.notices.clone();
        let library = self.library.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let id = job.id.clone();
            let result = tokio::task::spawn_blocking(move || {
                if skip_if_stored && store.get(&job.id)?.is_some() {
                    return Ok(None);
                }
                store.persist(&job, &artifacts).map(Some)
            })
            .await;

            let notice = match result {
                Ok(Ok(Some(asset))) => {
                    library.send_modify(|assets| {
                        assets.retain(|a| a.id != asset.id);
                        assets.push(asset.clone());
                        assets.sort_by(|a, b| a.id.cmp(&b.id));
                    });
                    Some(DownloadNotice::Completed { asset })
                }
                Ok(Ok(None)) => {
                    tracing::debug!("PERSIST_SKIPPED | id={} reason=already stored", id);
                    None
                }
                Ok(Err(e)) => {
                    tracing::error!("PERSIST_FAILED | id={} error={}", id, e);
                    Some(DownloadNotice::PersistFailed {
                        id: id.clone(),
                        message: e.to_string(),
                    })
                }
                Err(e) => {
                    tracing::error!("PERSIST_FAILED | id={} error=task aborted: {}", id, e);
                    Some(DownloadNotice::PersistFailed {
                        id: id.clone(),
                        message: "persistence task aborted".to_string(),
                    })
                }
            };

            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(RegistryCommand::Persisted { id }).await;
            }
            if let Some(notice) = notice {
                let _ = notices.send(notice);
            }
        });
    }

    fn fail(&mut self, id: &str, reason: EngineFailure) {
        let visible = self.jobs.remove(id).is_some();
        let tracked = self.ledger.remove(id).is_some();
        if !visible && !tracked {
            tracing::debug!("ERROR_IGNORED | id={} reason=untracked", id);
            return;
        }

        let seq = self.next_seq();
        self.terminated.insert(id.to_string(), seq);
        self.publish();

        let notice = match reason {
            EngineFailure::Cancelled => {
                tracing::info!("DOWNLOAD_CANCELLED | id={}", id);
                DownloadNotice::Cancelled { id: id.to_string() }
            }
            EngineFailure::Failed => {
                tracing::error!("DOWNLOAD_FAILED | id={}", id);
                DownloadNotice::Failed { id: id.to_string() }
            }
        };
        let _ = self.notices.send(notice);
    }

    fn reconcile(&mut self, engine_jobs: Vec<EngineJob>, mark: u64) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut next: HashMap<String, DownloadJob> = HashMap::new();
        let mut terminal = Vec::new();

        let mut listed = HashSet::new();
        for engine_job in engine_jobs {
            listed.insert(engine_job.id.clone());
            // Finished after the engine was listed; the listing is stale.
            if self.terminated.get(&engine_job.id).is_some_and(|&seq| seq > mark) {
                continue;
            }

            let failure = match engine_job.state {
                JobState::Done => None,
                JobState::Failed => Some(EngineFailure::Failed),
                JobState::Cancelled => Some(EngineFailure::Cancelled),
                JobState::Queued | JobState::Downloading => {
                    self.ledger
                        .entry(engine_job.id.clone())
                        .or_insert_with(|| LedgerEntry::adopted(&engine_job))
                        .abandoned = false;
                    let job = engine_job.into_job();
                    next.insert(job.id.clone(), job);
                    continue;
                }
            };

            // Engines may keep finished tasks listed. Only a job still in the
            // ledger, or one never seen before, takes the terminal path.
            let adopted = match self.ledger.get_mut(&engine_job.id) {
                Some(entry) => {
                    entry.abandoned = false;
                    false
                }
                None if self.terminated.contains_key(&engine_job.id) || self.persisting.contains(&engine_job.id) => {
                    tracing::debug!("TERMINAL_ALREADY_HANDLED | id={}", engine_job.id);
                    continue;
                }
                None => {
                    self.ledger
                        .insert(engine_job.id.clone(), LedgerEntry::adopted(&engine_job));
                    true
                }
            };
            terminal.push((engine_job.id, failure, adopted));
        }

        // Started after the engine was listed: keep.
        for (id, entry) in &self.ledger {
            if entry.seq > mark && !next.contains_key(id) {
                if let Some(job) = self.jobs.get(id) {
                    next.insert(id.clone(), job.clone());
                }
            }
        }

        // Missing from the listing: hide now, forget on the next pass.
        let mut dropped = Vec::new();
        self.ledger.retain(|id, entry| {
            if entry.seq > mark || next.contains_key(id) || terminal.iter().any(|(t, _, _)| t == id) {
                return true;
            }
            if entry.abandoned {
                tracing::debug!("ABANDONED_PURGED | id={}", id);
                return false;
            }
            entry.abandoned = true;
            dropped.push(id.clone());
            true
        });
        dropped.sort();
        for id in &dropped {
            tracing::info!("DOWNLOAD_ABANDONED | id={}", id);
        }

        outcome.adopted = next.len();
        outcome.dropped = dropped;
        self.jobs = next;
        self.publish();

        outcome.finished = terminal.len();
        for (id, failure, adopted) in terminal {
            match failure {
                None => self.finish(&id, adopted),
                Some(reason) => self.fail(&id, reason),
            }
        }

        // Tombstones outlive the pass while the engine still lists the id.
        self.terminated.retain(|id, seq| *seq > mark || listed.contains(id));

        tracing::info!(
            "REGISTRY_RECONCILED | adopted={} dropped={} finished={}",
            outcome.adopted,
            outcome.dropped.len(),
            outcome.finished
        );
        outcome
    }

    fn publish(&self) {
        let mut jobs: Vec<DownloadJob> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        self.snapshot.send_replace(Arc::new(jobs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::store::MetadataStore;
    use crate::download::types::sample_metadata;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        registry: JobRegistry,
        notices: broadcast::Receiver<DownloadNotice>,
        store: Arc<MetadataStore>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(MetadataStore::open(dir.path(), Duration::from_secs(1)).unwrap());
        let (notices_tx, notices) = broadcast::channel(64);
        let (library, _) = watch::channel(Vec::new());
        let (registry, _) = JobRegistry::spawn(store.clone(), notices_tx, library, 16);
        Fixture {
            registry,
            notices,
            store,
            _dir: dir,
        }
    }

    async fn start(registry: &JobRegistry, id: &str) {
        registry.reserve(id).await.unwrap();
        registry
            .insert(DownloadJob::queued(id, sample_metadata(id)), Vec::new())
            .await
            .unwrap();
    }

    async fn next_terminal(notices: &mut broadcast::Receiver<DownloadNotice>) -> DownloadNotice {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
                .await
                .expect("no notice")
                .unwrap();
            if notice.is_terminal() {
                return notice;
            }
        }
    }

    fn engine_job(id: &str, progress: f64, state: JobState) -> EngineJob {
        EngineJob {
            id: id.to_string(),
            state,
            progress,
            seconds_downloaded: 0,
            seconds_total: 0,
            metadata: sample_metadata(id),
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_reservation_is_rejected() {
        let f = fixture();
        start(&f.registry, "movie-1").await;
        f.registry.progress("movie-1", 0.4, 1, 2, JobState::Downloading).await.unwrap();

        let err = f.registry.reserve("movie-1").await.unwrap_err();
        assert!(matches!(err, DownloadError::Validation(_)));

        f.registry.is_tracked("movie-1").await.unwrap();
        let job = f.registry.get("movie-1").unwrap();
        assert_eq!(job.progress, 0.4);
        assert_eq!(job.state, JobState::Downloading);
    }

    #[tokio::test]
    async fn test_released_reservation_can_be_retaken() {
        let f = fixture();
        f.registry.reserve("movie-1").await.unwrap();
        f.registry.release("movie-1").await;
        f.registry.reserve("movie-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_for_unknown_id_is_discarded() {
        let f = fixture();
        f.registry.progress("ghost", 0.5, 1, 2, JobState::Downloading).await.unwrap();
        assert!(!f.registry.is_tracked("ghost").await.unwrap());
        assert!(f.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_complete_persists_once() {
        let mut f = fixture();
        start(&f.registry, "movie-1").await;

        f.registry.complete("movie-1").await.unwrap();
        f.registry.complete("movie-1").await.unwrap();

        match next_terminal(&mut f.notices).await {
            DownloadNotice::Completed { asset } => assert_eq!(asset.id, "movie-1"),
            other => panic!("unexpected notice {:?}", other),
        }
        assert!(!f.registry.is_tracked("movie-1").await.unwrap());
        assert!(f.registry.snapshot().is_empty());
        assert!(f.store.get("movie-1").unwrap().is_some());
        assert!(f.notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_done_progress_takes_success_path() {
        let mut f = fixture();
        start(&f.registry, "movie-1").await;

        f.registry.progress("movie-1", 1.0, 60, 60, JobState::Done).await.unwrap();
        f.registry.complete("movie-1").await.unwrap();

        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));
        assert_eq!(f.store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_after_clear_still_persists() {
        let mut f = fixture();
        start(&f.registry, "movie-1").await;

        assert_eq!(f.registry.clear().await.unwrap(), 1);
        assert!(f.registry.snapshot().is_empty());
        f.registry.complete("movie-1").await.unwrap();

        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));
        assert!(f.store.get("movie-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut f = fixture();
        start(&f.registry, "a").await;
        start(&f.registry, "b").await;

        f.registry.fail("a", EngineFailure::Cancelled).await.unwrap();
        assert_eq!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Cancelled { id: "a".into() }
        );
        f.registry.fail("b", EngineFailure::Failed).await.unwrap();
        assert_eq!(next_terminal(&mut f.notices).await, DownloadNotice::Failed { id: "b".into() });

        assert!(f.registry.snapshot().is_empty());
        assert!(f.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_and_drops() {
        let f = fixture();
        start(&f.registry, "A").await;
        start(&f.registry, "B").await;

        let mark = f.registry.mark().await.unwrap();
        let outcome = f
            .registry
            .reconcile(
                vec![
                    engine_job("A", 0.7, JobState::Downloading),
                    engine_job("C", 0.2, JobState::Queued),
                ],
                mark,
            )
            .await
            .unwrap();

        assert_eq!(outcome.adopted, 2);
        assert_eq!(outcome.dropped, vec!["B".to_string()]);

        let ids: HashSet<String> = f.registry.snapshot().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, HashSet::from(["A".to_string(), "C".to_string()]));
        assert_eq!(f.registry.get("A").unwrap().progress, 0.7);
        assert_eq!(f.registry.get("C").unwrap().state, JobState::Downloading);
        assert!(!f.registry.is_tracked("B").await.unwrap());
    }

    #[tokio::test]
    async fn test_late_complete_for_abandoned_job_still_persists() {
        let mut f = fixture();
        start(&f.registry, "A").await;

        // The engine finished A before listing; its Complete is still in flight.
        let mark = f.registry.mark().await.unwrap();
        let outcome = f.registry.reconcile(Vec::new(), mark).await.unwrap();
        assert_eq!(outcome.dropped, vec!["A".to_string()]);
        assert!(f.registry.snapshot().is_empty());
        assert!(!f.registry.is_tracked("A").await.unwrap());

        f.registry.complete("A").await.unwrap();
        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_forgotten_after_next_pass() {
        let f = fixture();
        start(&f.registry, "A").await;

        let mark = f.registry.mark().await.unwrap();
        f.registry.reconcile(Vec::new(), mark).await.unwrap();
        let mark = f.registry.mark().await.unwrap();
        let outcome = f.registry.reconcile(Vec::new(), mark).await.unwrap();
        assert!(outcome.dropped.is_empty());

        f.registry.complete("A").await.unwrap();
        assert!(!f.registry.is_tracked("A").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_job_can_be_restarted() {
        let f = fixture();
        start(&f.registry, "A").await;
        let mark = f.registry.mark().await.unwrap();
        f.registry.reconcile(Vec::new(), mark).await.unwrap();

        start(&f.registry, "A").await;
        assert!(f.registry.get("A").is_some());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_jobs_started_after_mark() {
        let f = fixture();
        let mark = f.registry.mark().await.unwrap();
        start(&f.registry, "late").await;

        let outcome = f.registry.reconcile(Vec::new(), mark).await.unwrap();
        assert!(outcome.dropped.is_empty());
        assert!(f.registry.get("late").is_some());
    }

    #[tokio::test]
    async fn test_reconcile_ignores_jobs_finished_after_mark() {
        let mut f = fixture();
        start(&f.registry, "A").await;

        let mark = f.registry.mark().await.unwrap();
        f.registry.complete("A").await.unwrap();
        let outcome = f
            .registry
            .reconcile(vec![engine_job("A", 0.9, JobState::Downloading)], mark)
            .await
            .unwrap();

        assert_eq!(outcome.adopted, 0);
        assert!(f.registry.snapshot().is_empty());
        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_reconcile_routes_engine_done_to_persistence() {
        let mut f = fixture();
        let mark = f.registry.mark().await.unwrap();
        let outcome = f
            .registry
            .reconcile(vec![engine_job("X", 1.0, JobState::Done)], mark)
            .await
            .unwrap();

        assert_eq!(outcome.finished, 1);
        assert!(f.registry.snapshot().is_empty());
        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));
        assert!(f.store.get("X").unwrap().is_some());
    }

    async fn assert_quiet(notices: &mut broadcast::Receiver<DownloadNotice>) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(notice) = notices.try_recv() {
            assert!(!notice.is_terminal(), "unexpected notice {:?}", notice);
        }
    }

    #[tokio::test]
    async fn test_finished_jobs_kept_in_listing_are_handled_once() {
        let mut f = fixture();
        let listing = || {
            vec![
                engine_job("X", 1.0, JobState::Done),
                engine_job("Y", 0.4, JobState::Failed),
            ]
        };

        let mark = f.registry.mark().await.unwrap();
        let outcome = f.registry.reconcile(listing(), mark).await.unwrap();
        assert_eq!(outcome.finished, 2);
        let mut seen = vec![next_terminal(&mut f.notices).await, next_terminal(&mut f.notices).await];
        seen.sort_by_key(|n| n.id().to_string());
        assert!(matches!(&seen[0], DownloadNotice::Completed { asset } if asset.id == "X"));
        assert_eq!(seen[1], DownloadNotice::Failed { id: "Y".into() });

        for _ in 0..2 {
            let mark = f.registry.mark().await.unwrap();
            let outcome = f.registry.reconcile(listing(), mark).await.unwrap();
            assert_eq!(outcome.finished, 0);
            assert!(f.registry.snapshot().is_empty());
        }
        assert_quiet(&mut f.notices).await;
        assert_eq!(f.store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listed_done_after_complete_event_is_not_rewritten() {
        let mut f = fixture();
        start(&f.registry, "Z").await;
        f.registry.complete("Z").await.unwrap();
        assert!(matches!(
            next_terminal(&mut f.notices).await,
            DownloadNotice::Completed { .. }
        ));

        let mark = f.registry.mark().await.unwrap();
        let outcome = f
            .registry
            .reconcile(vec![engine_job("Z", 1.0, JobState::Done)], mark)
            .await
            .unwrap();
        assert_eq!(outcome.finished, 0);
        assert_quiet(&mut f.notices).await;
    }

    #[tokio::test]
    async fn test_deleted_asset_is_not_restored_by_listing() {
        let mut f = fixture();
        let mark = f.registry.mark().await.unwrap();
        f.registry
            .reconcile(vec![engine_job("X", 1.0, JobState::Done)], mark)
            .await
            .unwrap();
        next_terminal(&mut f.notices).await;
        assert!(f.store.delete("X").unwrap());

        let mark = f.registry.mark().await.unwrap();
        f.registry
            .reconcile(vec![engine_job("X", 1.0, JobState::Done)], mark)
            .await
            .unwrap();
        assert_quiet(&mut f.notices).await;
        assert!(f.store.get("X").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listed_done_already_stored_is_not_announced() {
        let mut f = fixture();
        // Stored by a previous process that exited before the engine forgot it.
        f.store
            .persist(&DownloadJob::queued("X", sample_metadata("X")), &[])
            .unwrap();

        let mark = f.registry.mark().await.unwrap();
        let outcome = f
            .registry
            .reconcile(vec![engine_job("X", 1.0, JobState::Done)], mark)
            .await
            .unwrap();
        assert_eq!(outcome.finished, 1);
        assert_quiet(&mut f.notices).await;
        assert!(f.store.get("X").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reservation_blocked_while_persisting() {
        let mut f = fixture();
        start(&f.registry, "movie-1").await;
        f.registry.complete("movie-1").await.unwrap();

        // Either still persisting (rejected) or already persisted.
        let during = f.registry.reserve("movie-1").await;
        next_terminal(&mut f.notices).await;
        if during.is_ok() {
            f.registry.release("movie-1").await;
        }
        assert!(f.store.get("movie-1").unwrap().is_some());
    }
}
