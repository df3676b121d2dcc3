// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Race Detection Tests for reeldown
//!
//! These tests hammer the download registry from many tasks at once on a
//! multi-threaded runtime. They are designed to surface lost updates and
//! deadlocks, and to detect data races when run with ThreadSanitizer (TSAN).
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! # On Linux with nightly Rust:
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test race_detection_test
//! ```
//!
//! # Test Categories
//!
//! - Concurrent progress for distinct ids
//! - Concurrent starts for the same id
//! - Duplicate terminal signals under load
//! - Progress racing with lifecycle reconciliation
//! - Snapshot reads during mutation

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reeldown::download::{DownloadNotice, SimulatedEngine};
use tempfile::TempDir;
use tokio::time::timeout;

// Test configuration
const CONCURRENCY_LEVEL: usize = 50;
const ITERATIONS_PER_TASK: usize = 40;
const TEST_TIMEOUT_SECS: u64 = 30;
const BUS_CAPACITY: usize = 1 << 16;

async fn loaded_harness() -> Harness {
    harness_with(
        SimulatedEngine::with_capacity(BUS_CAPACITY),
        TempDir::new().expect("Failed to create temp dir"),
    )
    .await
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            handle.await.expect("Task panicked");
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

// =============================================================================
// PROGRESS STORMS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_progress_for_distinct_ids() {
    let h = loaded_harness().await;
    for i in 0..CONCURRENCY_LEVEL {
        h.service.start_job(request(&format!("job-{}", i))).await.unwrap();
    }

    let mut handles = vec![];
    for i in 0..CONCURRENCY_LEVEL {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("job-{}", i);
            for j in 1..=ITERATIONS_PER_TASK {
                let progress = j as f64 / ITERATIONS_PER_TASK as f64;
                engine.emit_progress(&id, progress, j as u64, ITERATIONS_PER_TASK as u64);
                if j % 8 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    join_all(handles).await;

    // Every id ends at its last reported value: no update was lost.
    wait_for_jobs(&h.service, |jobs| {
        jobs.len() == CONCURRENCY_LEVEL && jobs.iter().all(|j| j.progress == 1.0)
    })
    .await;
    for job in h.service.snapshot() {
        assert_eq!(job.seconds_downloaded, ITERATIONS_PER_TASK as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_reads_during_mutation() {
    let h = loaded_harness().await;
    for i in 0..10 {
        h.service.start_job(request(&format!("job-{}", i))).await.unwrap();
    }
    let service = Arc::new(h.service);

    let mut handles = vec![];
    for i in 0..CONCURRENCY_LEVEL {
        let engine = h.engine.clone();
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..ITERATIONS_PER_TASK {
                if i % 2 == 0 {
                    engine.emit_progress(&format!("job-{}", (i + j) % 10), 0.5, 1, 2);
                } else {
                    let snapshot = service.snapshot();
                    assert_eq!(snapshot.len(), 10);
                    assert!(snapshot.iter().all(|job| (0.0..=1.0).contains(&job.progress)));
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    join_all(handles).await;
}

// =============================================================================
// START / TERMINAL RACES
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_for_same_id() {
    let h = loaded_harness().await;
    let service = Arc::new(h.service);

    let mut handles = vec![];
    for _ in 0..CONCURRENCY_LEVEL {
        let service = service.clone();
        handles.push(tokio::spawn(async move { service.start_job(request("movie-1")).await.is_ok() }));
    }

    let mut accepted = 0;
    let result = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        for handle in handles {
            if handle.await.expect("Task panicked") {
                accepted += 1;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");

    assert_eq!(accepted, 1);
    assert_eq!(h.engine.start_calls().len(), 1);
    assert_eq!(service.snapshot().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_completes_under_load_write_once() {
    let h = loaded_harness().await;
    let mut notices = h.service.subscribe_notices();
    let ids: Vec<String> = (0..CONCURRENCY_LEVEL).map(|i| format!("movie-{}", i)).collect();
    for id in &ids {
        h.service.start_job(request(id)).await.unwrap();
    }

    let mut handles = vec![];
    for _ in 0..4 {
        let engine = h.engine.clone();
        let ids = ids.clone();
        handles.push(tokio::spawn(async move {
            for id in &ids {
                engine.emit(reeldown::download::EngineEvent::Complete { id: id.clone() });
                tokio::task::yield_now().await;
            }
        }));
    }
    join_all(handles).await;

    let mut completed = HashSet::new();
    while completed.len() < ids.len() {
        if let DownloadNotice::Completed { asset } = wait_for_notice(&mut notices, |n| n.is_terminal()).await {
            assert!(completed.insert(asset.id.clone()), "{} completed twice", asset.id);
        }
    }

    // Flush the bus through a sentinel before counting writes.
    h.service.start_job(request("sentinel")).await.unwrap();
    h.engine.emit_progress("sentinel", 0.3, 1, 3);
    wait_for_jobs(&h.service, |jobs| jobs.iter().any(|j| j.progress == 0.3)).await;

    assert_eq!(h.store.writes(), ids.len());
    assert_eq!(h.service.downloaded().await.unwrap().len(), ids.len());
    assert_exclusive(&h);
}

// =============================================================================
// RECONCILIATION RACES
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_racing_lifecycle_signals() {
    let h = loaded_harness().await;
    for i in 0..10 {
        h.service.start_job(request(&format!("job-{}", i))).await.unwrap();
    }
    let service = Arc::new(h.service);

    let mut handles = vec![];
    for i in 0..10 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            for j in 1..=ITERATIONS_PER_TASK {
                engine.emit_progress(&format!("job-{}", i), j as f64 / 100.0, j as u64, 100);
                tokio::task::yield_now().await;
            }
        }));
    }
    for round in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            if round % 2 == 0 {
                service.on_background().await.unwrap();
            } else {
                service.on_foreground().await.unwrap();
            }
        }));
    }
    join_all(handles).await;

    // A final pass settles on exactly the engine's set.
    let report = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), service.on_foreground())
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(report.adopted, 10);
    assert!(report.dropped.is_empty());

    let ids: HashSet<String> = service.snapshot().into_iter().map(|j| j.id).collect();
    let expected: HashSet<String> = (0..10).map(|i| format!("job-{}", i)).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completions_racing_reconciliation_never_resurrect() {
    let h = loaded_harness().await;
    let mut notices = h.service.subscribe_notices();
    let ids: Vec<String> = (0..20).map(|i| format!("movie-{}", i)).collect();
    for id in &ids {
        h.service.start_job(request(id)).await.unwrap();
    }
    let service = Arc::new(h.service);

    let mut handles = vec![];
    {
        let engine = h.engine.clone();
        let ids = ids.clone();
        handles.push(tokio::spawn(async move {
            for id in &ids {
                engine.emit_complete(id);
                tokio::task::yield_now().await;
            }
        }));
    }
    for _ in 0..5 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.on_foreground().await.unwrap();
        }));
    }
    join_all(handles).await;

    let mut completed = 0;
    while completed < ids.len() {
        if let DownloadNotice::Completed { .. } = wait_for_notice(&mut notices, |n| n.is_terminal()).await {
            completed += 1;
        }
    }

    service.on_foreground().await.unwrap();
    assert!(service.snapshot().is_empty());
    assert_eq!(h.store.writes(), ids.len());
}
