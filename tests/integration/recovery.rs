//! Restart behavior against an on-disk SQLite store.

use crate::common::wait_until_drained;
use jobline::testing::{JobLog, LogEntry, ScriptedJob, Step};
use jobline::{Dispatcher, FullSpec, JobId, JobIndex, JobSpec, SqliteStorage, now_millis};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open(path: &Path) -> Arc<JobIndex<SqliteStorage>> {
    let storage = SqliteStorage::new(path).await.unwrap();
    Arc::new(JobIndex::init(Arc::new(storage)).await.unwrap())
}

/// Test: a reopened store rebuilds exactly the index that was written.
#[tokio::test]
async fn test_reopened_store_matches_previous_index() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let before = {
        let index = open(&path).await;
        index
            .insert_jobs(vec![
                FullSpec::new(
                    JobSpec::new("upload", "Upload")
                        .with_create_time(1)
                        .with_queue("media")
                        .with_max_attempts(5)
                        .with_data(b"payload".to_vec()),
                )
                .with_constraint("Network"),
                FullSpec::new(JobSpec::new("notify", "Notify").with_create_time(2))
                    .depends_on("upload"),
            ])
            .await
            .unwrap();
        index
            .update_job_running_state(&JobId::new("upload"), true)
            .await
            .unwrap();

        let snapshot = (
            index.get_all_job_specs().await,
            index.get_full_spec(&JobId::new("upload")).await,
            index.get_full_spec(&JobId::new("notify")).await,
        );
        index.storage().close().await;
        snapshot
    };

    let index = open(&path).await;
    let after = (
        index.get_all_job_specs().await,
        index.get_full_spec(&JobId::new("upload")).await,
        index.get_full_spec(&JobId::new("notify")).await,
    );

    assert_eq!(before, after);
    assert!(after.0.iter().any(|j| j.id.as_str() == "upload" && j.is_running));
}

/// Test: a job left running by a crashed process runs again after start.
#[tokio::test]
async fn test_start_reconciles_jobs_left_running() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    {
        let index = open(&path).await;
        index
            .insert_jobs(vec![ScriptedJob::succeeding("orphan", 1)])
            .await
            .unwrap();
        index
            .update_job_running_state(&JobId::new("orphan"), true)
            .await
            .unwrap();
        assert!(index
            .get_pending_jobs_with_no_dependencies_in_created_order(now_millis())
            .await
            .is_empty());
        index.storage().close().await;
    }

    let log = JobLog::new();
    let index = open(&path).await;
    let dispatcher = Dispatcher::new(Arc::clone(&index), ScriptedJob::factories(log.clone()))
        .with_poll_interval(Duration::from_millis(10));
    let (handle, task) = dispatcher.start().await.unwrap();

    wait_until_drained(&index, Duration::from_secs(5)).await;
    assert_eq!(log.run_order(), vec!["orphan"]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: attempt counters and due times written by a retry survive a restart.
#[tokio::test]
async fn test_retry_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let first_log = JobLog::new();

    {
        let index = open(&path).await;
        let dispatcher =
            Dispatcher::new(Arc::clone(&index), ScriptedJob::factories(first_log.clone()))
                .with_poll_interval(Duration::from_millis(10));
        let (handle, task) = dispatcher.start().await.unwrap();

        handle
            .enqueue_one(ScriptedJob::spec_with_backoff(
                "flaky",
                1,
                &[Step::Transient, Step::Succeed],
                Duration::from_secs(60),
            ))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let spec = index.get_job_spec(&JobId::new("flaky")).await;
                if spec.is_some_and(|s| s.run_attempt == 1 && !s.is_running) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first attempt was not recorded");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        index.storage().close().await;
    }
    assert_eq!(first_log.runs_of("flaky"), 1);

    let index = open(&path).await;
    let stored = index.get_job_spec(&JobId::new("flaky")).await.unwrap();
    assert_eq!(stored.run_attempt, 1);
    assert!(stored.next_run_attempt_time > now_millis());

    // Make the retry due without touching the attempt counter.
    index
        .update_jobs(vec![JobSpec {
            next_run_attempt_time: 0,
            ..stored
        }])
        .await
        .unwrap();

    let second_log = JobLog::new();
    let dispatcher = Dispatcher::new(Arc::clone(&index), ScriptedJob::factories(second_log.clone()))
        .with_poll_interval(Duration::from_millis(10));
    let (handle, task) = dispatcher.start().await.unwrap();

    wait_until_drained(&index, Duration::from_secs(5)).await;
    assert_eq!(second_log.entries(), vec![LogEntry::Ran(JobId::new("flaky"), 1)]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
