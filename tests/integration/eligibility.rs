//! Eligibility scenarios driven through the public index API.

use crate::common::eligible_ids;
use jobline::{
    DependencySpec, FullSpec, InMemoryStorage, IndexError, JobId, JobIndex, JobSpec,
    MIGRATION_QUEUE_KEY, QueueOrdering,
};
use std::sync::Arc;

fn job(id: &str, create_time: i64) -> JobSpec {
    JobSpec::new(id, "Sync").with_create_time(create_time)
}

async fn index(ordering: QueueOrdering) -> JobIndex<InMemoryStorage> {
    JobIndex::init(Arc::new(InMemoryStorage::new()))
        .await
        .unwrap()
        .with_queue_ordering(ordering)
}

/// Test: a running head keeps its queue closed until the head is deleted.
#[tokio::test]
async fn test_queue_runs_to_completion_by_default() {
    let index = index(QueueOrdering::default()).await;
    index
        .insert_jobs(vec![
            job("j1", 1).with_queue("Q").into(),
            job("j2", 2).with_queue("Q").into(),
        ])
        .await
        .unwrap();

    assert_eq!(eligible_ids(&index).await, vec!["j1"]);

    index.update_job_running_state(&JobId::new("j1"), true).await.unwrap();
    assert!(eligible_ids(&index).await.is_empty());

    index.delete_job(&JobId::new("j1")).await.unwrap();
    assert_eq!(eligible_ids(&index).await, vec!["j2"]);
}

/// Test: with pipelined queues the next member is handed out once the head is dispatched.
#[tokio::test]
async fn test_pipelined_queue_scenario() {
    let index = index(QueueOrdering::Pipelined).await;
    index
        .insert_jobs(vec![
            job("j1", 1).with_queue("Q").into(),
            job("j2", 2).with_queue("Q").into(),
        ])
        .await
        .unwrap();

    assert_eq!(eligible_ids(&index).await, vec!["j1"]);

    index.update_job_running_state(&JobId::new("j1"), true).await.unwrap();
    assert_eq!(eligible_ids(&index).await, vec!["j2"]);
}

/// Test: at most one member per queue is eligible, for any mix of queues.
#[tokio::test]
async fn test_one_eligible_member_per_queue() {
    let index = index(QueueOrdering::default()).await;
    let mut specs = Vec::new();
    for i in 0..30 {
        let queue = ["A", "B", "C"][i % 3];
        specs.push(FullSpec::from(job(&format!("{}{}", queue, i), 100 - i as i64).with_queue(queue)));
    }
    index.insert_jobs(specs).await.unwrap();

    let eligible = eligible_ids(&index).await;
    assert_eq!(eligible, vec!["C29", "B28", "A27"]);
}

/// Test: dependencies block regardless of due time, and deletion releases them.
#[tokio::test]
async fn test_dependency_blocks_until_target_deleted() {
    let index = index(QueueOrdering::default()).await;
    index
        .insert_jobs(vec![
            job("upload", 1).with_next_run_attempt_time(i64::MAX).into(),
            FullSpec::new(job("notify", 2)).depends_on("upload"),
        ])
        .await
        .unwrap();

    assert!(eligible_ids(&index).await.is_empty());

    index.delete_job(&JobId::new("upload")).await.unwrap();
    assert_eq!(eligible_ids(&index).await, vec!["notify"]);
    assert!(index.get_dependency_specs_for_job(&JobId::new("notify")).await.is_empty());
}

/// Test: deleting a job scrubs every edge that names it.
#[tokio::test]
async fn test_delete_scrubs_edges_everywhere() {
    let index = index(QueueOrdering::default()).await;
    index
        .insert_jobs(vec![
            job("a", 1).into(),
            job("b", 2).into(),
            FullSpec::new(job("c", 3)).depends_on("a").depends_on("b"),
            FullSpec::new(job("d", 4)).depends_on("a"),
        ])
        .await
        .unwrap();

    index.delete_job(&JobId::new("a")).await.unwrap();

    assert!(index.get_job_spec(&JobId::new("a")).await.is_none());
    assert_eq!(
        index.get_dependency_specs_for_job(&JobId::new("c")).await,
        vec![DependencySpec::new("c", "b")]
    );
    assert!(index.get_dependency_specs_for_job(&JobId::new("d")).await.is_empty());
    assert!(index
        .get_dependency_specs_that_depend_on_job(&JobId::new("a"))
        .await
        .is_empty());
}

/// Test: a migration job starves every other job until it is gone.
#[tokio::test]
async fn test_migration_precedence() {
    let index = index(QueueOrdering::default()).await;
    index
        .insert_jobs(vec![
            job("early", 1).into(),
            job("migrate", 5).with_queue(MIGRATION_QUEUE_KEY).into(),
            job("late", 9).with_queue("Q").into(),
        ])
        .await
        .unwrap();

    assert_eq!(eligible_ids(&index).await, vec!["migrate"]);

    index.update_job_running_state(&JobId::new("migrate"), true).await.unwrap();
    assert!(eligible_ids(&index).await.is_empty());

    index.delete_job(&JobId::new("migrate")).await.unwrap();
    assert_eq!(eligible_ids(&index).await, vec!["early", "late"]);
}

/// Test: a batch closing a dependency loop is refused as a whole.
#[tokio::test]
async fn test_cycle_across_batches_is_rejected() {
    let index = index(QueueOrdering::default()).await;
    index
        .insert_jobs(vec![FullSpec::new(job("b", 2)).depends_on("a")])
        .await
        .unwrap();

    let result = index
        .insert_jobs(vec![
            job("unrelated", 1).into(),
            FullSpec::new(job("a", 3)).depends_on("b"),
        ])
        .await;

    assert!(matches!(result, Err(IndexError::DependencyCycle(_))));
    assert_eq!(index.get_all_job_specs().await.len(), 1);
}
