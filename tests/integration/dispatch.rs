//! Dispatcher scenarios: failure cascades, migrations, worker limits and
//! queue ordering, observed through the job log and lifecycle events.

use crate::common::wait_until_drained;
use jobline::testing::{JobLog, RecordingHandler, ScriptedJob, Step};
use jobline::{
    Dispatcher, EventBus, FullSpec, InMemoryStorage, JobEvent, JobIndex, MIGRATION_QUEUE_KEY,
    QueueOrdering, YamlLoader, now_millis,
};
use std::sync::Arc;
use std::time::Duration;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    index: Arc<JobIndex<InMemoryStorage>>,
    log: JobLog,
    recorder: Arc<RecordingHandler>,
}

impl Harness {
    async fn new(ordering: QueueOrdering) -> (Self, Dispatcher<InMemoryStorage>) {
        let index = JobIndex::init(Arc::new(InMemoryStorage::new()))
            .await
            .unwrap()
            .with_queue_ordering(ordering);
        let index = Arc::new(index);
        let log = JobLog::new();
        let recorder = Arc::new(RecordingHandler::new());
        let event_bus = Arc::new(EventBus::new());
        event_bus.register(recorder.clone()).await;

        let dispatcher = Dispatcher::new(Arc::clone(&index), ScriptedJob::factories(log.clone()))
            .with_poll_interval(Duration::from_millis(10))
            .with_event_bus(event_bus);

        (
            Self {
                index,
                log,
                recorder,
            },
            dispatcher,
        )
    }

    /// Started/Succeeded events as `("started", id)` pairs, in order.
    async fn run_events(&self) -> Vec<(&'static str, String)> {
        self.recorder
            .events()
            .await
            .into_iter()
            .filter_map(|event| match event {
                JobEvent::Started { job_id, .. } => Some(("started", job_id.to_string())),
                JobEvent::Succeeded { job_id, .. } => Some(("succeeded", job_id.to_string())),
                _ => None,
            })
            .collect()
    }
}

/// Test: a permanent failure deletes only the failed job and releases its dependents.
#[tokio::test]
async fn test_failure_releases_dependents() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::default()).await;
    let (handle, task) = dispatcher.start().await.unwrap();

    handle
        .enqueue(vec![
            ScriptedJob::spec("a", 1, &[Step::Permanent]).into(),
            FullSpec::new(ScriptedJob::spec("b", 2, &[Step::Succeed])).depends_on("a"),
            FullSpec::new(ScriptedJob::spec("c", 3, &[Step::Succeed])).depends_on("b"),
        ])
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(harness.log.run_order(), vec!["a", "b", "c"]);
    assert_eq!(harness.log.failed(), vec!["a"]);

    let events = harness.recorder.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Failed { job_id, fatal: false, .. } if job_id.as_str() == "a"
    )));
    assert!(!events.iter().any(|e| matches!(e, JobEvent::Cancelled { .. })));
}

/// Test: with cascading enabled, every transitive dependent is cancelled with the failed job.
#[tokio::test]
async fn test_cascading_failure_cancels_dependents() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::default()).await;
    let (handle, task) = dispatcher
        .with_cascade_failures(true)
        .start()
        .await
        .unwrap();

    handle
        .enqueue(vec![
            ScriptedJob::spec("a", 1, &[Step::Permanent]).into(),
            FullSpec::new(ScriptedJob::spec("b", 2, &[Step::Succeed])).depends_on("a"),
            FullSpec::new(ScriptedJob::spec("c", 3, &[Step::Succeed])).depends_on("b"),
        ])
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(harness.log.run_order(), vec!["a"]);
    let mut failed = harness.log.failed();
    assert_eq!(failed.first().map(String::as_str), Some("a"));
    failed.sort();
    assert_eq!(failed, vec!["a", "b", "c"]);

    let mut cancelled: Vec<String> = harness
        .recorder
        .events()
        .await
        .iter()
        .filter_map(|e| match e {
            JobEvent::Cancelled {
                job_id,
                failed_dependency,
                ..
            } => {
                assert_eq!(failed_dependency.as_str(), "a");
                Some(job_id.to_string())
            }
            _ => None,
        })
        .collect();
    cancelled.sort();
    assert_eq!(cancelled, vec!["b", "c"]);
}

/// Test: a migration job runs before older jobs that were enqueued alongside it.
#[tokio::test]
async fn test_migration_runs_before_everything_else() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::default()).await;
    let (handle, task) = dispatcher.start().await.unwrap();

    handle
        .enqueue(vec![
            ScriptedJob::spec("old", 1, &[Step::Succeed]).into(),
            ScriptedJob::spec("other", 2, &[Step::Succeed])
                .with_queue("Q")
                .into(),
            ScriptedJob::spec("migrate", 5, &[Step::SucceedAfter { millis: 30 }])
                .with_queue(MIGRATION_QUEUE_KEY)
                .into(),
        ])
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let order = harness.log.run_order();
    assert_eq!(order.first().map(String::as_str), Some("migrate"));
    assert_eq!(order.len(), 3);
}

/// Test: with a single worker, no job starts before the previous one finished.
#[tokio::test]
async fn test_single_worker_runs_jobs_serially() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::default()).await;
    let (handle, task) = dispatcher.with_max_workers(1).start().await.unwrap();

    handle
        .enqueue(
            ["x", "y", "z"]
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    FullSpec::from(ScriptedJob::spec(
                        *id,
                        i as i64 + 1,
                        &[Step::SucceedAfter { millis: 15 }],
                    ))
                })
                .collect(),
        )
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let expected: Vec<(&str, String)> = ["x", "y", "z"]
        .iter()
        .flat_map(|id| [("started", id.to_string()), ("succeeded", id.to_string())])
        .collect();
    assert_eq!(harness.run_events().await, expected);
}

/// Test: by default a queue's next member waits for the head to finish.
#[tokio::test]
async fn test_queue_head_finishes_before_next_starts() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::RunToCompletion).await;
    let (handle, task) = dispatcher.with_max_workers(2).start().await.unwrap();

    handle
        .enqueue(vec![
            ScriptedJob::spec("j1", 1, &[Step::SucceedAfter { millis: 50 }])
                .with_queue("Q")
                .into(),
            ScriptedJob::spec("j2", 2, &[Step::Succeed])
                .with_queue("Q")
                .into(),
        ])
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let started: Vec<(String, std::time::Instant)> = harness
        .recorder
        .events()
        .await
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::Started {
                job_id, timestamp, ..
            } => Some((job_id.to_string(), timestamp)),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0].0, "j1");
    assert_eq!(started[1].0, "j2");
    assert!(started[1].1.duration_since(started[0].1) >= Duration::from_millis(50));
}

/// Test: pipelined queues let the next member start while the head is still running.
#[tokio::test]
async fn test_pipelined_queue_overlaps_members() {
    let (harness, dispatcher) = Harness::new(QueueOrdering::Pipelined).await;
    let (handle, task) = dispatcher.with_max_workers(2).start().await.unwrap();

    handle
        .enqueue(vec![
            ScriptedJob::spec("j1", 1, &[Step::SucceedAfter { millis: 200 }])
                .with_queue("Q")
                .into(),
            ScriptedJob::spec("j2", 2, &[Step::Succeed])
                .with_queue("Q")
                .into(),
        ])
        .await
        .unwrap();

    wait_until_drained(&harness.index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let events = harness.run_events().await;
    let position = |entry: (&'static str, &str)| {
        events
            .iter()
            .position(|(kind, id)| *kind == entry.0 && id == entry.1)
            .unwrap()
    };
    assert!(position(("succeeded", "j2")) < position(("succeeded", "j1")));
}

/// Test: a dispatcher assembled from YAML configuration runs a YAML batch.
#[tokio::test]
async fn test_configured_dispatcher_runs_yaml_batch() {
    let config = YamlLoader::parse_global_config(
        r#"
max_workers: 1
poll_interval_ms: 10
queue_ordering: run_to_completion
default_backoff:
  type: fixed
  delay: 0
"#,
    )
    .unwrap();
    let batch = YamlLoader::parse_job_batch(
        r#"
jobs:
  - id: fetch
    factory: Scripted
    queue: sync
    max_attempts: 2
    data:
      steps:
        - type: transient
        - type: succeed
  - id: report
    factory: Scripted
    depends_on: [fetch]
"#,
    )
    .unwrap();

    let index = JobIndex::init(Arc::new(InMemoryStorage::new()))
        .await
        .unwrap()
        .with_queue_ordering(config.queue_ordering());
    let index = Arc::new(index);
    let log = JobLog::new();
    let dispatcher = Dispatcher::new(Arc::clone(&index), ScriptedJob::factories(log.clone()))
        .with_max_workers(config.max_workers())
        .with_poll_interval(config.poll_interval())
        .with_shutdown_timeout(config.shutdown_timeout())
        .with_default_backoff(config.default_backoff())
        .with_cascade_failures(config.cascade_failures());
    let (handle, task) = dispatcher.start().await.unwrap();

    handle
        .enqueue(batch.to_full_specs(now_millis()).unwrap())
        .await
        .unwrap();

    wait_until_drained(&index, DRAIN_TIMEOUT).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(log.run_order(), vec!["fetch", "fetch", "report"]);
    assert!(log.failed().is_empty());
}
