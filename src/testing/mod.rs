//! Testing utilities for users of the jobline library.
//!
//! - [`ScriptedJob`]: a job whose outcome per attempt is stored in its payload
//! - [`JobLog`]: shared record of what scripted jobs did
//! - [`FlakyStorage`]: a storage wrapper whose writes can be made to fail
//! - [`RecordingHandler`]: an event handler that keeps every event

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::factory::{JobData, JobFactories};
use crate::core::job::{Job, JobError, Parameters};
use crate::core::retry::BackoffPolicy;
use crate::core::spec::{FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};
use crate::events::{EventHandler, JobEvent};
use crate::storage::{JobStorage, StorageError, StoredJobs};

/// Factory key scripted jobs register under.
pub const SCRIPTED_FACTORY_KEY: &str = "Scripted";

/// What a scripted job does on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Succeed,
    /// Sleep, then succeed.
    SucceedAfter { millis: u64 },
    Transient,
    Permanent,
    Defect,
    Panic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Script {
    steps: Vec<Step>,
    #[serde(default)]
    backoff_ms: u64,
}

/// Something a scripted job did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// `on_run` started for this attempt.
    Ran(JobId, i32),
    /// A `SucceedAfter` step finished sleeping.
    Woke(JobId),
    /// `on_failure` was called.
    FailureHook(JobId),
}

/// Shared, cloneable log of scripted job activity.
#[derive(Debug, Clone, Default)]
pub struct JobLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl JobLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: LogEntry) {
        self.entries.lock().expect("lock poisoned").push(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("lock poisoned").clone()
    }

    /// Ids of jobs in the order their attempts started.
    pub fn run_order(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Ran(id, _) => Some(id.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Number of attempts started for `id`.
    pub fn runs_of(&self, id: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| matches!(e, LogEntry::Ran(job_id, _) if job_id.as_str() == id))
            .count()
    }

    /// Ids whose `on_failure` hook ran.
    pub fn failed(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::FailureHook(id) => Some(id.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Whether a `SucceedAfter` step of `id` got past its sleep.
    pub fn woke(&self, id: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| matches!(e, LogEntry::Woke(job_id) if job_id.as_str() == id))
    }
}

/// A job that follows a script stored in its own payload.
///
/// Attempt `n` performs `steps[n]`; attempts past the end of the script
/// succeed. Because the script lives in the payload, a job rebuilt after a
/// restart carries on where it left off.
///
/// # Example
///
/// ```
/// use jobline::testing::{JobLog, ScriptedJob, Step};
///
/// let log = JobLog::new();
/// let factories = ScriptedJob::factories(log.clone());
/// let spec = ScriptedJob::spec("flaky", 1, &[Step::Transient, Step::Succeed]);
///
/// assert!(factories.create(&spec).is_ok());
/// assert_eq!(spec.max_attempts, 2);
/// ```
pub struct ScriptedJob {
    params: Parameters,
    script: Script,
    log: JobLog,
}

impl ScriptedJob {
    /// A spec for a scripted job allowed one attempt per step.
    pub fn spec(id: impl Into<JobId>, create_time: Timestamp, steps: &[Step]) -> JobSpec {
        Self::spec_with_backoff(id, create_time, steps, Duration::ZERO)
    }

    /// Like [`ScriptedJob::spec`] with a fixed retry delay.
    pub fn spec_with_backoff(
        id: impl Into<JobId>,
        create_time: Timestamp,
        steps: &[Step],
        backoff: Duration,
    ) -> JobSpec {
        let script = Script {
            steps: steps.to_vec(),
            backoff_ms: backoff.as_millis() as u64,
        };
        let data = JobData::encode(&script).unwrap_or_default();
        JobSpec::new(id, SCRIPTED_FACTORY_KEY)
            .with_create_time(create_time)
            .with_max_attempts(steps.len().max(1) as i32)
            .with_data(data)
    }

    /// A full spec that always succeeds.
    pub fn succeeding(id: impl Into<JobId>, create_time: Timestamp) -> FullSpec {
        Self::spec(id, create_time, &[Step::Succeed]).into()
    }

    /// A registry with the scripted decoder installed.
    pub fn factories(log: JobLog) -> JobFactories {
        JobFactories::new().with(
            SCRIPTED_FACTORY_KEY,
            move |params: Parameters, data: &[u8]| -> Result<Box<dyn Job>, JobError> {
                let script: Option<Script> = JobData::decode(data)?;
                Ok(Box::new(ScriptedJob {
                    params,
                    script: script.unwrap_or_default(),
                    log: log.clone(),
                }))
            },
        )
    }

    fn current_step(&self) -> Step {
        usize::try_from(self.params.run_attempt)
            .ok()
            .and_then(|n| self.script.steps.get(n).copied())
            .unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    async fn on_run(&mut self) -> Result<(), JobError> {
        self.log
            .push(LogEntry::Ran(self.params.id.clone(), self.params.run_attempt));

        match self.current_step() {
            Step::Succeed => Ok(()),
            Step::SucceedAfter { millis } => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                self.log.push(LogEntry::Woke(self.params.id.clone()));
                Ok(())
            }
            Step::Transient => Err(JobError::Transient("scripted transient error".into())),
            Step::Permanent => Err(JobError::Permanent("scripted permanent error".into())),
            Step::Defect => Err(JobError::Defect("scripted defect".into())),
            Step::Panic => panic!("scripted panic in job {}", self.params.id),
        }
    }

    async fn on_failure(&mut self) {
        self.log.push(LogEntry::FailureHook(self.params.id.clone()));
    }

    fn backoff_policy(&self) -> Option<BackoffPolicy> {
        Some(BackoffPolicy::fixed(Duration::from_millis(self.script.backoff_ms)))
    }
}

/// A storage wrapper whose writes can be switched to fail.
///
/// Reads always reach the inner store.
pub struct FlakyStorage<S> {
    inner: S,
    fail_writes: AtomicBool,
}

impl<S: JobStorage> FlakyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self, operation: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Other(format!("injected {} error", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: JobStorage> JobStorage for FlakyStorage<S> {
    async fn load_all(&self) -> Result<StoredJobs, StorageError> {
        self.inner.load_all().await
    }

    async fn insert_jobs(&self, full_specs: &[FullSpec]) -> Result<(), StorageError> {
        self.check("insert_jobs")?;
        self.inner.insert_jobs(full_specs).await
    }

    async fn update_job_running_state(
        &self,
        id: &JobId,
        is_running: bool,
    ) -> Result<(), StorageError> {
        self.check("update_job_running_state")?;
        self.inner.update_job_running_state(id, is_running).await
    }

    async fn update_job_after_retry(
        &self,
        id: &JobId,
        is_running: bool,
        run_attempt: i32,
        next_run_attempt_time: Timestamp,
        serialized_data: &[u8],
    ) -> Result<(), StorageError> {
        self.check("update_job_after_retry")?;
        self.inner
            .update_job_after_retry(
                id,
                is_running,
                run_attempt,
                next_run_attempt_time,
                serialized_data,
            )
            .await
    }

    async fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        self.check("update_all_jobs_to_be_pending")?;
        self.inner.update_all_jobs_to_be_pending().await
    }

    async fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        self.check("update_jobs")?;
        self.inner.update_jobs(specs).await
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), StorageError> {
        self.check("delete_jobs")?;
        self.inner.delete_jobs(ids).await
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<JobEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<JobEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &JobEvent) {
        self.events.lock().await.push(event.clone());
    }
}
