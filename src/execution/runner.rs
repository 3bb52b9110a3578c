//! Applies the outcome of one job attempt to the index.
//!
//! The `JobRunner` owns the state machine of a dispatched job:
//! - Success deletes the spec
//! - Retry bumps the attempt counter and pushes the due time out by the
//!   job's backoff, unless attempts are used up
//! - Failure and fatal failure delete the spec, which releases every job
//!   waiting on it. With failure cascading enabled the dependents are
//!   deleted too, and `on_failure` runs on each one that can still be decoded
//!
//! Lifespan expiry and undecodable specs are handled before the job runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::core::factory::JobFactories;
use crate::core::job::{Job, JobResult};
use crate::core::retry::BackoffPolicy;
use crate::core::spec::JobSpec;
use crate::core::types::{JobId, now_millis};
use crate::events::{EventBus, JobEvent};
use crate::index::{IndexError, JobIndex};
use crate::storage::JobStorage;

/// Runs dispatched jobs and records their outcome.
pub struct JobRunner<S: JobStorage + ?Sized> {
    index: Arc<JobIndex<S>>,
    factories: Arc<JobFactories>,
    event_bus: Arc<EventBus>,
    default_backoff: BackoffPolicy,
    cascade_failures: bool,
}

impl<S: JobStorage + ?Sized> Clone for JobRunner<S> {
    fn clone(&self) -> Self {
        Self {
            index: Arc::clone(&self.index),
            factories: Arc::clone(&self.factories),
            event_bus: Arc::clone(&self.event_bus),
            default_backoff: self.default_backoff.clone(),
            cascade_failures: self.cascade_failures,
        }
    }
}

impl<S: JobStorage + ?Sized + 'static> JobRunner<S> {
    pub fn new(index: Arc<JobIndex<S>>, factories: Arc<JobFactories>) -> Self {
        Self {
            index,
            factories,
            event_bus: Arc::new(EventBus::new()),
            default_backoff: BackoffPolicy::default(),
            cascade_failures: false,
        }
    }

    /// Backoff for jobs that do not choose their own.
    pub fn with_default_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.default_backoff = policy;
        self
    }

    /// Also delete every transitive dependent of a terminally failed job.
    ///
    /// Off by default: a failed job is deleted alone and its dependents
    /// become eligible once their edges to it are scrubbed.
    pub fn with_cascade_failures(mut self, cascade: bool) -> Self {
        self.cascade_failures = cascade;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn index(&self) -> &Arc<JobIndex<S>> {
        &self.index
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run one attempt of a job that is already marked running.
    ///
    /// The job runs on its own task so a panic surfaces as a fatal failure
    /// instead of tearing down the caller.
    pub async fn execute(&self, spec: JobSpec) -> Result<JobResult, IndexError> {
        if spec.is_past_lifespan(now_millis()) {
            tracing::warn!(job_id = %spec.id, lifespan = spec.lifespan, "Job outlived its lifespan");
            self.fail(&spec, None, false, "lifespan expired").await?;
            return Ok(JobResult::Failure);
        }

        let job = match self.factories.create(&spec) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(job_id = %spec.id, factory_key = %spec.factory_key, error = %err, "Failed to decode job");
                self.fail(&spec, None, true, err.to_string()).await?;
                return Ok(JobResult::FatalFailure);
            }
        };

        self.event_bus
            .emit(JobEvent::started(spec.id.clone(), spec.run_attempt))
            .await;
        tracing::debug!(job_id = %spec.id, run_attempt = spec.run_attempt, "Running job");

        let start = Instant::now();
        let (job, result) = run_isolated(job).await;
        let elapsed = start.elapsed();

        match result {
            JobResult::Success => {
                self.index.delete_job(&spec.id).await?;
                tracing::info!(job_id = %spec.id, elapsed_ms = elapsed.as_millis() as u64, "Job succeeded");
                self.event_bus
                    .emit(JobEvent::succeeded(spec.id.clone(), elapsed))
                    .await;
                Ok(JobResult::Success)
            }
            JobResult::Retry => match job {
                Some(job) => self.retry(&spec, job).await,
                None => {
                    self.fail(&spec, None, true, "job lost after retry").await?;
                    Ok(JobResult::FatalFailure)
                }
            },
            JobResult::Failure => {
                self.fail(&spec, job, false, "job failed").await?;
                Ok(JobResult::Failure)
            }
            JobResult::FatalFailure => {
                let reason = if job.is_some() { "job hit a defect" } else { "job panicked" };
                self.fail(&spec, job, true, reason).await?;
                Ok(JobResult::FatalFailure)
            }
        }
    }

    async fn retry(&self, spec: &JobSpec, job: Box<dyn Job>) -> Result<JobResult, IndexError> {
        let attempt = spec.run_attempt.saturating_add(1);
        if spec.attempts_exhausted(attempt) {
            tracing::warn!(job_id = %spec.id, attempt, max_attempts = spec.max_attempts, "Job ran out of attempts");
            self.fail(spec, Some(job), false, "attempts exhausted").await?;
            return Ok(JobResult::Failure);
        }

        let serialized_data = match job.serialize() {
            Ok(Some(data)) => data,
            Ok(None) => spec.serialized_data.clone(),
            Err(err) => {
                tracing::error!(job_id = %spec.id, error = %err, "Failed to serialize job for retry");
                self.fail(spec, Some(job), true, err.to_string()).await?;
                return Ok(JobResult::FatalFailure);
            }
        };

        let policy = job
            .backoff_policy()
            .unwrap_or_else(|| self.default_backoff.clone());
        let next_run_attempt_time =
            policy.next_run_attempt_time(now_millis(), attempt, spec.max_backoff);

        self.index
            .update_job_after_retry(&spec.id, false, attempt, next_run_attempt_time, serialized_data)
            .await?;
        self.event_bus
            .emit(JobEvent::retrying(
                spec.id.clone(),
                attempt,
                spec.max_attempts,
                next_run_attempt_time,
            ))
            .await;
        Ok(JobResult::Retry)
    }

    /// Drop a job for good.
    ///
    /// `job` is the live instance, if one survived; otherwise the spec is
    /// decoded again so its failure hook still runs. Jobs that waited on it
    /// are released, or deleted with it when failures cascade.
    pub async fn fail(
        &self,
        spec: &JobSpec,
        job: Option<Box<dyn Job>>,
        fatal: bool,
        reason: impl Into<String>,
    ) -> Result<(), IndexError> {
        let reason = reason.into();

        let mut dependents = Vec::new();
        if self.cascade_failures {
            let mut seen: HashSet<JobId> = HashSet::from([spec.id.clone()]);
            for edge in self.index.get_dependency_specs_that_depend_on_job(&spec.id).await {
                if !seen.insert(edge.job_id.clone()) {
                    continue;
                }
                if let Some(dependent) = self.index.get_job_spec(&edge.job_id).await {
                    dependents.push(dependent);
                }
            }
        }

        let mut ids = vec![spec.id.clone()];
        ids.extend(dependents.iter().map(|d| d.id.clone()));
        self.index.delete_jobs(&ids).await?;

        let job = job.or_else(|| self.factories.create(spec).ok());
        if let Some(mut job) = job {
            job.on_failure().await;
        }
        if fatal {
            tracing::error!(job_id = %spec.id, reason = %reason, cancelled = dependents.len(), "Job failed fatally");
        } else {
            tracing::warn!(job_id = %spec.id, reason = %reason, cancelled = dependents.len(), "Job failed");
        }
        self.event_bus
            .emit(JobEvent::failed(spec.id.clone(), fatal, reason))
            .await;

        for dependent in dependents {
            match self.factories.create(&dependent) {
                Ok(mut job) => job.on_failure().await,
                Err(err) => {
                    tracing::warn!(job_id = %dependent.id, error = %err, "Skipping failure hook of undecodable dependent");
                }
            }
            self.event_bus
                .emit(JobEvent::cancelled(dependent.id, spec.id.clone()))
                .await;
        }
        Ok(())
    }
}

/// Aborts the wrapped task when dropped.
///
/// Aborting the attempt that awaits a job must stop the job itself.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a job on its own task. A panic yields no job and a fatal failure.
async fn run_isolated(mut job: Box<dyn Job>) -> (Option<Box<dyn Job>>, JobResult) {
    let mut handle = AbortOnDrop(tokio::spawn(async move {
        let result = job.run().await;
        (job, result)
    }));

    match (&mut handle.0).await {
        Ok((job, result)) => (Some(job), result),
        Err(err) => {
            if err.is_panic() {
                tracing::error!("Job panicked");
            } else {
                tracing::error!(error = %err, "Job task was cancelled");
            }
            (None, JobResult::FatalFailure)
        }
    }
}
