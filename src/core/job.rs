//! Job trait, outcome and error types.
//!
//! The `Job` trait is the run-once contract every job type implements. The
//! provided [`Job::run`] template turns the outcome of [`Job::on_run`] into a
//! [`JobResult`]; the runner then applies that result against the index.

use async_trait::async_trait;
use thiserror::Error;

use super::retry::BackoffPolicy;
use super::spec::JobSpec;
use super::types::{JobId, Timestamp};

/// Errors raised by jobs and job factories.
#[derive(Debug, Error)]
pub enum JobError {
    /// An expected, temporary condition (network down, remote busy).
    #[error("transient error: {0}")]
    Transient(String),

    /// A condition retrying cannot fix (malformed payload, rejected request).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A programming defect. Never retried.
    #[error("defect: {0}")]
    Defect(String),

    /// No decoder is registered for a factory key.
    #[error("no factory registered for key: {0}")]
    UnknownFactory(String),

    /// The stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    /// Check if this error is considered transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    /// Check if this error indicates a bug rather than a runtime condition.
    pub fn is_defect(&self) -> bool {
        matches!(self, JobError::Defect(_))
    }
}

/// Outcome of one attempt of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    /// Work finished; delete the spec.
    Success,
    /// Try again later; keep the spec with new attempt bookkeeping.
    Retry,
    /// Give up; delete the spec and release dependents.
    Failure,
    /// A defect was hit; give up loudly and never re-enqueue.
    FatalFailure,
}

impl JobResult {
    /// Whether the spec should be deleted after this outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobResult::Retry)
    }

    /// Whether this outcome counts as a failure of the job.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobResult::Failure | JobResult::FatalFailure)
    }
}

/// Scheduling parameters a job is rebuilt with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pub id: JobId,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub create_time: Timestamp,
    pub run_attempt: i32,
    pub max_attempts: i32,
    pub max_backoff: i64,
    pub lifespan: i64,
}

impl From<&JobSpec> for Parameters {
    fn from(spec: &JobSpec) -> Self {
        Self {
            id: spec.id.clone(),
            factory_key: spec.factory_key.clone(),
            queue_key: spec.queue_key.clone(),
            create_time: spec.create_time,
            run_attempt: spec.run_attempt,
            max_attempts: spec.max_attempts,
            max_backoff: spec.max_backoff,
            lifespan: spec.lifespan,
        }
    }
}

/// A runnable unit of background work.
///
/// # Example
///
/// ```ignore
/// use jobline::{Job, JobError, Parameters};
/// use async_trait::async_trait;
///
/// struct PushSendJob {
///     params: Parameters,
///     message_id: u64,
/// }
///
/// #[async_trait]
/// impl Job for PushSendJob {
///     fn parameters(&self) -> &Parameters {
///         &self.params
///     }
///
///     async fn on_run(&mut self) -> Result<(), JobError> {
///         send(self.message_id).await.map_err(|e| JobError::Transient(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// Parameters the job was created or decoded with.
    fn parameters(&self) -> &Parameters;

    /// The work itself.
    async fn on_run(&mut self) -> Result<(), JobError>;

    /// Classify a non-defect error. Default: retry transient errors only.
    fn on_should_retry(&self, error: &JobError) -> bool {
        error.is_transient()
    }

    /// Called once when the job is dropped for good without succeeding.
    async fn on_failure(&mut self) {}

    /// Updated payload to persist on retry. `None` keeps the stored payload.
    fn serialize(&self) -> Result<Option<Vec<u8>>, JobError> {
        Ok(None)
    }

    /// Delay policy used when this job is retried. `None` defers to the
    /// runner's default policy.
    fn backoff_policy(&self) -> Option<BackoffPolicy> {
        None
    }

    fn id(&self) -> &JobId {
        &self.parameters().id
    }

    fn factory_key(&self) -> &str {
        &self.parameters().factory_key
    }

    /// Run one attempt and classify its outcome.
    ///
    /// Not meant to be overridden.
    async fn run(&mut self) -> JobResult {
        match self.on_run().await {
            Ok(()) => JobResult::Success,
            Err(err) if err.is_defect() => {
                tracing::error!(job_id = %self.id(), error = %err, "Job hit a defect");
                JobResult::FatalFailure
            }
            Err(err) => {
                if self.on_should_retry(&err) {
                    tracing::info!(job_id = %self.id(), error = %err, "Job will be retried");
                    JobResult::Retry
                } else {
                    tracing::warn!(job_id = %self.id(), error = %err, "Job failed");
                    JobResult::Failure
                }
            }
        }
    }
}
