//! Persisted job records.
//!
//! A [`JobSpec`] is the durable description of one unit of background work.
//! [`ConstraintSpec`] and [`DependencySpec`] rows hang off it by job id, and a
//! [`FullSpec`] bundles all three so they can be inserted together.

use serde::{Deserialize, Serialize};

use super::types::{JobId, Timestamp, now_millis};

/// Queue key reserved for migration jobs.
///
/// While any job in this queue exists, nothing else is handed out.
pub const MIGRATION_QUEUE_KEY: &str = "MIGRATION";

/// Sentinel for "no limit" on attempts and instances.
pub const UNLIMITED: i32 = -1;

/// Sentinel lifespan for jobs that never expire.
pub const IMMORTAL: i64 = -1;

/// Default cap on the backoff between two attempts (30 seconds).
pub const DEFAULT_MAX_BACKOFF: i64 = 30_000;

/// Durable description of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier.
    pub id: JobId,
    /// Name of the decoder that rebuilds the job from `serialized_data`.
    pub factory_key: String,
    /// Jobs sharing a queue key run one at a time in creation order.
    pub queue_key: Option<String>,
    /// When the job was enqueued.
    pub create_time: Timestamp,
    /// Earliest time the job may be dispatched.
    pub next_run_attempt_time: Timestamp,
    /// Number of attempts already made.
    pub run_attempt: i32,
    /// Maximum number of attempts, or [`UNLIMITED`].
    pub max_attempts: i32,
    /// Upper bound for the delay between attempts, in milliseconds.
    pub max_backoff: i64,
    /// Maximum number of specs with this factory key, or [`UNLIMITED`].
    pub max_instances: i32,
    /// How long after creation the job may still run, or [`IMMORTAL`].
    pub lifespan: i64,
    /// Job-type-defined payload.
    pub serialized_data: Vec<u8>,
    /// Whether the job has been handed to a worker.
    pub is_running: bool,
}

impl JobSpec {
    /// Create a spec that is due immediately and may run once.
    pub fn new(id: impl Into<JobId>, factory_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            factory_key: factory_key.into(),
            queue_key: None,
            create_time: now_millis(),
            next_run_attempt_time: 0,
            run_attempt: 0,
            max_attempts: 1,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_instances: UNLIMITED,
            lifespan: IMMORTAL,
            serialized_data: Vec::new(),
            is_running: false,
        }
    }

    /// Set the queue key.
    pub fn with_queue(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = Some(queue_key.into());
        self
    }

    /// Set the creation time.
    pub fn with_create_time(mut self, create_time: Timestamp) -> Self {
        self.create_time = create_time;
        self
    }

    /// Set the earliest dispatch time.
    pub fn with_next_run_attempt_time(mut self, time: Timestamp) -> Self {
        self.next_run_attempt_time = time;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff cap in milliseconds.
    pub fn with_max_backoff(mut self, max_backoff: i64) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Set the maximum number of instances of this job type.
    pub fn with_max_instances(mut self, max_instances: i32) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Set the lifespan in milliseconds.
    pub fn with_lifespan(mut self, lifespan: i64) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Set the opaque payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.serialized_data = data.into();
        self
    }

    /// Set the running flag.
    pub fn with_running(mut self, running: bool) -> Self {
        self.is_running = running;
        self
    }

    /// Whether this job belongs to the migration queue.
    pub fn is_migration(&self) -> bool {
        self.queue_key.as_deref() == Some(MIGRATION_QUEUE_KEY)
    }

    /// Whether the job may be dispatched at `now` as far as timing goes.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_run_attempt_time <= now
    }

    /// Whether the job outlived its lifespan at `now`.
    pub fn is_past_lifespan(&self, now: Timestamp) -> bool {
        self.lifespan != IMMORTAL && self.create_time.saturating_add(self.lifespan) <= now
    }

    /// Whether `attempts` used up the allowed attempts.
    pub fn attempts_exhausted(&self, attempts: i32) -> bool {
        self.max_attempts != UNLIMITED && attempts >= self.max_attempts
    }
}

/// A named precondition attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub job_id: JobId,
    pub factory_key: String,
}

impl ConstraintSpec {
    pub fn new(job_id: impl Into<JobId>, factory_key: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            factory_key: factory_key.into(),
        }
    }
}

/// `job_id` must not run while `depends_on_job_id` is still stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySpec {
    pub job_id: JobId,
    pub depends_on_job_id: JobId,
}

impl DependencySpec {
    pub fn new(job_id: impl Into<JobId>, depends_on_job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            depends_on_job_id: depends_on_job_id.into(),
        }
    }
}

/// A job spec together with its constraint and dependency rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSpec {
    pub job_spec: JobSpec,
    pub constraint_specs: Vec<ConstraintSpec>,
    pub dependency_specs: Vec<DependencySpec>,
}

impl FullSpec {
    /// Wrap a job spec with no constraints or dependencies.
    pub fn new(job_spec: JobSpec) -> Self {
        Self {
            job_spec,
            constraint_specs: Vec::new(),
            dependency_specs: Vec::new(),
        }
    }

    /// Attach a named constraint.
    pub fn with_constraint(mut self, name: impl Into<String>) -> Self {
        let spec = ConstraintSpec::new(self.job_spec.id.clone(), name);
        self.constraint_specs.push(spec);
        self
    }

    /// Make this job wait for `job_id`.
    pub fn depends_on(mut self, job_id: impl Into<JobId>) -> Self {
        let spec = DependencySpec::new(self.job_spec.id.clone(), job_id);
        self.dependency_specs.push(spec);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.job_spec.id
    }
}

impl From<JobSpec> for FullSpec {
    fn from(job_spec: JobSpec) -> Self {
        Self::new(job_spec)
    }
}
