//! Durable storage for job, constraint and dependency rows.
//!
//! The index reads a store in bulk exactly once, at initialization, and
//! calls the matching write method before every in-memory mutation.
//! Backends: in-memory (tests, development) and SQLite.

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::core::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Everything a store holds, as read at start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredJobs {
    /// Job specs ordered by creation time.
    pub job_specs: Vec<JobSpec>,
    /// Constraint rows in insertion order.
    pub constraint_specs: Vec<ConstraintSpec>,
    /// Dependency rows in insertion order.
    pub dependency_specs: Vec<DependencySpec>,
}

/// Table storage backing the job index.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Read every row. Only called when an index is initialized.
    async fn load_all(&self) -> Result<StoredJobs, StorageError>;

    /// Insert specs with their constraint and dependency rows, all or nothing.
    ///
    /// Fails with `DuplicateKey` if any job id is already stored.
    async fn insert_jobs(&self, full_specs: &[FullSpec]) -> Result<(), StorageError>;

    /// Set the running flag of one job.
    async fn update_job_running_state(&self, id: &JobId, is_running: bool)
    -> Result<(), StorageError>;

    /// Record a retry: running flag, attempt count, due time and payload.
    async fn update_job_after_retry(
        &self,
        id: &JobId,
        is_running: bool,
        run_attempt: i32,
        next_run_attempt_time: Timestamp,
        serialized_data: &[u8],
    ) -> Result<(), StorageError>;

    /// Clear the running flag of every job.
    async fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError>;

    /// Replace stored specs that share an id with one of `specs`.
    ///
    /// Specs with no stored counterpart are ignored.
    async fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError>;

    /// Delete jobs, their own rows, and every dependency row naming them.
    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: JobStorage + ?Sized> JobStorage for Arc<S> {
    async fn load_all(&self) -> Result<StoredJobs, StorageError> {
        (**self).load_all().await
    }

    async fn insert_jobs(&self, full_specs: &[FullSpec]) -> Result<(), StorageError> {
        (**self).insert_jobs(full_specs).await
    }

    async fn update_job_running_state(
        &self,
        id: &JobId,
        is_running: bool,
    ) -> Result<(), StorageError> {
        (**self).update_job_running_state(id, is_running).await
    }

    async fn update_job_after_retry(
        &self,
        id: &JobId,
        is_running: bool,
        run_attempt: i32,
        next_run_attempt_time: Timestamp,
        serialized_data: &[u8],
    ) -> Result<(), StorageError> {
        (**self)
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
        (**self).update_all_jobs_to_be_pending().await
    }

    async fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        (**self).update_jobs(specs).await
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), StorageError> {
        (**self).delete_jobs(ids).await
    }
}
