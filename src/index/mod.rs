//! Write-through scheduling index over a [`JobStorage`].
//!
//! The index loads every row once in [`JobIndex::init`] and afterwards
//! answers all queries from memory. Each mutation runs inside one lock that
//! covers both the durable write and the memory update: the store is written
//! first, and memory is only touched once that write succeeded, so the two
//! never disagree at any point another caller can observe.

mod state;

pub use state::QueueOrdering;

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};
use crate::storage::{JobStorage, StorageError};
use state::IndexState;

/// Errors that can occur in the job index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No job with this id is indexed.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Inserting the batch would create a dependency cycle through this job.
    #[error("dependency cycle involving job: {0}")]
    DependencyCycle(JobId),
}

/// In-memory mirror of the job tables that decides what may run next.
pub struct JobIndex<S: JobStorage + ?Sized> {
    storage: Arc<S>,
    state: Mutex<IndexState>,
    ordering: QueueOrdering,
}

impl<S: JobStorage + ?Sized> JobIndex<S> {
    /// Build the index from one bulk read of `storage`.
    pub async fn init(storage: Arc<S>) -> Result<Self, IndexError> {
        let stored = storage.load_all().await?;
        tracing::debug!(
            jobs = stored.job_specs.len(),
            constraints = stored.constraint_specs.len(),
            dependencies = stored.dependency_specs.len(),
            "Loaded job index"
        );

        Ok(Self {
            storage,
            state: Mutex::new(IndexState::from_stored(stored)),
            ordering: QueueOrdering::default(),
        })
    }

    /// Set how queue heads are chosen.
    pub fn with_queue_ordering(mut self, ordering: QueueOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn queue_ordering(&self) -> QueueOrdering {
        self.ordering
    }

    /// The backing store.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Persist and index a batch of jobs.
    ///
    /// The batch is rejected as a whole if it would close a dependency cycle
    /// or if the store refuses it.
    pub async fn insert_jobs(&self, full_specs: Vec<FullSpec>) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.find_cycle(&full_specs) {
            tracing::warn!(job_id = %id, "Rejecting jobs that would form a dependency cycle");
            return Err(IndexError::DependencyCycle(id));
        }

        self.storage.insert_jobs(&full_specs).await?;
        tracing::debug!(count = full_specs.len(), "Inserted jobs");
        state.insert(full_specs);
        Ok(())
    }

    /// All indexed specs, oldest first.
    pub async fn get_all_job_specs(&self) -> Vec<JobSpec> {
        let state = self.state.lock().await;
        let mut specs = state.job_specs.clone();
        specs.sort_by_key(|j| j.create_time);
        specs
    }

    pub async fn get_job_spec(&self, id: &JobId) -> Option<JobSpec> {
        self.state.lock().await.get(id).cloned()
    }

    /// A spec together with its constraint and dependency rows.
    pub async fn get_full_spec(&self, id: &JobId) -> Option<FullSpec> {
        let state = self.state.lock().await;
        let job_spec = state.get(id)?.clone();
        Some(FullSpec {
            job_spec,
            constraint_specs: state.constraints_by_job.get(id).cloned().unwrap_or_default(),
            dependency_specs: state.dependencies_by_job.get(id).cloned().unwrap_or_default(),
        })
    }

    /// Jobs that may be handed to a worker at `now`, oldest first.
    ///
    /// While the migration queue holds a job, only its head can be returned.
    /// Otherwise a job qualifies when it is not running, heads its queue,
    /// waits on no stored job, and is due.
    pub async fn get_pending_jobs_with_no_dependencies_in_created_order(
        &self,
        now: Timestamp,
    ) -> Vec<JobSpec> {
        self.state.lock().await.pending_jobs(now, self.ordering)
    }

    /// Number of stored jobs with this factory key.
    pub async fn get_job_instance_count(&self, factory_key: &str) -> usize {
        let state = self.state.lock().await;
        state
            .job_specs
            .iter()
            .filter(|j| j.factory_key == factory_key)
            .count()
    }

    pub async fn get_constraint_specs(&self, id: &JobId) -> Vec<ConstraintSpec> {
        let state = self.state.lock().await;
        state.constraints_by_job.get(id).cloned().unwrap_or_default()
    }

    /// Edges leaving `id`: the jobs it waits for.
    pub async fn get_dependency_specs_for_job(&self, id: &JobId) -> Vec<DependencySpec> {
        let state = self.state.lock().await;
        state.dependencies_by_job.get(id).cloned().unwrap_or_default()
    }

    /// Every edge that directly or transitively waits on `id`.
    pub async fn get_dependency_specs_that_depend_on_job(&self, id: &JobId) -> Vec<DependencySpec> {
        self.state.lock().await.dependents_of(id)
    }

    /// Whether no stored job belongs to any of `queue_keys`.
    pub async fn are_queues_empty(&self, queue_keys: &[&str]) -> bool {
        let keys: HashSet<&str> = queue_keys.iter().copied().collect();
        let state = self.state.lock().await;
        !state
            .job_specs
            .iter()
            .any(|j| j.queue_key.as_deref().is_some_and(|q| keys.contains(q)))
    }

    pub async fn update_job_running_state(
        &self,
        id: &JobId,
        is_running: bool,
    ) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        let current = state
            .get(id)
            .ok_or_else(|| IndexError::NotFound(id.clone()))?;
        let updated = current.clone().with_running(is_running);

        self.storage.update_job_running_state(id, is_running).await?;
        tracing::debug!(job_id = %id, is_running, "Updated running state");
        state.replace(updated);
        Ok(())
    }

    /// Record a retry: new attempt count, due time and payload.
    pub async fn update_job_after_retry(
        &self,
        id: &JobId,
        is_running: bool,
        run_attempt: i32,
        next_run_attempt_time: Timestamp,
        serialized_data: Vec<u8>,
    ) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        let current = state
            .get(id)
            .ok_or_else(|| IndexError::NotFound(id.clone()))?;
        let updated = JobSpec {
            is_running,
            run_attempt,
            next_run_attempt_time,
            serialized_data,
            ..current.clone()
        };

        self.storage
            .update_job_after_retry(
                id,
                is_running,
                run_attempt,
                next_run_attempt_time,
                &updated.serialized_data,
            )
            .await?;
        tracing::debug!(job_id = %id, run_attempt, next_run_attempt_time, "Updated job after retry");
        state.replace(updated);
        Ok(())
    }

    /// Clear every running flag. Attempt counters are left alone.
    pub async fn update_all_jobs_to_be_pending(&self) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        self.storage.update_all_jobs_to_be_pending().await?;

        let running = state.job_specs.iter().filter(|j| j.is_running).count();
        for job in state.job_specs.iter_mut() {
            job.is_running = false;
        }
        tracing::debug!(reset = running, "Reset all jobs to pending");
        Ok(())
    }

    /// Replace indexed specs with the same id. Unknown ids are ignored.
    pub async fn update_jobs(&self, specs: Vec<JobSpec>) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        let known: Vec<JobSpec> = specs.into_iter().filter(|s| state.contains(&s.id)).collect();

        self.storage.update_jobs(&known).await?;
        for spec in known {
            state.replace(spec);
        }
        Ok(())
    }

    pub async fn delete_job(&self, id: &JobId) -> Result<(), IndexError> {
        self.delete_jobs(std::slice::from_ref(id)).await
    }

    /// Delete jobs and release everything that waited on them.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), IndexError> {
        let mut state = self.state.lock().await;
        self.storage.delete_jobs(ids).await?;
        state.remove(ids);
        tracing::debug!(count = ids.len(), "Deleted jobs");
        Ok(())
    }
}
