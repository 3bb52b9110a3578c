//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::RwLock;

use super::{JobStorage, StorageError, StoredJobs};
use crate::core::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};

#[derive(Default)]
struct Tables {
    jobs: Vec<JobSpec>,
    constraints: Vec<ConstraintSpec>,
    dependencies: Vec<DependencySpec>,
}

/// In-memory storage backend.
///
/// All three tables sit behind one RwLock so multi-table writes are atomic.
/// Data is not persisted across restarts, but an `Arc<InMemoryStorage>`
/// shared between two indexes behaves like a store surviving a restart.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    async fn load_all(&self) -> Result<StoredJobs, StorageError> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut job_specs = tables.jobs.clone();
        job_specs.sort_by_key(|j| j.create_time);
        Ok(StoredJobs {
            job_specs,
            constraint_specs: tables.constraints.clone(),
            dependency_specs: tables.dependencies.clone(),
        })
    }

    async fn insert_jobs(&self, full_specs: &[FullSpec]) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;

        let mut ids: HashSet<&JobId> = tables.jobs.iter().map(|j| &j.id).collect();
        for full in full_specs {
            if !ids.insert(full.id()) {
                return Err(StorageError::DuplicateKey(format!("job: {}", full.id())));
            }
        }

        for full in full_specs {
            tables.jobs.push(full.job_spec.clone());
            tables.constraints.extend(full.constraint_specs.iter().cloned());
            tables.dependencies.extend(full.dependency_specs.iter().cloned());
        }
        Ok(())
    }

    async fn update_job_running_state(
        &self,
        id: &JobId,
        is_running: bool,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job.is_running = is_running;
        Ok(())
    }

    async fn update_job_after_retry(
        &self,
        id: &JobId,
        is_running: bool,
        run_attempt: i32,
        next_run_attempt_time: Timestamp,
        serialized_data: &[u8],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job.is_running = is_running;
        job.run_attempt = run_attempt;
        job.next_run_attempt_time = next_run_attempt_time;
        job.serialized_data = serialized_data.to_vec();
        Ok(())
    }

    async fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        for job in tables.jobs.iter_mut() {
            job.is_running = false;
        }
        Ok(())
    }

    async fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        for spec in specs {
            if let Some(job) = tables.jobs.iter_mut().find(|j| j.id == spec.id) {
                *job = spec.clone();
            }
        }
        Ok(())
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let ids: HashSet<&JobId> = ids.iter().collect();
        tables.jobs.retain(|j| !ids.contains(&j.id));
        tables.constraints.retain(|c| !ids.contains(&c.job_id));
        tables
            .dependencies
            .retain(|d| !ids.contains(&d.job_id) && !ids.contains(&d.depends_on_job_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(id: &str, create_time: Timestamp) -> FullSpec {
        FullSpec::new(JobSpec::new(id, "Test").with_create_time(create_time))
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let storage = InMemoryStorage::new();
        let specs = vec![
            full("b", 2).with_constraint("Network"),
            full("a", 1),
            full("c", 3).depends_on("a"),
        ];

        storage.insert_jobs(&specs).await.unwrap();
        let stored = storage.load_all().await.unwrap();

        let ids: Vec<&str> = stored.job_specs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(stored.constraint_specs, vec![ConstraintSpec::new("b", "Network")]);
        assert_eq!(stored.dependency_specs, vec![DependencySpec::new("c", "a")]);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected_atomically() {
        let storage = InMemoryStorage::new();
        storage.insert_jobs(&[full("a", 1)]).await.unwrap();

        let result = storage.insert_jobs(&[full("b", 2), full("a", 3)]).await;

        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert_eq!(storage.load_all().await.unwrap().job_specs.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_is_rejected() {
        let storage = InMemoryStorage::new();
        let result = storage.insert_jobs(&[full("a", 1), full("a", 2)]).await;

        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert!(storage.load_all().await.unwrap().job_specs.is_empty());
    }

    #[tokio::test]
    async fn test_update_running_state_not_found() {
        let storage = InMemoryStorage::new();
        let result = storage
            .update_job_running_state(&JobId::new("missing"), true)
            .await;

        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_after_retry() {
        let storage = InMemoryStorage::new();
        storage.insert_jobs(&[full("a", 1)]).await.unwrap();
        storage
            .update_job_running_state(&JobId::new("a"), true)
            .await
            .unwrap();

        storage
            .update_job_after_retry(&JobId::new("a"), false, 2, 5_000, b"progress")
            .await
            .unwrap();

        let job = &storage.load_all().await.unwrap().job_specs[0];
        assert!(!job.is_running);
        assert_eq!(job.run_attempt, 2);
        assert_eq!(job.next_run_attempt_time, 5_000);
        assert_eq!(job.serialized_data, b"progress".to_vec());
    }

    #[tokio::test]
    async fn test_delete_cascades_rows() {
        let storage = InMemoryStorage::new();
        storage
            .insert_jobs(&[
                full("a", 1).with_constraint("Network"),
                full("b", 2).depends_on("a"),
                full("c", 3).depends_on("b"),
            ])
            .await
            .unwrap();

        storage.delete_jobs(&[JobId::new("a")]).await.unwrap();
        let stored = storage.load_all().await.unwrap();

        assert_eq!(stored.job_specs.len(), 2);
        assert!(stored.constraint_specs.is_empty());
        assert_eq!(stored.dependency_specs, vec![DependencySpec::new("c", "b")]);
    }

    #[tokio::test]
    async fn test_update_jobs_ignores_unknown_ids() {
        let storage = InMemoryStorage::new();
        storage.insert_jobs(&[full("a", 1)]).await.unwrap();

        let updated = JobSpec::new("a", "Test")
            .with_create_time(1)
            .with_max_attempts(9);
        let unknown = JobSpec::new("z", "Test");
        storage.update_jobs(&[updated, unknown]).await.unwrap();

        let stored = storage.load_all().await.unwrap();
        assert_eq!(stored.job_specs.len(), 1);
        assert_eq!(stored.job_specs[0].max_attempts, 9);
    }
}
