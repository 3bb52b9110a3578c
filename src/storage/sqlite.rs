//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{JobStorage, StorageError, StoredJobs};
use crate::core::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

type JobRow = (
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    Vec<u8>,
    bool,
);

fn row_to_job_spec(row: JobRow) -> JobSpec {
    JobSpec {
        id: JobId::new(row.0),
        factory_key: row.1,
        queue_key: row.2,
        create_time: row.3,
        next_run_attempt_time: row.4,
        run_attempt: row.5 as i32,
        max_attempts: row.6 as i32,
        max_backoff: row.7,
        max_instances: row.8 as i32,
        lifespan: row.9,
        serialized_data: row.10,
        is_running: row.11,
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

#[async_trait]
impl JobStorage for SqliteStorage {
    async fn load_all(&self) -> Result<StoredJobs, StorageError> {
        let jobs: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, factory_key, queue_key, create_time, next_run_attempt_time, run_attempt,
                   max_attempts, max_backoff, max_instances, lifespan, serialized_data, is_running
            FROM job_spec ORDER BY create_time, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let constraints: Vec<(String, String)> =
            sqlx::query_as("SELECT job_spec_id, factory_key FROM constraint_spec ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        let dependencies: Vec<(String, String)> = sqlx::query_as(
            "SELECT job_spec_id, depends_on_job_spec_id FROM dependency_spec ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(StoredJobs {
            job_specs: jobs.into_iter().map(row_to_job_spec).collect(),
            constraint_specs: constraints
                .into_iter()
                .map(|(job_id, key)| ConstraintSpec::new(job_id, key))
                .collect(),
            dependency_specs: dependencies
                .into_iter()
                .map(|(job_id, depends_on)| DependencySpec::new(job_id, depends_on))
                .collect(),
        })
    }

    async fn insert_jobs(&self, full_specs: &[FullSpec]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for full in full_specs {
            let job = &full.job_spec;
            let result = sqlx::query(
                r#"
                INSERT INTO job_spec (id, factory_key, queue_key, create_time, next_run_attempt_time,
                    run_attempt, max_attempts, max_backoff, max_instances, lifespan, serialized_data,
                    is_running)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.id.as_str())
            .bind(&job.factory_key)
            .bind(&job.queue_key)
            .bind(job.create_time)
            .bind(job.next_run_attempt_time)
            .bind(job.run_attempt as i64)
            .bind(job.max_attempts as i64)
            .bind(job.max_backoff)
            .bind(job.max_instances as i64)
            .bind(job.lifespan)
            .bind(&job.serialized_data)
            .bind(job.is_running)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
                }
                Err(e) => return Err(db_error(e)),
            }

            for constraint in &full.constraint_specs {
                sqlx::query("INSERT INTO constraint_spec (job_spec_id, factory_key) VALUES (?, ?)")
                    .bind(constraint.job_id.as_str())
                    .bind(&constraint.factory_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
            }

            for dependency in &full.dependency_specs {
                sqlx::query(
                    "INSERT INTO dependency_spec (job_spec_id, depends_on_job_spec_id) VALUES (?, ?)",
                )
                .bind(dependency.job_id.as_str())
                .bind(dependency.depends_on_job_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            }
        }

        tx.commit().await.map_err(db_error)
    }

    async fn update_job_running_state(
        &self,
        id: &JobId,
        is_running: bool,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE job_spec SET is_running = ? WHERE id = ?")
            .bind(is_running)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
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
        let result = sqlx::query(
            r#"
            UPDATE job_spec
            SET is_running = ?, run_attempt = ?, next_run_attempt_time = ?, serialized_data = ?
            WHERE id = ?
            "#,
        )
        .bind(is_running)
        .bind(run_attempt as i64)
        .bind(next_run_attempt_time)
        .bind(serialized_data)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn update_all_jobs_to_be_pending(&self) -> Result<(), StorageError> {
        sqlx::query("UPDATE job_spec SET is_running = 0")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn update_jobs(&self, specs: &[JobSpec]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for job in specs {
            sqlx::query(
                r#"
                UPDATE job_spec
                SET factory_key = ?, queue_key = ?, create_time = ?, next_run_attempt_time = ?,
                    run_attempt = ?, max_attempts = ?, max_backoff = ?, max_instances = ?,
                    lifespan = ?, serialized_data = ?, is_running = ?
                WHERE id = ?
                "#,
            )
            .bind(&job.factory_key)
            .bind(&job.queue_key)
            .bind(job.create_time)
            .bind(job.next_run_attempt_time)
            .bind(job.run_attempt as i64)
            .bind(job.max_attempts as i64)
            .bind(job.max_backoff)
            .bind(job.max_instances as i64)
            .bind(job.lifespan)
            .bind(&job.serialized_data)
            .bind(job.is_running)
            .bind(job.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for id in ids {
            sqlx::query("DELETE FROM job_spec WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            sqlx::query("DELETE FROM constraint_spec WHERE job_spec_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            sqlx::query(
                "DELETE FROM dependency_spec WHERE job_spec_id = ? OR depends_on_job_spec_id = ?",
            )
            .bind(id.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)
    }
}
