//! YAML configuration parsing.
//!
//! Parses global settings (`jobline.yaml`) and job batch files from YAML.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::retry::BackoffPolicy;
use crate::core::spec::{FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};
use crate::index::QueueOrdering;

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Global configuration (jobline.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Storage configuration.
    pub storage: Option<StorageConfig>,
    /// Maximum number of jobs running at once.
    pub max_workers: Option<usize>,
    /// How often the dispatcher re-checks the index without being woken.
    pub poll_interval_ms: Option<u64>,
    /// How long shutdown waits for running jobs.
    pub shutdown_timeout_ms: Option<u64>,
    /// How a running queue head is treated.
    pub queue_ordering: Option<QueueOrdering>,
    /// Backoff for jobs that do not pick their own.
    pub default_backoff: Option<BackoffPolicy>,
    /// Delete the dependents of a terminally failed job instead of releasing them.
    pub cascade_failures: Option<bool>,
}

impl GlobalConfig {
    pub fn storage(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_timeout_ms
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        )
    }

    pub fn queue_ordering(&self) -> QueueOrdering {
        self.queue_ordering.unwrap_or_default()
    }

    pub fn default_backoff(&self) -> BackoffPolicy {
        self.default_backoff.clone().unwrap_or_default()
    }

    pub fn cascade_failures(&self) -> bool {
        self.cascade_failures.unwrap_or(false)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// A batch of jobs to enqueue together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobBatchConfig {
    pub jobs: Vec<JobEntryConfig>,
}

/// One job in a batch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntryConfig {
    /// Job id. Generated when omitted.
    pub id: Option<String>,
    /// Factory key of the decoder that runs the job.
    pub factory: String,
    /// Queue key.
    pub queue: Option<String>,
    pub max_attempts: Option<i32>,
    pub max_backoff_ms: Option<i64>,
    pub max_instances: Option<i32>,
    pub lifespan_ms: Option<i64>,
    /// Delay before the first attempt.
    pub delay_ms: Option<i64>,
    /// Names of constraints that must hold before the job runs.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Ids of jobs (in this batch or already stored) to run after.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Payload, stored as JSON.
    pub data: Option<serde_yaml::Value>,
}

impl JobBatchConfig {
    /// Build the specs for this batch, all created at `now`.
    pub fn to_full_specs(&self, now: Timestamp) -> Result<Vec<FullSpec>, ConfigError> {
        self.jobs.iter().map(|entry| entry.to_full_spec(now)).collect()
    }
}

impl JobEntryConfig {
    pub fn to_full_spec(&self, now: Timestamp) -> Result<FullSpec, ConfigError> {
        let id = match &self.id {
            Some(id) => JobId::new(id.clone()),
            None => JobId::generate(),
        };

        let serialized_data = match &self.data {
            Some(value) => serde_json::to_vec(value).map_err(|source| ConfigError::PayloadError {
                job: id.to_string(),
                source,
            })?,
            None => Vec::new(),
        };

        let mut spec = JobSpec::new(id, self.factory.clone())
            .with_create_time(now)
            .with_next_run_attempt_time(now.saturating_add(self.delay_ms.unwrap_or(0)))
            .with_data(serialized_data);
        if let Some(queue) = &self.queue {
            spec = spec.with_queue(queue.clone());
        }
        if let Some(max_attempts) = self.max_attempts {
            spec = spec.with_max_attempts(max_attempts);
        }
        if let Some(max_backoff) = self.max_backoff_ms {
            spec = spec.with_max_backoff(max_backoff);
        }
        if let Some(max_instances) = self.max_instances {
            spec = spec.with_max_instances(max_instances);
        }
        if let Some(lifespan) = self.lifespan_ms {
            spec = spec.with_lifespan(lifespan);
        }

        let mut full = FullSpec::new(spec);
        for constraint in &self.constraints {
            full = full.with_constraint(constraint.clone());
        }
        for dependency in &self.depends_on {
            full = full.depends_on(dependency.clone());
        }
        Ok(full)
    }
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_global_config(&content)
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Load a job batch from a file.
    pub fn load_job_batch(path: impl AsRef<Path>) -> Result<JobBatchConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_job_batch(&content)
    }

    /// Parse a job batch from a YAML string.
    pub fn parse_job_batch(yaml: &str) -> Result<JobBatchConfig, ConfigError> {
        let batch: JobBatchConfig = serde_yaml::from_str(yaml)?;
        Self::validate_job_batch(&batch)?;
        Ok(batch)
    }

    fn validate_global_config(config: &GlobalConfig) -> Result<(), ConfigError> {
        if config.max_workers == Some(0) {
            return Err(ConfigError::InvalidConfig("max_workers cannot be zero".into()));
        }
        if config.poll_interval_ms == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "poll_interval_ms cannot be zero".into(),
            ));
        }
        if let Some(StorageConfig::Sqlite { path }) = &config.storage
            && path.trim().is_empty()
        {
            return Err(ConfigError::MissingField("storage.path".into()));
        }
        if let Some(BackoffPolicy::Exponential {
            multiplier, jitter, ..
        }) = &config.default_backoff
        {
            if *multiplier < 1.0 {
                return Err(ConfigError::InvalidConfig(
                    "default_backoff.multiplier must be at least 1".into(),
                ));
            }
            if !(0.0..=1.0).contains(jitter) {
                return Err(ConfigError::InvalidConfig(
                    "default_backoff.jitter must be between 0 and 1".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_job_batch(batch: &JobBatchConfig) -> Result<(), ConfigError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for entry in &batch.jobs {
            if entry.factory.is_empty() {
                return Err(ConfigError::MissingField("factory".into()));
            }
            if entry.max_attempts == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{}' has max_attempts of zero",
                    entry.id.as_deref().unwrap_or(&entry.factory)
                )));
            }
            if let Some(id) = entry.id.as_deref()
                && !ids.insert(id)
            {
                return Err(ConfigError::InvalidConfig(format!("duplicate job id: {}", id)));
            }
        }

        for entry in &batch.jobs {
            let mut seen_deps = HashSet::new();
            for dep in &entry.depends_on {
                if entry.id.as_deref() == Some(dep.as_str()) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "job '{}' cannot depend on itself",
                        dep
                    )));
                }
                if !seen_deps.insert(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "job '{}' has duplicate dependency '{}'",
                        entry.id.as_deref().unwrap_or(&entry.factory),
                        dep
                    )));
                }
            }
        }

        Self::validate_no_cycles(batch)
    }

    /// Reject batches whose dependencies among named jobs form a cycle.
    ///
    /// Dependencies on ids outside the batch are left to the index.
    fn validate_no_cycles(batch: &JobBatchConfig) -> Result<(), ConfigError> {
        let named: Vec<(&str, &Vec<String>)> = batch
            .jobs
            .iter()
            .filter_map(|e| e.id.as_deref().map(|id| (id, &e.depends_on)))
            .collect();

        let ids: HashSet<&str> = named.iter().map(|(id, _)| *id).collect();
        let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
        let mut reverse_deps: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in &named {
            for dep in deps.iter().filter(|d| ids.contains(d.as_str())) {
                *in_degree.entry(*id).or_default() += 1;
                reverse_deps.entry(dep.as_str()).or_default().push(*id);
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited_count = 0;

        while let Some(id) = queue.pop_front() {
            visited_count += 1;
            if let Some(downstream) = reverse_deps.get(id) {
                for next in downstream {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if visited_count != named.len() {
            let mut cycle_jobs: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            cycle_jobs.sort_unstable();
            return Err(ConfigError::InvalidConfig(format!(
                "dependency cycle detected involving jobs: {}",
                cycle_jobs.join(", ")
            )));
        }
        Ok(())
    }
}
