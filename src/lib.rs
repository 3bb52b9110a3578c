//! jobline - a durable background-job scheduling engine.
//!
//! Jobs are persisted as [`JobSpec`] rows in a [`JobStorage`] and mirrored by
//! a [`JobIndex`], which decides which jobs may run next: one job at a time
//! per queue key, nothing that waits on a stored job, and nothing at all while
//! a migration job exists. A [`Dispatcher`] runs eligible jobs and a
//! [`JobRunner`] applies each outcome (delete, retry with backoff, or fail
//! together with every dependent).

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod index;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, GlobalConfig, JobBatchConfig, StorageConfig, YamlLoader};
pub use core::constraint::{Constraint, Constraints, FlagConstraint};
pub use core::factory::{JobData, JobFactories, JobFactory};
pub use core::job::{Job, JobError, JobResult, Parameters};
pub use core::retry::BackoffPolicy;
pub use core::spec::{
    ConstraintSpec, DependencySpec, FullSpec, IMMORTAL, JobSpec, MIGRATION_QUEUE_KEY, UNLIMITED,
};
pub use core::types::{JobId, Timestamp, now_millis};
pub use events::{EventBus, EventHandler, JobEvent};
pub use execution::{DispatchError, Dispatcher, DispatcherHandle, JobRunner};
pub use index::{IndexError, JobIndex, QueueOrdering};
#[cfg(any(feature = "sqlite", test))]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, JobStorage, StorageError, StoredJobs};
