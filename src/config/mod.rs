//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for global settings and for
//! batches of jobs to enqueue.

mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::{GlobalConfig, JobBatchConfig, JobEntryConfig, StorageConfig, YamlLoader};
