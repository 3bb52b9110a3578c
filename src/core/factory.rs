//! Factory-key registry for rebuilding jobs from stored specs.
//!
//! Each job type registers a decoder under its factory key. The payload
//! encoding belongs to the job type; [`JobData`] offers a serde_json helper
//! so a job type can describe its payload as a plain serde struct.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use super::job::{Job, JobError, Parameters};
use super::spec::JobSpec;

/// Decoder for one job type.
pub trait JobFactory: Send + Sync {
    /// Rebuild a runnable job from its parameters and stored payload.
    fn create(&self, params: Parameters, data: &[u8]) -> Result<Box<dyn Job>, JobError>;
}

impl<F> JobFactory for F
where
    F: Fn(Parameters, &[u8]) -> Result<Box<dyn Job>, JobError> + Send + Sync,
{
    fn create(&self, params: Parameters, data: &[u8]) -> Result<Box<dyn Job>, JobError> {
        self(params, data)
    }
}

/// Registry mapping factory keys to decoders.
#[derive(Clone, Default)]
pub struct JobFactories {
    factories: HashMap<String, Arc<dyn JobFactory>>,
}

impl JobFactories {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder, replacing any previous one for the key.
    pub fn register(&mut self, key: impl Into<String>, factory: impl JobFactory + 'static) {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Builder: register a decoder.
    pub fn with(mut self, key: impl Into<String>, factory: impl JobFactory + 'static) -> Self {
        self.register(key, factory);
        self
    }

    /// Whether a decoder is registered for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered factory keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Rebuild the job described by `spec`.
    pub fn create(&self, spec: &JobSpec) -> Result<Box<dyn Job>, JobError> {
        let factory = self
            .factories
            .get(&spec.factory_key)
            .ok_or_else(|| JobError::UnknownFactory(spec.factory_key.clone()))?;
        factory.create(Parameters::from(spec), &spec.serialized_data)
    }
}

impl std::fmt::Debug for JobFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFactories")
            .field("keys", &self.keys())
            .finish()
    }
}

/// serde_json encoding for job payloads.
pub struct JobData;

impl JobData {
    /// Encode a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, JobError> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode a payload. An empty payload decodes as JSON `null`.
    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, JobError> {
        if data.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(data)?)
    }
}
