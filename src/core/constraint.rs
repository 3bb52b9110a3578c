//! Named preconditions evaluated at dispatch time.
//!
//! The index only records which constraint names are attached to a job.
//! The dispatcher looks the names up here before handing a job to a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::spec::ConstraintSpec;

/// A precondition such as "network available".
pub trait Constraint: Send + Sync {
    fn is_met(&self) -> bool;
}

/// A constraint toggled from outside, e.g. by a connectivity monitor.
#[derive(Debug, Default)]
pub struct FlagConstraint {
    met: AtomicBool,
}

impl FlagConstraint {
    pub fn new(met: bool) -> Self {
        Self {
            met: AtomicBool::new(met),
        }
    }

    pub fn set(&self, met: bool) {
        self.met.store(met, Ordering::SeqCst);
    }
}

impl Constraint for FlagConstraint {
    fn is_met(&self) -> bool {
        self.met.load(Ordering::SeqCst)
    }
}

/// Registry of constraints by name.
#[derive(Clone, Default)]
pub struct Constraints {
    constraints: HashMap<String, Arc<dyn Constraint>>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constraint, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, constraint: Arc<dyn Constraint>) {
        self.constraints.insert(name.into(), constraint);
    }

    /// Builder: register a constraint.
    pub fn with(mut self, name: impl Into<String>, constraint: Arc<dyn Constraint>) -> Self {
        self.register(name, constraint);
        self
    }

    /// Names of the attached constraints that are unknown or not met.
    ///
    /// An unknown name counts as unmet so a job is never run without its
    /// precondition being checked.
    pub fn unmet<'a>(&self, specs: &'a [ConstraintSpec]) -> Vec<&'a str> {
        specs
            .iter()
            .filter(|spec| {
                self.constraints
                    .get(&spec.factory_key)
                    .map(|c| !c.is_met())
                    .unwrap_or(true)
            })
            .map(|spec| spec.factory_key.as_str())
            .collect()
    }

    /// Whether every attached constraint is registered and met.
    pub fn all_met(&self, specs: &[ConstraintSpec]) -> bool {
        self.unmet(specs).is_empty()
    }
}
