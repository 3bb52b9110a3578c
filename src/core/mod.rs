//! Core data model and job contract.

pub mod constraint;
pub mod factory;
pub mod job;
pub mod retry;
pub mod spec;
pub mod types;
