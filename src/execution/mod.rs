//! Job execution.
//!
//! [`JobRunner`] applies the outcome of a single attempt to the index;
//! [`Dispatcher`] decides when attempts happen and bounds how many run at once.

mod dispatcher;
mod runner;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherHandle};
pub use runner::JobRunner;
