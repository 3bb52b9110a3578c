//! Job lifecycle events and event handling.
//!
//! The dispatcher and runner emit a [`JobEvent`] at every state transition so
//! callers can observe progress without polling the index.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobId, Timestamp};

/// Lifecycle events emitted while jobs move through the scheduler.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A batch containing this job was persisted.
    Enqueued {
        job_id: JobId,
        factory_key: String,
        timestamp: Instant,
    },

    /// A job was marked running and handed to a worker.
    Started {
        job_id: JobId,
        /// Zero-based attempt number.
        run_attempt: i32,
        timestamp: Instant,
    },

    /// A job finished successfully and was deleted.
    Succeeded {
        job_id: JobId,
        duration: Duration,
        timestamp: Instant,
    },

    /// A job will run again once `next_run_attempt_time` has passed.
    Retrying {
        job_id: JobId,
        /// Attempts made so far, including the one that just failed.
        attempt: i32,
        max_attempts: i32,
        next_run_attempt_time: Timestamp,
        timestamp: Instant,
    },

    /// A job was dropped after a terminal failure.
    Failed {
        job_id: JobId,
        /// True when the failure came from a defect rather than the job's own
        /// retry decision.
        fatal: bool,
        reason: String,
        timestamp: Instant,
    },

    /// A job was dropped because something it depended on failed.
    Cancelled {
        job_id: JobId,
        failed_dependency: JobId,
        timestamp: Instant,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            JobEvent::Enqueued { timestamp, .. } => *timestamp,
            JobEvent::Started { timestamp, .. } => *timestamp,
            JobEvent::Succeeded { timestamp, .. } => *timestamp,
            JobEvent::Retrying { timestamp, .. } => *timestamp,
            JobEvent::Failed { timestamp, .. } => *timestamp,
            JobEvent::Cancelled { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Enqueued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => job_id,
        }
    }

    pub fn enqueued(job_id: JobId, factory_key: impl Into<String>) -> Self {
        JobEvent::Enqueued {
            job_id,
            factory_key: factory_key.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn started(job_id: JobId, run_attempt: i32) -> Self {
        JobEvent::Started {
            job_id,
            run_attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn succeeded(job_id: JobId, duration: Duration) -> Self {
        JobEvent::Succeeded {
            job_id,
            duration,
            timestamp: Instant::now(),
        }
    }

    pub fn retrying(
        job_id: JobId,
        attempt: i32,
        max_attempts: i32,
        next_run_attempt_time: Timestamp,
    ) -> Self {
        JobEvent::Retrying {
            job_id,
            attempt,
            max_attempts,
            next_run_attempt_time,
            timestamp: Instant::now(),
        }
    }

    pub fn failed(job_id: JobId, fatal: bool, reason: impl Into<String>) -> Self {
        JobEvent::Failed {
            job_id,
            fatal,
            reason: reason.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn cancelled(job_id: JobId, failed_dependency: JobId) -> Self {
        JobEvent::Cancelled {
            job_id,
            failed_dependency,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &JobEvent);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: JobEvent) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
