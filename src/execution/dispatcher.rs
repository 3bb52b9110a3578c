//! Dispatch loop feeding eligible jobs to a bounded worker pool.
//!
//! The `Dispatcher` wakes on a poll interval, on enqueue, and whenever a job
//! finishes. Each wake-up it asks the index for eligible jobs, skips those
//! whose constraints are unmet, marks the rest running and spawns them while
//! worker permits remain. It is controlled through a [`DispatcherHandle`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use super::runner::JobRunner;
use crate::core::constraint::Constraints;
use crate::core::factory::JobFactories;
use crate::core::job::JobResult;
use crate::core::retry::BackoffPolicy;
use crate::core::spec::{FullSpec, UNLIMITED};
use crate::core::types::now_millis;
use crate::events::{EventBus, JobEvent};
use crate::index::{IndexError, JobIndex};
use crate::storage::JobStorage;

/// Buffer size for the command channel between DispatcherHandle and Dispatcher.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Errors surfaced by the dispatcher and its handle.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Index or storage error.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Enqueueing would exceed the factory's `max_instances`.
    #[error("too many instances of {factory_key} (max {max_instances})")]
    TooManyInstances {
        factory_key: String,
        max_instances: i32,
    },

    /// The dispatcher is gone.
    #[error("channel error: {0}")]
    ChannelError(String),
}

pub(crate) enum DispatchCommand {
    Enqueue {
        specs: Vec<FullSpec>,
        response: oneshot::Sender<Result<(), DispatchError>>,
    },
    Wake,
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Handle for controlling a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    command_tx: mpsc::Sender<DispatchCommand>,
}

impl DispatcherHandle {
    /// Persist a batch of jobs and wake the dispatcher.
    pub async fn enqueue(&self, specs: Vec<FullSpec>) -> Result<(), DispatchError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(DispatchCommand::Enqueue {
                specs,
                response: response_tx,
            })
            .await
            .map_err(|_| DispatchError::ChannelError("failed to send enqueue command".into()))?;

        response_rx
            .await
            .map_err(|_| DispatchError::ChannelError("failed to receive enqueue response".into()))?
    }

    pub async fn enqueue_one(&self, spec: impl Into<FullSpec>) -> Result<(), DispatchError> {
        self.enqueue(vec![spec.into()]).await
    }

    /// Re-evaluate eligibility now, e.g. after a constraint changed.
    pub async fn wake(&self) -> Result<(), DispatchError> {
        self.command_tx
            .send(DispatchCommand::Wake)
            .await
            .map_err(|_| DispatchError::ChannelError("failed to send wake command".into()))
    }

    /// Stop dispatching and wait for in-flight jobs.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(DispatchCommand::Shutdown {
                response: response_tx,
            })
            .await
            .map_err(|_| DispatchError::ChannelError("failed to send shutdown command".into()))?;

        response_rx
            .await
            .map_err(|_| DispatchError::ChannelError("failed to receive shutdown response".into()))
    }
}

/// Polls the index and runs eligible jobs.
pub struct Dispatcher<S: JobStorage + ?Sized> {
    runner: JobRunner<S>,
    constraints: Arc<Constraints>,
    max_workers: usize,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl<S: JobStorage + ?Sized + 'static> Dispatcher<S> {
    pub fn new(index: Arc<JobIndex<S>>, factories: JobFactories) -> Self {
        Self {
            runner: JobRunner::new(index, Arc::new(factories)),
            constraints: Arc::new(Constraints::new()),
            max_workers: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = Arc::new(constraints);
        self
    }

    /// Set the number of jobs allowed to run at once. Zero is treated as one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how long shutdown waits for in-flight jobs.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Backoff for jobs that do not choose their own.
    pub fn with_default_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.runner = self.runner.with_default_backoff(policy);
        self
    }

    /// Delete the dependents of a terminally failed job along with it.
    pub fn with_cascade_failures(mut self, cascade: bool) -> Self {
        self.runner = self.runner.with_cascade_failures(cascade);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.runner = self.runner.with_event_bus(event_bus);
        self
    }

    pub fn index(&self) -> &Arc<JobIndex<S>> {
        self.runner.index()
    }

    /// Reconcile jobs left running by a previous process, then start the loop.
    pub async fn start(self) -> Result<(DispatcherHandle, JoinHandle<()>), DispatchError> {
        self.index().update_all_jobs_to_be_pending().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = DispatcherHandle { command_tx };

        tracing::info!(
            max_workers = self.max_workers,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Dispatcher started"
        );
        let task = tokio::spawn(async move {
            self.run(command_rx).await;
        });

        Ok((handle, task))
    }

    async fn run(self, mut command_rx: mpsc::Receiver<DispatchCommand>) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let notify = Arc::new(Notify::new());
        let mut in_flight: JoinSet<Result<JobResult, IndexError>> = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = notify.notified() => {}
                command = command_rx.recv() => match command {
                    Some(DispatchCommand::Enqueue { specs, response }) => {
                        let _ = response.send(self.enqueue(specs).await);
                    }
                    Some(DispatchCommand::Wake) => {}
                    Some(DispatchCommand::Shutdown { response }) => {
                        self.drain(&mut in_flight).await;
                        let _ = response.send(());
                        break;
                    }
                    None => {
                        self.drain(&mut in_flight).await;
                        break;
                    }
                },
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_finished(joined);
            }
            self.dispatch_ready(&semaphore, &notify, &mut in_flight).await;
        }

        tracing::info!("Dispatcher stopped");
    }

    async fn enqueue(&self, specs: Vec<FullSpec>) -> Result<(), DispatchError> {
        let index = self.index();

        let mut batch_counts: std::collections::HashMap<&str, usize> = Default::default();
        for full in &specs {
            let spec = &full.job_spec;
            let in_batch = batch_counts.entry(spec.factory_key.as_str()).or_default();
            *in_batch += 1;
            if spec.max_instances == UNLIMITED {
                continue;
            }
            let stored = index.get_job_instance_count(&spec.factory_key).await;
            if stored + *in_batch > spec.max_instances.max(0) as usize {
                tracing::info!(
                    factory_key = %spec.factory_key,
                    max_instances = spec.max_instances,
                    "Already at max instance count"
                );
                return Err(DispatchError::TooManyInstances {
                    factory_key: spec.factory_key.clone(),
                    max_instances: spec.max_instances,
                });
            }
        }

        let enqueued: Vec<JobEvent> = specs
            .iter()
            .map(|f| JobEvent::enqueued(f.id().clone(), f.job_spec.factory_key.clone()))
            .collect();
        index.insert_jobs(specs).await?;

        for event in enqueued {
            self.runner.event_bus().emit(event).await;
        }
        Ok(())
    }

    async fn dispatch_ready(
        &self,
        semaphore: &Arc<Semaphore>,
        notify: &Arc<Notify>,
        in_flight: &mut JoinSet<Result<JobResult, IndexError>>,
    ) {
        let index = self.index();
        let pending = index
            .get_pending_jobs_with_no_dependencies_in_created_order(now_millis())
            .await;

        for spec in pending {
            let constraint_specs = index.get_constraint_specs(&spec.id).await;
            let unmet = self.constraints.unmet(&constraint_specs);
            if !unmet.is_empty() {
                tracing::debug!(job_id = %spec.id, unmet = ?unmet, "Constraints not met");
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };

            if let Err(err) = index.update_job_running_state(&spec.id, true).await {
                tracing::warn!(job_id = %spec.id, error = %err, "Failed to mark job running");
                continue;
            }

            let runner = self.runner.clone();
            let notify = Arc::clone(notify);
            in_flight.spawn(async move {
                let _permit = permit;
                let result = runner.execute(spec.with_running(true)).await;
                notify.notify_one();
                result
            });
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<Result<JobResult, IndexError>>) {
        if in_flight.is_empty() {
            return;
        }
        tracing::info!(running = in_flight.len(), "Waiting for running jobs");

        let wait = async {
            while let Some(joined) = in_flight.join_next().await {
                log_finished(joined);
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, wait).await.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                "Shutdown timeout exceeded, aborting running jobs"
            );
            in_flight.abort_all();
        }
    }
}

fn log_finished(joined: Result<Result<JobResult, IndexError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(result)) => tracing::debug!(?result, "Job attempt finished"),
        Ok(Err(err)) => tracing::error!(error = %err, "Failed to record job outcome"),
        Err(err) => tracing::error!(error = %err, "Job worker crashed"),
    }
}
