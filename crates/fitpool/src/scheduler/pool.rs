//! Pool scheduler
//!
//! Drives a [`Transport`] on behalf of a [`Coordinator`]: sets the workers
//! up, throttles submission, interprets every returned message and runs the
//! dispatch loop until the coordinator is done or progress stalls.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::coordinator::SharedCoordinator;
use super::ping::PingTable;
use crate::config::PoolConfig;
use crate::protocol::{AuditRecord, WorkerCommand, WorkerMessage, DEFAULT_MODEL_SLOT};
use crate::transport::{Transport, TransportError};

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The operation needs a coordinator, none is bound
    #[error("no coordinator is bound to the pool")]
    NoCoordinator,

    /// The pool is already bound to a coordinator
    #[error("pool is already prepared with a coordinator")]
    AlreadyPrepared,

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Scheduler over a pool of workers
///
/// # Example
///
/// ```ignore
/// use fitpool::prelude::*;
///
/// let config = PoolConfig::from_env()?;
/// let transport = ProcessPoolTransport::new(&config, |_: WorkerId| MyEngine::default());
/// let mut pool = PoolScheduler::new(transport, config);
///
/// pool.prepare(coordinator::shared(my_coordinator)).await?;
/// pool.run().await;
/// pool.stop().await?;
/// ```
pub struct PoolScheduler<T: Transport> {
    transport: T,
    config: PoolConfig,
    coordinator: Option<SharedCoordinator>,
    pings: PingTable,
    model_slot: String,
    timestep: Duration,
    last_progress: Instant,
    workers_started: bool,
}

impl<T: Transport> PoolScheduler<T> {
    /// Create a scheduler; no worker is started until [`prepare`](Self::prepare)
    pub fn new(transport: T, config: PoolConfig) -> Self {
        Self {
            transport,
            timestep: config.timestep,
            config,
            coordinator: None,
            pings: PingTable::new(),
            model_slot: DEFAULT_MODEL_SLOT.to_string(),
            last_progress: Instant::now(),
            workers_started: false,
        }
    }

    /// Use a different model slot name on the workers
    pub fn with_model_slot(mut self, slot: impl Into<String>) -> Self {
        self.model_slot = slot.into();
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn pings(&self) -> &PingTable {
        &self.pings
    }

    pub fn coordinator(&self) -> Option<&SharedCoordinator> {
        self.coordinator.as_ref()
    }

    /// Current idle interval of the dispatch loop
    pub fn timestep(&self) -> Duration {
        self.timestep
    }

    /// Pool capacity
    pub fn worker_count(&self) -> usize {
        self.transport.worker_count()
    }

    /// Jobs submitted but not yet claimed, as reported by the transport
    pub fn pending_count(&self) -> usize {
        self.transport.pending_count()
    }

    /// Bind the coordinator, start the workers and install the model on them
    #[instrument(skip(self, coordinator), fields(backend = %self.transport.backend()))]
    pub async fn prepare(&mut self, coordinator: SharedCoordinator) -> Result<(), SchedulerError> {
        if self.coordinator.is_some() {
            return Err(SchedulerError::AlreadyPrepared);
        }

        let (snapshot, test, optional) = {
            let c = coordinator.lock();
            (
                c.model_snapshot(),
                c.test_definition(),
                c.optional_component_names(),
            )
        };
        self.coordinator = Some(coordinator);

        self.transport.start_workers().await?;
        self.workers_started = true;

        self.transport
            .broadcast(WorkerCommand::SetupTest(test))
            .await?;
        self.transport
            .broadcast(WorkerCommand::CreateModel {
                snapshot,
                slot: self.model_slot.clone(),
            })
            .await?;
        self.transport
            .broadcast(WorkerCommand::SetOptionalNames(optional))
            .await?;

        info!(
            workers = self.transport.worker_count(),
            slot = %self.model_slot,
            "Workers prepared"
        );
        Ok(())
    }

    /// Re-send the coordinator's current optional component names
    #[instrument(skip(self))]
    pub async fn update_optional_names(&mut self) -> Result<(), SchedulerError> {
        let Some(coordinator) = &self.coordinator else {
            error!("Have to bind a coordinator to the pool first");
            return Err(SchedulerError::NoCoordinator);
        };
        let names = coordinator.lock().optional_component_names();
        debug!(count = names.len(), "Updating optional component names");

        self.transport
            .broadcast(WorkerCommand::SetOptionalNames(names))
            .await?;
        Ok(())
    }

    /// Change the idle interval of the loop and of the workers
    pub async fn set_timestep(&mut self, timestep: Duration) -> Result<(), SchedulerError> {
        self.timestep = timestep;
        if self.workers_started {
            self.transport
                .broadcast(WorkerCommand::ChangeTimestep(timestep))
                .await?;
        }
        Ok(())
    }

    /// Ping every worker, wait the grace period, then collect whatever came back
    #[instrument(skip(self))]
    pub async fn ping_workers(&mut self, timeout: Option<Duration>) -> Result<(), SchedulerError> {
        if self.coordinator.is_none() {
            error!("Have to bind a coordinator to the pool first");
            return Ok(());
        }

        for worker in self.transport.worker_ids() {
            self.pings.mark_sent(worker, Utc::now());
            self.transport.send(worker, WorkerCommand::Ping).await?;
        }

        tokio::time::sleep(self.config.ping_grace).await;
        self.collect_results(timeout).await;

        let unanswered = self.pings.unanswered();
        if !unanswered.is_empty() {
            warn!(?unanswered, "Workers did not answer the ping yet");
        }
        Ok(())
    }

    /// How many jobs to submit now
    ///
    /// Never more than the idle capacity of the pool, never more than the
    /// coordinator's progress allows.
    pub fn jobs_needed(&self) -> usize {
        let Some(coordinator) = &self.coordinator else {
            return 0;
        };
        let metric = coordinator.lock().progress_metric();
        let idle = self
            .transport
            .worker_count()
            .saturating_sub(self.transport.pending_count());
        metric.min(idle)
    }

    /// Request `n` jobs from the coordinator and submit them
    ///
    /// Stops at the first submission failure; jobs submitted before it stay
    /// dispatched. Returns the number of jobs submitted.
    pub async fn add_jobs(&mut self, n: usize) -> Result<usize, SchedulerError> {
        let Some(coordinator) = &self.coordinator else {
            return Err(SchedulerError::NoCoordinator);
        };
        let jobs = coordinator.lock().request_jobs(n);

        let mut submitted = 0;
        for job in jobs {
            debug!(index = %job.index, "Submitting job");
            self.transport.submit_job(job).await?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Interpret one message returned by a worker
    pub fn parse(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Pong {
                worker,
                pid,
                sent_at,
                message,
            } => match self.pings.resolve(worker, pid, sent_at) {
                Some(round_trip) => info!(
                    worker = %worker,
                    pid,
                    ?round_trip,
                    %sent_at,
                    message = %message,
                    "Pong"
                ),
                None => debug!(worker = %worker, pid, "Pong without a pending ping"),
            },
            WorkerMessage::Error {
                worker,
                index,
                message,
            } => match index {
                // The pixel stays in flight; the coordinator decides what to do with it
                Some(index) => error!(
                    worker = %worker,
                    %index,
                    error = %message,
                    "Fit failed in worker"
                ),
                None => error!(worker = %worker, error = %message, "Error in worker"),
            },
            WorkerMessage::Result {
                worker,
                index,
                result,
                is_good,
            } => {
                let Some(coordinator) = &self.coordinator else {
                    warn!(%index, "Result without a coordinator, dropped");
                    return;
                };
                let mut c = coordinator.lock();
                if !c.is_in_flight(&index) {
                    debug!(%index, "Result for a pixel no longer in flight, dropped");
                    return;
                }

                c.clear_in_flight(&index);
                c.update_result(&index, result, is_good);
                c.trigger_plot_refresh();
                c.trigger_checkpoint_save();

                let progress = c.progress_counter();
                if let Some(log) = c.audit_log() {
                    log.push(AuditRecord {
                        index,
                        is_good,
                        progress,
                        worker,
                    });
                }
            }
            WorkerMessage::Failed => {
                error!("Unusual return from some worker, nothing usable came back");
            }
        }
    }

    /// Drain the transport and parse everything; `true` if anything came back
    pub async fn collect_results(&mut self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let messages = self.transport.drain_results(timeout).await;
        let found = !messages.is_empty();
        for message in messages {
            self.parse(message);
        }
        found
    }

    /// Dispatch loop
    ///
    /// Returns once the coordinator has nothing left and nothing in flight,
    /// or once no progress was seen for longer than the configured timeout.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            error!("Have to bind a coordinator to the pool first");
            return;
        };

        self.last_progress = Instant::now();
        loop {
            if self.last_progress.elapsed() > self.config.timeout {
                let c = coordinator.lock();
                warn!(
                    timeout = ?self.config.timeout,
                    remaining = c.remaining_job_count(),
                    in_flight = c.in_flight_count(),
                    "No progress for too long, leaving the dispatch loop"
                );
                break;
            }
            let (remaining, in_flight) = {
                let c = coordinator.lock();
                (c.remaining_job_count(), c.in_flight_count())
            };
            if remaining == 0 && in_flight == 0 {
                debug!("Nothing left to fit");
                break;
            }

            let got_result = self.collect_results(None).await;
            let need = self.jobs_needed();
            if need > 0 {
                if let Err(e) = self.add_jobs(need).await {
                    error!(error = %e, "Failed to submit jobs");
                }
            }

            if need == 0 || !got_result {
                tokio::time::sleep(self.timestep).await;
            } else {
                self.last_progress = Instant::now();
            }
        }
    }

    /// Stop the workers and release the transport
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        self.transport.shutdown().await?;
        info!("Pool stopped");
        Ok(())
    }
}
