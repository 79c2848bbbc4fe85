//! Process pool transport
//!
//! Workers are long-lived threads, each owning its engine. Every worker has a
//! private command queue; jobs go through one shared multi-consumer queue and
//! every reply lands in one shared result queue.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, instrument, warn};

use super::{Transport, TransportError};
use crate::config::{Backend, PoolConfig};
use crate::protocol::{Job, PixelIndex, WorkerCommand, WorkerId, WorkerMessage};
use crate::worker::{EngineFactory, FitEngine, Worker};

/// Transport over local worker threads
pub struct ProcessPoolTransport<F: EngineFactory> {
    factory: Arc<F>,
    timestep: Duration,
    shutdown_timeout: Duration,
    workers: BTreeMap<WorkerId, Sender<WorkerCommand>>,
    command_rxs: BTreeMap<WorkerId, Receiver<WorkerCommand>>,
    job_tx: Option<Sender<WorkerCommand>>,
    job_rx: Receiver<WorkerCommand>,
    result_tx: Sender<WorkerMessage>,
    result_rx: Receiver<WorkerMessage>,
    handles: Vec<thread::JoinHandle<()>>,
    /// Submitted jobs with no result yet, oldest first
    deadlines: Vec<(PixelIndex, Instant)>,
    started: bool,
}

impl<F: EngineFactory> ProcessPoolTransport<F> {
    /// Create the queues for `config.num_workers` workers
    ///
    /// Nothing runs until [`Transport::start_workers`]; commands sent before
    /// that are queued and applied in order once the workers start.
    pub fn new(config: &PoolConfig, factory: F) -> Self {
        let mut workers = BTreeMap::new();
        let mut command_rxs = BTreeMap::new();
        for i in 0..config.num_workers {
            let (tx, rx) = unbounded();
            workers.insert(WorkerId(i), tx);
            command_rxs.insert(WorkerId(i), rx);
        }

        let (job_tx, job_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();

        Self {
            factory: Arc::new(factory),
            timestep: config.timestep,
            shutdown_timeout: config.shutdown_timeout,
            workers,
            command_rxs,
            job_tx: Some(job_tx),
            job_rx,
            result_tx,
            result_rx,
            handles: Vec::with_capacity(config.num_workers),
            deadlines: Vec::new(),
            started: false,
        }
    }

    /// Messages waiting in the result queue
    pub fn result_queue_len(&self) -> usize {
        self.result_rx.len()
    }

    /// Commands waiting in one worker's queue
    pub fn command_queue_len(&self, worker: WorkerId) -> Option<usize> {
        self.workers.get(&worker).map(|tx| tx.len())
    }

    fn job_sender(&self) -> Result<&Sender<WorkerCommand>, TransportError> {
        self.job_tx.as_ref().ok_or(TransportError::Closed)
    }

    fn clear_deadline(&mut self, index: &PixelIndex) {
        if let Some(pos) = self.deadlines.iter().position(|(i, _)| i == index) {
            self.deadlines.remove(pos);
        }
    }
}

#[async_trait]
impl<F: EngineFactory> Transport for ProcessPoolTransport<F> {
    fn backend(&self) -> Backend {
        Backend::ProcessPool
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    #[instrument(skip(self), fields(workers = self.workers.len()))]
    async fn start_workers(&mut self) -> Result<(), TransportError> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;

        let command_rxs = std::mem::take(&mut self.command_rxs);
        for (id, commands) in command_rxs {
            let factory = Arc::clone(&self.factory);
            let jobs = self.job_rx.clone();
            let results = self.result_tx.clone();
            let timestep = self.timestep;

            let handle = thread::Builder::new()
                .name(format!("fitpool-worker-{}", id))
                .spawn(move || {
                    let worker = Worker::new(id, factory.create(id), timestep);
                    listen(worker, commands, jobs, results);
                })
                .map_err(|e| TransportError::Spawn {
                    worker: id,
                    reason: e.to_string(),
                })?;
            self.handles.push(handle);
        }

        info!(workers = self.handles.len(), "Worker threads started");
        Ok(())
    }

    async fn broadcast(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        debug!(command = command.name(), "Broadcasting");
        for (id, queue) in &self.workers {
            queue
                .send(command.clone())
                .map_err(|_| TransportError::ChannelClosed(format!("worker {}", id)))?;
        }
        Ok(())
    }

    async fn send(
        &mut self,
        worker: WorkerId,
        command: WorkerCommand,
    ) -> Result<(), TransportError> {
        let queue = self
            .workers
            .get(&worker)
            .ok_or(TransportError::UnknownWorker(worker))?;
        queue
            .send(command)
            .map_err(|_| TransportError::ChannelClosed(format!("worker {}", worker)))
    }

    async fn submit_job(&mut self, job: Job) -> Result<(), TransportError> {
        let index = job.index.clone();
        self.job_sender()?
            .send(WorkerCommand::Test(job))
            .map_err(|_| TransportError::ChannelClosed("job queue".into()))?;
        self.deadlines.push((index, Instant::now()));
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.job_rx.len()
    }

    async fn drain_results(&mut self, timeout: Duration) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.result_rx.try_recv() {
            // A fit error answers the job too; the pixel is left to the coordinator.
            match &message {
                WorkerMessage::Result { index, .. }
                | WorkerMessage::Error {
                    index: Some(index), ..
                } => self.clear_deadline(index),
                _ => {}
            }
            messages.push(message);
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        self.deadlines.retain(|(index, submitted_at)| {
            if now.duration_since(*submitted_at) > timeout {
                expired.push(index.clone());
                false
            } else {
                true
            }
        });
        for index in expired {
            info!(%index, ?timeout, "Pixel failed to come back in time, assuming failed");
            messages.push(WorkerMessage::timed_out(index));
        }

        messages
    }

    #[instrument(skip(self))]
    async fn shutdown(&mut self) -> Result<(), TransportError> {
        // A second shutdown would close an already closed pool.
        if self.job_tx.is_none() {
            error!("Process pool is already closed");
            return Err(TransportError::Closed);
        }

        for (id, queue) in &self.workers {
            if queue.send(WorkerCommand::StopListening).is_err() {
                debug!(worker = %id, "Worker queue already closed");
            }
        }
        self.job_tx = None;
        self.deadlines.clear();

        let handles = std::mem::take(&mut self.handles);
        let join = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    error!("Worker thread panicked");
                }
            }
        });

        match tokio::time::timeout(self.shutdown_timeout, join).await {
            Ok(_) => {
                info!("Process pool closed");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Worker threads still busy at shutdown");
                Err(TransportError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }
}

/// Worker thread loop: own commands first, then shared jobs
fn listen<E: FitEngine>(
    mut worker: Worker<E>,
    commands: Receiver<WorkerCommand>,
    jobs: Receiver<WorkerCommand>,
    results: Sender<WorkerMessage>,
) {
    debug!(worker = %worker.id(), "Worker listening");
    loop {
        let command = match commands.try_recv() {
            Ok(command) => command,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => match jobs.recv_timeout(worker.timestep()) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                // Job queue closed: keep serving commands until told to stop.
                Err(RecvTimeoutError::Disconnected) => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            },
        };

        match worker.handle(command) {
            ControlFlow::Break(()) => break,
            ControlFlow::Continue(Some(message)) => {
                if results.send(message).is_err() {
                    break;
                }
            }
            ControlFlow::Continue(None) => {}
        }
    }
    debug!(worker = %worker.id(), "Worker stopped listening");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobParams, ModelSnapshot, TestDefinition};
    use crate::worker::{FitError, FitOutcome};
    use serde_json::json;

    struct EchoEngine;

    impl FitEngine for EchoEngine {
        fn setup_test(&mut self, _test: &TestDefinition) -> Result<(), FitError> {
            Ok(())
        }

        fn create_model(&mut self, _snapshot: &ModelSnapshot, _slot: &str) -> Result<(), FitError> {
            Ok(())
        }

        fn fit(&mut self, index: &PixelIndex, _params: &JobParams) -> Result<FitOutcome, FitError> {
            if index.0.first() == Some(&13) {
                return Err(FitError::Failed("unlucky pixel".into()));
            }
            Ok(FitOutcome {
                result: json!(index.0),
                is_good: true,
            })
        }
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig::default()
            .with_num_workers(workers)
            .with_timestep(Duration::from_millis(1))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn drain_until<F: EngineFactory>(
        transport: &mut ProcessPoolTransport<F>,
        expected: usize,
    ) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        for _ in 0..500 {
            messages.extend(transport.drain_results(Duration::from_secs(60)).await);
            if messages.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        messages
    }

    fn echo(_: WorkerId) -> EchoEngine {
        EchoEngine
    }

    #[tokio::test]
    async fn test_pending_count_is_queue_length() {
        let mut transport = ProcessPoolTransport::new(&config(2), echo);
        assert_eq!(transport.pending_count(), 0);

        for i in 0..3 {
            transport
                .submit_job(Job::new([i, 0], JobParams::new()))
                .await
                .unwrap();
        }
        // Workers not started: every job is still queued
        assert_eq!(transport.pending_count(), 3);
    }

    #[tokio::test]
    async fn test_jobs_round_trip_through_threads() {
        let mut transport = ProcessPoolTransport::new(&config(3), echo);
        transport.start_workers().await.unwrap();

        for i in 0..6 {
            transport
                .submit_job(Job::new([i], JobParams::new()))
                .await
                .unwrap();
        }

        let messages = drain_until(&mut transport, 6).await;
        assert_eq!(messages.len(), 6);
        assert!(messages
            .iter()
            .all(|m| matches!(m, WorkerMessage::Result { worker: Some(_), is_good: true, .. })));
        assert_eq!(transport.pending_count(), 0);

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_reaches_single_worker() {
        let mut transport = ProcessPoolTransport::new(&config(2), echo);
        transport.start_workers().await.unwrap();

        transport.send(WorkerId(1), WorkerCommand::Ping).await.unwrap();
        for _ in 0..500 {
            if transport.result_queue_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.result_queue_len(), 1);
        let messages = transport.drain_results(Duration::from_secs(60)).await;
        assert_eq!(transport.result_queue_len(), 0);
        assert!(matches!(
            messages.as_slice(),
            [WorkerMessage::Pong { worker: WorkerId(1), .. }]
        ));

        let err = transport
            .send(WorkerId(9), WorkerCommand::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownWorker(WorkerId(9))));

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_job_times_out() {
        // Workers never started, so the job can only expire
        let mut transport = ProcessPoolTransport::new(&config(1), echo);
        transport
            .submit_job(Job::new([5, 5], JobParams::new()))
            .await
            .unwrap();

        assert!(transport
            .drain_results(Duration::from_secs(60))
            .await
            .is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let messages = transport.drain_results(Duration::from_millis(10)).await;
        assert_eq!(
            messages,
            vec![WorkerMessage::timed_out(PixelIndex::from([5, 5]))]
        );

        // Expired only once
        assert!(transport
            .drain_results(Duration::from_millis(10))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_fit_error_clears_deadline() {
        let mut transport = ProcessPoolTransport::new(&config(1), echo);
        transport.start_workers().await.unwrap();
        transport
            .submit_job(Job::new([13, 0], JobParams::new()))
            .await
            .unwrap();

        let messages = drain_until(&mut transport, 1).await;
        assert!(matches!(
            messages.as_slice(),
            [WorkerMessage::Error { index: Some(index), .. }] if *index == PixelIndex::from([13, 0])
        ));

        // Answered with an error: nothing left to expire
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport
            .drain_results(Duration::from_millis(10))
            .await
            .is_empty());

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_twice_fails() {
        let mut transport = ProcessPoolTransport::new(&config(2), echo);
        transport.start_workers().await.unwrap();

        transport.shutdown().await.unwrap();
        assert!(matches!(
            transport.shutdown().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport
                .submit_job(Job::new([0], JobParams::new()))
                .await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut transport = ProcessPoolTransport::new(&config(1), echo);
        transport.start_workers().await.unwrap();
        assert!(matches!(
            transport.start_workers().await,
            Err(TransportError::AlreadyStarted)
        ));
        transport.shutdown().await.unwrap();
    }
}
