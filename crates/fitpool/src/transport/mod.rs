//! Transport adapters
//!
//! This module provides:
//! - [`Transport`] - The uniform contract the scheduler talks to
//! - [`ProcessPoolTransport`] - Worker threads fed through shared queues
//! - [`DistributedTransport`] - Remote engines reached through a [`Cluster`]
//! - [`LocalCluster`] - In-process cluster with tokio engine tasks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PoolScheduler                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Transport
//!              ┌───────────────┴────────────────┐
//!              ▼                                ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │   ProcessPoolTransport    │   │   DistributedTransport<C>     │
//! │  per-worker cmd queues    │   │  direct calls  → RemoteFuture │
//! │  shared job queue (MPMC)  │   │  balanced jobs → RemoteFuture │
//! │  shared result queue      │   │  pending set, reverse scan    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!              │                                │
//!              ▼                                ▼
//!     [thread 0] [thread 1] ...       [engine 0] [engine 1] ...
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Backend;
use crate::protocol::{Job, WorkerCommand, WorkerId, WorkerMessage};

mod cluster;
mod distributed;
mod process_pool;

pub use cluster::{Cluster, EngineRequest, LocalCluster, RemoteFuture, RemoteState};
pub use distributed::DistributedTransport;
pub use process_pool::ProcessPoolTransport;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A queue or channel is closed
    #[error("channel to {0} is closed")]
    ChannelClosed(String),

    /// The worker id is not part of this pool
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// A blocking remote call did not return in time
    #[error("worker {worker} did not answer {command} within {timeout:?}")]
    Timeout {
        worker: WorkerId,
        command: &'static str,
        timeout: Duration,
    },

    /// The load-balanced queue is full
    #[error("job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// A worker thread could not be spawned
    #[error("failed to spawn worker {worker}: {reason}")]
    Spawn { worker: WorkerId, reason: String },

    /// Workers were already started
    #[error("workers are already started")]
    AlreadyStarted,

    /// Worker threads did not exit in time
    #[error("workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// The transport was already shut down
    #[error("transport is already closed")]
    Closed,
}

/// Uniform contract over the worker backends
///
/// Every operation is transport I/O only; interpretation of the returned
/// messages belongs to the scheduler.
#[async_trait]
pub trait Transport: Send {
    /// Backend this transport implements
    fn backend(&self) -> Backend;

    /// Ids of every worker, fixed for the transport lifetime
    fn worker_ids(&self) -> Vec<WorkerId>;

    /// Pool capacity
    fn worker_count(&self) -> usize {
        self.worker_ids().len()
    }

    /// Make every worker start consuming commands
    async fn start_workers(&mut self) -> Result<(), TransportError>;

    /// Send a command to every worker
    async fn broadcast(&mut self, command: WorkerCommand) -> Result<(), TransportError>;

    /// Send a command to one worker; its reply arrives through `drain_results`
    async fn send(&mut self, worker: WorkerId, command: WorkerCommand)
        -> Result<(), TransportError>;

    /// Hand one job to whichever worker the backend picks
    async fn submit_job(&mut self, job: Job) -> Result<(), TransportError>;

    /// Jobs submitted but not yet claimed by a worker
    fn pending_count(&self) -> usize;

    /// Completed messages, plus synthesized failures for jobs older than `timeout`
    async fn drain_results(&mut self, timeout: Duration) -> Vec<WorkerMessage>;

    /// Tell workers to stop and release transport resources
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}
