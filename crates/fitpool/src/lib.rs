//! # fitpool
//!
//! A throttled job scheduler that fans independent per-pixel fits out to a
//! fixed pool of long-lived workers.
//!
//! ## Features
//!
//! - **Two backends, one contract**: local worker threads fed through shared
//!   queues, or remote engines reached through futures
//! - **Throttled submission**: never more jobs than idle workers, never faster
//!   than the coordinator's progress allows
//! - **Timeout-to-failure conversion**: a job that never comes back is handed
//!   to the coordinator as a failed result
//! - **Health checks**: ping/pong round trips and worker pids
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Coordinator                           │
//! │  (picks pixels, consumes results, owns the fitting run)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ request_jobs / update_result
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PoolScheduler                          │
//! │  (setup broadcast, throttling, parse, dispatch loop)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Transport
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      ProcessPoolTransport      │     DistributedTransport     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker<FitEngine>                        │
//! │  (private model copy, applies commands in FIFO order)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use fitpool::prelude::*;
//!
//! let config = PoolConfig::from_env()?;
//! let transport = ProcessPoolTransport::new(&config, |_: WorkerId| MyEngine::default());
//! let mut pool = PoolScheduler::new(transport, config);
//!
//! pool.prepare(fitpool::scheduler::coordinator::shared(my_coordinator)).await?;
//! pool.ping_workers(None).await?;
//! pool.run().await;
//! pool.stop().await?;
//! ```

pub mod config;
pub mod protocol;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{Backend, ConfigError, PoolConfig};
    pub use crate::protocol::{
        AuditRecord, Job, JobParams, ModelSnapshot, PixelIndex, TestDefinition, WorkerCommand,
        WorkerId, WorkerMessage,
    };
    pub use crate::scheduler::{
        Coordinator, PingState, PingTable, PoolScheduler, SchedulerError, SharedCoordinator,
    };
    pub use crate::transport::{
        Cluster, DistributedTransport, LocalCluster, ProcessPoolTransport, Transport,
        TransportError,
    };
    pub use crate::worker::{EngineFactory, FitEngine, FitError, FitOutcome};
}

// Re-export key types at crate root
pub use config::{Backend, ConfigError, PoolConfig};
pub use protocol::{Job, PixelIndex, WorkerCommand, WorkerId, WorkerMessage};
pub use scheduler::{Coordinator, PoolScheduler, SchedulerError, SharedCoordinator};
pub use transport::{DistributedTransport, ProcessPoolTransport, Transport, TransportError};
pub use worker::{EngineFactory, FitEngine, FitError, FitOutcome};
