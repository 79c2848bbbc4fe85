//! Scheduling
//!
//! This module provides:
//! - [`PoolScheduler`] - Worker setup, throttling and the dispatch loop
//! - [`Coordinator`] - The owner of the fitting run the scheduler reports to
//! - [`PingTable`] - Liveness bookkeeping fed by ping/pong round trips
//!
//! # Dispatch loop
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        │ stalled longer than timeout?  ── yes ──► exit │
//!        │ nothing remaining, nothing in flight? ─► exit │
//!        └──────────────────────────────────────────────┘
//!                          │
//!                          ▼
//!   collect_results ──► parse each message ──► Coordinator
//!                          │
//!                          ▼
//!   need = min(progress_metric, workers - pending)
//!                          │
//!              need > 0 ──►  add_jobs(need)
//!                          │
//!   need == 0 or nothing collected ──► sleep(timestep)
//!   otherwise                      ──► progress clock reset
//! ```

pub mod coordinator;
mod ping;
mod pool;

pub use coordinator::{Coordinator, SharedCoordinator};
pub use ping::{PingState, PingTable};
pub use pool::{PoolScheduler, SchedulerError};
