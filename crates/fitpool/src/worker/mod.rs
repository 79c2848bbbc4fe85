//! Workers
//!
//! This module provides:
//! - [`FitEngine`] - The fitting algorithm a worker drives (external)
//! - [`EngineFactory`] - Builds one private engine per worker
//! - [`Worker`] - Applies [`WorkerCommand`](crate::protocol::WorkerCommand)s
//!   to its engine and produces [`WorkerMessage`](crate::protocol::WorkerMessage)s
//!
//! Workers are transport-agnostic: the process pool runs each one on its own
//! thread, the local cluster runs each one on an engine task.

mod engine;
mod runtime;

pub use engine::{EngineFactory, FitEngine, FitError, FitOutcome};
pub use runtime::Worker;
