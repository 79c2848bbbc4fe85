//! Fitting engine abstraction

use std::collections::BTreeSet;

use crate::protocol::{JobParams, ModelSnapshot, PixelIndex, TestDefinition, WorkerId};

/// Outcome of fitting one pixel
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// Fitted parameters, in whatever shape the coordinator expects
    pub result: serde_json::Value,
    /// Whether the convergence test accepted the fit
    pub is_good: bool,
}

/// Errors raised by an engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum FitError {
    /// `create_model` has not been applied yet
    #[error("no model has been created on this worker")]
    ModelMissing,

    /// `setup_test` has not been applied yet
    #[error("no convergence test has been set up on this worker")]
    TestMissing,

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The fit itself failed
    #[error("fit failed: {0}")]
    Failed(String),
}

/// The fitting algorithm run by a worker
///
/// Each worker owns one engine, holding its private copy of the model. Calls
/// arrive in the order the worker received the matching commands.
pub trait FitEngine: Send + 'static {
    /// Install the convergence test
    fn setup_test(&mut self, test: &TestDefinition) -> Result<(), FitError>;

    /// Build the model copy from a snapshot, stored under `slot`
    fn create_model(&mut self, snapshot: &ModelSnapshot, slot: &str) -> Result<(), FitError>;

    /// Restrict which components are optional for the next fits
    fn set_optional_names(&mut self, _names: &BTreeSet<String>) -> Result<(), FitError> {
        Ok(())
    }

    /// Fit one pixel
    fn fit(&mut self, index: &PixelIndex, params: &JobParams) -> Result<FitOutcome, FitError>;
}

/// Builds one engine per worker
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: FitEngine;

    fn create(&self, worker: WorkerId) -> Self::Engine;
}

impl<F, E> EngineFactory for F
where
    F: Fn(WorkerId) -> E + Send + Sync + 'static,
    E: FitEngine,
{
    type Engine = E;

    fn create(&self, worker: WorkerId) -> E {
        self(worker)
    }
}
