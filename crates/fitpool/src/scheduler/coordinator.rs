//! Coordinator interface

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{AuditRecord, Job, ModelSnapshot, PixelIndex, TestDefinition};

/// Owner of the fitting run
///
/// The coordinator decides which pixels to fit next, consumes results and
/// decides when the run is over. The scheduler only calls into it.
pub trait Coordinator: Send {
    /// Serializable model template installed on every worker
    fn model_snapshot(&self) -> ModelSnapshot;

    /// Convergence test installed on every worker
    fn test_definition(&self) -> TestDefinition;

    /// Components currently treated as optional
    fn optional_component_names(&self) -> BTreeSet<String>;

    /// Produce up to `n` jobs and mark their pixels as in flight
    fn request_jobs(&mut self, n: usize) -> Vec<Job>;

    fn is_in_flight(&self, index: &PixelIndex) -> bool;

    fn clear_in_flight(&mut self, index: &PixelIndex);

    /// Consume a fit result
    fn update_result(
        &mut self,
        index: &PixelIndex,
        result: Option<serde_json::Value>,
        is_good: bool,
    );

    /// Called after every accepted result
    fn trigger_plot_refresh(&mut self) {}

    /// Called after every accepted result
    fn trigger_checkpoint_save(&mut self) {}

    /// Pixels not yet handed out
    fn remaining_job_count(&self) -> usize;

    /// Pixels handed out with no accepted result yet
    fn in_flight_count(&self) -> usize;

    /// How many new jobs are useful to start this cycle
    fn progress_metric(&self) -> usize;

    /// Monotonic counter recorded in audit records
    fn progress_counter(&self) -> usize;

    /// Audit trail, when the coordinator keeps one
    fn audit_log(&mut self) -> Option<&mut Vec<AuditRecord>> {
        None
    }
}

/// Coordinator shared between the scheduler and its owner
pub type SharedCoordinator = Arc<Mutex<dyn Coordinator>>;

/// Wrap a coordinator for [`PoolScheduler::prepare`](super::PoolScheduler::prepare)
pub fn shared<C: Coordinator + 'static>(coordinator: C) -> SharedCoordinator {
    Arc::new(Mutex::new(coordinator))
}
