//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fitpool::prelude::*;
use parking_lot::Mutex;
use serde_json::json;

/// Coordinator over a fixed list of pixels
#[derive(Default)]
pub struct ListCoordinator {
    pub remaining: VecDeque<PixelIndex>,
    pub in_flight: BTreeSet<PixelIndex>,
    pub updates: Vec<(PixelIndex, bool)>,
    pub metric: usize,
    pub audit: Vec<AuditRecord>,
    pub plot_refreshes: usize,
    pub saves: usize,
}

impl ListCoordinator {
    pub fn with_pixels(n: usize, metric: usize) -> Self {
        Self {
            remaining: (0..n).map(|i| PixelIndex::from([i / 8, i % 8])).collect(),
            metric,
            ..Default::default()
        }
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn updates_for(&self, index: &PixelIndex) -> Vec<bool> {
        self.updates
            .iter()
            .filter(|(i, _)| i == index)
            .map(|(_, good)| *good)
            .collect()
    }
}

impl Coordinator for ListCoordinator {
    fn model_snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            signal: json!({"shape": [8, 8]}),
            components: json!({"gaussian": ["centre", "sigma"]}),
        }
    }

    fn test_definition(&self) -> TestDefinition {
        json!({"max_chisq": 1.5})
    }

    fn optional_component_names(&self) -> BTreeSet<String> {
        BTreeSet::from(["background".to_string()])
    }

    fn request_jobs(&mut self, n: usize) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(n);
        while jobs.len() < n {
            let Some(index) = self.remaining.pop_front() else {
                break;
            };
            self.in_flight.insert(index.clone());
            jobs.push(Job::new(index, JobParams::new()));
        }
        jobs
    }

    fn is_in_flight(&self, index: &PixelIndex) -> bool {
        self.in_flight.contains(index)
    }

    fn clear_in_flight(&mut self, index: &PixelIndex) {
        self.in_flight.remove(index);
    }

    fn update_result(
        &mut self,
        index: &PixelIndex,
        _result: Option<serde_json::Value>,
        is_good: bool,
    ) {
        self.updates.push((index.clone(), is_good));
    }

    fn trigger_plot_refresh(&mut self) {
        self.plot_refreshes += 1;
    }

    fn trigger_checkpoint_save(&mut self) {
        self.saves += 1;
    }

    fn remaining_job_count(&self) -> usize {
        self.remaining.len()
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn progress_metric(&self) -> usize {
        self.metric
    }

    fn progress_counter(&self) -> usize {
        self.updates.len()
    }

    fn audit_log(&mut self) -> Option<&mut Vec<AuditRecord>> {
        Some(&mut self.audit)
    }
}

/// Engine answering every pixel, except the ones it is told to fail or stall on
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    pub fail_on: BTreeSet<PixelIndex>,
    pub stall_on: Option<(PixelIndex, Duration)>,
    pub has_model: bool,
}

impl ScriptedEngine {
    pub fn failing_on(index: impl Into<PixelIndex>) -> Self {
        Self {
            fail_on: BTreeSet::from([index.into()]),
            ..Default::default()
        }
    }

    pub fn stalling_on(index: impl Into<PixelIndex>, delay: Duration) -> Self {
        Self {
            stall_on: Some((index.into(), delay)),
            ..Default::default()
        }
    }
}

impl FitEngine for ScriptedEngine {
    fn setup_test(&mut self, _test: &TestDefinition) -> Result<(), FitError> {
        Ok(())
    }

    fn create_model(&mut self, _snapshot: &ModelSnapshot, _slot: &str) -> Result<(), FitError> {
        self.has_model = true;
        Ok(())
    }

    fn fit(&mut self, index: &PixelIndex, _params: &JobParams) -> Result<FitOutcome, FitError> {
        if !self.has_model {
            return Err(FitError::ModelMissing);
        }
        if self.fail_on.contains(index) {
            return Err(FitError::Failed("did not converge".into()));
        }
        if let Some((stall, delay)) = &self.stall_on {
            if stall == index {
                std::thread::sleep(*delay);
            }
        }
        Ok(FitOutcome {
            result: json!({"centre": index.0}),
            is_good: true,
        })
    }
}

/// Factory cloning one scripted engine per worker
pub fn scripted(engine: ScriptedEngine) -> impl EngineFactory<Engine = ScriptedEngine> {
    move |_: WorkerId| engine.clone()
}

pub fn config(backend: Backend, workers: usize, timeout: Duration) -> PoolConfig {
    PoolConfig::new(backend)
        .with_num_workers(workers)
        .with_timeout(timeout)
        .with_timestep(Duration::from_millis(1))
        .with_ping_grace(Duration::from_millis(100))
        .with_queue_capacity(64)
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// Transport whose workers never start, so submitted jobs stay queued
pub struct Unstarted<T>(pub T);

#[async_trait]
impl<T: Transport> Transport for Unstarted<T> {
    fn backend(&self) -> Backend {
        self.0.backend()
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.0.worker_ids()
    }

    async fn start_workers(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn broadcast(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        self.0.broadcast(command).await
    }

    async fn send(
        &mut self,
        worker: WorkerId,
        command: WorkerCommand,
    ) -> Result<(), TransportError> {
        self.0.send(worker, command).await
    }

    async fn submit_job(&mut self, job: Job) -> Result<(), TransportError> {
        self.0.submit_job(job).await
    }

    fn pending_count(&self) -> usize {
        self.0.pending_count()
    }

    async fn drain_results(&mut self, timeout: Duration) -> Vec<WorkerMessage> {
        self.0.drain_results(timeout).await
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.0.shutdown().await
    }
}
