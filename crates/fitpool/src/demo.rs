//! Synthetic line-fitting map used by the `fitpool` binary
//!
//! Every pixel of a `width x height` grid holds a noisy straight line. The
//! engine fits slope and intercept by least squares; the coordinator grows
//! the fitted region outwards from one pre-fitted seed pixel.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use fitpool::protocol::{AuditRecord, Job, JobParams, ModelSnapshot, PixelIndex, TestDefinition};
use fitpool::worker::{FitEngine, FitError, FitOutcome};
use fitpool::Coordinator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Signal {
    width: usize,
    height: usize,
    x: Vec<f64>,
    /// Row-major, one line per pixel
    data: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ConvergenceTest {
    max_reduced_chisq: f64,
}

/// Least-squares line fitter
#[derive(Default)]
pub struct LineEngine {
    signal: Option<Signal>,
    test: Option<ConvergenceTest>,
}

impl FitEngine for LineEngine {
    fn setup_test(&mut self, test: &TestDefinition) -> Result<(), FitError> {
        let test = serde_json::from_value(test.clone())
            .map_err(|e| FitError::InvalidInput(e.to_string()))?;
        self.test = Some(test);
        Ok(())
    }

    fn create_model(&mut self, snapshot: &ModelSnapshot, _slot: &str) -> Result<(), FitError> {
        let signal = serde_json::from_value(snapshot.signal.clone())
            .map_err(|e| FitError::InvalidInput(e.to_string()))?;
        self.signal = Some(signal);
        Ok(())
    }

    fn fit(&mut self, index: &PixelIndex, _params: &JobParams) -> Result<FitOutcome, FitError> {
        let signal = self.signal.as_ref().ok_or(FitError::ModelMissing)?;
        let test = self.test.ok_or(FitError::TestMissing)?;

        let [row, col] = index.0[..] else {
            return Err(FitError::InvalidInput(format!("not a 2d index: {}", index)));
        };
        let y = signal
            .data
            .get(row * signal.width + col)
            .ok_or_else(|| FitError::InvalidInput(format!("pixel {} outside the map", index)))?;

        let (slope, intercept) = least_squares(&signal.x, y)
            .ok_or_else(|| FitError::Failed("degenerate abscissa".into()))?;
        let dof = (y.len().saturating_sub(2)).max(1) as f64;
        let chisq: f64 = signal
            .x
            .iter()
            .zip(y)
            .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
            .sum();
        let reduced = chisq / dof;

        Ok(FitOutcome {
            result: json!({"slope": slope, "intercept": intercept, "reduced_chisq": reduced}),
            is_good: reduced <= test.max_reduced_chisq,
        })
    }
}

fn least_squares(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len()) as f64;
    let sx: f64 = x.iter().sum();
    let sy: f64 = y.iter().sum();
    let sxx: f64 = x.iter().map(|x| x * x).sum();
    let sxy: f64 = x.iter().zip(y).map(|(x, y)| x * y).sum();

    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denom;
    Some((slope, (sy - slope * sx) / n))
}

/// Coordinator growing the fitted region from a seed pixel
pub struct GridCoordinator {
    signal: Signal,
    max_reduced_chisq: f64,
    remaining: VecDeque<PixelIndex>,
    in_flight: BTreeSet<PixelIndex>,
    fitted: BTreeMap<PixelIndex, (Option<serde_json::Value>, bool)>,
    updates: usize,
    audit: Vec<AuditRecord>,
}

impl GridCoordinator {
    /// Build a noisy map; pixel `(0, 0)` starts out fitted
    pub fn new(width: usize, height: usize, points: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let x: Vec<f64> = (0..points).map(|i| i as f64).collect();
        let mut data = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                let slope = 0.5 + 0.1 * row as f64;
                let intercept = 2.0 - 0.2 * col as f64;
                data.push(
                    x.iter()
                        .map(|x| slope * x + intercept + rng.gen_range(-0.5..0.5))
                        .collect(),
                );
            }
        }

        let seed_pixel = PixelIndex::from([0, 0]);
        let mut remaining: Vec<PixelIndex> = (0..height)
            .flat_map(|row| (0..width).map(move |col| PixelIndex::from([row, col])))
            .filter(|p| *p != seed_pixel)
            .collect();
        remaining.sort_by_key(|p| p.0[0] + p.0[1]);

        let mut fitted = BTreeMap::new();
        fitted.insert(seed_pixel, (Some(json!({"slope": 0.5, "intercept": 2.0})), true));

        Self {
            signal: Signal {
                width,
                height,
                x,
                data,
            },
            max_reduced_chisq: 0.25,
            remaining: remaining.into(),
            in_flight: BTreeSet::new(),
            fitted,
            updates: 0,
            audit: Vec::new(),
        }
    }

    pub fn good_count(&self) -> usize {
        self.fitted.values().filter(|(_, good)| *good).count()
    }

    pub fn fitted_count(&self) -> usize {
        self.fitted.len()
    }

    pub fn audit(&self) -> &[AuditRecord] {
        &self.audit
    }

    /// Starting values taken from the closest fitted neighbour
    fn starting_values(&self, index: &PixelIndex) -> JobParams {
        let mut params = JobParams::new();
        let neighbour = self
            .fitted
            .iter()
            .filter(|(_, (result, good))| *good && result.is_some())
            .min_by_key(|(p, _)| {
                p.0.iter()
                    .zip(&index.0)
                    .map(|(a, b)| a.abs_diff(*b))
                    .sum::<usize>()
            });
        if let Some((p, (Some(result), _))) = neighbour {
            params.insert("from".into(), json!(p.0));
            params.insert("start".into(), result.clone());
        }
        params
    }
}

impl Coordinator for GridCoordinator {
    fn model_snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            signal: serde_json::to_value(&self.signal).unwrap_or_default(),
            components: json!({"line": ["slope", "intercept"], "background": ["offset"]}),
        }
    }

    fn test_definition(&self) -> TestDefinition {
        json!({"max_reduced_chisq": self.max_reduced_chisq})
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
            let params = self.starting_values(&index);
            self.in_flight.insert(index.clone());
            jobs.push(Job::new(index, params));
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
        result: Option<serde_json::Value>,
        is_good: bool,
    ) {
        self.updates += 1;
        self.fitted.insert(index.clone(), (result, is_good));
    }

    fn remaining_job_count(&self) -> usize {
        self.remaining.len()
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn progress_metric(&self) -> usize {
        self.fitted.len() * 2
    }

    fn progress_counter(&self) -> usize {
        self.updates
    }

    fn audit_log(&mut self) -> Option<&mut Vec<AuditRecord>> {
        Some(&mut self.audit)
    }
}
