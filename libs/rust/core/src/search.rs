//! Hyperparameter search seam. The driver pulls configurations from a
//! `SearchAdapter`, reports progress after every evaluation and asks it
//! between rounds whether the trial should stop.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::{HyperParams, SearchSettings};
use crate::driver::TrialOutcome;
use crate::error::{FedError, Result};
use crate::metrics::SummaryReport;

/// Progress of one trial after an evaluation point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialReport {
    pub trial: usize,
    pub round: usize,
    /// Weighted summary on the eval partition.
    pub metrics: SummaryReport,
    /// Bytes moved in the most recent training round.
    pub round_bytes: u64,
    pub cumulative_bytes: u64,
}

impl TrialReport {
    pub fn mean(&self, metric: &str) -> Option<f64> { self.metrics.get(metric).map(|s| s.mean) }
}

pub trait SearchAdapter {
    /// Next configuration to try; `None` ends the search.
    fn next_config(&mut self) -> Option<HyperParams>;
    fn report(&mut self, report: &TrialReport);
    /// Consulted between rounds of the running trial.
    fn should_stop(&self) -> bool;
    fn trial_finished(&mut self, _outcome: &TrialOutcome) {}
}

/// Runs exactly one configuration and never stops early.
#[derive(Debug, Clone, Default)]
pub struct SingleTrial {
    config: Option<HyperParams>,
    pub reports: Vec<TrialReport>,
}

impl SingleTrial {
    pub fn new(config: HyperParams) -> Self { Self { config: Some(config), reports: Vec::new() } }
}

impl SearchAdapter for SingleTrial {
    fn next_config(&mut self) -> Option<HyperParams> { self.config.take() }
    fn report(&mut self, report: &TrialReport) { self.reports.push(report.clone()); }
    fn should_stop(&self) -> bool { false }
}

/// When a trial counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StopCriteria {
    /// Stop once the reported eval accuracy mean reaches this value.
    pub accuracy: Option<f64>,
    /// Stop once this many reports were received in the current trial.
    pub max_iterations: Option<u64>,
}

impl From<&SearchSettings> for StopCriteria {
    fn from(s: &SearchSettings) -> Self { Self { accuracy: s.stop_accuracy, max_iterations: s.max_iterations } }
}

/// Best and last observation of a finished trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub trial: usize,
    pub hyperparams: HyperParams,
    pub iterations: u64,
    pub best_accuracy: Option<f64>,
    pub last: Option<TrialReport>,
}

/// Cartesian product over every `{"grid_search": [...]}` value in the
/// search space, each point repeated `num_samples` times.
#[derive(Debug)]
pub struct GridSearch {
    points: Vec<HyperParams>,
    cursor: usize,
    stop: StopCriteria,
    current: Option<TrialRecord>,
    records: Vec<TrialRecord>,
}

impl GridSearch {
    pub fn new(space: &HyperParams, settings: &SearchSettings) -> Result<Self> {
        let grid = expand_grid(space)?;
        let points = grid.iter().flat_map(|p| std::iter::repeat(p.clone()).take(settings.num_samples)).collect::<Vec<_>>();
        info!(search = %settings.name, points = points.len(), "grid_search_expanded");
        Ok(Self { points, cursor: 0, stop: StopCriteria::from(settings), current: None, records: Vec::new() })
    }

    pub fn len(&self) -> usize { self.points.len() }
    pub fn is_empty(&self) -> bool { self.points.is_empty() }
    pub fn records(&self) -> &[TrialRecord] { &self.records }

    /// Record with the highest accuracy seen so far.
    pub fn best(&self) -> Option<&TrialRecord> {
        self.records.iter().filter(|r| r.best_accuracy.is_some()).max_by(|a, b| a.best_accuracy.partial_cmp(&b.best_accuracy).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn close_current(&mut self) {
        if let Some(rec) = self.current.take() { self.records.push(rec); }
    }
}

impl SearchAdapter for GridSearch {
    fn next_config(&mut self) -> Option<HyperParams> {
        self.close_current();
        let hp = self.points.get(self.cursor)?.clone();
        self.current = Some(TrialRecord { trial: self.cursor, hyperparams: hp.clone(), iterations: 0, best_accuracy: None, last: None });
        self.cursor += 1;
        Some(hp)
    }

    fn report(&mut self, report: &TrialReport) {
        let Some(rec) = self.current.as_mut() else { return };
        rec.iterations += 1;
        if let Some(acc) = report.mean("accuracy") {
            rec.best_accuracy = Some(rec.best_accuracy.map_or(acc, |b| b.max(acc)));
        }
        rec.last = Some(report.clone());
    }

    fn should_stop(&self) -> bool {
        let Some(rec) = self.current.as_ref() else { return false };
        let reached = match (self.stop.accuracy, rec.last.as_ref().and_then(|r| r.mean("accuracy"))) {
            (Some(target), Some(acc)) => acc >= target,
            _ => false,
        };
        reached || self.stop.max_iterations.is_some_and(|max| rec.iterations >= max)
    }

    fn trial_finished(&mut self, outcome: &TrialOutcome) {
        info!(trial = outcome.trial, rounds = outcome.rounds_completed, stopped_early = outcome.stopped_early, "trial_finished");
        self.close_current();
    }
}

fn expand_grid(space: &HyperParams) -> Result<Vec<HyperParams>> {
    let mut points = vec![HyperParams::new()];
    for (key, value) in space {
        let options = match value.as_object().and_then(|o| o.get("grid_search")) {
            Some(Value::Array(opts)) if !opts.is_empty() => opts.clone(),
            Some(_) => return Err(FedError::config(format!("grid_search for '{key}' must be a non-empty list"))),
            None => vec![value.clone()],
        };
        points = points
            .into_iter()
            .flat_map(|p| {
                options.iter().map(move |opt| {
                    let mut q = p.clone();
                    q.insert(key.clone(), opt.clone());
                    q
                })
            })
            .collect();
    }
    Ok(points)
}
