//! Trial state machine.
//!
//! Phases per trial:
//! - Init (baseline evaluation of the fresh model as round 0)
//! - SelectClients, TrainLocal, Aggregate, MaybeEvaluate, NextRound (per round)
//! - Terminal
//!
//! Cancellation, from the search adapter or the external stop flag, is only
//! honoured at round boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, trace};

use crate::availability::{AlwaysOnline, Availability, RandomDropout};
use crate::client::{Client, Partition};
use crate::config::{HyperParams, RoundPlan, TrialConfig};
use crate::data::{ClientData, DataProvider, DatasetInfo};
use crate::error::Result;
use crate::metrics::{weighted_summary, RoundCost, SummaryReport, SystemMetricsAccumulator, WeightsByClient};
use crate::model::{ModelHandle, ModelRegistry, Params};
use crate::search::{SearchAdapter, TrialReport};
use crate::server::{sample_weights, weights_for, RoundOutcome, RoundTraining, Server};
use crate::sink::{MetricsSink, RoundLine, RoundStatus, StatLine, SysLine};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoundPhase { Init, SelectClients, TrainLocal, Aggregate, MaybeEvaluate, NextRound, Terminal }

/// Summaries taken at one evaluation point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub round: usize,
    pub train: SummaryReport,
    pub eval: SummaryReport,
    pub round_bytes: u64,
    pub cumulative_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub trial: usize,
    pub hyperparams: HyperParams,
    pub rounds_completed: usize,
    pub stopped_early: bool,
    pub evaluations: Vec<Evaluation>,
    pub costs: Vec<RoundCost>,
    pub failed_clients: usize,
    pub degenerate_rounds: usize,
    pub final_params: Params,
}

impl TrialOutcome {
    pub fn last_evaluation(&self) -> Option<&Evaluation> { self.evaluations.last() }
}

pub struct RoundDriver {
    trial: usize,
    hyperparams: HyperParams,
    plan: RoundPlan,
    server: Server,
    availability: Box<dyn Availability>,
    weights: WeightsByClient,
    stop: Option<Arc<AtomicBool>>,
    costs: SystemMetricsAccumulator,
    phase: RoundPhase,
}

impl RoundDriver {
    /// Validate the config, resolve the model and register the clients.
    /// `input_dim` and `num_classes` are inferred from the data when the
    /// hyperparameters leave them out.
    pub fn new(trial: usize, cfg: &TrialConfig, registry: &ModelRegistry, clients: Vec<ClientData>) -> Result<Self> {
        let plan = cfg.validate()?;
        let mut hyperparams = cfg.hyperparams.clone();
        if let Some(info) = DatasetInfo::infer(&clients) {
            hyperparams.entry("input_dim".to_string()).or_insert_with(|| Value::from(info.input_dim));
            hyperparams.entry("num_classes".to_string()).or_insert_with(|| Value::from(info.num_classes));
        }
        let model = registry.resolve(&cfg.model_key(), &hyperparams)?;
        let handle = ModelHandle::new(model, &mut StdRng::seed_from_u64(plan.seed.wrapping_add(123)));
        let clients = clients.into_iter().map(|d| Client::new(d, plan.use_validation_set)).collect();
        let server = Server::new(handle, clients, plan.seed)?;
        let weights = sample_weights(&server.get_clients_info(&server.registry()));
        let availability: Box<dyn Availability> =
            if plan.client_dropout > 0.0 { Box::new(RandomDropout { rate: plan.client_dropout, seed: plan.seed }) } else { Box::new(AlwaysOnline) };
        info!(trial, model = %cfg.model_key(), clients = server.registry().len(), params = server.model().size(), "trial_initialized");
        Ok(Self { trial, hyperparams, plan, server, availability, weights, stop: None, costs: SystemMetricsAccumulator::new(), phase: RoundPhase::Init })
    }

    pub fn with_availability(mut self, availability: impl Availability + 'static) -> Self {
        self.availability = Box::new(availability);
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn phase(&self) -> RoundPhase { self.phase }
    pub fn plan(&self) -> &RoundPlan { &self.plan }
    pub fn server(&self) -> &Server { &self.server }

    fn enter(&mut self, next: RoundPhase) {
        trace!(from = ?self.phase, to = ?next, round = self.server.round_index(), "phase_transition");
        self.phase = next;
    }

    fn cancelled(&self, adapter: &dyn SearchAdapter) -> bool {
        adapter.should_stop() || self.stop.as_ref().is_some_and(|f| f.load(Ordering::Relaxed))
    }

    #[instrument(skip_all, fields(trial = self.trial))]
    pub fn run(mut self, sink: &mut dyn MetricsSink, adapter: &mut dyn SearchAdapter) -> Result<TrialOutcome> {
        let registry = self.server.registry();
        let mut evaluations = vec![self.evaluate(0, &registry, sink, adapter)?];
        let (mut failed_clients, mut degenerate_rounds, mut rounds_completed) = (0, 0, 0);
        let mut stopped_early = false;

        for i in 0..self.plan.num_rounds {
            if self.cancelled(adapter) {
                info!(round = i, "trial_stopped");
                stopped_early = true;
                break;
            }
            let round = i + 1;

            self.enter(RoundPhase::SelectClients);
            let pool = self.availability.online(i, &registry);
            let selected = self.server.select_clients(i, &pool, self.plan.clients_per_round).len();

            self.enter(RoundPhase::TrainLocal);
            let training = self.server.train_model(self.plan.local);
            failed_clients += training.failures.len();
            self.costs.record_round(round, &training.sys);
            sink.write_sys(&self.sys_lines(round, &training))?;

            self.enter(RoundPhase::Aggregate);
            let (status, contributed) = match self.server.update_model()? {
                RoundOutcome::Aggregated { contributors, .. } => (RoundStatus::Aggregated, contributors),
                RoundOutcome::Degenerate => {
                    degenerate_rounds += 1;
                    (RoundStatus::Degenerate, 0)
                }
                RoundOutcome::Empty => (RoundStatus::Empty, 0),
            };
            sink.write_round(&RoundLine { round, selected, contributed, failed: training.failures.len(), status, cumulative_bytes: self.costs.cumulative_bytes() })?;
            rounds_completed = round;

            self.enter(RoundPhase::MaybeEvaluate);
            if self.plan.evaluates_after(round) {
                evaluations.push(self.evaluate(round, &registry, sink, adapter)?);
            }
            self.enter(RoundPhase::NextRound);
        }

        self.enter(RoundPhase::Terminal);
        sink.flush()?;
        info!(rounds_completed, failed_clients, degenerate_rounds, cumulative_bytes = self.costs.cumulative_bytes(), "trial_complete");
        Ok(TrialOutcome {
            trial: self.trial,
            hyperparams: self.hyperparams,
            rounds_completed,
            stopped_early,
            evaluations,
            costs: self.costs.rounds().to_vec(),
            failed_clients,
            degenerate_rounds,
            final_params: self.server.params().as_ref().clone(),
        })
    }

    fn sys_lines(&self, round: usize, training: &RoundTraining) -> Vec<SysLine> {
        training
            .sys
            .iter()
            .map(|(id, sys)| SysLine {
                round,
                client_id: id.clone(),
                group: self.server.client(id).and_then(Client::group).unwrap_or_default().to_string(),
                num_samples: training.samples.get(id).copied().unwrap_or(0),
                bytes_read: sys.bytes_read,
                bytes_written: sys.bytes_written,
                local_computations: sys.local_computations,
            })
            .collect()
    }

    fn evaluate(&self, round: usize, registry: &[Client], sink: &mut dyn MetricsSink, adapter: &mut dyn SearchAdapter) -> Result<Evaluation> {
        let train = self.summarize(round, registry, Partition::Train, sink)?;
        let eval = self.summarize(round, registry, Partition::eval(self.plan.use_validation_set), sink)?;
        let report = TrialReport { trial: self.trial, round, metrics: eval.clone(), round_bytes: self.costs.last_round_bytes(), cumulative_bytes: self.costs.cumulative_bytes() };
        adapter.report(&report);
        Ok(Evaluation { round, train, eval, round_bytes: report.round_bytes, cumulative_bytes: report.cumulative_bytes })
    }

    fn summarize(&self, round: usize, registry: &[Client], set: Partition, sink: &mut dyn MetricsSink) -> Result<SummaryReport> {
        let metrics = self.server.test_model(registry, set)?;
        let weights = weights_for(&self.weights, &metrics);
        let summary = weighted_summary(&metrics, &weights)?;
        for (metric, s) in &summary.metrics {
            info!(round, set = set.as_str(), %metric, mean = s.mean, p10 = s.p10, p50 = s.p50, p90 = s.p90, "round_stats");
        }
        sink.write_stats(&StatLine::from_report(round, set, &summary))?;
        Ok(summary)
    }
}

/// Run one trial per configuration the adapter hands out. Data is loaded
/// fresh for each trial; `sink_for` opens the output for a trial index.
pub fn run_search(
    base: &TrialConfig,
    registry: &ModelRegistry,
    provider: &dyn DataProvider,
    adapter: &mut dyn SearchAdapter,
    mut sink_for: impl FnMut(usize) -> Result<Box<dyn MetricsSink>>,
    stop: Option<Arc<AtomicBool>>,
) -> Result<Vec<TrialOutcome>> {
    let mut outcomes = Vec::new();
    while let Some(hp) = adapter.next_config() {
        if stop.as_ref().is_some_and(|f| f.load(Ordering::Relaxed)) {
            info!(trial = outcomes.len(), "search_cancelled");
            break;
        }
        let trial = outcomes.len();
        let cfg = base.with_hyperparams(&hp);
        let clients = provider.load(&cfg.dataset, cfg.use_validation_set)?;
        let mut driver = RoundDriver::new(trial, &cfg, registry, clients)?;
        if let Some(flag) = &stop {
            driver = driver.with_stop_flag(Arc::clone(flag));
        }
        let mut sink = sink_for(trial)?;
        let outcome = driver.run(sink.as_mut(), adapter)?;
        adapter.trial_finished(&outcome);
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticProvider;
    use crate::search::SingleTrial;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn cfg(rounds: usize, eval_every: usize) -> TrialConfig {
        TrialConfig {
            num_rounds: Some(rounds),
            eval_every: Some(eval_every),
            clients_per_round: Some(3),
            hyperparams: HyperParams::from([("lr".to_string(), json!(0.05))]),
            ..Default::default()
        }
    }

    fn clients() -> Vec<ClientData> {
        SyntheticProvider::new(8, 5, 3, 7).load("synthetic", false).unwrap()
    }

    #[test]
    fn baseline_and_scheduled_evaluations() {
        let mut sink = MemorySink::new();
        let mut adapter = SingleTrial::new(HyperParams::new());
        let driver = RoundDriver::new(0, &cfg(5, 2), &ModelRegistry::builtin(), clients()).unwrap();
        assert_eq!(driver.phase(), RoundPhase::Init);
        let out = driver.run(&mut sink, &mut adapter).unwrap();
        assert_eq!(out.evaluations.iter().map(|e| e.round).collect::<Vec<_>>(), [0, 2, 4, 5]);
        assert_eq!(adapter.reports.len(), 4);
        assert_eq!(adapter.reports[0].cumulative_bytes, 0);
        assert!(adapter.reports[3].cumulative_bytes > adapter.reports[1].cumulative_bytes);
        assert_eq!(out.rounds_completed, 5);
        assert!(!out.stopped_early);
        assert_eq!(out.hyperparams["input_dim"], json!(5));
        sink.with(|r| {
            assert_eq!(r.rounds.len(), 5);
            assert!(r.stats.iter().any(|l| l.round == 0 && l.prefix == "train" && l.metric == "accuracy"));
            assert!(r.stats.iter().all(|l| l.prefix == "train" || l.prefix == "test"));
            assert!(r.sys.iter().all(|l| l.round >= 1 && l.bytes_read > 0));
        });
    }

    #[test]
    fn stop_flag_ends_trial_at_round_boundary() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut sink = MemorySink::new();
        let driver = RoundDriver::new(0, &cfg(5, 1), &ModelRegistry::builtin(), clients()).unwrap().with_stop_flag(flag);
        let out = driver.run(&mut sink, &mut SingleTrial::new(HyperParams::new())).unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.rounds_completed, 0);
        assert_eq!(out.evaluations.len(), 1);
    }

    #[test]
    fn unknown_model_is_reported_before_any_round() {
        let cfg = TrialConfig { model: "cnn".into(), ..cfg(2, 1) };
        let err = RoundDriver::new(0, &cfg, &ModelRegistry::builtin(), clients()).err().unwrap();
        assert!(matches!(err, crate::error::FedError::UnknownModel(..)));
    }

    #[test]
    fn search_runs_each_grid_point() {
        use crate::config::SearchSettings;
        use crate::search::GridSearch;
        let space = HyperParams::from([("lr".to_string(), json!({"grid_search": [0.05, 0.1]}))]);
        let settings = SearchSettings { stop_accuracy: None, max_iterations: None, ..Default::default() };
        let mut grid = GridSearch::new(&space, &settings).unwrap();
        let provider = SyntheticProvider::new(6, 4, 2, 3);
        let sink = MemorySink::new();
        let outcomes = run_search(&cfg(2, 1), &ModelRegistry::builtin(), &provider, &mut grid, |_| Ok(Box::new(sink.clone()) as Box<dyn MetricsSink>), None).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(grid.records().len(), 2);
        assert_eq!(outcomes[1].hyperparams["lr"], json!(0.1));
    }
}
