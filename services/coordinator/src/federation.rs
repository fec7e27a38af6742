use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use fedsim_core::search::TrialRecord;
use fedsim_core::{run_search, CsvSink, DataProvider, DataSource, GridSearch, LeafDirectoryProvider, MetricsSink, ModelRegistry, SyntheticProvider, TrialConfig};

/// Result file written next to the metric tables once the search ends.
#[derive(Debug, Serialize)]
pub struct SearchSummary {
    pub search: String,
    pub finished_at: String,
    pub trials_run: usize,
    pub records: Vec<TrialRecord>,
    pub best: Option<TrialRecord>,
}

pub struct FederationModule {
    cfg: TrialConfig,
    registry: ModelRegistry,
    stop: Arc<AtomicBool>,
}

impl FederationModule {
    pub fn new(cfg: TrialConfig, stop: Arc<AtomicBool>) -> Result<Self> {
        let plan = cfg.validate().context("invalid trial configuration")?;
        info!(dataset = %cfg.dataset, model = %cfg.model, rounds = plan.num_rounds, clients_per_round = plan.clients_per_round, "federation_module_initialized");
        Ok(Self { cfg, registry: ModelRegistry::builtin(), stop })
    }

    fn provider(&self) -> Box<dyn DataProvider> {
        match &self.cfg.data {
            DataSource::Synthetic { num_clients, dim, num_classes } => Box::new(SyntheticProvider::new(*num_clients, *dim, *num_classes, self.cfg.seed)),
            DataSource::Leaf { root } => Box::new(LeafDirectoryProvider::new(root.clone())),
        }
    }

    /// Blocking: runs every trial of the grid and writes the summary file.
    pub fn run(&self) -> Result<SearchSummary> {
        let provider = self.provider();
        let mut grid = GridSearch::new(&self.cfg.hyperparams, &self.cfg.search)?;
        let dir = self.cfg.metrics_dir.clone();
        let name = self.cfg.metrics_name.clone();
        let per_trial = grid.len() > 1;

        let outcomes = run_search(
            &self.cfg,
            &self.registry,
            provider.as_ref(),
            &mut grid,
            |trial| {
                let file = if per_trial { format!("{name}_trial{trial}") } else { name.clone() };
                Ok(Box::new(CsvSink::create(&dir, &file)?) as Box<dyn MetricsSink>)
            },
            Some(Arc::clone(&self.stop)),
        )?;

        let summary = SearchSummary {
            search: self.cfg.search.name.clone(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            trials_run: outcomes.len(),
            records: grid.records().to_vec(),
            best: grid.best().cloned(),
        };
        let path: PathBuf = dir.join(format!("{name}_search.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(&summary)?).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), trials = summary.trials_run, "search_summary_written");
        Ok(summary)
    }
}
