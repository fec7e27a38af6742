//! Trial configuration: layered loading (defaults, file, environment) and
//! validation into the immutable plan the round driver executes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{FedError, Result};

pub type HyperParams = BTreeMap<String, Value>;

/// Time budget used to pick round-count defaults when they are not given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeBudget { Small, Medium, #[default] Large }

/// `(num_rounds, eval_every, clients_per_round)` per dataset and budget.
pub fn budget_defaults(dataset: &str, t: TimeBudget) -> Option<(usize, usize, usize)> {
    let row = match dataset {
        "sent140" => [(10, 2, 2), (16, 2, 2), (24, 2, 2)],
        "femnist" | "celeba" => [(30, 10, 2), (100, 10, 2), (400, 20, 2)],
        "shakespeare" | "synthetic" | "reddit" => [(6, 2, 2), (8, 2, 2), (20, 1, 2)],
        _ => return None,
    };
    Some(match t { TimeBudget::Small => row[0], TimeBudget::Medium => row[1], TimeBudget::Large => row[2] })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// Seeded in-memory clients; see `data::SyntheticProvider`.
    Synthetic {
        #[serde(default = "default_synthetic_clients")] num_clients: usize,
        #[serde(default = "default_synthetic_dim")] dim: usize,
        #[serde(default = "default_synthetic_classes")] num_classes: usize,
    },
    /// LEAF-format JSON shards under `<root>/data/<dataset>/{train,test,val}`.
    Leaf { root: PathBuf },
}

fn default_synthetic_clients() -> usize { 100 }
fn default_synthetic_dim() -> usize { 60 }
fn default_synthetic_classes() -> usize { 10 }

impl Default for DataSource {
    fn default() -> Self {
        DataSource::Synthetic { num_clients: default_synthetic_clients(), dim: default_synthetic_dim(), num_classes: default_synthetic_classes() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchSettings {
    #[serde(default = "default_search_name")] pub name: String,
    /// Repetitions of every grid point.
    #[serde(default = "default_num_samples")] pub num_samples: usize,
    #[serde(default = "default_stop_accuracy")] pub stop_accuracy: Option<f64>,
    #[serde(default = "default_max_iterations")] pub max_iterations: Option<u64>,
}

fn default_search_name() -> String { "fedsim".into() }
fn default_num_samples() -> usize { 1 }
fn default_stop_accuracy() -> Option<f64> { Some(0.99) }
fn default_max_iterations() -> Option<u64> { Some(3000) }

impl Default for SearchSettings {
    fn default() -> Self { Self { name: default_search_name(), num_samples: 1, stop_accuracy: default_stop_accuracy(), max_iterations: default_max_iterations() } }
}

/// Everything one trial needs. Immutable once a trial starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialConfig {
    #[serde(default = "default_dataset")] pub dataset: String,
    #[serde(default = "default_model")] pub model: String,
    #[serde(default)] pub t: TimeBudget,
    #[serde(default)] pub num_rounds: Option<usize>,
    #[serde(default)] pub eval_every: Option<usize>,
    #[serde(default)] pub clients_per_round: Option<usize>,
    #[serde(default)] pub num_epochs: Option<usize>,
    #[serde(default = "default_batch_size")] pub batch_size: usize,
    /// Fraction of local data used per round; replaces epoch-based training.
    #[serde(default)] pub minibatch: Option<f64>,
    #[serde(default)] pub seed: u64,
    #[serde(default)] pub use_validation_set: bool,
    /// Per-round probability that a client is offline; 0 keeps everyone online.
    #[serde(default)] pub client_dropout: f64,
    #[serde(default)] pub hyperparams: HyperParams,
    #[serde(default)] pub data: DataSource,
    #[serde(default = "default_metrics_dir")] pub metrics_dir: PathBuf,
    #[serde(default = "default_metrics_name")] pub metrics_name: String,
    #[serde(default)] pub search: SearchSettings,
}

fn default_dataset() -> String { "synthetic".into() }
fn default_model() -> String { "logreg".into() }
fn default_batch_size() -> usize { 10 }
fn default_metrics_dir() -> PathBuf { PathBuf::from("metrics") }
fn default_metrics_name() -> String { "metrics".into() }

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            model: default_model(),
            t: TimeBudget::default(),
            num_rounds: None,
            eval_every: None,
            clients_per_round: None,
            num_epochs: None,
            batch_size: default_batch_size(),
            minibatch: None,
            seed: 0,
            use_validation_set: false,
            client_dropout: 0.0,
            hyperparams: HyperParams::new(),
            data: DataSource::default(),
            metrics_dir: default_metrics_dir(),
            metrics_name: default_metrics_name(),
            search: SearchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalTraining {
    Epochs { num_epochs: usize, batch_size: usize },
    Minibatch { fraction: f64 },
}

/// Validated round schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundPlan {
    pub num_rounds: usize,
    pub eval_every: usize,
    pub clients_per_round: usize,
    pub local: LocalTraining,
    pub seed: u64,
    pub use_validation_set: bool,
    pub client_dropout: f64,
}

impl RoundPlan {
    /// Evaluation runs after round `round` (1-based) on the schedule and
    /// always after the last one.
    pub fn evaluates_after(&self, round: usize) -> bool { round % self.eval_every == 0 || round == self.num_rounds }

    pub fn eval_partition(&self) -> &'static str { if self.use_validation_set { "val" } else { "test" } }
}

impl TrialConfig {
    /// `"<dataset>.<model>"`, the model registry key.
    pub fn model_key(&self) -> String { format!("{}.{}", self.dataset, self.model) }

    pub fn validate(&self) -> Result<RoundPlan> {
        let defaults = budget_defaults(&self.dataset, self.t);
        let pick = |explicit: Option<usize>, idx: usize, name: &str| -> Result<usize> {
            let v = match (explicit, defaults) {
                (Some(v), _) => v,
                (None, Some(d)) => [d.0, d.1, d.2][idx],
                (None, None) => return Err(FedError::config(format!("{name} not set and dataset '{}' has no defaults", self.dataset))),
            };
            if v == 0 { return Err(FedError::config(format!("{name} must be > 0"))); }
            Ok(v)
        };
        let num_rounds = pick(self.num_rounds, 0, "num_rounds")?;
        let eval_every = pick(self.eval_every, 1, "eval_every")?;
        let clients_per_round = pick(self.clients_per_round, 2, "clients_per_round")?;

        let local = match (self.minibatch, self.num_epochs) {
            (Some(_), Some(_)) => return Err(FedError::config("minibatch and num_epochs are mutually exclusive")),
            (Some(f), None) => {
                if !(f > 0.0 && f <= 1.0) { return Err(FedError::config(format!("minibatch fraction {f} outside (0, 1]"))); }
                LocalTraining::Minibatch { fraction: f }
            }
            (None, epochs) => {
                let num_epochs = epochs.unwrap_or(1);
                if num_epochs == 0 { return Err(FedError::config("num_epochs must be > 0")); }
                if self.batch_size == 0 { return Err(FedError::config("batch_size must be > 0")); }
                LocalTraining::Epochs { num_epochs, batch_size: self.batch_size }
            }
        };
        if !(0.0..1.0).contains(&self.client_dropout) {
            return Err(FedError::config(format!("client_dropout {} outside [0, 1)", self.client_dropout)));
        }
        let plan = RoundPlan { num_rounds, eval_every, clients_per_round, local, seed: self.seed, use_validation_set: self.use_validation_set, client_dropout: self.client_dropout };
        debug!(?plan, "round_plan_validated");
        Ok(plan)
    }

    /// Copy of this config with the search adapter's hyperparameters merged on top.
    pub fn with_hyperparams(&self, overrides: &HyperParams) -> Self {
        let mut cfg = self.clone();
        for (k, v) in overrides { cfg.hyperparams.insert(k.clone(), v.clone()); }
        cfg
    }
}

fn base_builder(service: &str) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    Ok(config::Config::builder()
        .set_default("metrics_name", service)?
        .set_default("dataset", default_dataset())?
        .set_default("model", default_model())?)
}

/// Defaults, then the file at `FEDSIM_CONFIG_FILE`, then `FEDSIM__*` variables.
pub fn load_config(service: &str) -> Result<TrialConfig> {
    let mut builder = base_builder(service)?;
    if let Ok(file) = std::env::var("FEDSIM_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDSIM").separator("__").try_parsing(true));
    let cfg: TrialConfig = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

/// Parse a YAML document on top of the defaults.
pub fn config_from_yaml(service: &str, text: &str) -> Result<TrialConfig> {
    let builder = base_builder(service)?.add_source(config::File::from_str(text, config::FileFormat::Yaml));
    Ok(builder.build()?.try_deserialize()?)
}
