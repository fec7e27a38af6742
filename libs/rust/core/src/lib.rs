//! Core of the federated learning round simulator.
//!
//! A trial registers simulated clients around one shared model and runs
//! synchronous FedAvg rounds: select, train locally in parallel, aggregate,
//! and evaluate on a fixed schedule. Weighted statistics and per-client cost
//! go to a `MetricsSink`; a `SearchAdapter` drives repeated trials.

pub mod error;
pub mod config;
pub mod telemetry;
pub mod model;
pub mod data;
pub mod client;
pub mod availability;
pub mod metrics;
pub mod server;
pub mod sink;
pub mod search;
pub mod driver;

pub use error::{FedError, Result};
pub use config::{load_config, config_from_yaml, budget_defaults, DataSource, HyperParams, LocalTraining, RoundPlan, SearchSettings, TimeBudget, TrialConfig};
pub use telemetry::{init_tracing, FedMetrics, FED_METRICS};
pub use model::{LogisticRegression, MetricMap, Model, ModelHandle, ModelRegistry, Params, SysMetrics};
pub use data::{ClientData, DataProvider, Dataset, DatasetInfo, LeafDirectoryProvider, SyntheticProvider};
pub use client::{Client, ClientUpdate, Partition};
pub use availability::{AlwaysOnline, Availability, RandomDropout};
pub use metrics::{weighted_summary, MetricSummary, MetricsByClient, SummaryReport, SystemMetricsAccumulator, WeightsByClient};
pub use server::{RoundOutcome, RoundTraining, Server};
pub use sink::{CsvSink, MemorySink, MetricsSink, RoundLine, RoundStatus, StatLine, SysLine};
pub use search::{GridSearch, SearchAdapter, SingleTrial, StopCriteria, TrialReport};
pub use driver::{run_search, Evaluation, RoundDriver, RoundPhase, TrialOutcome};
