//! Round coordinator state: the global model, the client registry, the
//! current selection and the updates waiting to be averaged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::client::{Client, ClientUpdate, Partition};
use crate::config::LocalTraining;
use crate::error::{FedError, Result};
use crate::metrics::{MetricsByClient, WeightsByClient};
use crate::model::{ModelHandle, Params, SysMetrics};
use crate::telemetry::FED_METRICS;

/// Selected client that did not produce an update this round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientFailure {
    pub client_id: String,
    pub reason: String,
}

/// Outcome of `train_model` for the current selection.
#[derive(Debug, Clone, Default)]
pub struct RoundTraining {
    /// Cost per successful client, in client-id order.
    pub sys: BTreeMap<String, SysMetrics>,
    /// Samples each successful client trained on.
    pub samples: BTreeMap<String, usize>,
    pub failures: Vec<ClientFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RoundOutcome {
    Aggregated { contributors: usize, total_weight: f64 },
    /// Clients were selected but none contributed; parameters unchanged.
    Degenerate,
    /// Nothing was selected; parameters unchanged.
    Empty,
}

/// Static per-client info for output tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub group: Option<String>,
    pub num_train_samples: usize,
    pub num_eval_samples: usize,
}

impl ClientInfo {
    /// Train plus eval samples.
    pub fn num_samples(&self) -> usize { self.num_train_samples + self.num_eval_samples }
}

pub struct Server {
    model: ModelHandle,
    registry: Arc<[Client]>,
    selected: Vec<Client>,
    pending: Vec<ClientUpdate>,
    round_index: usize,
    seed: u64,
}

impl Server {
    /// Registry is ordered by client id; duplicate ids are rejected.
    pub fn new(model: ModelHandle, mut clients: Vec<Client>, seed: u64) -> Result<Self> {
        clients.sort_by(|a, b| a.id().cmp(b.id()));
        if let Some(w) = clients.windows(2).find(|w| w[0].id() == w[1].id()) {
            return Err(FedError::config(format!("duplicate client id {}", w[0].id())));
        }
        Ok(Self { model, registry: clients.into(), selected: Vec::new(), pending: Vec::new(), round_index: 0, seed })
    }

    /// Shared handle on the registry, so callers can build candidate pools
    /// while mutating the server.
    pub fn registry(&self) -> Arc<[Client]> { Arc::clone(&self.registry) }
    pub fn client(&self, id: &str) -> Option<&Client> { self.registry.binary_search_by(|c| c.id().cmp(id)).ok().map(|i| &self.registry[i]) }
    pub fn round_index(&self) -> usize { self.round_index }
    pub fn selected(&self) -> &[Client] { &self.selected }
    pub fn params(&self) -> Arc<Params> { self.model.get_params() }
    pub fn model(&self) -> &ModelHandle { &self.model }
    pub fn into_model(self) -> ModelHandle { self.model }

    /// Sample `min(k, eligible)` clients without replacement. Clients with no
    /// training samples are never eligible. The draw depends only on the
    /// seed, `round` and the pool.
    #[instrument(skip(self, pool), fields(pool = pool.len()))]
    pub fn select_clients(&mut self, round: usize, pool: &[&Client], k: usize) -> &[Client] {
        let eligible: Vec<&Client> = pool.iter().copied().filter(|c| c.num_train_samples() > 0).collect();
        let mut rng = StdRng::seed_from_u64(mix(self.seed, round as u64));
        self.selected = eligible.choose_multiple(&mut rng, k.min(eligible.len())).map(|c| (*c).clone()).collect();
        debug!(selected = self.selected.len(), eligible = eligible.len(), "clients_selected");
        &self.selected
    }

    /// Local training of every selected client against one snapshot of the
    /// global parameters. Failed clients are logged and left out of the
    /// pending updates; they never abort the round.
    #[instrument(skip(self), fields(round = self.round_index + 1, selected = self.selected.len()))]
    pub fn train_model(&mut self, local: LocalTraining) -> RoundTraining {
        let snapshot = self.model.get_params();
        let model = Arc::clone(self.model.model());
        let (seed, round) = (self.seed, self.round_index as u64);

        let results: Vec<(String, Result<ClientUpdate>)> = self
            .selected
            .par_iter()
            .map(|c| {
                let mut rng = StdRng::seed_from_u64(mix(mix(seed, round), fnv1a(c.id())));
                (c.id().to_string(), c.train(model.as_ref(), &snapshot, local, &mut rng))
            })
            .collect();

        let mut out = RoundTraining::default();
        for (client_id, res) in results {
            match res {
                Ok(update) => {
                    out.sys.insert(client_id.clone(), update.sys);
                    out.samples.insert(client_id, update.num_samples);
                    self.pending.push(update);
                }
                Err(e) => {
                    warn!(client = %client_id, error = %e, "client_training_failed");
                    FED_METRICS.failed_clients_total.add(1, &[]);
                    out.failures.push(ClientFailure { client_id, reason: e.to_string() });
                }
            }
        }
        out
    }

    /// FedAvg over the pending updates, weighted by trained sample count and
    /// accumulated in f64 in client-id order. Shapes are checked before any
    /// state changes; after that the pending set is cleared and the round
    /// index advances in every case.
    #[instrument(skip(self), fields(round = self.round_index + 1, pending = self.pending.len()))]
    pub fn update_model(&mut self) -> Result<RoundOutcome> {
        let current = self.model.get_params();
        let shape = current.shape();
        if let Some(bad) = self.pending.iter().find(|u| u.params.shape() != shape) {
            return Err(FedError::invariant(format!("update from {} has shape {:?}, expected {:?}", bad.client_id, bad.params.shape(), shape)));
        }

        let mut updates = std::mem::take(&mut self.pending);
        let had_selection = !self.selected.is_empty();
        self.selected.clear();
        self.round_index += 1;

        updates.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let total_weight: f64 = updates.iter().map(|u| u.num_samples as f64).sum();
        if total_weight <= 0.0 {
            if !had_selection {
                debug!(round = self.round_index, "empty_round");
                return Ok(RoundOutcome::Empty);
            }
            warn!(round = self.round_index, "degenerate_round");
            FED_METRICS.degenerate_rounds_total.add(1, &[]);
            return Ok(RoundOutcome::Degenerate);
        }

        let started = Instant::now();
        let mut acc: Vec<Vec<f64>> = shape.iter().map(|&n| vec![0f64; n]).collect();
        for u in &updates {
            let w = u.num_samples as f64;
            for (dst, src) in acc.iter_mut().zip(&u.params.layers) {
                for (d, v) in dst.iter_mut().zip(src) { *d += w * f64::from(*v); }
            }
        }
        let layers = acc.into_iter().map(|l| l.into_iter().map(|v| (v / total_weight) as f32).collect()).collect();
        self.model.set_params(Params::new(layers));

        let latency = started.elapsed().as_secs_f64() * 1000.0;
        FED_METRICS.aggregation_latency_ms.record(latency, &[]);
        FED_METRICS.rounds_total.add(1, &[]);
        FED_METRICS.participants_total.add(updates.len() as u64, &[]);
        info!(round = self.round_index, contributors = updates.len(), total_weight, "model_aggregated");
        Ok(RoundOutcome::Aggregated { contributors: updates.len(), total_weight })
    }

    /// Evaluate the current global model on `set` for each client. Clients
    /// with an empty `set` partition are skipped.
    #[instrument(skip(self, clients, set), fields(clients = clients.len(), set = set.as_str()))]
    pub fn test_model(&self, clients: &[Client], set: Partition) -> Result<MetricsByClient> {
        let snapshot = self.model.get_params();
        let model = self.model.model();
        clients
            .par_iter()
            .filter(|c| c.num_samples(set) > 0)
            .map(|c| c.test(model.as_ref(), &snapshot, set).map(|m| (c.id().to_string(), m)))
            .collect()
    }

    pub fn get_clients_info(&self, clients: &[Client]) -> Vec<ClientInfo> {
        clients
            .iter()
            .map(|c| ClientInfo { id: c.id().to_string(), group: c.group().map(str::to_string), num_train_samples: c.num_train_samples(), num_eval_samples: c.num_eval_samples() })
            .collect()
    }
}

/// One weight per client, train plus eval samples, used for the train and
/// the eval summaries alike.
pub fn sample_weights(infos: &[ClientInfo]) -> WeightsByClient {
    infos.iter().map(|i| (i.id.clone(), i.num_samples() as f64)).collect()
}

/// `weights` restricted to the clients present in `metrics`.
pub fn weights_for(weights: &WeightsByClient, metrics: &MetricsByClient) -> WeightsByClient {
    weights.iter().filter(|(id, _)| metrics.contains_key(*id)).map(|(id, w)| (id.clone(), *w)).collect()
}

/// splitmix64 finalizer over `a ^ b`.
fn mix(a: u64, b: u64) -> u64 {
    let mut z = a ^ b.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3))
}
