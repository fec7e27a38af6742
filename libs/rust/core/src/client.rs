//! Simulated participant: private partitions plus local train/eval against a
//! snapshot of the global parameters.

use std::sync::Arc;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::LocalTraining;
use crate::data::{ClientData, Dataset};
use crate::error::{FedError, Result};
use crate::model::{MetricMap, Model, Params, SysMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition { Train, Test, Val }

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self { Partition::Train => "train", Partition::Test => "test", Partition::Val => "val" }
    }

    pub fn eval(use_validation_set: bool) -> Self { if use_validation_set { Partition::Val } else { Partition::Test } }
}

/// Result of one client's local step, pending aggregation.
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    pub client_id: String,
    /// Samples actually trained on this round; the aggregation weight.
    pub num_samples: usize,
    pub params: Params,
    pub sys: SysMetrics,
}

#[derive(Debug, Clone)]
pub struct Client {
    id: String,
    group: Option<String>,
    train: Arc<Dataset>,
    eval: Arc<Dataset>,
    eval_kind: Partition,
}

impl Client {
    pub fn new(data: ClientData, use_validation_set: bool) -> Self {
        Self { id: data.id, group: data.group, train: Arc::new(data.train), eval: Arc::new(data.eval), eval_kind: Partition::eval(use_validation_set) }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn group(&self) -> Option<&str> { self.group.as_deref() }
    pub fn num_train_samples(&self) -> usize { self.train.len() }
    pub fn num_eval_samples(&self) -> usize { self.eval.len() }

    pub fn num_samples(&self, set: Partition) -> usize {
        if set == Partition::Train { self.num_train_samples() } else { self.num_eval_samples() }
    }

    /// Local training. Any model or numerical failure comes back as
    /// `FedError::ClientTraining` for this client.
    pub fn train(&self, model: &dyn Model, params: &Params, local: LocalTraining, rng: &mut StdRng) -> Result<ClientUpdate> {
        let fail = |reason: String| FedError::ClientTraining { client_id: self.id.clone(), reason };
        let sampled;
        let (data, num_epochs, batch_size) = match local {
            LocalTraining::Epochs { num_epochs, batch_size } => (self.train.as_ref(), num_epochs, batch_size),
            LocalTraining::Minibatch { fraction } => {
                let n = ((fraction * self.train.len() as f64) as usize).max(1);
                sampled = self.train.subsample(n, rng);
                // one pass over the sampled fraction as a single batch
                (&sampled, 1, n)
            }
        };
        if data.is_empty() { return Err(fail("no training samples".into())); }
        let (params, sys) = model.train(params, data, num_epochs, batch_size, rng).map_err(|e| fail(e.to_string()))?;
        if !params.is_finite() { return Err(fail("non-finite parameters after training".into())); }
        trace!(client = %self.id, samples = data.len(), "local_training_done");
        Ok(ClientUpdate { client_id: self.id.clone(), num_samples: data.len(), params, sys })
    }

    pub fn test(&self, model: &dyn Model, params: &Params, set: Partition) -> Result<MetricMap> {
        let data = match set {
            Partition::Train => &self.train,
            s if s == self.eval_kind => &self.eval,
            s => return Err(FedError::config(format!("client {} holds a {} split, not {}", self.id, self.eval_kind.as_str(), s.as_str()))),
        };
        model.test(params, data)
    }
}
