//! Model capability consumed by clients and the server.
//!
//! `Model` is a stateless capability: parameters travel in and out explicitly,
//! so one instance can be shared by every client thread of a round. The
//! server's canonical copy lives in `ModelHandle`. Implementations are
//! resolved through a static `ModelRegistry` keyed by `"<dataset>.<model>"`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::HyperParams;
use crate::data::Dataset;
use crate::error::{FedError, Result};

pub type MetricMap = BTreeMap<String, f64>;

/// Layer-wise flat parameter buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub layers: Vec<Vec<f32>>,
}

impl Params {
    pub fn new(layers: Vec<Vec<f32>>) -> Self { Self { layers } }
    pub fn shape(&self) -> Vec<usize> { self.layers.iter().map(Vec::len).collect() }
    pub fn num_params(&self) -> usize { self.layers.iter().map(Vec::len).sum() }
    pub fn is_finite(&self) -> bool { self.layers.iter().flatten().all(|v| v.is_finite()) }
}

/// Cost of one client's local step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysMetrics {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub local_computations: u64,
}

impl SysMetrics {
    /// Download and upload of a full parameter set of `num_params` f32 values.
    pub fn for_transfer(num_params: usize, local_computations: u64) -> Self {
        let bytes = (num_params * std::mem::size_of::<f32>()) as u64;
        Self { bytes_read: bytes, bytes_written: bytes, local_computations }
    }

    pub fn bytes_total(&self) -> u64 { self.bytes_read + self.bytes_written }
}

pub trait Model: Send + Sync {
    fn name(&self) -> &str;
    fn initialize(&self, rng: &mut StdRng) -> Params;
    /// Local training from `params`; returns new parameters and the step's cost.
    fn train(&self, params: &Params, data: &Dataset, num_epochs: usize, batch_size: usize, rng: &mut StdRng) -> Result<(Params, SysMetrics)>;
    fn test(&self, params: &Params, data: &Dataset) -> Result<MetricMap>;
    /// Parameter count.
    fn size(&self) -> usize;
}

/// The shared global model: one capability plus the canonical parameters.
/// Readers take an `Arc` snapshot; only `set_params` replaces it.
#[derive(Clone)]
pub struct ModelHandle {
    model: Arc<dyn Model>,
    params: Arc<Params>,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn Model>, rng: &mut StdRng) -> Self {
        let params = Arc::new(model.initialize(rng));
        Self { model, params }
    }

    pub fn model(&self) -> &Arc<dyn Model> { &self.model }
    pub fn get_params(&self) -> Arc<Params> { Arc::clone(&self.params) }
    pub fn set_params(&mut self, params: Params) { self.params = Arc::new(params); }
    pub fn size(&self) -> usize { self.model.size() }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("model", &self.model.name()).field("shape", &self.params.shape()).finish()
    }
}

pub type ModelFactory = fn(&HyperParams) -> Result<Arc<dyn Model>>;

pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn empty() -> Self { Self { factories: HashMap::new() } }

    /// Logistic regression registered for every dataset with defaults.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        for dataset in ["synthetic", "femnist", "celeba", "sent140", "shakespeare", "reddit"] {
            reg.register(format!("{dataset}.logreg"), LogisticRegression::factory);
        }
        reg
    }

    pub fn register(&mut self, key: impl Into<String>, factory: ModelFactory) { self.factories.insert(key.into(), factory); }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn resolve(&self, key: &str, hp: &HyperParams) -> Result<Arc<dyn Model>> {
        let factory = self.factories.get(key).ok_or_else(|| FedError::UnknownModel(key.to_string(), self.keys().join(", ")))?;
        factory(hp)
    }
}

pub fn hp_f64(hp: &HyperParams, key: &str) -> Result<f64> {
    hp.get(key).and_then(Value::as_f64).ok_or_else(|| FedError::config(format!("hyperparameter '{key}' missing or not a number")))
}

pub fn hp_usize(hp: &HyperParams, key: &str) -> Result<usize> {
    hp.get(key).and_then(Value::as_u64).map(|v| v as usize).ok_or_else(|| FedError::config(format!("hyperparameter '{key}' missing or not a non-negative integer")))
}

/// Multinomial logistic regression trained with plain minibatch SGD.
/// Parameters: `[W (num_classes x input_dim, row-major), b (num_classes)]`.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    lr: f32,
    num_classes: usize,
    input_dim: usize,
}

impl LogisticRegression {
    pub fn new(lr: f32, num_classes: usize, input_dim: usize) -> Result<Self> {
        if !(lr > 0.0 && lr.is_finite()) { return Err(FedError::config(format!("lr must be > 0, got {lr}"))); }
        if num_classes < 2 { return Err(FedError::config("num_classes must be >= 2")); }
        if input_dim == 0 { return Err(FedError::config("input_dim must be > 0")); }
        Ok(Self { lr, num_classes, input_dim })
    }

    fn factory(hp: &HyperParams) -> Result<Arc<dyn Model>> {
        let m = Self::new(hp_f64(hp, "lr")? as f32, hp_usize(hp, "num_classes")?, hp_usize(hp, "input_dim")?)?;
        Ok(Arc::new(m))
    }

    fn check(&self, params: &Params, data: &Dataset) -> Result<()> {
        if params.shape() != [self.num_classes * self.input_dim, self.num_classes] {
            return Err(FedError::invariant(format!("parameter shape {:?} does not fit logreg {}x{}", params.shape(), self.num_classes, self.input_dim)));
        }
        if let Some(x) = data.x.iter().find(|x| x.len() != self.input_dim) {
            return Err(FedError::Data(format!("feature length {} != input_dim {}", x.len(), self.input_dim)));
        }
        if let Some(y) = data.y.iter().find(|y| **y as usize >= self.num_classes) {
            return Err(FedError::Data(format!("label {y} out of range for {} classes", self.num_classes)));
        }
        Ok(())
    }

    /// Softmax probabilities into `out`.
    fn probs(&self, w: &[f32], b: &[f32], x: &[f32], out: &mut [f32]) {
        for (c, o) in out.iter_mut().enumerate() {
            let row = &w[c * self.input_dim..(c + 1) * self.input_dim];
            *o = b[c] + row.iter().zip(x).map(|(a, v)| a * v).sum::<f32>();
        }
        let max = out.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut z = 0.0;
        for o in out.iter_mut() { *o = (*o - max).exp(); z += *o; }
        for o in out.iter_mut() { *o /= z; }
    }
}

impl Model for LogisticRegression {
    fn name(&self) -> &str { "logreg" }

    fn initialize(&self, rng: &mut StdRng) -> Params {
        let scale = 1.0 / (self.input_dim as f32).sqrt();
        let w = (0..self.num_classes * self.input_dim).map(|_| rng.gen_range(-scale..scale)).collect();
        Params::new(vec![w, vec![0.0; self.num_classes]])
    }

    fn train(&self, params: &Params, data: &Dataset, num_epochs: usize, batch_size: usize, rng: &mut StdRng) -> Result<(Params, SysMetrics)> {
        self.check(params, data)?;
        if data.is_empty() { return Err(FedError::Data("empty training partition".into())); }
        let mut w = params.layers[0].clone();
        let mut b = params.layers[1].clone();
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut p = vec![0.0f32; self.num_classes];
        let mut gw = vec![0.0f32; w.len()];
        let mut gb = vec![0.0f32; b.len()];
        let bs = batch_size.max(1);

        for _ in 0..num_epochs {
            order.shuffle(rng);
            for batch in order.chunks(bs) {
                gw.iter_mut().for_each(|g| *g = 0.0);
                gb.iter_mut().for_each(|g| *g = 0.0);
                for &i in batch {
                    let x = &data.x[i];
                    self.probs(&w, &b, x, &mut p);
                    p[data.y[i] as usize] -= 1.0;
                    for (c, d) in p.iter().enumerate() {
                        gb[c] += d;
                        let row = &mut gw[c * self.input_dim..(c + 1) * self.input_dim];
                        for (g, v) in row.iter_mut().zip(x) { *g += d * v; }
                    }
                }
                let step = self.lr / batch.len() as f32;
                for (v, g) in w.iter_mut().zip(&gw) { *v -= step * g; }
                for (v, g) in b.iter_mut().zip(&gb) { *v -= step * g; }
            }
            if !w.iter().chain(&b).all(|v| v.is_finite()) {
                return Err(FedError::Data("parameters diverged to non-finite values".into()));
            }
        }
        let comp = (num_epochs * data.len() * self.num_classes * self.input_dim * 2) as u64;
        Ok((Params::new(vec![w, b]), SysMetrics::for_transfer(self.size(), comp)))
    }

    fn test(&self, params: &Params, data: &Dataset) -> Result<MetricMap> {
        self.check(params, data)?;
        if data.is_empty() { return Err(FedError::Data("empty evaluation partition".into())); }
        let (w, b) = (&params.layers[0], &params.layers[1]);
        let mut p = vec![0.0f32; self.num_classes];
        let (mut correct, mut loss) = (0usize, 0.0f64);
        for (x, &y) in data.x.iter().zip(&data.y) {
            self.probs(w, b, x, &mut p);
            let pred = p.iter().enumerate().fold(0, |best, (c, v)| if *v > p[best] { c } else { best });
            if pred == y as usize { correct += 1; }
            loss -= (p[y as usize].max(f32::MIN_POSITIVE) as f64).ln();
        }
        let n = data.len() as f64;
        Ok(MetricMap::from([("accuracy".to_string(), correct as f64 / n), ("loss".to_string(), loss / n)]))
    }

    fn size(&self) -> usize { self.num_classes * self.input_dim + self.num_classes }
}
