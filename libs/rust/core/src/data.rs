//! Client data partitions and the providers that produce them.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{FedError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub x: Vec<Vec<f32>>,
    pub y: Vec<u32>,
}

impl Dataset {
    pub fn len(&self) -> usize { self.y.len() }
    pub fn is_empty(&self) -> bool { self.y.is_empty() }

    /// `n` distinct examples drawn without replacement, in draw order.
    pub fn subsample(&self, n: usize, rng: &mut StdRng) -> Dataset {
        let picked = index::sample(rng, self.len(), n.min(self.len()));
        Dataset { x: picked.iter().map(|i| self.x[i].clone()).collect(), y: picked.iter().map(|i| self.y[i]).collect() }
    }
}

/// One user's partitions as handed over by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientData {
    pub id: String,
    pub group: Option<String>,
    pub train: Dataset,
    /// Test or validation split, whichever the trial asked for.
    pub eval: Dataset,
}

/// Shape facts the model factory needs when the config leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetInfo {
    pub input_dim: usize,
    pub num_classes: usize,
}

impl DatasetInfo {
    pub fn infer(clients: &[ClientData]) -> Option<Self> {
        let parts = clients.iter().flat_map(|c| [&c.train, &c.eval]);
        let input_dim = parts.clone().find_map(|d| d.x.first().map(Vec::len))?;
        let max_label = parts.flat_map(|d| d.y.iter().copied()).max()?;
        Some(Self { input_dim, num_classes: max_label as usize + 1 })
    }
}

pub trait DataProvider: Send + Sync {
    /// Clients of `dataset`, ordered by id.
    fn load(&self, dataset: &str, use_validation_set: bool) -> Result<Vec<ClientData>>;
}

/// LEAF-style synthetic federation: every client perturbs a shared linear
/// labelling rule and draws features around its own centre, so partitions
/// are non-IID. Deterministic in `seed`.
#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    pub num_clients: usize,
    pub dim: usize,
    pub num_classes: usize,
    pub seed: u64,
    /// Spread of per-client rule perturbation.
    pub alpha: f32,
    /// Spread of per-client feature centres.
    pub beta: f32,
}

impl SyntheticProvider {
    pub fn new(num_clients: usize, dim: usize, num_classes: usize, seed: u64) -> Self {
        Self { num_clients, dim, num_classes, seed, alpha: 0.5, beta: 0.5 }
    }

    fn client(&self, k: usize, base: &[f32], rng: &mut StdRng) -> (Dataset, Dataset, Dataset) {
        let w: Vec<f32> = base.iter().map(|v| v + self.alpha * gaussian(rng)).collect();
        let shift = self.beta * gaussian(rng);
        let centre: Vec<f32> = (0..self.dim).map(|_| shift + gaussian(rng)).collect();
        let n = (gaussian(rng) + 4.0).exp().clamp(10.0, 500.0) as usize;
        let mut all = Dataset::default();
        for _ in 0..n {
            let x: Vec<f32> = centre.iter().map(|c| c + gaussian(rng)).collect();
            let y = (0..self.num_classes)
                .map(|c| w[c * self.dim..(c + 1) * self.dim].iter().zip(&x).map(|(a, b)| a * b).sum::<f32>())
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (c, s)| if s > best.1 { (c, s) } else { best })
                .0;
            all.x.push(x);
            all.y.push(y as u32);
        }
        let n_train = (n * 8 / 10).max(1);
        let n_test = (n - n_train) / 2;
        let split = |r: std::ops::Range<usize>| Dataset { x: all.x[r.clone()].to_vec(), y: all.y[r].to_vec() };
        debug!(client = k, samples = n, "synthetic_client_generated");
        (split(0..n_train), split(n_train..n_train + n_test), split(n_train + n_test..n))
    }
}

impl DataProvider for SyntheticProvider {
    fn load(&self, dataset: &str, use_validation_set: bool) -> Result<Vec<ClientData>> {
        if self.dim == 0 || self.num_classes < 2 {
            return Err(FedError::config("synthetic data needs dim > 0 and num_classes >= 2"));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let base: Vec<f32> = (0..self.num_classes * self.dim).map(|_| gaussian(&mut rng)).collect();
        let clients = (0..self.num_clients)
            .map(|k| {
                let (train, test, val) = self.client(k, &base, &mut rng);
                ClientData { id: format!("{dataset}_{k:05}"), group: None, train, eval: if use_validation_set { val } else { test } }
            })
            .collect::<Vec<_>>();
        info!(dataset, clients = clients.len(), "synthetic_data_ready");
        Ok(clients)
    }
}

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[derive(Debug, Deserialize)]
struct LeafShard {
    users: Vec<String>,
    #[serde(default)]
    hierarchies: Vec<Value>,
    user_data: HashMap<String, Dataset>,
}

#[derive(Debug, Default)]
struct LeafSplit {
    groups: HashMap<String, String>,
    users: Vec<String>,
    data: HashMap<String, Dataset>,
}

/// Reads LEAF JSON shards from `<root>/data/<dataset>/{train,test,val}`.
#[derive(Debug, Clone)]
pub struct LeafDirectoryProvider {
    pub root: PathBuf,
}

impl LeafDirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    fn read_split(dir: &Path) -> Result<LeafSplit> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        if files.is_empty() { return Err(FedError::Data(format!("no .json shards in {}", dir.display()))); }
        let mut split = LeafSplit::default();
        for f in files {
            let shard: LeafShard = serde_json::from_slice(&std::fs::read(&f)?)?;
            for (i, u) in shard.users.iter().enumerate() {
                if let Some(h) = shard.hierarchies.get(i) {
                    let g = match h { Value::String(s) => s.clone(), other => other.to_string() };
                    split.groups.insert(u.clone(), g);
                }
            }
            split.users.extend(shard.users);
            split.data.extend(shard.user_data);
        }
        Ok(split)
    }
}

impl DataProvider for LeafDirectoryProvider {
    fn load(&self, dataset: &str, use_validation_set: bool) -> Result<Vec<ClientData>> {
        let base = self.root.join("data").join(dataset);
        let mut train = Self::read_split(&base.join("train"))?;
        let mut eval = Self::read_split(&base.join(if use_validation_set { "val" } else { "test" }))?;
        let users: BTreeSet<String> = train.users.drain(..).collect();
        let mut clients = Vec::with_capacity(users.len());
        for id in users {
            let t = train.data.remove(&id).ok_or_else(|| FedError::Data(format!("user {id} listed without train data")))?;
            let e = eval.data.remove(&id).ok_or_else(|| FedError::Data(format!("user {id} has no eval data")))?;
            if t.x.len() != t.y.len() || e.x.len() != e.y.len() {
                return Err(FedError::Data(format!("user {id} has mismatched x/y lengths")));
            }
            clients.push(ClientData { group: train.groups.remove(&id), id, train: t, eval: e });
        }
        info!(dataset, clients = clients.len(), root = %self.root.display(), "leaf_data_loaded");
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_is_deterministic_and_disjoint_per_seed() {
        let p = SyntheticProvider::new(5, 4, 3, 11);
        let a = p.load("synthetic", false).unwrap();
        let b = p.load("synthetic", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        for c in &a {
            assert!(!c.train.is_empty());
            assert!(c.train.y.iter().all(|y| *y < 3));
            assert!(c.train.x.iter().all(|x| x.len() == 4));
        }
        let other = SyntheticProvider::new(5, 4, 3, 12).load("synthetic", false).unwrap();
        assert_ne!(a[0].train, other[0].train);
    }

    #[test]
    fn validation_flag_switches_eval_split() {
        let p = SyntheticProvider::new(3, 4, 3, 2);
        let test = p.load("synthetic", false).unwrap();
        let val = p.load("synthetic", true).unwrap();
        assert_eq!(test[0].train, val[0].train);
        assert_ne!(test[0].eval, val[0].eval);
    }

    #[test]
    fn subsample_draws_without_replacement() {
        let d = Dataset { x: (0..10).map(|i| vec![i as f32]).collect(), y: (0..10).collect() };
        let s = d.subsample(4, &mut StdRng::seed_from_u64(3));
        assert_eq!(s.len(), 4);
        let mut ys = s.y.clone();
        ys.sort_unstable();
        ys.dedup();
        assert_eq!(ys.len(), 4);
        assert_eq!(d.subsample(50, &mut StdRng::seed_from_u64(3)).len(), 10);
    }

    #[test]
    fn infer_reads_dim_and_classes() {
        let clients = SyntheticProvider::new(4, 6, 5, 0).load("synthetic", false).unwrap();
        let info = DatasetInfo::infer(&clients).unwrap();
        assert_eq!(info.input_dim, 6);
        assert!(info.num_classes <= 5 && info.num_classes >= 1);
    }

    #[test]
    fn leaf_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data").join("femnist");
        for split in ["train", "test"] { std::fs::create_dir_all(base.join(split)).unwrap(); }
        let train = serde_json::json!({
            "users": ["u2", "u1"], "hierarchies": ["g2", "g1"], "num_samples": [1, 2],
            "user_data": { "u2": { "x": [[0.0, 1.0]], "y": [1] }, "u1": { "x": [[1.0, 0.0], [0.5, 0.5]], "y": [0, 1] } }
        });
        let test = serde_json::json!({
            "users": ["u1", "u2"], "num_samples": [1, 1],
            "user_data": { "u1": { "x": [[1.0, 0.0]], "y": [0] }, "u2": { "x": [[0.0, 1.0]], "y": [1] } }
        });
        std::fs::write(base.join("train").join("all_data_0.json"), train.to_string()).unwrap();
        std::fs::write(base.join("test").join("all_data_0.json"), test.to_string()).unwrap();

        let clients = LeafDirectoryProvider::new(dir.path()).load("femnist", false).unwrap();
        assert_eq!(clients.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["u1", "u2"]);
        assert_eq!(clients[0].group.as_deref(), Some("g1"));
        assert_eq!(clients[0].train.len(), 2);
        assert_eq!(clients[1].eval.y, vec![1]);

        assert!(LeafDirectoryProvider::new(dir.path()).load("femnist", true).is_err());
    }
}
