//! Weighted statistics over per-client metric tables and per-round cost
//! accounting. Pure functions; writing results out is the sink's job.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{FedError, Result};
use crate::model::{MetricMap, SysMetrics};

pub type MetricsByClient = BTreeMap<String, MetricMap>;
pub type WeightsByClient = BTreeMap<String, f64>;

pub const PERCENTILES: [f64; 3] = [10.0, 50.0, 90.0];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Weighted by the per-client weights.
    pub mean: f64,
    /// Unweighted percentiles of the per-client values.
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub metrics: BTreeMap<String, MetricSummary>,
}

impl SummaryReport {
    pub fn get(&self, metric: &str) -> Option<&MetricSummary> { self.metrics.get(metric) }
    pub fn is_empty(&self) -> bool { self.metrics.is_empty() }
}

/// Linear interpolation between closest ranks over an ascending slice
/// (`rank = q/100 * (n-1)`). `q` in `[0, 100]`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Weighted mean plus p10/p50/p90 for every metric name.
///
/// Both tables must have the same client keys, every client must report the
/// same metric names, and weights must be non-negative with a positive sum.
/// Empty tables give an empty report.
pub fn weighted_summary(metrics_by_client: &MetricsByClient, weights_by_client: &WeightsByClient) -> Result<SummaryReport> {
    if !metrics_by_client.keys().eq(weights_by_client.keys()) {
        return Err(FedError::invariant("metric and weight tables cover different clients"));
    }
    let Some((first_id, first)) = metrics_by_client.iter().next() else { return Ok(SummaryReport::default()) };
    let names: BTreeSet<&String> = first.keys().collect();
    if let Some((id, _)) = metrics_by_client.iter().find(|(_, m)| !m.keys().eq(names.iter().copied())) {
        return Err(FedError::config(format!("client {id} reports a different metric set than {first_id}")));
    }
    if let Some((id, w)) = weights_by_client.iter().find(|(_, w)| !(**w >= 0.0 && w.is_finite())) {
        return Err(FedError::invariant(format!("client {id} has invalid weight {w}")));
    }
    let total: f64 = weights_by_client.values().sum();
    if total <= 0.0 {
        return Err(FedError::invariant("total weight is zero"));
    }

    let mut report = SummaryReport::default();
    for name in names {
        let mut values: Vec<f64> = metrics_by_client.values().map(|m| m[name]).collect();
        let mean = metrics_by_client.iter().map(|(id, m)| weights_by_client[id] * m[name]).sum::<f64>() / total;
        values.sort_by(f64::total_cmp);
        let [p10, p50, p90] = PERCENTILES.map(|q| percentile(&values, q));
        report.metrics.insert(name.clone(), MetricSummary { mean, p10, p50, p90 });
    }
    Ok(report)
}

/// Cost totals of one training round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCost {
    pub round: usize,
    pub clients: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub local_computations: u64,
}

impl RoundCost {
    pub fn bytes_total(&self) -> u64 { self.bytes_read + self.bytes_written }
}

/// Running byte and compute totals across the rounds of a trial.
#[derive(Debug, Clone, Default)]
pub struct SystemMetricsAccumulator {
    rounds: Vec<RoundCost>,
    cumulative_bytes: u64,
}

impl SystemMetricsAccumulator {
    pub fn new() -> Self { Self::default() }

    pub fn record_round(&mut self, round: usize, sys: &BTreeMap<String, SysMetrics>) -> RoundCost {
        let cost = sys.values().fold(RoundCost { round, clients: sys.len(), ..Default::default() }, |mut acc, s| {
            acc.bytes_read += s.bytes_read;
            acc.bytes_written += s.bytes_written;
            acc.local_computations += s.local_computations;
            acc
        });
        self.cumulative_bytes += cost.bytes_total();
        self.rounds.push(cost);
        cost
    }

    /// Bytes moved in the latest recorded round; 0 before any training.
    pub fn last_round_bytes(&self) -> u64 { self.rounds.last().map(RoundCost::bytes_total).unwrap_or(0) }
    pub fn cumulative_bytes(&self) -> u64 { self.cumulative_bytes }
    pub fn rounds(&self) -> &[RoundCost] { &self.rounds }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(values: &[(&str, f64, f64)]) -> (MetricsByClient, WeightsByClient) {
        let metrics = values.iter().map(|(id, acc, _)| (id.to_string(), MetricMap::from([("accuracy".to_string(), *acc)]))).collect();
        let weights = values.iter().map(|(id, _, w)| (id.to_string(), *w)).collect();
        (metrics, weights)
    }

    #[test]
    fn four_client_scenario() {
        let (m, w) = table(&[("a", 0.5, 10.0), ("b", 0.6, 20.0), ("c", 0.7, 30.0), ("d", 0.8, 40.0)]);
        let s = weighted_summary(&m, &w).unwrap();
        let acc = s.get("accuracy").unwrap();
        assert!((acc.mean - 0.70).abs() < 1e-12);
        assert!((acc.p50 - 0.65).abs() < 1e-12);
        assert!((acc.p10 - 0.53).abs() < 1e-12);
        assert!((acc.p90 - 0.77).abs() < 1e-12);
    }

    #[test]
    fn single_client_percentiles_collapse() {
        let (m, w) = table(&[("a", 0.42, 1.0)]);
        let acc = *weighted_summary(&m, &w).unwrap().get("accuracy").unwrap();
        assert_eq!((acc.mean, acc.p10, acc.p50, acc.p90), (0.42, 0.42, 0.42, 0.42));
    }

    #[test]
    fn empty_tables_give_empty_report() {
        assert!(weighted_summary(&MetricsByClient::new(), &WeightsByClient::new()).unwrap().is_empty());
    }

    #[test]
    fn mismatched_metric_names_are_configuration_errors() {
        let (mut m, w) = table(&[("a", 0.5, 1.0), ("b", 0.6, 1.0)]);
        m.get_mut("b").unwrap().insert("loss".into(), 1.0);
        assert!(matches!(weighted_summary(&m, &w), Err(FedError::Configuration(_))));
    }

    #[test]
    fn key_divergence_and_negative_weights_are_invariant_violations() {
        let (m, mut w) = table(&[("a", 0.5, 1.0), ("b", 0.6, 1.0)]);
        w.insert("z".into(), 1.0);
        assert!(matches!(weighted_summary(&m, &w), Err(FedError::AggregationInvariant(_))));
        let (m, w) = table(&[("a", 0.5, -1.0), ("b", 0.6, 1.0)]);
        assert!(matches!(weighted_summary(&m, &w), Err(FedError::AggregationInvariant(_))));
        let (m, w) = table(&[("a", 0.5, 0.0)]);
        assert!(matches!(weighted_summary(&m, &w), Err(FedError::AggregationInvariant(_))));
    }

    #[test]
    fn accumulator_tracks_round_and_cumulative_bytes() {
        let mut acc = SystemMetricsAccumulator::new();
        assert_eq!(acc.last_round_bytes(), 0);
        let sys = BTreeMap::from([("a".to_string(), SysMetrics::for_transfer(10, 5)), ("b".to_string(), SysMetrics::for_transfer(10, 7))]);
        let cost = acc.record_round(1, &sys);
        assert_eq!(cost.bytes_read, 80);
        assert_eq!(cost.local_computations, 12);
        acc.record_round(2, &BTreeMap::new());
        assert_eq!(acc.last_round_bytes(), 0);
        assert_eq!(acc.cumulative_bytes(), 160);
        assert_eq!(acc.rounds().len(), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn rows() -> impl Strategy<Value = Vec<(f64, f64)>> {
        prop::collection::vec((0.0f64..1.0, 0.01f64..1000.0), 1..40)
    }

    fn build(rows: &[(f64, f64)], scale: f64) -> (MetricsByClient, WeightsByClient) {
        let m = rows.iter().enumerate().map(|(i, (v, _))| (format!("c{i:03}"), MetricMap::from([("accuracy".to_string(), *v)]))).collect();
        let w = rows.iter().enumerate().map(|(i, (_, w))| (format!("c{i:03}"), w * scale)).collect();
        (m, w)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_mean_is_weighted_arithmetic_mean(rows in rows()) {
            let (m, w) = build(&rows, 1.0);
            let expected = rows.iter().map(|(v, w)| v * w).sum::<f64>() / rows.iter().map(|(_, w)| w).sum::<f64>();
            let got = weighted_summary(&m, &w).unwrap().get("accuracy").unwrap().mean;
            prop_assert!((got - expected).abs() < 1e-9);
        }

        #[test]
        fn prop_mean_invariant_under_weight_scaling(rows in rows(), scale in 0.001f64..1000.0) {
            let (m, w) = build(&rows, 1.0);
            let (_, ws) = build(&rows, scale);
            let a = weighted_summary(&m, &w).unwrap().get("accuracy").unwrap().mean;
            let b = weighted_summary(&m, &ws).unwrap().get("accuracy").unwrap().mean;
            prop_assert!((a - b).abs() < 1e-9);
        }

        #[test]
        fn prop_percentiles_are_ordered(rows in rows()) {
            let (m, w) = build(&rows, 1.0);
            let s = *weighted_summary(&m, &w).unwrap().get("accuracy").unwrap();
            prop_assert!(s.p10 <= s.p50 && s.p50 <= s.p90);
        }
    }
}
