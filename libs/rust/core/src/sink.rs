//! Stable, parseable output tables: weighted statistics per round and
//! partition, per-client system cost, and per-round outcome.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::client::Partition;
use crate::error::Result;
use crate::metrics::SummaryReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatLine {
    pub round: usize,
    pub prefix: String,
    pub metric: String,
    pub mean: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl StatLine {
    pub fn from_report(round: usize, partition: Partition, report: &SummaryReport) -> Vec<StatLine> {
        report
            .metrics
            .iter()
            .map(|(metric, s)| StatLine { round, prefix: partition.as_str().to_string(), metric: metric.clone(), mean: s.mean, p10: s.p10, p50: s.p50, p90: s.p90 })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysLine {
    pub round: usize,
    pub client_id: String,
    pub group: String,
    pub num_samples: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub local_computations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Aggregated,
    /// Clients were selected but every one of them failed.
    Degenerate,
    /// Nobody was available to select.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundLine {
    pub round: usize,
    pub selected: usize,
    pub contributed: usize,
    pub failed: usize,
    pub status: RoundStatus,
    pub cumulative_bytes: u64,
}

pub trait MetricsSink: Send {
    fn write_stats(&mut self, lines: &[StatLine]) -> Result<()>;
    fn write_sys(&mut self, lines: &[SysLine]) -> Result<()>;
    fn write_round(&mut self, line: &RoundLine) -> Result<()>;
    fn flush(&mut self) -> Result<()> { Ok(()) }
}

/// `<dir>/<name>_stat.csv`, `<name>_sys.csv` and `<name>_rounds.csv`.
pub struct CsvSink {
    stat: csv::Writer<File>,
    sys: csv::Writer<File>,
    rounds: csv::Writer<File>,
}

impl CsvSink {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |suffix: &str| csv::Writer::from_path(dir.join(format!("{name}_{suffix}.csv")));
        Ok(Self { stat: open("stat")?, sys: open("sys")?, rounds: open("rounds")? })
    }
}

impl MetricsSink for CsvSink {
    fn write_stats(&mut self, lines: &[StatLine]) -> Result<()> {
        for l in lines { self.stat.serialize(l)?; }
        Ok(())
    }

    fn write_sys(&mut self, lines: &[SysLine]) -> Result<()> {
        for l in lines { self.sys.serialize(l)?; }
        Ok(())
    }

    fn write_round(&mut self, line: &RoundLine) -> Result<()> {
        self.rounds.serialize(line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.stat.flush()?;
        self.sys.flush()?;
        self.rounds.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub stats: Vec<StatLine>,
    pub sys: Vec<SysLine>,
    pub rounds: Vec<RoundLine>,
}

/// Keeps everything in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn with<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R { f(&self.inner.lock()) }
}

impl MetricsSink for MemorySink {
    fn write_stats(&mut self, lines: &[StatLine]) -> Result<()> {
        self.inner.lock().stats.extend_from_slice(lines);
        Ok(())
    }

    fn write_sys(&mut self, lines: &[SysLine]) -> Result<()> {
        self.inner.lock().sys.extend_from_slice(lines);
        Ok(())
    }

    fn write_round(&mut self, line: &RoundLine) -> Result<()> {
        self.inner.lock().rounds.push(line.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSummary;

    fn report() -> SummaryReport {
        let mut r = SummaryReport::default();
        r.metrics.insert("accuracy".into(), MetricSummary { mean: 0.7, p10: 0.53, p50: 0.65, p90: 0.77 });
        r.metrics.insert("loss".into(), MetricSummary { mean: 1.2, p10: 1.0, p50: 1.1, p90: 1.5 });
        r
    }

    #[test]
    fn csv_tables_have_stable_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "metrics").unwrap();
        sink.write_stats(&StatLine::from_report(2, Partition::Test, &report())).unwrap();
        sink.write_sys(&[SysLine { round: 1, client_id: "u1".into(), group: String::new(), num_samples: 10, bytes_read: 40, bytes_written: 40, local_computations: 7 }]).unwrap();
        sink.write_round(&RoundLine { round: 1, selected: 2, contributed: 0, failed: 2, status: RoundStatus::Degenerate, cumulative_bytes: 0 }).unwrap();
        sink.flush().unwrap();

        let stat = std::fs::read_to_string(dir.path().join("metrics_stat.csv")).unwrap();
        let mut lines = stat.lines();
        assert_eq!(lines.next(), Some("round,prefix,metric,mean,p10,p50,p90"));
        assert_eq!(lines.next(), Some("2,test,accuracy,0.7,0.53,0.65,0.77"));
        assert_eq!(lines.count(), 1);

        let sys = std::fs::read_to_string(dir.path().join("metrics_sys.csv")).unwrap();
        assert!(sys.starts_with("round,client_id,group,num_samples,bytes_read,bytes_written,local_computations\n1,u1,,10,40,40,7"));
        let rounds = std::fs::read_to_string(dir.path().join("metrics_rounds.csv")).unwrap();
        assert!(rounds.contains("1,2,0,2,degenerate,0"));
    }

    #[test]
    fn memory_sink_clones_share_buffer() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_stats(&StatLine::from_report(0, Partition::Train, &report())).unwrap();
        assert_eq!(sink.with(|r| r.stats.len()), 2);
        assert_eq!(sink.with(|r| r.stats[0].prefix.clone()), "train");
    }
}
