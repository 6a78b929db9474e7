//! Metrics recorder.
//!
//! Samples are appended into one of N shards, picked by `worker_id % N`, so
//! concurrent virtual users only contend with the few workers sharing their
//! shard. [`MetricsRecorder::snapshot`] merges every shard into a [`Snapshot`].
//!
//! Trend series are backed by an HDR histogram with 2 significant digits:
//! any percentile is reported within 1% relative error, and is clamped to the
//! exact min/max which are tracked separately.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

pub mod thresholds;

pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const HTTP_REQS: &str = "http_reqs";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS: &str = "iterations";
pub const CHECKS: &str = "checks";

/// Trend values are stored in thousandths of their unit (µs for millisecond latencies).
const TREND_SCALE: f64 = 1000.0;
/// One hour, in trend storage units.
const TREND_HIGHEST: u64 = 60 * 60 * 1000 * 1000;
const TREND_SIGFIG: u8 = 2;

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, TREND_HIGHEST, TREND_SIGFIG)
        .expect("constant histogram bounds are valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Trend,
    Rate,
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Trend => f.write_str("trend"),
            MetricKind::Rate => f.write_str("rate"),
            MetricKind::Counter => f.write_str("counter"),
        }
    }
}

/// Known series names and their kinds. Thresholds are resolved against it.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    kinds: HashMap<String, MetricKind>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MetricRegistry {
    pub fn with_builtins() -> Self {
        let kinds = [
            (HTTP_REQ_DURATION, MetricKind::Trend),
            (HTTP_REQ_FAILED, MetricKind::Rate),
            (HTTP_REQS, MetricKind::Counter),
            (ITERATION_DURATION, MetricKind::Trend),
            (ITERATIONS, MetricKind::Counter),
            (CHECKS, MetricKind::Rate),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        Self { kinds }
    }

    /// Declare a custom series. Re-declaring with the same kind is a no-op.
    pub fn declare(&mut self, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
        match self.kinds.get(name) {
            Some(existing) if *existing != kind => Err(ConfigError::ConflictingMetric {
                name: name.to_string(),
                existing: *existing,
            }),
            Some(_) => Ok(()),
            None => {
                self.kinds.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.kinds.get(name).copied()
    }
}

/// Result of one named check inside an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub duration: Duration,
    pub success: bool,
}

/// Key of the sub-series that receives samples carrying `key=value`.
pub fn tagged_key(name: &str, key: &str, value: &str) -> String {
    format!("{}{{{}:{}}}", name, key, value)
}

#[derive(Clone)]
struct TrendSeries {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendSeries {
    fn new() -> Self {
        Self {
            histogram: new_histogram(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, value: f64) {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        self.histogram
            .saturating_record((value * TREND_SCALE).round() as u64);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn merge(&mut self, other: &TrendSeries) {
        // Both sides share the same bounds, so add() cannot fail.
        let _ = self.histogram.add(&other.histogram);
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSeries {
    pub total: u64,
    pub trues: u64,
}

impl RateSeries {
    fn record(&mut self, value: bool) {
        self.total += 1;
        if value {
            self.trues += 1;
        }
    }

    /// Exact fraction of true samples, 0 when empty.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trues as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

#[derive(Default)]
struct Shard {
    trends: HashMap<String, TrendSeries>,
    rates: HashMap<String, RateSeries>,
    counters: HashMap<String, u64>,
    checks: HashMap<String, CheckTally>,
}

impl Shard {
    fn record_trend(&mut self, key: &str, value: f64) {
        match self.trends.get_mut(key) {
            Some(series) => series.record(value),
            None => {
                let mut series = TrendSeries::new();
                series.record(value);
                self.trends.insert(key.to_string(), series);
            }
        }
    }

    fn record_rate(&mut self, key: &str, value: bool) {
        match self.rates.get_mut(key) {
            Some(series) => series.record(value),
            None => {
                let mut series = RateSeries::default();
                series.record(value);
                self.rates.insert(key.to_string(), series);
            }
        }
    }
}

pub struct MetricsRecorder {
    shards: Vec<RwLock<Shard>>,
    registry: MetricRegistry,
}

pub type SharedRecorder = Arc<MetricsRecorder>;

impl MetricsRecorder {
    pub fn new(num_shards: usize, registry: MetricRegistry) -> Self {
        let num_shards = num_shards.max(1);
        let shards = (0..num_shards).map(|_| RwLock::new(Shard::default())).collect();
        Self { shards, registry }
    }

    /// Target ~100 workers per shard, between 16 and 256 shards.
    pub fn shards_for_workers(max_workers: usize) -> usize {
        (max_workers / 100).clamp(16, 256)
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Recording handle for one worker, bound to its shard.
    pub fn handle(self: &Arc<Self>, worker_id: usize) -> MetricsHandle {
        MetricsHandle {
            recorder: Arc::clone(self),
            shard: worker_id % self.shards.len(),
        }
    }

    /// Merge every shard into a point-in-time aggregate.
    ///
    /// Each shard is read-locked only while it is being merged, so writers on
    /// other shards keep going. The result can lag concurrent appends slightly.
    pub fn snapshot(&self) -> Snapshot {
        let mut trends: BTreeMap<String, TrendSeries> = BTreeMap::new();
        let mut snapshot = Snapshot::default();

        for shard in &self.shards {
            let shard = shard.read();
            for (name, series) in &shard.trends {
                match trends.get_mut(name) {
                    Some(merged) => merged.merge(series),
                    None => {
                        trends.insert(name.clone(), series.clone());
                    }
                }
            }
            for (name, series) in &shard.rates {
                let merged = snapshot.rates.entry(name.clone()).or_default();
                merged.total += series.total;
                merged.trues += series.trues;
            }
            for (name, value) in &shard.counters {
                *snapshot.counters.entry(name.clone()).or_insert(0) += value;
            }
            for (name, tally) in &shard.checks {
                let merged = snapshot.checks.entry(name.clone()).or_default();
                merged.passes += tally.passes;
                merged.fails += tally.fails;
            }
        }

        snapshot.trends = trends
            .into_iter()
            .map(|(name, series)| (name, TrendSnapshot(series)))
            .collect();
        snapshot
    }
}

/// Per-worker recording handle; cheap to clone.
#[derive(Clone)]
pub struct MetricsHandle {
    recorder: SharedRecorder,
    shard: usize,
}

impl MetricsHandle {
    pub fn recorder(&self) -> &SharedRecorder {
        &self.recorder
    }

    pub fn record_trend(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let mut shard = self.recorder.shards[self.shard].write();
        shard.record_trend(name, value);
        for (key, tag) in tags {
            shard.record_trend(&tagged_key(name, key, tag), value);
        }
    }

    pub fn record_rate(&self, name: &str, value: bool, tags: &[(&str, &str)]) {
        let mut shard = self.recorder.shards[self.shard].write();
        shard.record_rate(name, value);
        for (key, tag) in tags {
            shard.record_rate(&tagged_key(name, key, tag), value);
        }
    }

    pub fn add_counter(&self, name: &str, n: u64) {
        let mut shard = self.recorder.shards[self.shard].write();
        match shard.counters.get_mut(name) {
            Some(total) => *total += n,
            None => {
                shard.counters.insert(name.to_string(), n);
            }
        }
    }

    /// Record a check result into the `checks` rate and its per-name tally.
    pub fn record_outcome(&self, outcome: &ScenarioOutcome) {
        let mut shard = self.recorder.shards[self.shard].write();
        shard.record_rate(CHECKS, outcome.success);
        match shard.checks.get_mut(&outcome.name) {
            Some(tally) => {
                if outcome.success {
                    tally.passes += 1;
                } else {
                    tally.fails += 1;
                }
            }
            None => {
                let tally = if outcome.success {
                    CheckTally { passes: 1, fails: 0 }
                } else {
                    CheckTally { passes: 0, fails: 1 }
                };
                shard.checks.insert(outcome.name.clone(), tally);
            }
        }
    }
}

/// Merged view of one trend series.
#[derive(Clone)]
pub struct TrendSnapshot(TrendSeries);

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.0.count
    }

    pub fn sum(&self) -> f64 {
        self.0.sum
    }

    pub fn min(&self) -> f64 {
        if self.0.count == 0 {
            0.0
        } else {
            self.0.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.0.count == 0 {
            0.0
        } else {
            self.0.max
        }
    }

    pub fn avg(&self) -> f64 {
        if self.0.count == 0 {
            0.0
        } else {
            self.0.sum / self.0.count as f64
        }
    }

    /// Value at percentile `p` in [0, 100].
    pub fn percentile(&self, p: f64) -> f64 {
        if self.0.count == 0 {
            return 0.0;
        }
        let q = (p / 100.0).clamp(0.0, 1.0);
        if q == 0.0 {
            return self.min();
        }
        let raw = self.0.histogram.value_at_quantile(q) as f64 / TREND_SCALE;
        raw.clamp(self.min(), self.max())
    }
}

impl fmt::Debug for TrendSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendSnapshot")
            .field("count", &self.count())
            .field("avg", &self.avg())
            .field("min", &self.min())
            .field("max", &self.max())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub trends: BTreeMap<String, TrendSnapshot>,
    pub rates: BTreeMap<String, RateSeries>,
    pub counters: BTreeMap<String, u64>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl Snapshot {
    pub fn trend(&self, key: &str) -> Option<&TrendSnapshot> {
        self.trends.get(key)
    }

    pub fn rate(&self, key: &str) -> Option<&RateSeries> {
        self.rates.get(key)
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn to_report(&self) -> ReportStats {
        let trends = self
            .trends
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    TrendReport {
                        count: t.count(),
                        avg: t.avg(),
                        min: t.min(),
                        med: t.percentile(50.0),
                        max: t.max(),
                        p90: t.percentile(90.0),
                        p95: t.percentile(95.0),
                        p99: t.percentile(99.0),
                    },
                )
            })
            .collect();

        let rates = self
            .rates
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    RateReport {
                        total: r.total,
                        trues: r.trues,
                        rate: r.rate(),
                    },
                )
            })
            .collect();

        ReportStats {
            trends,
            rates,
            counters: self.counters.clone(),
            checks: self.checks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateReport {
    pub total: u64,
    pub trues: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    pub trends: BTreeMap<String, TrendReport>,
    pub rates: BTreeMap<String, RateReport>,
    pub counters: BTreeMap<String, u64>,
    pub checks: BTreeMap<String, CheckTally>,
}

impl ReportStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
