//! Pass/fail criteria over metric snapshots.
//!
//! Predicates look like `p(95)<500`, `rate<=0.01`, `avg < 200`. They are
//! parsed once, up front; anything malformed is a [`ConfigError`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::stats::{MetricKind, MetricRegistry, Snapshot};
use crate::utils::{format_duration, parse_duration_str};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    /// Percentile in [0, 100].
    Percentile(f64),
    Rate,
    Avg,
    Min,
    Med,
    Max,
    Count,
}

impl Aggregation {
    fn supports(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => !matches!(self, Aggregation::Rate),
            MetricKind::Rate => matches!(self, Aggregation::Rate | Aggregation::Count),
            MetricKind::Counter => matches!(self, Aggregation::Count),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Count => f.write_str("count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn holds(&self, actual: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => actual < bound,
            Comparison::Le => actual <= bound,
            Comparison::Gt => actual > bound,
            Comparison::Ge => actual >= bound,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicate {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub value: f64,
}

impl Predicate {
    pub fn holds(&self, actual: f64) -> bool {
        self.comparison.holds(actual, self.value)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison, self.value)
    }
}

impl FromStr for Predicate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPredicate {
            predicate: s.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(['<', '>'])
            .ok_or_else(|| invalid("expected one of <, <=, >, >="))?;
        let (lhs, rest) = compact.split_at(op_at);
        let (comparison, rhs) = if let Some(r) = rest.strip_prefix("<=") {
            (Comparison::Le, r)
        } else if let Some(r) = rest.strip_prefix(">=") {
            (Comparison::Ge, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (Comparison::Lt, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (Comparison::Gt, r)
        } else {
            return Err(invalid("expected one of <, <=, >, >="));
        };

        let aggregation = match lhs {
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "med" => Aggregation::Med,
            "max" => Aggregation::Max,
            "count" => Aggregation::Count,
            other => {
                let n = other
                    .strip_prefix("p(")
                    .and_then(|r| r.strip_suffix(')'))
                    .or_else(|| other.strip_prefix('p'))
                    .ok_or_else(|| invalid("unknown aggregation"))?;
                let n: f64 = n.parse().map_err(|_| invalid("percentile is not a number"))?;
                if !(0.0..=100.0).contains(&n) {
                    return Err(invalid("percentile must be within [0, 100]"));
                }
                Aggregation::Percentile(n)
            }
        };

        let value: f64 = rhs.parse().map_err(|_| invalid("bound is not a number"))?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid("bound must be a non-negative number"));
        }

        Ok(Predicate {
            aggregation,
            comparison,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope")]
pub enum Scope {
    Global,
    Tagged { key: String, value: String },
}

/// Metric name with an optional `{key:value}` tag filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSelector {
    pub name: String,
    pub scope: Scope,
}

impl MetricSelector {
    /// Key of the series this selector reads in a [`Snapshot`].
    pub fn series_key(&self) -> String {
        match &self.scope {
            Scope::Global => self.name.clone(),
            Scope::Tagged { key, value } => super::tagged_key(&self.name, key, value),
        }
    }
}

impl FromStr for MetricSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidSelector(s.to_string());
        match s.split_once('{') {
            None if !s.is_empty() && !s.contains('}') => Ok(MetricSelector {
                name: s.to_string(),
                scope: Scope::Global,
            }),
            None => Err(invalid()),
            Some((name, rest)) => {
                let inner = rest.strip_suffix('}').ok_or_else(invalid)?;
                let (key, value) = inner.split_once(':').ok_or_else(invalid)?;
                let (name, key, value) = (name.trim(), key.trim(), value.trim());
                if name.is_empty() || key.is_empty() || value.is_empty() {
                    return Err(invalid());
                }
                Ok(MetricSelector {
                    name: name.to_string(),
                    scope: Scope::Tagged {
                        key: key.to_string(),
                        value: value.to_string(),
                    },
                })
            }
        }
    }
}

/// A threshold as written in a workload: either a bare predicate string or
/// an object with abort settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Predicate(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
        /// Minimum elapsed test time before a breach may abort (e.g. "10s")
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

impl From<&str> for ThresholdSpec {
    fn from(s: &str) -> Self {
        ThresholdSpec::Predicate(s.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: MetricSelector,
    pub kind: MetricKind,
    pub predicate: Predicate,
    pub source: String,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

impl Threshold {
    pub fn parse(
        metric: &str,
        spec: &ThresholdSpec,
        registry: &MetricRegistry,
        global_abort: bool,
    ) -> Result<Self, ConfigError> {
        let selector: MetricSelector = metric.parse()?;
        let kind = registry
            .kind(&selector.name)
            .ok_or_else(|| ConfigError::UnknownMetric(selector.name.clone()))?;

        let (source, abort_on_fail, delay) = match spec {
            ThresholdSpec::Predicate(p) => (p.clone(), global_abort, None),
            ThresholdSpec::Detailed {
                threshold,
                abort_on_fail,
                delay_abort_eval,
            } => (
                threshold.clone(),
                *abort_on_fail || global_abort,
                delay_abort_eval.as_deref(),
            ),
        };

        let predicate: Predicate = source.parse()?;
        if !predicate.aggregation.supports(kind) {
            return Err(ConfigError::IncompatibleAggregation {
                metric: selector.name.clone(),
                kind,
                aggregation: predicate.aggregation.to_string(),
            });
        }

        let delay_abort_eval = match delay {
            Some(d) => {
                parse_duration_str(d).ok_or_else(|| ConfigError::InvalidDuration(d.to_string()))?
            }
            None => Duration::ZERO,
        };

        Ok(Threshold {
            metric: selector,
            kind,
            predicate,
            source,
            abort_on_fail,
            delay_abort_eval,
        })
    }

    /// Current aggregate value of the selected series. Empty series read as 0.
    pub fn actual(&self, snapshot: &Snapshot) -> f64 {
        let key = self.metric.series_key();
        match self.kind {
            MetricKind::Trend => snapshot.trend(&key).map_or(0.0, |t| match self.predicate.aggregation {
                Aggregation::Percentile(p) => t.percentile(p),
                Aggregation::Avg => t.avg(),
                Aggregation::Min => t.min(),
                Aggregation::Med => t.percentile(50.0),
                Aggregation::Max => t.max(),
                Aggregation::Count => t.count() as f64,
                Aggregation::Rate => 0.0,
            }),
            MetricKind::Rate => snapshot.rate(&key).map_or(0.0, |r| match self.predicate.aggregation {
                Aggregation::Count => r.total as f64,
                _ => r.rate(),
            }),
            MetricKind::Counter => snapshot.counter(&key) as f64,
        }
    }

    pub fn passes(&self, snapshot: &Snapshot) -> bool {
        self.predicate.holds(self.actual(snapshot))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub predicate: String,
    pub actual: f64,
    pub passed: bool,
    /// Whether any periodic evaluation saw this threshold fail
    pub breached_during_run: bool,
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub thresholds: Vec<ThresholdResult>,
}

impl Verdict {
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// What one periodic evaluation found.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Thresholds failing right now, as `metric: predicate`
    pub failing: Vec<String>,
    /// An abort-on-fail threshold failed past its delay
    pub abort: bool,
}

struct ThresholdState {
    threshold: Threshold,
    breached: bool,
    /// Failed past its abort delay; fails the verdict whatever the final aggregate says.
    tripped: bool,
}

pub struct ThresholdEvaluator {
    states: Vec<ThresholdState>,
}

impl ThresholdEvaluator {
    pub fn new(
        criteria: &HashMap<String, Vec<ThresholdSpec>>,
        registry: &MetricRegistry,
        global_abort: bool,
    ) -> Result<Self, ConfigError> {
        let mut metrics: Vec<_> = criteria.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));

        let mut states = Vec::new();
        for (metric, specs) in metrics {
            for spec in specs {
                states.push(ThresholdState {
                    threshold: Threshold::parse(metric, spec, registry, global_abort)?,
                    breached: false,
                    tripped: false,
                });
            }
        }
        Ok(Self { states })
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn thresholds(&self) -> impl Iterator<Item = &Threshold> {
        self.states.iter().map(|s| &s.threshold)
    }

    /// Periodic check. Breach flags are sticky for the rest of the run.
    pub fn evaluate(&mut self, snapshot: &Snapshot, elapsed: Duration) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for state in &mut self.states {
            let t = &state.threshold;
            if t.passes(snapshot) {
                continue;
            }
            state.breached = true;
            evaluation
                .failing
                .push(format!("{}: {}", t.metric.series_key(), t.source));
            if t.abort_on_fail && elapsed >= t.delay_abort_eval {
                state.tripped = true;
                evaluation.abort = true;
            }
        }
        evaluation
    }

    /// AND over every threshold against the final aggregate. An abort-on-fail
    /// threshold that tripped during the run stays failed.
    pub fn final_verdict(&self, snapshot: &Snapshot) -> Verdict {
        let thresholds: Vec<ThresholdResult> = self
            .states
            .iter()
            .map(|state| {
                let t = &state.threshold;
                let actual = t.actual(snapshot);
                let passed = !state.tripped && t.predicate.holds(actual);
                ThresholdResult {
                    metric: t.metric.series_key(),
                    predicate: t.source.clone(),
                    actual,
                    passed,
                    breached_during_run: state.breached || !passed,
                    abort_on_fail: t.abort_on_fail,
                }
            })
            .collect();
        Verdict {
            passed: thresholds.iter().all(|t| t.passed),
            thresholds,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric.series_key(), self.predicate)?;
        if self.abort_on_fail {
            write!(f, " (abort after {})", format_duration(self.delay_abort_eval))?;
        }
        Ok(())
    }
}
