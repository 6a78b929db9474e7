use std::time::Duration;

use thiserror::Error;

use crate::stats::MetricKind;

/// Problems with the workload definition. Always raised before any virtual user starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("stage list is empty")]
    EmptySchedule,

    #[error("total stage duration overflows")]
    ScheduleOverflow,

    #[error("invalid threshold predicate '{predicate}': {reason}")]
    InvalidPredicate { predicate: String, reason: String },

    #[error("invalid metric selector '{0}'")]
    InvalidSelector(String),

    #[error("threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("aggregation '{aggregation}' is not supported for {kind} metric '{metric}'")]
    IncompatibleAggregation {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },

    #[error("metric '{name}' is already declared as {existing}")]
    ConflictingMetric { name: String, existing: MetricKind },

    #[error("think time minimum {min:?} exceeds maximum {max:?}")]
    InvalidThinkTime { min: Duration, max: Duration },

    #[error("branch '{branch}' has probability {probability}, expected a value in [0, 1]")]
    InvalidProbability { branch: String, probability: f64 },

    #[error("branch '{0}' has no steps")]
    EmptyBranch(String),

    #[error("unknown workload '{0}'")]
    UnknownWorkload(String),

    #[error("invalid base URL '{0}'")]
    InvalidBaseUrl(String),
}

/// Fatal failures while preparing the test. Nothing has been spawned when these surface.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("target {url} not ready after {timeout:?} (last status: {})", .last_status.map(|s| s.to_string()).unwrap_or_else(|| "unreachable".to_string()))]
    ReadinessTimeout {
        url: String,
        timeout: Duration,
        last_status: Option<u16>,
    },

    #[error("cannot build readiness request for '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("setup hook failed: {0}")]
    Hook(String),
}

/// Failures below the HTTP status line: the request produced no response at all.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
