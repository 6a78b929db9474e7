use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::control::{ControlState, StopReason};
use crate::engine::http_client::{Transport, DEFAULT_REQUEST_TIMEOUT};
use crate::engine::lifecycle::{LifecycleHooks, LifecycleManager, NoopHooks, Readiness};
use crate::engine::pool::{ThinkTime, VirtualUserPool};
use crate::engine::scheduler::{Stage, StageSchedule, StageScheduler};
use crate::error::ConfigError;
use crate::scenario::{Scenario, ScenarioExecutor};
use crate::stats::thresholds::{ThresholdEvaluator, ThresholdSpec, Verdict};
use crate::stats::{MetricKind, MetricRegistry, MetricsRecorder, ReportStats, SharedRecorder, ITERATIONS};

pub mod control;
pub mod http_client;
pub mod lifecycle;
pub mod pool;
pub mod scheduler;

/// Everything that defines one load test.
#[derive(Clone)]
pub struct Workload {
    pub name: String,
    pub stages: Vec<Stage>,
    pub start_target: usize,
    /// Metric selector -> thresholds
    pub thresholds: HashMap<String, Vec<ThresholdSpec>>,
    pub abort_on_fail: bool,
    pub scenario: Scenario,
    pub think_time: ThinkTime,
    /// Extra series the hooks or branches record into
    pub custom_metrics: Vec<(String, MetricKind)>,
    pub readiness: Option<Readiness>,
    pub hooks: Arc<dyn LifecycleHooks>,
}

impl Workload {
    pub fn new(name: &str, stages: Vec<Stage>, scenario: Scenario) -> Self {
        Self {
            name: name.to_string(),
            stages,
            start_target: 0,
            thresholds: HashMap::new(),
            abort_on_fail: false,
            scenario,
            think_time: ThinkTime::none(),
            custom_metrics: Vec::new(),
            readiness: None,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn threshold(mut self, metric: &str, spec: impl Into<ThresholdSpec>) -> Self {
        self.thresholds
            .entry(metric.to_string())
            .or_default()
            .push(spec.into());
        self
    }

    pub fn think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Built-in series plus the custom ones and every branch error metric.
    pub fn registry(&self) -> Result<MetricRegistry, ConfigError> {
        let mut registry = MetricRegistry::with_builtins();
        for (name, kind) in &self.custom_metrics {
            registry.declare(name, *kind)?;
        }
        for name in self.scenario.error_metrics() {
            registry.declare(name, MetricKind::Rate)?;
        }
        Ok(registry)
    }

    /// Check the whole definition without touching the target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let registry = self.registry()?;
        StageSchedule::new(self.stages.clone(), self.start_target)?;
        ThresholdEvaluator::new(&self.thresholds, &registry, self.abort_on_fail)?;
        self.scenario.validate()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub base_url: String,
    /// Scheduler resolution
    pub tick: Duration,
    /// How often thresholds are checked while the test runs
    pub evaluation_interval: Duration,
    pub seed: Option<u64>,
    pub request_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            base_url: crate::cli::config::DEFAULT_BASE_URL.to_string(),
            tick: Duration::from_secs(1),
            evaluation_interval: Duration::from_secs(2),
            seed: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri: http::Uri = self
            .base_url
            .parse()
            .map_err(|_| ConfigError::InvalidBaseUrl(self.base_url.clone()))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workload: String,
    pub passed: bool,
    pub stop_reason: StopReason,
    pub aborted: bool,
    pub elapsed_ms: u64,
    pub seed: u64,
    pub iterations: u64,
    pub verdict: Verdict,
    pub metrics: ReportStats,
    /// Teardown failures are reported, never turned into a failed verdict
    pub teardown_error: Option<String>,
}

impl RunSummary {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

pub struct Engine {
    transport: Arc<dyn Transport>,
    control: Arc<ControlState>,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            control: Arc::new(ControlState::new()),
        }
    }

    /// Stop handle, e.g. for a Ctrl-C handler.
    pub fn control(&self) -> Arc<ControlState> {
        Arc::clone(&self.control)
    }

    /// Validate, set up, run every stage, evaluate and tear down.
    ///
    /// Configuration and setup errors are returned before any virtual user
    /// is spawned. Threshold failures are part of the summary, not errors.
    /// The engine is consumed: its stop signal is spent once the run ends.
    pub async fn run(self, workload: Workload, options: &RunOptions) -> Result<RunSummary> {
        options.validate()?;
        let registry = workload.registry()?;
        let schedule = StageSchedule::new(workload.stages.clone(), workload.start_target)?;
        let evaluator = ThresholdEvaluator::new(&workload.thresholds, &registry, workload.abort_on_fail)?;
        let executor = Arc::new(ScenarioExecutor::new(
            workload.scenario.clone(),
            Arc::clone(&self.transport),
        )?);

        info!(
            workload = %workload.name,
            base_url = %options.base_url,
            stages = schedule.stages().len(),
            max_vus = schedule.max_target(),
            duration = %crate::utils::format_duration(schedule.total_duration()),
            thresholds = evaluator.thresholds().count(),
            "starting load test"
        );

        let lifecycle = LifecycleManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&workload.hooks),
            workload.readiness.clone(),
        );
        let context = Arc::new(lifecycle.setup(&options.base_url).await?);

        let recorder: SharedRecorder = Arc::new(MetricsRecorder::new(
            MetricsRecorder::shards_for_workers(schedule.max_target()),
            registry,
        ));
        let seed = options.seed.unwrap_or_else(rand::random);
        debug!(seed, shards = recorder.num_shards(), "recorder ready");

        let mut pool = VirtualUserPool::new(
            executor,
            Arc::clone(&context),
            Arc::clone(&recorder),
            workload.think_time,
            seed,
            self.control.token(),
        );

        let started = Instant::now();
        let monitor_done = CancellationToken::new();
        let monitor = tokio::spawn(monitor_thresholds(
            evaluator,
            Arc::clone(&recorder),
            Arc::clone(&self.control),
            options.evaluation_interval,
            started,
            monitor_done.clone(),
        ));

        StageScheduler::new(schedule, options.tick)
            .run(&mut pool, &self.control)
            .await;

        monitor_done.cancel();
        let evaluator = monitor.await.context("threshold monitor task failed")?;
        let elapsed = started.elapsed();

        let snapshot = recorder.snapshot();
        let verdict = evaluator.final_verdict(&snapshot);
        for failure in verdict.failures() {
            warn!(
                metric = %failure.metric,
                threshold = %failure.predicate,
                actual = failure.actual,
                "threshold failed"
            );
        }

        let teardown_error = lifecycle.teardown(&context).await;

        let stop_reason = self.control.stop_reason().unwrap_or(StopReason::Completed);
        let summary = RunSummary {
            workload: workload.name.clone(),
            passed: verdict.passed,
            stop_reason,
            aborted: stop_reason != StopReason::Completed,
            elapsed_ms: elapsed.as_millis() as u64,
            seed,
            iterations: snapshot.counter(ITERATIONS),
            verdict,
            metrics: snapshot.to_report(),
            teardown_error,
        };
        info!(
            passed = summary.passed,
            reason = ?summary.stop_reason,
            iterations = summary.iterations,
            elapsed_ms = summary.elapsed_ms,
            "load test finished"
        );
        Ok(summary)
    }
}

/// Periodically evaluate thresholds and stop the test on an abort-on-fail
/// breach. Hands the evaluator back so its breach history reaches the verdict.
async fn monitor_thresholds(
    mut evaluator: ThresholdEvaluator,
    recorder: SharedRecorder,
    control: Arc<ControlState>,
    every: Duration,
    started: Instant,
    done: CancellationToken,
) -> ThresholdEvaluator {
    if evaluator.is_empty() {
        return evaluator;
    }
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = done.cancelled() => break,
        }
        let evaluation = evaluator.evaluate(&recorder.snapshot(), started.elapsed());
        if !evaluation.failing.is_empty() {
            debug!(failing = ?evaluation.failing, "thresholds currently failing");
        }
        if evaluation.abort {
            warn!(failing = ?evaluation.failing, "abort-on-fail threshold breached, stopping test");
            control.stop(StopReason::ThresholdAbort);
            break;
        }
    }
    evaluator
}
