use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::engine::lifecycle::Readiness;
use crate::engine::pool::ThinkTime;
use crate::engine::scheduler::Stage;
use crate::engine::{RunOptions, Workload};
use crate::error::ConfigError;
use crate::stats::thresholds::ThresholdSpec;
use crate::utils::parse_duration_str;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const BASE_URL_ENV: &str = "BASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ScheduleStep {
    /// Stage length (e.g., "30s", "1m", "3h56m")
    pub duration: String,
    /// Virtual users to reach by the end of the stage
    pub target: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ThinkTimeConfig {
    pub min: String,
    pub max: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct ReadinessConfig {
    /// Set to false to skip the probe
    pub enabled: Option<bool>,
    /// Path polled with GET (default: /health)
    pub path: Option<String>,
    /// Expected status code (default: 200)
    pub status: Option<u16>,
    /// Delay between attempts (default: 1s)
    pub interval: Option<String>,
    /// Give up after this long (default: 30s)
    pub timeout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Built-in workload to run (auth, soak, spike)
    pub workload: Option<String>,
    /// Target base URL. The BASE_URL environment variable takes precedence.
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Ramping schedule, replaces the workload's stages
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Virtual users at t=0 (default: 0)
    #[serde(alias = "startWorkers", alias = "start_vus", alias = "startVUs")]
    pub start_workers: Option<usize>,
    /// Pass/Fail criteria, keyed by metric. Replaces the workload's criteria for that metric.
    #[serde(alias = "thresholds")]
    pub criteria: Option<HashMap<String, Vec<ThresholdSpec>>>,
    /// Stop the test as soon as any threshold fails
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Scheduler resolution (default: 1s)
    pub tick: Option<String>,
    /// Threshold evaluation period while running (default: 2s)
    #[serde(alias = "evaluationInterval")]
    pub evaluation_interval: Option<String>,
    /// Pause between iterations, drawn uniformly from [min, max]
    #[serde(alias = "thinkTime")]
    pub think_time: Option<ThinkTimeConfig>,
    /// Seed for branch selection and think time
    pub seed: Option<u64>,
    /// Per-request timeout (default: 60s)
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Pre-test health probe
    pub readiness: Option<ReadinessConfig>,
}

fn duration(value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration(value.to_string()))
}

fn optional_duration(value: Option<&String>, default: Duration) -> Result<Duration, ConfigError> {
    value.map_or(Ok(default), |v| duration(v))
}

/// CLI flag, then the `BASE_URL` environment variable, then the config file.
pub fn resolve_base_url(cli: Option<&str>, env: Option<&str>, config: Option<&str>) -> String {
    cli.or(env)
        .or(config)
        .filter(|url| !url.is_empty())
        .unwrap_or(DEFAULT_BASE_URL)
        .to_string()
}

impl Config {
    /// Load YAML or JSON, picked by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing JSON config {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing YAML config {}", path.display()))?,
        };
        Ok(config)
    }

    /// Overlay this config on a workload.
    pub fn apply(&self, workload: &mut Workload) -> Result<(), ConfigError> {
        if let Some(schedule) = &self.schedule {
            let mut stages = Vec::with_capacity(schedule.len());
            for step in schedule {
                stages.push(Stage::new(duration(&step.duration)?, step.target));
            }
            workload.stages = stages;
        }
        if let Some(start) = self.start_workers {
            workload.start_target = start;
        }
        if let Some(criteria) = &self.criteria {
            for (metric, specs) in criteria {
                workload.thresholds.insert(metric.clone(), specs.clone());
            }
        }
        if let Some(abort) = self.abort_on_fail {
            workload.abort_on_fail = abort;
        }
        if let Some(think) = &self.think_time {
            workload.think_time = ThinkTime::uniform(duration(&think.min)?, duration(&think.max)?)?;
        }
        if let Some(readiness) = &self.readiness {
            workload.readiness = if readiness.enabled == Some(false) {
                None
            } else {
                let defaults = workload.readiness.clone().unwrap_or_default();
                Some(Readiness {
                    path: readiness.path.clone().unwrap_or(defaults.path),
                    expect_status: readiness.status.unwrap_or(defaults.expect_status),
                    interval: optional_duration(readiness.interval.as_ref(), defaults.interval)?,
                    timeout: optional_duration(readiness.timeout.as_ref(), defaults.timeout)?,
                })
            };
        }
        Ok(())
    }

    /// Runtime options. `cli_base_url` wins over `BASE_URL`, which wins over the file.
    pub fn run_options(&self, cli_base_url: Option<&str>) -> Result<RunOptions, ConfigError> {
        let env = std::env::var(BASE_URL_ENV).ok();
        self.run_options_with_env(cli_base_url, env.as_deref())
    }

    fn run_options_with_env(
        &self,
        cli_base_url: Option<&str>,
        env_base_url: Option<&str>,
    ) -> Result<RunOptions, ConfigError> {
        let defaults = RunOptions::default();
        let options = RunOptions {
            base_url: resolve_base_url(cli_base_url, env_base_url, self.base_url.as_deref()),
            tick: optional_duration(self.tick.as_ref(), defaults.tick)?,
            evaluation_interval: optional_duration(
                self.evaluation_interval.as_ref(),
                defaults.evaluation_interval,
            )?,
            seed: self.seed,
            request_timeout: optional_duration(self.request_timeout.as_ref(), defaults.request_timeout)?,
        };
        options.validate()?;
        Ok(options)
    }
}
