//! Scenario model and executor.
//!
//! A scenario is a list of branches. On every iteration each branch fires
//! independently with its own probability, so zero, one or several branches
//! may run. Inside a branch the steps form a chain: once a step fails, the
//! rest of the branch is skipped.

use http::{Method, Request};
use hyper::body::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

use crate::engine::http_client::Transport;
use crate::engine::lifecycle::TestContext;
use crate::error::ConfigError;
use crate::stats::{
    MetricsHandle, ScenarioOutcome, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS,
    ITERATION_DURATION,
};

pub mod workloads;

/// Assertion on a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Status(u16),
    /// JSON pointer (`/data/token`) resolves to a value
    JsonFieldPresent(String),
    JsonFieldEquals(String, Value),
    BodyContains(String),
}

impl Check {
    pub fn status(code: u16) -> Self {
        Check::Status(code)
    }

    pub fn json_present(pointer: &str) -> Self {
        Check::JsonFieldPresent(pointer.to_string())
    }

    pub fn json_equals(pointer: &str, value: impl Into<Value>) -> Self {
        Check::JsonFieldEquals(pointer.to_string(), value.into())
    }

    pub fn body_contains(needle: &str) -> Self {
        Check::BodyContains(needle.to_string())
    }

    fn needs_json(&self) -> bool {
        matches!(self, Check::JsonFieldPresent(_) | Check::JsonFieldEquals(..))
    }

    fn holds(&self, status: u16, body: &Bytes, json: Option<&Value>) -> bool {
        match self {
            Check::Status(code) => status == *code,
            Check::JsonFieldPresent(pointer) => json.and_then(|v| v.pointer(pointer)).is_some(),
            Check::JsonFieldEquals(pointer, expected) => {
                json.and_then(|v| v.pointer(pointer)) == Some(expected)
            }
            Check::BodyContains(needle) => std::str::from_utf8(body)
                .map(|text| text.contains(needle.as_str()))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedCheck {
    pub name: String,
    pub check: Check,
}

/// Stores the value at `pointer` of the JSON response as variable `var`.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub var: String,
    pub pointer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Text(String),
    /// String leaves are templated before serialization
    Json(Value),
}

/// One request. Path, header values and body may contain `{{var}}` templates.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub checks: Vec<NamedCheck>,
    pub captures: Vec<Capture>,
}

impl Step {
    pub fn new(name: &str, method: Method, path: &str) -> Self {
        Self {
            name: name.to_string(),
            method,
            path: path.to_string(),
            headers: Vec::new(),
            body: Body::Empty,
            checks: Vec::new(),
            captures: Vec::new(),
        }
    }

    pub fn get(name: &str, path: &str) -> Self {
        Self::new(name, Method::GET, path)
    }

    pub fn post(name: &str, path: &str) -> Self {
        Self::new(name, Method::POST, path)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn text_body(mut self, body: &str) -> Self {
        self.body = Body::Text(body.to_string());
        self
    }

    pub fn json_body(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self.header("content-type", "application/json")
    }

    pub fn check(mut self, name: &str, check: Check) -> Self {
        self.checks.push(NamedCheck {
            name: name.to_string(),
            check,
        });
        self
    }

    pub fn capture(mut self, var: &str, pointer: &str) -> Self {
        self.captures.push(Capture {
            var: var.to_string(),
            pointer: pointer.to_string(),
        });
        self
    }

    fn needs_json(&self) -> bool {
        !self.captures.is_empty() || self.checks.iter().any(|c| c.check.needs_json())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub name: String,
    pub probability: f64,
    pub steps: Vec<Step>,
    /// Rate series receiving one sample per executed step (true when it failed)
    pub error_metric: Option<String>,
}

impl Branch {
    pub fn new(name: &str, probability: f64) -> Self {
        Self {
            name: name.to_string(),
            probability,
            steps: Vec::new(),
            error_metric: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn error_metric(mut self, name: &str) -> Self {
        self.error_metric = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scenario {
    pub branches: Vec<Branch>,
    /// Parameter rows; one is picked at random for every iteration
    pub data: Vec<HashMap<String, String>>,
}

impl Scenario {
    pub fn new(branches: Vec<Branch>) -> Self {
        Self {
            branches,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, rows: Vec<HashMap<String, String>>) -> Self {
        self.data = rows;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for branch in &self.branches {
            if !(0.0..=1.0).contains(&branch.probability) {
                return Err(ConfigError::InvalidProbability {
                    branch: branch.name.clone(),
                    probability: branch.probability,
                });
            }
            if branch.steps.is_empty() {
                return Err(ConfigError::EmptyBranch(branch.name.clone()));
            }
        }
        Ok(())
    }

    /// Custom rate series written by the branches.
    pub fn error_metrics(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().filter_map(|b| b.error_metric.as_deref())
    }
}

/// What happened during one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub branches_fired: Vec<String>,
    pub requests: usize,
    pub failed_checks: usize,
    pub skipped_steps: usize,
}

pub struct ScenarioExecutor {
    scenario: Scenario,
    transport: Arc<dyn Transport>,
}

impl ScenarioExecutor {
    pub fn new(scenario: Scenario, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        scenario.validate()?;
        Ok(Self {
            scenario,
            transport,
        })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run one iteration. Failures are recorded into `metrics`, never returned.
    pub async fn run_iteration(
        &self,
        ctx: &TestContext,
        rng: &mut StdRng,
        metrics: &MetricsHandle,
    ) -> IterationReport {
        let started = Instant::now();
        let mut vars = self.iteration_vars(ctx, rng);
        let mut report = IterationReport::default();

        for branch in &self.scenario.branches {
            if !rng.gen_bool(branch.probability) {
                continue;
            }
            report.branches_fired.push(branch.name.clone());

            for (index, step) in branch.steps.iter().enumerate() {
                let passed = self.run_step(ctx, step, &mut vars, metrics, &mut report).await;
                if let Some(metric) = &branch.error_metric {
                    metrics.record_rate(metric, !passed, &[]);
                }
                if !passed {
                    let skipped = branch.steps.len() - index - 1;
                    if skipped > 0 {
                        debug!(branch = %branch.name, step = %step.name, skipped, "step failed, skipping rest of branch");
                    }
                    report.skipped_steps += skipped;
                    break;
                }
            }
        }

        metrics.record_trend(ITERATION_DURATION, as_millis_f64(started.elapsed()), &[]);
        metrics.add_counter(ITERATIONS, 1);
        report
    }

    fn iteration_vars(&self, ctx: &TestContext, rng: &mut StdRng) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        if let Value::Object(fields) = &ctx.setup_data {
            for (key, value) in fields {
                vars.insert(key.clone(), value_to_var(value));
            }
        }
        if !self.scenario.data.is_empty() {
            let row = &self.scenario.data[rng.gen_range(0..self.scenario.data.len())];
            vars.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        vars.insert(
            "unique".to_string(),
            format!("{}{:06}", epoch_ms, rng.gen_range(0..1_000_000u32)),
        );
        vars
    }

    /// Send one step and evaluate it. Returns whether the branch may continue.
    async fn run_step(
        &self,
        ctx: &TestContext,
        step: &Step,
        vars: &mut HashMap<String, String>,
        metrics: &MetricsHandle,
        report: &mut IterationReport,
    ) -> bool {
        let request = match build_request(ctx, step, vars) {
            Ok(request) => request,
            Err(e) => {
                debug!(step = %step.name, error = %e, "could not build request");
                return false;
            }
        };

        let sent = Instant::now();
        let result = self.transport.send(request).await;
        let elapsed = sent.elapsed();
        report.requests += 1;

        let tags = [("name", step.name.as_str())];
        metrics.record_trend(HTTP_REQ_DURATION, as_millis_f64(elapsed), &tags);
        metrics.add_counter(HTTP_REQS, 1);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!(step = %step.name, error = %e, "request failed");
                metrics.record_rate(HTTP_REQ_FAILED, true, &tags);
                for check in &step.checks {
                    record_check(metrics, check, elapsed, false);
                }
                report.failed_checks += step.checks.len();
                return false;
            }
        };

        let status = response.status().as_u16();
        metrics.record_rate(HTTP_REQ_FAILED, !(200..400).contains(&status), &tags);

        let body = response.into_body();
        let json: Option<Value> = if step.needs_json() {
            serde_json::from_slice(&body).ok()
        } else {
            None
        };

        let mut passed = true;
        for check in &step.checks {
            let ok = check.check.holds(status, &body, json.as_ref());
            record_check(metrics, check, elapsed, ok);
            if !ok {
                debug!(step = %step.name, check = %check.name, status, "check failed");
                report.failed_checks += 1;
                passed = false;
            }
        }
        if !passed {
            return false;
        }

        for capture in &step.captures {
            match json.as_ref().and_then(|v| v.pointer(&capture.pointer)) {
                Some(value) => {
                    vars.insert(capture.var.clone(), value_to_var(value));
                }
                None => {
                    debug!(step = %step.name, pointer = %capture.pointer, "capture missing from response");
                    return false;
                }
            }
        }
        true
    }
}

fn record_check(metrics: &MetricsHandle, check: &NamedCheck, duration: Duration, success: bool) {
    metrics.record_outcome(&ScenarioOutcome {
        name: check.name.clone(),
        duration,
        success,
    });
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn value_to_var(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_request(
    ctx: &TestContext,
    step: &Step,
    vars: &HashMap<String, String>,
) -> Result<Request<String>, http::Error> {
    let url = format!(
        "{}{}",
        ctx.base_url.trim_end_matches('/'),
        render(&step.path, vars)
    );
    let mut builder = Request::builder().method(step.method.clone()).uri(url);
    for (name, value) in &step.headers {
        builder = builder.header(name.as_str(), render(value, vars));
    }
    let body = match &step.body {
        Body::Empty => String::new(),
        Body::Text(text) => render(text, vars),
        Body::Json(value) => render_json(value, vars).to_string(),
    };
    builder.body(body)
}

/// Replace `{{name}}` placeholders. Unknown names are left untouched.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_json(value: &Value, vars: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_json(v, vars)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_json(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_client::testing::{json, text, StubTransport};
    use crate::error::TransportError;
    use crate::stats::{tagged_key, MetricKind, MetricRegistry, MetricsRecorder, CHECKS};
    use rand::SeedableRng;
    use serde_json::json;

    fn recorder(extra: &[&str]) -> Arc<MetricsRecorder> {
        let mut registry = MetricRegistry::with_builtins();
        for name in extra {
            registry.declare(name, MetricKind::Rate).unwrap();
        }
        Arc::new(MetricsRecorder::new(2, registry))
    }

    fn ctx() -> TestContext {
        TestContext::new("http://target", Value::Null)
    }

    fn login_branch(probability: f64) -> Branch {
        Branch::new("login", probability)
            .error_metric("errors")
            .step(
                Step::post("login", "/api/v1/auth/login")
                    .json_body(json!({"email": "{{email}}", "password": "{{password}}"}))
                    .check("login status is 200", Check::status(200))
                    .check("login response has token", Check::json_present("/data/token"))
                    .capture("token", "/data/token"),
            )
            .step(
                Step::get("profile", "/api/v1/users/me")
                    .header("authorization", "Bearer {{token}}")
                    .check("profile status is 200", Check::status(200)),
            )
    }

    #[test]
    fn test_render_templates() {
        let vars: HashMap<String, String> = [("token".to_string(), "abc".to_string())].into();
        assert_eq!(render("Bearer {{token}}", &vars), "Bearer abc");
        assert_eq!(render("{{ token }}/{{missing}}", &vars), "abc/{{missing}}");
        assert_eq!(render("open {{token", &vars), "open {{token");
        assert_eq!(render("no vars", &vars), "no vars");
    }

    #[test]
    fn test_validate_rejects_bad_branches() {
        let bad = Scenario::new(vec![Branch::new("x", 1.5).step(Step::get("x", "/"))]);
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidProbability { .. })));
        let empty = Scenario::new(vec![Branch::new("y", 0.5)]);
        assert!(matches!(empty.validate(), Err(ConfigError::EmptyBranch(_))));
    }

    #[tokio::test]
    async fn test_failed_step_skips_rest_of_branch() {
        // Login answers 200 but without a token
        let transport = StubTransport::new(|req| match req.uri().path() {
            "/api/v1/auth/login" => json(200, json!({"data": {}})),
            _ => json(200, json!({"data": {"user": {}}})),
        })
        .shared();
        let scenario = Scenario::new(vec![login_branch(1.0)]);
        let executor = ScenarioExecutor::new(scenario, transport.clone()).unwrap();
        let rec = recorder(&["errors"]);
        let metrics = rec.handle(0);
        let mut rng = StdRng::seed_from_u64(1);

        let report = executor.run_iteration(&ctx(), &mut rng, &metrics).await;
        assert_eq!(report.branches_fired, vec!["login".to_string()]);
        assert_eq!(report.requests, 1);
        assert_eq!(report.failed_checks, 1);
        assert_eq!(report.skipped_steps, 1);
        assert_eq!(transport.requests_to("/api/v1/users/me"), 0);

        let snap = rec.snapshot();
        let errors = snap.rate("errors").unwrap();
        assert_eq!((errors.total, errors.trues), (1, 1));
        let checks = snap.rate(CHECKS).unwrap();
        assert_eq!((checks.total, checks.trues), (2, 1));
        assert_eq!(snap.checks["login response has token"].fails, 1);
        assert_eq!(snap.counter(HTTP_REQS), 1);
        assert_eq!(snap.counter(ITERATIONS), 1);
        // 200 is not an HTTP failure even though a check failed
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap().trues, 0);
    }

    #[tokio::test]
    async fn test_rejected_login_is_one_failed_step() {
        let transport = StubTransport::new(|req| match req.uri().path() {
            "/api/v1/auth/login" => json(401, json!({"error": "invalid credentials"})),
            _ => json(200, json!({"data": {"user": {}}})),
        })
        .shared();
        let scenario = Scenario::new(vec![login_branch(1.0)]);
        let executor = ScenarioExecutor::new(scenario, transport.clone()).unwrap();
        let rec = recorder(&["errors"]);
        let metrics = rec.handle(0);
        let mut rng = StdRng::seed_from_u64(1);

        let report = executor.run_iteration(&ctx(), &mut rng, &metrics).await;
        assert_eq!(report.requests, 1);
        assert_eq!(report.skipped_steps, 1);
        assert_eq!(transport.requests_to("/api/v1/users/me"), 0);

        let snap = rec.snapshot();
        // One failed step, tallied once on the branch's error rate
        let errors = snap.rate("errors").unwrap();
        assert_eq!((errors.total, errors.trues), (1, 1));
        // Each of the step's checks keeps its own tally
        assert_eq!(report.failed_checks, 2);
        assert_eq!(snap.checks["login status is 200"].fails, 1);
        assert_eq!(snap.checks["login response has token"].fails, 1);
        assert!(!snap.checks.contains_key("profile status is 200"));
        assert_eq!(snap.rate(HTTP_REQ_FAILED).unwrap().trues, 1);
    }

    #[tokio::test]
    async fn test_captured_value_flows_into_next_step() {
        let transport = StubTransport::new(|req| match req.uri().path() {
            "/api/v1/auth/login" => {
                let body: Value = serde_json::from_str(req.body()).unwrap();
                assert_eq!(body["email"], "loadtest1@example.com");
                json(200, json!({"data": {"token": "t-123"}}))
            }
            _ => {
                let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
                let status = if auth == "Bearer t-123" { 200 } else { 401 };
                text(status, "")
            }
        })
        .shared();
        let row: HashMap<String, String> = [
            ("email".to_string(), "loadtest1@example.com".to_string()),
            ("password".to_string(), "Password123!".to_string()),
        ]
        .into();
        let scenario = Scenario::new(vec![login_branch(1.0)]).with_data(vec![row]);
        let executor = ScenarioExecutor::new(scenario, transport.clone()).unwrap();
        let rec = recorder(&["errors"]);
        let mut rng = StdRng::seed_from_u64(2);

        let report = executor.run_iteration(&ctx(), &mut rng, &rec.handle(0)).await;
        assert_eq!(report.requests, 2);
        assert_eq!(report.failed_checks, 0);

        let snap = rec.snapshot();
        assert_eq!(snap.rate("errors").unwrap().total, 2);
        assert_eq!(snap.rate("errors").unwrap().trues, 0);
        assert_eq!(snap.trend(&tagged_key(HTTP_REQ_DURATION, "name", "profile")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_fails_check_without_panicking() {
        let transport = StubTransport::new(|_| text(200, "<html>oops")).shared();
        let scenario = Scenario::new(vec![Branch::new("health", 1.0).step(
            Step::get("health", "/health")
                .check("health status is 200", Check::status(200))
                .check("health response is valid", Check::json_equals("/status", "healthy")),
        )]);
        let executor = ScenarioExecutor::new(scenario, transport).unwrap();
        let rec = recorder(&[]);
        let mut rng = StdRng::seed_from_u64(3);

        let report = executor.run_iteration(&ctx(), &mut rng, &rec.handle(0)).await;
        assert_eq!(report.failed_checks, 1);
        let snap = rec.snapshot();
        assert_eq!(snap.checks["health status is 200"].passes, 1);
        assert_eq!(snap.checks["health response is valid"].fails, 1);
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_failed_request() {
        let transport =
            StubTransport::new(|_| Err(TransportError::Connection("refused".into()))).shared();
        let scenario = Scenario::new(vec![Branch::new("health", 1.0)
            .step(Step::get("health", "/health").check("health status is 200", Check::status(200)))]);
        let executor = ScenarioExecutor::new(scenario, transport).unwrap();
        let rec = recorder(&[]);
        let mut rng = StdRng::seed_from_u64(4);

        executor.run_iteration(&ctx(), &mut rng, &rec.handle(0)).await;
        let snap = rec.snapshot();
        let failed = snap.rate(HTTP_REQ_FAILED).unwrap();
        assert_eq!((failed.total, failed.trues), (1, 1));
        assert_eq!(snap.checks["health status is 200"].fails, 1);
    }

    #[tokio::test]
    async fn test_branches_fire_independently() {
        let transport = StubTransport::new(|_| text(200, "")).shared();
        let scenario = Scenario::new(vec![
            Branch::new("always", 1.0).step(Step::get("a", "/a")),
            Branch::new("never", 0.0).step(Step::get("b", "/b")),
            Branch::new("half", 0.5).step(Step::get("c", "/c")),
        ]);
        let executor = ScenarioExecutor::new(scenario, transport.clone()).unwrap();
        let rec = recorder(&[]);
        let metrics = rec.handle(0);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            executor.run_iteration(&ctx(), &mut rng, &metrics).await;
        }
        assert_eq!(transport.requests_to("/a"), 1000);
        assert_eq!(transport.requests_to("/b"), 0);
        let half = transport.requests_to("/c");
        assert!((400..=600).contains(&half), "half branch fired {} times", half);
    }

    #[tokio::test]
    async fn test_same_seed_same_branch_choices() {
        let run = |seed: u64| async move {
            let transport = StubTransport::new(|_| text(200, "")).shared();
            let scenario = Scenario::new(vec![
                Branch::new("register", 0.1).step(Step::post("register", "/r")),
                Branch::new("login", 0.4).step(Step::post("login", "/l")),
                Branch::new("health", 0.5).step(Step::get("health", "/h")),
            ]);
            let executor = ScenarioExecutor::new(scenario, transport).unwrap();
            let rec = recorder(&[]);
            let metrics = rec.handle(0);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut fired = Vec::new();
            for _ in 0..50 {
                fired.push(executor.run_iteration(&ctx(), &mut rng, &metrics).await.branches_fired);
            }
            fired
        };
        assert_eq!(run(9).await, run(9).await);
    }
}
