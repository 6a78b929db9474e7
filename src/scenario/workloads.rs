//! Built-in workloads against the auth API.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Branch, Check, Scenario, Step};
use crate::engine::lifecycle::{Readiness, TimedHooks};
use crate::engine::pool::ThinkTime;
use crate::engine::scheduler::Stage;
use crate::engine::Workload;
use crate::error::ConfigError;

pub const NAMES: [&str; 3] = ["auth", "soak", "spike"];

const ERRORS: &str = "errors";
const TEST_PASSWORD: &str = "Password123!";

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn health_step(check_name: &str) -> Step {
    Step::get("health", "/health").check(check_name, Check::status(200))
}

fn test_users() -> Vec<HashMap<String, String>> {
    (1..=3)
        .map(|i| {
            HashMap::from([
                ("email".to_string(), format!("loadtest{}@example.com", i)),
                ("password".to_string(), TEST_PASSWORD.to_string()),
            ])
        })
        .collect()
}

/// Mixed register / login+profile / health traffic ramping to 200 users.
pub fn auth() -> Workload {
    let register = Branch::new("register", 0.1).error_metric(ERRORS).step(
        Step::post("register", "/api/v1/auth/register")
            .json_body(json!({
                "email": "test{{unique}}@example.com",
                "password": TEST_PASSWORD,
                "name": "Load Test User",
            }))
            .check("register status is 201", Check::status(201))
            .check("register response has token", Check::json_present("/data/token")),
    );

    let login = Branch::new("login", 0.4)
        .error_metric(ERRORS)
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
                .check("profile status is 200", Check::status(200))
                .check("profile has user data", Check::json_present("/data/user")),
        );

    let health = Branch::new("health", 0.5).error_metric(ERRORS).step(
        health_step("health status is 200")
            .check("health response is valid", Check::json_equals("/status", "healthy")),
    );

    let stages = vec![
        Stage::new(secs(30), 50),
        Stage::new(secs(60), 100),
        Stage::new(secs(120), 100),
        Stage::new(secs(30), 200),
        Stage::new(secs(30), 0),
    ];
    let think = ThinkTime::uniform(secs(1), secs(3)).unwrap_or_else(|_| ThinkTime::fixed(secs(2)));

    Workload::new(
        "auth",
        stages,
        Scenario::new(vec![register, login, health]).with_data(test_users()),
    )
    .think_time(think)
    .threshold("http_req_duration", "p(95)<500")
    .threshold("http_req_duration", "p(99)<1000")
    .threshold("http_req_failed", "rate<0.01")
    .threshold(ERRORS, "rate<0.05")
    .readiness(Readiness::default())
    .hooks(Arc::new(TimedHooks))
}

/// Four hours of steady health checks at 400 users.
pub fn soak() -> Workload {
    let stages = vec![
        Stage::new(secs(120), 400),
        Stage::new(secs(3 * 3600 + 56 * 60), 400),
        Stage::new(secs(120), 0),
    ];
    Workload::new(
        "soak",
        stages,
        Scenario::new(vec![Branch::new("health", 1.0).step(health_step("status is 200"))]),
    )
    .think_time(ThinkTime::fixed(secs(1)))
    .threshold("http_req_duration", "p(99)<1500")
    .threshold("http_req_failed", "rate<0.01")
}

/// Sudden jump from 100 to 1400 users and back.
pub fn spike() -> Workload {
    let stages = vec![
        Stage::new(secs(10), 100),
        Stage::new(secs(60), 100),
        Stage::new(secs(10), 1400),
        Stage::new(secs(180), 1400),
        Stage::new(secs(10), 100),
        Stage::new(secs(180), 100),
        Stage::new(secs(10), 0),
    ];
    Workload::new(
        "spike",
        stages,
        Scenario::new(vec![Branch::new("health", 1.0).step(health_step("status is 200"))]),
    )
    .think_time(ThinkTime::fixed(Duration::from_millis(500)))
    .threshold("http_req_duration", "p(99)<2000")
    .threshold("http_req_failed", "rate<0.05")
}

pub fn by_name(name: &str) -> Result<Workload, ConfigError> {
    match name {
        "auth" => Ok(auth()),
        "soak" => Ok(soak()),
        "spike" => Ok(spike()),
        other => Err(ConfigError::UnknownWorkload(other.to_string())),
    }
}
