//! Setup and teardown around the load phase.

use async_trait::async_trait;
use http::{Method, Request};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::http_client::Transport;
use crate::error::SetupError;

/// Read-only data shared by every virtual user and handed to teardown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestContext {
    pub base_url: String,
    pub setup_data: Value,
}

impl TestContext {
    pub fn new(base_url: impl Into<String>, setup_data: Value) -> Self {
        Self {
            base_url: base_url.into(),
            setup_data,
        }
    }
}

/// Poll settings for the pre-test health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub path: String,
    pub expect_status: u16,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            expect_status: 200,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// User-supplied code run once before and once after the load phase.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs after the readiness probe passed. The returned value becomes
    /// `TestContext::setup_data`.
    async fn setup(&self, _transport: &dyn Transport, _base_url: &str) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn teardown(&self, _context: &TestContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Records the start time during setup and logs the test duration in teardown.
pub struct TimedHooks;

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl LifecycleHooks for TimedHooks {
    async fn setup(&self, _transport: &dyn Transport, base_url: &str) -> anyhow::Result<Value> {
        info!(base_url, "target is ready, starting load test");
        Ok(json!({ "start_time": epoch_millis() }))
    }

    async fn teardown(&self, context: &TestContext) -> anyhow::Result<()> {
        let start = context
            .setup_data
            .get("start_time")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("setup data has no start_time"))?;
        let elapsed = Duration::from_millis(epoch_millis().saturating_sub(start));
        info!(duration_secs = elapsed.as_secs_f64(), "load test finished");
        Ok(())
    }
}

pub struct LifecycleManager {
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn LifecycleHooks>,
    readiness: Option<Readiness>,
}

impl LifecycleManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn LifecycleHooks>,
        readiness: Option<Readiness>,
    ) -> Self {
        Self {
            transport,
            hooks,
            readiness,
        }
    }

    /// Wait for the target, then run the setup hook.
    pub async fn setup(&self, base_url: &str) -> Result<TestContext, SetupError> {
        if let Some(readiness) = &self.readiness {
            self.wait_ready(base_url, readiness).await?;
        }
        let data = self
            .hooks
            .setup(self.transport.as_ref(), base_url)
            .await
            .map_err(|e| SetupError::Hook(format!("{:#}", e)))?;
        Ok(TestContext::new(base_url, data))
    }

    /// Poll the readiness endpoint until it answers with the expected status
    /// or the timeout runs out.
    pub async fn wait_ready(&self, base_url: &str, readiness: &Readiness) -> Result<(), SetupError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), readiness.path);
        let deadline = Instant::now() + readiness.timeout;
        let mut last_status = None;
        let mut attempts = 0u32;

        loop {
            let request = Request::builder()
                .method(Method::GET)
                .uri(url.as_str())
                .body(String::new())
                .map_err(|e| SetupError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            attempts += 1;

            match self.transport.send(request).await {
                Ok(response) if response.status().as_u16() == readiness.expect_status => {
                    debug!(url = %url, attempts, "readiness probe passed");
                    return Ok(());
                }
                Ok(response) => {
                    last_status = Some(response.status().as_u16());
                    debug!(url = %url, status = response.status().as_u16(), "target not ready");
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "readiness probe failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(url = %url, attempts, "readiness probe timed out");
                return Err(SetupError::ReadinessTimeout {
                    url,
                    timeout: readiness.timeout,
                    last_status,
                });
            }
            tokio::time::sleep(readiness.interval.min(deadline - now)).await;
        }
    }

    /// Run the teardown hook. Consumes the manager so it can only happen once.
    /// Returns the hook's error message, if any.
    pub async fn teardown(self, context: &TestContext) -> Option<String> {
        match self.hooks.teardown(context).await {
            Ok(()) => None,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(error = %message, "teardown failed");
                Some(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::http_client::testing::{text, StubTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn readiness(timeout_secs: u64) -> Readiness {
        Readiness {
            timeout: Duration::from_secs(timeout_secs),
            ..Readiness::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_waits_for_healthy_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let transport = StubTransport::new(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 3 {
                text(503, "starting")
            } else {
                text(200, "ok")
            }
        })
        .shared();
        let manager = LifecycleManager::new(transport.clone(), Arc::new(NoopHooks), Some(readiness(30)));

        let ctx = manager.setup("http://target/").await.unwrap();
        assert_eq!(ctx.base_url, "http://target/");
        assert_eq!(ctx.setup_data, Value::Null);
        assert_eq!(transport.requests_to("/health"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_reports_last_status() {
        let transport = StubTransport::new(|_| text(503, "down")).shared();
        let manager = LifecycleManager::new(transport, Arc::new(TimedHooks), Some(readiness(5)));

        let started = Instant::now();
        let err = manager.setup("http://target").await.unwrap_err();
        assert!(started.elapsed() <= Duration::from_secs(6));
        match err {
            SetupError::ReadinessTimeout { url, last_status, .. } => {
                assert_eq!(url, "http://target/health");
                assert_eq!(last_status, Some(503));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_target_has_no_status() {
        let transport = StubTransport::new(|_| Err(crate::error::TransportError::Connection("refused".into()))).shared();
        let manager = LifecycleManager::new(transport, Arc::new(NoopHooks), Some(readiness(2)));
        let err = manager.setup("http://target").await.unwrap_err();
        assert!(matches!(err, SetupError::ReadinessTimeout { last_status: None, .. }));
        assert!(err.to_string().contains("unreachable"));
    }

    struct Failing;

    #[async_trait]
    impl LifecycleHooks for Failing {
        async fn setup(&self, _: &dyn Transport, _: &str) -> anyhow::Result<Value> {
            Err(anyhow::anyhow!("seed users missing"))
        }

        async fn teardown(&self, _: &TestContext) -> anyhow::Result<()> {
            anyhow::bail!("cleanup refused")
        }
    }

    #[tokio::test]
    async fn test_hook_errors_are_surfaced() {
        let transport = StubTransport::new(|_| text(200, "ok")).shared();
        let manager = LifecycleManager::new(transport, Arc::new(Failing), None);
        let err = manager.setup("http://target").await.unwrap_err();
        assert!(matches!(err, SetupError::Hook(ref m) if m.contains("seed users missing")));

        let ctx = TestContext::new("http://target", Value::Null);
        assert_eq!(manager.teardown(&ctx).await.as_deref(), Some("cleanup refused"));
    }

    #[tokio::test]
    async fn test_timed_hooks_round_trip_start_time() {
        let transport = StubTransport::new(|_| text(200, "ok")).shared();
        let manager = LifecycleManager::new(transport, Arc::new(TimedHooks), None);
        let ctx = manager.setup("http://target").await.unwrap();
        assert!(ctx.setup_data.get("start_time").and_then(Value::as_u64).is_some());
        assert_eq!(manager.teardown(&ctx).await, None);
    }
}
