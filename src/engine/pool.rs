//! Virtual user pool.
//!
//! Every virtual user is a tokio task running iterations back to back with a
//! think-time pause in between. Shrinking marks the oldest users; each one
//! exits at its next loop boundary, never in the middle of a request.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::engine::lifecycle::TestContext;
use crate::error::ConfigError;
use crate::scenario::ScenarioExecutor;
use crate::stats::{MetricsHandle, SharedRecorder};

/// Pause between iterations, drawn uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    pub fn uniform(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidThinkTime { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn fixed(d: Duration) -> Self {
        Self { min: d, max: d }
    }

    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        Duration::from_secs_f64(rng.gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64()))
    }
}

struct Worker {
    id: usize,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Decrements the active count when a worker task ends, however it ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct VirtualUserPool {
    executor: Arc<ScenarioExecutor>,
    context: Arc<TestContext>,
    recorder: SharedRecorder,
    think_time: ThinkTime,
    seed: u64,
    /// Global stop; also cuts think-time pauses short
    stop: CancellationToken,
    /// Running workers, oldest first
    live: VecDeque<Worker>,
    /// Workers marked for stop that may still be finishing an iteration
    draining: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    next_id: usize,
}

impl VirtualUserPool {
    pub fn new(
        executor: Arc<ScenarioExecutor>,
        context: Arc<TestContext>,
        recorder: SharedRecorder,
        think_time: ThinkTime,
        seed: u64,
        stop: CancellationToken,
    ) -> Self {
        Self {
            executor,
            context,
            recorder,
            think_time,
            seed,
            stop,
            live: VecDeque::new(),
            draining: Vec::new(),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: 0,
        }
    }

    /// Workers that have not exited yet, including those draining.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers not marked for stop.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Converge towards `desired` live workers: spawn the missing ones, or
    /// mark the oldest surplus workers for graceful stop.
    pub fn reconcile(&mut self, desired: usize) {
        self.reap();
        let live = self.live.len();
        if desired > live {
            for _ in live..desired {
                self.spawn();
            }
        } else {
            for _ in desired..live {
                if let Some(worker) = self.live.pop_front() {
                    debug!(worker_id = worker.id, "marking virtual user for stop");
                    worker.token.cancel();
                    self.draining.push(worker.handle);
                }
            }
        }
    }

    /// Mark every worker for stop and wait until all of them have exited.
    pub async fn drain(&mut self) {
        self.reconcile(0);
        for handle in self.draining.drain(..) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "virtual user panicked");
                }
            }
        }
    }

    fn reap(&mut self) {
        self.draining.retain(|h| !h.is_finished());
        // A live worker only finishes early if it panicked; drop it so it is replaced.
        self.live.retain(|w| !w.handle.is_finished());
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let token = self.stop.child_token();
        let stop = self.stop.clone();
        let executor = Arc::clone(&self.executor);
        let context = Arc::clone(&self.context);
        let metrics = self.recorder.handle(id);
        let think_time = self.think_time;
        let rng = StdRng::seed_from_u64(self.seed ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run_worker(id, worker_token, stop, executor, context, metrics, think_time, rng).await;
        });
        self.live.push_back(Worker { id, token, handle });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    id: usize,
    token: CancellationToken,
    stop: CancellationToken,
    executor: Arc<ScenarioExecutor>,
    context: Arc<TestContext>,
    metrics: MetricsHandle,
    think_time: ThinkTime,
    mut rng: StdRng,
) {
    debug!(worker_id = id, "virtual user started");
    let mut iterations: u64 = 0;
    // The token is a child of `stop`, so this also observes the global stop.
    while !token.is_cancelled() {
        executor.run_iteration(&context, &mut rng, &metrics).await;
        iterations += 1;

        let pause = think_time.sample(&mut rng);
        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop.cancelled() => {}
        }
    }
    debug!(worker_id = id, iterations, "virtual user stopped");
}
