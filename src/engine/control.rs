use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Why the test stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// All stages ran to the end
    Completed,
    /// An abort-on-fail threshold was breached
    ThresholdAbort,
    /// Operator interrupt (Ctrl-C)
    Interrupted,
}

/// Shared state between the scheduler, the threshold monitor and the operator.
///
/// `stop` is the only way to interrupt the stage scheduler from outside: it
/// cancels the global token, the scheduler ramps to zero and waits for drain.
pub struct ControlState {
    cancel: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    /// Most recent desired concurrency published by the scheduler
    desired_workers: AtomicUsize,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            reason: Mutex::new(None),
            desired_workers: AtomicUsize::new(0),
        }
    }

    /// Request a stop. The first reason recorded wins.
    pub fn stop(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Global token; cancelled once [`ControlState::stop`] is called.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_desired_workers(&self, count: usize) {
        self.desired_workers.store(count, Ordering::SeqCst);
    }

    pub fn desired_workers(&self) -> usize {
        self.desired_workers.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}
