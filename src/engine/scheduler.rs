//! Stage scheduler: turns the stage list into a desired worker count over time.

use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::control::{ControlState, StopReason};
use crate::engine::pool::VirtualUserPool;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Validated stage list with its starting level.
#[derive(Debug, Clone)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    start_target: usize,
    total: Duration,
}

impl StageSchedule {
    pub fn new(stages: Vec<Stage>, start_target: usize) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        let total = stages
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
            .ok_or(ConfigError::ScheduleOverflow)?;
        Ok(Self {
            stages,
            start_target,
            total,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    pub fn max_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_target))
            .max()
            .unwrap_or(0)
    }

    /// Desired concurrency at `elapsed`.
    ///
    /// Inside a stage the value is interpolated from the previous target,
    /// rounded to the nearest level with ties going toward the stage's own
    /// target. Zero-length stages jump. At and
    /// after the end of the last stage the answer is 0.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        if elapsed >= self.total {
            return 0;
        }
        let mut stage_start = Duration::ZERO;
        let mut prev = self.start_target;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return interpolate(prev, stage.target, progress);
            }
            stage_start = stage_end;
            prev = stage.target;
        }
        0
    }
}

fn interpolate(from: usize, to: usize, progress: f64) -> usize {
    // Float noise around .5 still counts as a tie.
    const EPSILON: f64 = 1e-9;
    let value = from as f64 + (to as f64 - from as f64) * progress;
    let floor = value.floor();
    let rounded = if (value - floor - 0.5).abs() < EPSILON {
        if to >= from {
            floor + 1.0
        } else {
            floor
        }
    } else {
        value.round()
    };
    (rounded.max(0.0) as usize).clamp(from.min(to), from.max(to))
}

pub struct StageScheduler {
    schedule: StageSchedule,
    tick: Duration,
}

impl StageScheduler {
    pub fn new(schedule: StageSchedule, tick: Duration) -> Self {
        Self {
            schedule,
            tick: tick.max(Duration::from_millis(10)),
        }
    }

    pub fn schedule(&self) -> &StageSchedule {
        &self.schedule
    }

    /// Drive the pool through every stage, then ramp to zero and wait for the
    /// pool to drain. Returns once no worker is active.
    pub async fn run(&self, pool: &mut VirtualUserPool, control: &ControlState) {
        let start = Instant::now();
        let end = start + self.schedule.total_duration();
        let stop = control.token();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_target = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(end) => {}
                _ = stop.cancelled() => {}
            }
            if control.is_stopped() {
                break;
            }
            let elapsed = start.elapsed();
            if elapsed >= self.schedule.total_duration() {
                control.stop(StopReason::Completed);
                break;
            }

            let desired = self.schedule.target_at(elapsed);
            if last_target != Some(desired) {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    desired,
                    active = pool.active(),
                    "desired concurrency changed"
                );
                last_target = Some(desired);
            }
            control.set_desired_workers(desired);
            pool.reconcile(desired);
        }

        info!(
            reason = ?control.stop_reason(),
            active = pool.active(),
            "ramping down, waiting for virtual users to drain"
        );
        control.set_desired_workers(0);
        pool.drain().await;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "drain complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn schedule(stages: &[(u64, usize)]) -> StageSchedule {
        StageSchedule::new(
            stages.iter().map(|(d, t)| Stage::new(secs(*d), *t)).collect(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_schedule_is_config_error() {
        assert!(matches!(
            StageSchedule::new(vec![], 0),
            Err(ConfigError::EmptySchedule)
        ));
    }

    #[test]
    fn test_linear_ramp() {
        let s = schedule(&[(10, 10), (20, 10), (10, 0)]);
        assert_eq!(s.total_duration(), secs(40));
        assert_eq!(s.target_at(Duration::ZERO), 0);
        assert_eq!(s.target_at(secs(5)), 5);
        assert_eq!(s.target_at(secs(10)), 10);
        assert_eq!(s.target_at(secs(25)), 10);
        assert_eq!(s.target_at(secs(35)), 5);
        assert_eq!(s.target_at(secs(40)), 0);
        assert_eq!(s.target_at(secs(100)), 0);
    }

    #[test]
    fn test_rounds_toward_stage_target() {
        let up = schedule(&[(10, 10)]);
        assert_eq!(up.target_at(Duration::from_millis(500)), 1);
        assert_eq!(up.target_at(Duration::from_millis(1500)), 2);

        let down = schedule(&[(1, 10), (10, 0)]);
        assert_eq!(down.target_at(Duration::from_millis(1500)), 9);
        assert_eq!(down.target_at(Duration::from_millis(2500)), 8);
    }

    #[test]
    fn test_rounds_to_nearest_between_ties() {
        let up = schedule(&[(10, 10)]);
        assert_eq!(up.target_at(Duration::from_millis(100)), 0);
        assert_eq!(up.target_at(Duration::from_millis(400)), 0);
        assert_eq!(up.target_at(Duration::from_millis(1400)), 1);
        assert_eq!(up.target_at(Duration::from_millis(1600)), 2);

        let down = schedule(&[(1, 10), (10, 0)]);
        assert_eq!(down.target_at(Duration::from_millis(1100)), 10);
        assert_eq!(down.target_at(Duration::from_millis(1400)), 10);
        assert_eq!(down.target_at(Duration::from_millis(1600)), 9);
    }

    #[test]
    fn test_overflowing_schedule_is_config_error() {
        let stages = vec![Stage::new(Duration::MAX, 1), Stage::new(secs(1), 1)];
        assert!(matches!(
            StageSchedule::new(stages, 0),
            Err(ConfigError::ScheduleOverflow)
        ));
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let s = schedule(&[(10, 10), (0, 100), (10, 100)]);
        assert_eq!(s.target_at(Duration::from_millis(9_999)), 10);
        assert_eq!(s.target_at(secs(10)), 100);
        assert_eq!(s.target_at(secs(15)), 100);

        let leading = schedule(&[(0, 50), (10, 50)]);
        assert_eq!(leading.target_at(Duration::ZERO), 50);
    }

    #[test]
    fn test_explicit_start_level() {
        let s = StageSchedule::new(vec![Stage::new(secs(10), 20)], 10).unwrap();
        assert_eq!(s.target_at(Duration::ZERO), 10);
        assert_eq!(s.target_at(secs(5)), 15);
        assert_eq!(s.max_target(), 20);
    }

    #[test]
    fn test_all_zero_duration_stages_end_immediately() {
        let s = schedule(&[(0, 10), (0, 0)]);
        assert_eq!(s.total_duration(), Duration::ZERO);
        assert_eq!(s.target_at(Duration::ZERO), 0);
    }

    fn stages() -> impl Strategy<Value = (usize, Vec<(u64, usize)>)> {
        (
            0usize..50,
            (1u64..120, 0usize..500),
            prop::collection::vec((0u64..120, 0usize..500), 0..6),
        )
            .prop_map(|(start, first, rest)| {
                let mut all = vec![first];
                all.extend(rest);
                (start, all)
            })
    }

    proptest! {
        #[test]
        fn prop_starts_at_start_level_and_ends_at_zero((start, raw) in stages()) {
            let s = StageSchedule::new(
                raw.iter().map(|(d, t)| Stage::new(secs(*d), *t)).collect(),
                start,
            ).unwrap();
            prop_assert_eq!(s.target_at(Duration::ZERO), start);
            prop_assert_eq!(s.target_at(s.total_duration()), 0);
        }

        #[test]
        fn prop_target_stays_between_neighbouring_levels(
            (start, raw) in stages(),
            probe_ms in 0u64..720_000,
        ) {
            let s = StageSchedule::new(
                raw.iter().map(|(d, t)| Stage::new(secs(*d), *t)).collect(),
                start,
            ).unwrap();
            let probe = Duration::from_millis(probe_ms);
            let target = s.target_at(probe);
            if probe < s.total_duration() {
                let mut prev = start;
                let mut stage_start = Duration::ZERO;
                for stage in s.stages() {
                    let end = stage_start + stage.duration;
                    if probe < end {
                        prop_assert!(target >= prev.min(stage.target));
                        prop_assert!(target <= prev.max(stage.target));
                        break;
                    }
                    stage_start = end;
                    prev = stage.target;
                }
            } else {
                prop_assert_eq!(target, 0);
            }
        }
    }
}
