//! Global backoff state machine.
//!
//! Failures zero every connection's RDY and start an exponentially growing
//! timer; when it fires, a single connection probes with RDY 1. Success in
//! the probe lowers the level until normal flow resumes.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffState {
    Normal,
    /// All RDY zeroed, waiting out the timer.
    Backoff,
    /// One probe connection holds RDY 1.
    Test,
}

/// What the Reader must do after a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffAction {
    None,
    /// Zero all RDY and arm the timer.
    EnterBackoff(Duration),
    /// Give one random connection RDY 1.
    Probe,
    /// Restore the steady-state allocation on every connection.
    Resume,
}

#[derive(Debug)]
pub(crate) struct BackoffController {
    enabled: bool,
    base: Duration,
    max: Duration,
    max_level: u32,
    level: u32,
    state: BackoffState,
}

impl BackoffController {
    pub(crate) fn new(enabled: bool, base: Duration, max: Duration) -> Self {
        // Smallest level whose raw interval reaches the cap; deeper levels
        // would only saturate.
        let mut max_level = 1u32;
        while max_level < 32 && raw_interval(base, max, max_level) < max {
            max_level += 1;
        }
        Self {
            enabled,
            base,
            max,
            max_level,
            level: 0,
            state: BackoffState::Normal,
        }
    }

    pub(crate) fn state(&self) -> BackoffState {
        self.state
    }

    pub(crate) fn level(&self) -> u32 {
        self.level
    }

    /// True whenever any backoff is pending (level above zero).
    pub(crate) fn in_backoff(&self) -> bool {
        self.level > 0
    }

    /// True while a backoff block is running and RDY must stay frozen.
    pub(crate) fn blocks_rdy(&self) -> bool {
        self.state == BackoffState::Backoff
    }

    pub(crate) fn success(&mut self) -> BackoffAction {
        if !self.enabled {
            return BackoffAction::None;
        }
        match self.state {
            BackoffState::Normal => BackoffAction::None,
            BackoffState::Backoff => {
                // An in-flight message resolved during the block; lower the
                // level but let the running timer decide when to probe.
                self.level = self.level.saturating_sub(1);
                BackoffAction::None
            }
            BackoffState::Test => {
                self.level = self.level.saturating_sub(1);
                if self.level == 0 {
                    self.state = BackoffState::Normal;
                    BackoffAction::Resume
                } else {
                    self.state = BackoffState::Backoff;
                    BackoffAction::EnterBackoff(self.interval())
                }
            }
        }
    }

    pub(crate) fn failure(&mut self) -> BackoffAction {
        if !self.enabled {
            return BackoffAction::None;
        }
        match self.state {
            // Stragglers resolving mid-block must not extend the timer.
            BackoffState::Backoff => BackoffAction::None,
            BackoffState::Normal | BackoffState::Test => {
                self.level = (self.level + 1).min(self.max_level);
                self.state = BackoffState::Backoff;
                BackoffAction::EnterBackoff(self.interval())
            }
        }
    }

    pub(crate) fn timer_expired(&mut self) -> BackoffAction {
        match self.state {
            BackoffState::Backoff => {
                if self.level == 0 {
                    // Successes during the block already drained the level.
                    self.state = BackoffState::Normal;
                    BackoffAction::Resume
                } else {
                    self.state = BackoffState::Test;
                    BackoffAction::Probe
                }
            }
            // Stale timer after an out-of-order transition.
            BackoffState::Normal | BackoffState::Test => BackoffAction::None,
        }
    }

    fn raw_interval(&self) -> Duration {
        raw_interval(self.base, self.max, self.level.max(1))
    }

    /// Timer duration for the current level with uniform [0.8, 1.2] jitter.
    fn interval(&self) -> Duration {
        self.raw_interval().mul_f64(rand::random_range(0.8..=1.2))
    }
}

fn raw_interval(base: Duration, max: Duration, level: u32) -> Duration {
    let doubled = base.checked_mul(1u32 << (level - 1).min(31)).unwrap_or(max);
    doubled.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackoffController {
        BackoffController::new(true, Duration::from_secs(1), Duration::from_secs(128))
    }

    fn assert_backoff_near(action: BackoffAction, expected: Duration) {
        match action {
            BackoffAction::EnterBackoff(d) => {
                assert!(
                    d >= expected.mul_f64(0.8) && d <= expected.mul_f64(1.2),
                    "interval {d:?} outside jitter window of {expected:?}"
                );
            }
            other => panic!("expected EnterBackoff, got {other:?}"),
        }
    }

    #[test]
    fn failure_enters_backoff_at_base_interval() {
        let mut backoff = controller();
        let action = backoff.failure();
        assert_backoff_near(action, Duration::from_secs(1));
        assert_eq!(backoff.level(), 1);
        assert_eq!(backoff.state(), BackoffState::Backoff);
        assert!(backoff.in_backoff());
        assert!(backoff.blocks_rdy());
    }

    #[test]
    fn timer_expiry_moves_to_probe() {
        let mut backoff = controller();
        backoff.failure();
        assert_eq!(backoff.timer_expired(), BackoffAction::Probe);
        assert_eq!(backoff.state(), BackoffState::Test);
        assert!(!backoff.blocks_rdy());
    }

    #[test]
    fn failure_during_probe_doubles_the_interval() {
        let mut backoff = controller();
        backoff.failure();
        backoff.timer_expired();
        let action = backoff.failure();
        assert_backoff_near(action, Duration::from_secs(2));
        assert_eq!(backoff.level(), 2);
    }

    #[test]
    fn probe_success_at_level_one_resumes() {
        let mut backoff = controller();
        backoff.failure();
        backoff.timer_expired();
        assert_eq!(backoff.success(), BackoffAction::Resume);
        assert_eq!(backoff.state(), BackoffState::Normal);
        assert_eq!(backoff.level(), 0);
    }

    #[test]
    fn probe_success_at_higher_level_shortens_the_block() {
        let mut backoff = controller();
        backoff.failure();
        backoff.timer_expired();
        backoff.failure(); // level 2
        backoff.timer_expired();
        let action = backoff.success(); // back to level 1
        assert_backoff_near(action, Duration::from_secs(1));
        assert_eq!(backoff.level(), 1);
        assert_eq!(backoff.state(), BackoffState::Backoff);
    }

    #[test]
    fn failures_during_a_block_are_ignored() {
        let mut backoff = controller();
        backoff.failure();
        assert_eq!(backoff.failure(), BackoffAction::None);
        assert_eq!(backoff.level(), 1);
    }

    #[test]
    fn success_during_a_block_drains_the_level() {
        let mut backoff = controller();
        backoff.failure();
        assert_eq!(backoff.success(), BackoffAction::None);
        assert_eq!(backoff.level(), 0);
        // The running timer then resumes instead of probing.
        assert_eq!(backoff.timer_expired(), BackoffAction::Resume);
        assert_eq!(backoff.state(), BackoffState::Normal);
    }

    #[test]
    fn interval_saturates_at_the_cap() {
        let mut backoff = controller();
        for _ in 0..40 {
            backoff.failure();
            backoff.timer_expired();
        }
        assert!(backoff.level() <= 8);
        match backoff.failure() {
            BackoffAction::EnterBackoff(d) => {
                assert!(d <= Duration::from_secs(128).mul_f64(1.2));
            }
            other => panic!("expected EnterBackoff, got {other:?}"),
        }
    }

    #[test]
    fn disabled_controller_never_backs_off() {
        let mut backoff =
            BackoffController::new(false, Duration::from_secs(1), Duration::from_secs(128));
        assert_eq!(backoff.failure(), BackoffAction::None);
        assert_eq!(backoff.level(), 0);
        assert!(!backoff.in_backoff());
    }

    #[test]
    fn stale_timer_is_a_no_op() {
        let mut backoff = controller();
        assert_eq!(backoff.timer_expired(), BackoffAction::None);
    }
}
