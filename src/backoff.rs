/// Exponential backoff for reconnection logic.
///
/// `BackoffPolicy::advance` is the pure transition: from idle it yields
/// `min`, then doubles (capped at `max`). Once `max` has been handed out,
/// the next advance yields nothing and falls back to idle so the next
/// cycle ramps up from `min` again. `Backoff` wraps a policy and its
/// current state for callers that just want the next delay.
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
}

/// Current position in the backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffState {
    /// No retry in flight.
    #[default]
    Idle,
    /// Last delay handed out, always within `[min, max]`.
    Waiting(Duration),
}

impl BackoffPolicy {
    pub const DEFAULT_MIN: Duration = Duration::from_millis(1000);
    pub const DEFAULT_MAX: Duration = Duration::from_millis(30_000);

    pub fn new(min: Duration, max: Duration) -> Result<Self, Error> {
        if min.is_zero() || max.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "backoff bounds must be positive (min {min:?}, max {max:?})"
            )));
        }
        if min > max {
            return Err(Error::InvalidConfig(format!(
                "backoff min {min:?} exceeds max {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the next delay and the state to keep.
    /// `None` means the range is exhausted and the state is idle again.
    pub fn advance(&self, state: BackoffState) -> (Option<Duration>, BackoffState) {
        match state {
            BackoffState::Idle => (Some(self.min), BackoffState::Waiting(self.min)),
            BackoffState::Waiting(current) if current >= self.max => (None, BackoffState::Idle),
            BackoffState::Waiting(current) => {
                let next = current.saturating_mul(2).min(self.max);
                (Some(next), BackoffState::Waiting(next))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
        }
    }
}

impl BackoffState {
    pub fn reset(self) -> Self {
        BackoffState::Idle
    }

    /// The delay last handed out, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            BackoffState::Idle => None,
            BackoffState::Waiting(delay) => Some(*delay),
        }
    }
}

pub struct Backoff {
    policy: BackoffPolicy,
    state: BackoffState,
    /// Number of consecutive advances (resets on `reset()`).
    pub attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: BackoffState::Idle,
            attempt: 0,
        }
    }

    /// Advances the state and returns the delay before the next retry.
    /// Returns `None` when the cycle restarts; callers retry immediately.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let (delay, state) = self.policy.advance(self.state);
        self.state = state;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to idle. Called after a successful connection.
    pub fn reset(&mut self) {
        self.state = self.state.reset();
        self.attempt = 0;
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }
}
