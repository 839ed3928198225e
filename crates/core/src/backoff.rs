//! Reconnect backoff for the duplex transport.
//!
//! Pure bookkeeping: the runtime owns the timer, this decides how long it
//! should be and when to stop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before the connection is declared lost.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max_delay)`, with `attempt` counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << attempt.min(31))
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }
}

/// What to do after a failed open or an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Try again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The failure budget is spent. Reported once.
    GiveUp { attempts: u32 },
    /// Already gave up earlier; nothing more to do or report.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    gave_up: bool,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            gave_up: false,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> BackoffStep {
        if self.gave_up {
            return BackoffStep::Exhausted;
        }
        let attempt = self.failures;
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.gave_up = true;
            return BackoffStep::GiveUp {
                attempts: self.failures,
            };
        }
        BackoffStep::Retry {
            attempt,
            delay: self.policy.delay_for(attempt),
        }
    }

    /// A successful open clears the failure streak.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
