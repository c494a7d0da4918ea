//! Crash-retry decisions and restart backoff

use std::time::Duration;

use rand::Rng;

use crate::task::Task;

/// What to do with a task whose unit died mid-execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashOutcome {
    /// Budget remains; resubmit the same task to the scheduler
    Resubmit,
    /// Budget exhausted; reject with the attempt count and exit reason
    Exhausted,
}

/// Apply the retry policy to a crashed task. Only infrastructure faults
/// reach this point; errors returned by the executed function settle the
/// task directly and are never retried.
pub(crate) fn on_crash(task: &mut Task) -> CrashOutcome {
    if task.retries_remaining > 0 {
        task.retries_remaining -= 1;
        CrashOutcome::Resubmit
    } else {
        CrashOutcome::Exhausted
    }
}

/// Bounded exponential backoff between unit restarts.
///
/// The exact shape is an implementation detail, not a contract: 100 ms
/// doubling per attempt, capped at 5 s, with ±20% jitter so a pool of
/// crashing slots does not respawn in lockstep.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    base: f64,
    jitter: bool,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            base: 2.0,
            jitter: true,
        }
    }
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration, base: f64, jitter: bool) -> Self {
        Self {
            initial,
            max,
            base,
            jitter,
        }
    }

    /// Delay before restart attempt `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.base.powi(attempt as i32 - 1);
        let raw = Duration::from_nanos((self.initial.as_nanos() as f64 * multiplier) as u64);
        let capped = raw.min(self.max);

        if self.jitter {
            let factor = rand::rng().random_range(0.8..1.2);
            Duration::from_nanos((capped.as_nanos() as f64 * factor) as u64)
        } else {
            capped
        }
    }
}
