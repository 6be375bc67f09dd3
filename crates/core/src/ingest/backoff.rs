use std::time::Duration;

/// Retry policy for a supervised ingest loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay after a failed session.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor applied after each consecutive failure.
    pub multiplier: f64,
    /// A session that ran at least this long counts as healthy and resets
    /// the delay back to `initial`.
    pub healthy_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(20),
            multiplier: 2.0,
            healthy_after: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff state: 2s, 4s, 8s, 16s, 20s, 20s, ... by default.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial.min(policy.max),
            attempts: 0,
        }
    }

    /// Delay to sleep before the next attempt. Advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.policy.multiplier).min(self.policy.max);
        self.attempts += 1;
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) would return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Consecutive retries since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
        self.attempts = 0;
    }

    /// Feed back how long the session that just ended ran for.
    pub fn record_session(&mut self, ran_for: Duration) {
        if ran_for >= self.policy.healthy_after {
            self.reset();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
