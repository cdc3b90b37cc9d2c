//! Provider call pacing.
//!
//! A [`Pacer`] decides how long to wait after each provider call before the
//! next one may start. Processing is sequential, so this delay is the only
//! throughput control against provider quotas.
//!
//! | Strategy | Behavior |
//! |----------|----------|
//! | [`FixedDelay`] | Same delay after every call |
//! | [`TokenBucket`] | Up to `burst` calls back to back, refilled at `rate_per_sec` |
//! | [`AdaptiveBackoff`] | Base delay, doubled per consecutive provider failure, capped |

use std::time::{Duration, Instant};

use crate::config::{PacingConfig, PacingStrategy};

/// Upper bound on any single token-bucket wait.
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

/// How the provider call that just finished went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

pub trait Pacer: Send {
    /// Delay to observe after a call with the given outcome.
    fn next_delay(&mut self, outcome: CallOutcome) -> Duration;
}

/// Build the pacer selected in `[pacing]`.
pub fn from_config(config: &PacingConfig) -> Box<dyn Pacer> {
    let base = Duration::from_millis(config.delay_ms);
    match config.strategy {
        PacingStrategy::Fixed => Box::new(FixedDelay::new(base)),
        PacingStrategy::TokenBucket => {
            Box::new(TokenBucket::new(config.rate_per_sec, config.burst))
        }
        PacingStrategy::Adaptive => Box::new(AdaptiveBackoff::new(
            base,
            Duration::from_millis(config.max_backoff_ms),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Pacer for FixedDelay {
    fn next_delay(&mut self, _outcome: CallOutcome) -> Duration {
        self.delay
    }
}

/// Token bucket holding at most `burst` tokens; each call spends one.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            burst,
            // The call that triggers the first `next_delay` already happened
            tokens: burst - 1.0,
            last: Instant::now(),
        }
    }

    /// [`next_delay`](Pacer::next_delay) evaluated at `now`.
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }

        // Wait until one full token has accrued, then spend it.
        let wait = Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate_per_sec)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);
        self.tokens = 0.0;
        self.last = now + wait;
        wait
    }
}

impl Pacer for TokenBucket {
    fn next_delay(&mut self, _outcome: CallOutcome) -> Duration {
        self.delay_at(Instant::now())
    }
}

/// Base delay after successes; doubles after each consecutive failure.
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    base: Duration,
    max: Duration,
    consecutive_failures: u32,
}

impl AdaptiveBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            consecutive_failures: 0,
        }
    }
}

impl Pacer for AdaptiveBackoff {
    fn next_delay(&mut self, outcome: CallOutcome) -> Duration {
        match outcome {
            CallOutcome::Success => {
                self.consecutive_failures = 0;
                self.base
            }
            CallOutcome::Failure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let factor = 1u32 << self.consecutive_failures.min(16);
                self.base.saturating_mul(factor).min(self.max)
            }
        }
    }
}
