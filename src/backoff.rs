//! Retry delay policies.

use std::time::Duration;

use rand::Rng;

const MAX_DOUBLINGS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Option<Duration>,
    jitter: bool,
}

impl BackoffPolicy {
    /// `base·2^(n-1)` plus a random jitter below half of that step. Each
    /// attempt's delay is strictly greater than the previous one's.
    #[must_use]
    pub fn exponential_with_jitter(base: Duration) -> Self {
        Self {
            base,
            max: None,
            jitter: true,
        }
    }

    /// `base·2^(n-1)`, capped at `max`.
    #[must_use]
    pub fn capped_exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: Some(max),
            jitter: false,
        }
    }

    /// Delay before retry `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(MAX_DOUBLINGS);
        let step = self.base.saturating_mul(1_u32 << doublings);

        let mut delay = step;
        if self.jitter {
            let half_millis = u64::try_from(step.as_millis() / 2).unwrap_or(u64::MAX);
            if half_millis > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..half_millis));
            }
        }

        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
