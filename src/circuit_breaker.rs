//! Consecutive-failure gate for one remote dependency.
//!
//! Constructed once per dependency and shared by `Arc`; there is no global
//! instance. A fresh breaker starts closed, so a restart only forgets recent
//! failures.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::locks::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Asks permission for one call. Open circuits refuse until the recovery
    /// timeout passes; then exactly one trial call is let through.
    pub fn try_acquire(&self) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.timeout_elapsed(&inner) {
                    return false;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Gives back a half-open trial slot without recording an outcome.
    pub fn release_trial(&self) {
        lock_unpoisoned(&self.inner).trial_in_flight = false;
    }

    pub fn record_success(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    pub fn record_failure(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        let trip = match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
        };
        if trip {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    /// Effective state: an open circuit whose timeout elapsed reads as half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = lock_unpoisoned(&self.inner);
        match inner.state {
            CircuitState::Open if self.timeout_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        lock_unpoisoned(&self.inner).failure_count
    }

    /// `last_failure + recovery_timeout`; `None` before any failure.
    #[must_use]
    pub fn next_attempt_time(&self) -> Option<Instant> {
        lock_unpoisoned(&self.inner)
            .last_failure
            .map(|at| at + self.config.recovery_timeout)
    }

    /// Time left until [`Self::next_attempt_time`], zero if already passed.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.next_attempt_time()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.config.failure_threshold,
        }
    }

    fn timeout_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout)
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        match next {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = previous.as_str(),
                failures = inner.failure_count,
                "circuit opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = previous.as_str(),
                to = next.as_str(),
                "circuit state changed"
            ),
        }
    }
}
