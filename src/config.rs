//! Engine configuration with environment overrides.

use std::env;
use std::time::Duration;

pub const ENV_REQUEST_TIMEOUT_SECS: &str = "CONVO_GUARD_REQUEST_TIMEOUT_SECS";
pub const ENV_RECENCY_WINDOW_SECS: &str = "CONVO_GUARD_RECENCY_WINDOW_SECS";
pub const ENV_CHECKPOINT_HISTORY: &str = "CONVO_GUARD_CHECKPOINT_HISTORY";
pub const ENV_BREAKER_THRESHOLD: &str = "CONVO_GUARD_BREAKER_THRESHOLD";
pub const ENV_BREAKER_RECOVERY_SECS: &str = "CONVO_GUARD_BREAKER_RECOVERY_SECS";
pub const ENV_MAX_TOOL_ROUNDS: &str = "CONVO_GUARD_MAX_TOOL_ROUNDS";
pub const ENV_CONTEXT_TTL_SECS: &str = "CONVO_GUARD_CONTEXT_TTL_SECS";
pub const ENV_RATE_LIMIT_BASE_MS: &str = "CONVO_GUARD_RATE_LIMIT_BASE_MS";
pub const ENV_BACKOFF_BASE_MS: &str = "CONVO_GUARD_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_MAX_SECS: &str = "CONVO_GUARD_BACKOFF_MAX_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for one remote completion call.
    pub request_timeout: Duration,
    /// A user turn newer than this keeps validation in basic (flag-only) mode.
    pub recency_window: Duration,
    pub checkpoint_history_limit: usize,
    /// Consecutive failures that open the circuit breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a trial call.
    pub recovery_timeout: Duration,
    pub max_tool_rounds: usize,
    pub recovery_context_ttl: Duration,
    pub rate_limit_base_delay: Duration,
    pub backoff_base_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            recency_window: Duration::from_secs(120),
            checkpoint_history_limit: 10,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            max_tool_rounds: 8,
            recovery_context_ttl: Duration::from_secs(600),
            rate_limit_base_delay: Duration::from_secs(1),
            backoff_base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CONVO_GUARD_*` variables. Blank or unparsable
    /// values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_secs(ENV_REQUEST_TIMEOUT_SECS).unwrap_or(defaults.request_timeout),
            recency_window: env_secs(ENV_RECENCY_WINDOW_SECS).unwrap_or(defaults.recency_window),
            checkpoint_history_limit: env_number::<usize>(ENV_CHECKPOINT_HISTORY)
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.checkpoint_history_limit),
            failure_threshold: env_number::<u32>(ENV_BREAKER_THRESHOLD)
                .filter(|threshold| *threshold > 0)
                .unwrap_or(defaults.failure_threshold),
            recovery_timeout: env_secs(ENV_BREAKER_RECOVERY_SECS)
                .unwrap_or(defaults.recovery_timeout),
            max_tool_rounds: env_number::<usize>(ENV_MAX_TOOL_ROUNDS)
                .filter(|rounds| *rounds > 0)
                .unwrap_or(defaults.max_tool_rounds),
            recovery_context_ttl: env_secs(ENV_CONTEXT_TTL_SECS)
                .unwrap_or(defaults.recovery_context_ttl),
            rate_limit_base_delay: env_millis(ENV_RATE_LIMIT_BASE_MS)
                .unwrap_or(defaults.rate_limit_base_delay),
            backoff_base_delay: env_millis(ENV_BACKOFF_BASE_MS)
                .unwrap_or(defaults.backoff_base_delay),
            max_backoff: env_secs(ENV_BACKOFF_MAX_SECS).unwrap_or(defaults.max_backoff),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    #[must_use]
    pub fn with_checkpoint_history_limit(mut self, limit: usize) -> Self {
        self.checkpoint_history_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    #[must_use]
    pub fn with_recovery_context_ttl(mut self, ttl: Duration) -> Self {
        self.recovery_context_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_rate_limit_base_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_delay = base;
        self.max_backoff = max;
        self
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string_opt(key).and_then(|value| value.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_number::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_number::<u64>(key).map(Duration::from_millis)
}
