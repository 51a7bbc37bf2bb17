//! The only component that talks to the remote completion client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use completion_provider::{
    CancelSignal, CompletionClient, CompletionError, CompletionReply, CompletionRequest,
    ProviderProfile,
};
use thiserror::Error;
use tokio::time::Instant;

use crate::cancel::await_or_cancel;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::classifier::ErrorClassifier;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Refused by the breaker; the inner client was not called.
    #[error("circuit open: service unavailable for {breaker}, next attempt in {retry_after:?}")]
    ShortCircuited {
        breaker: String,
        retry_after: Duration,
    },
    #[error("request timed out after {}s", .after.as_secs_f64())]
    TimedOut { after: Duration },
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Remote(#[from] CompletionError),
}

#[derive(Debug, Default)]
struct HealthMetrics {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
    short_circuits: AtomicU64,
    cancellations: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl HealthMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, started: Instant) {
        let millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_latency_ms.store(millis, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub provider: ProviderProfile,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub calls: u64,
    pub successes: u64,
    /// Failures counted against the breaker: timeouts and outage errors.
    pub failures: u64,
    /// Error replies from a remote that was up, e.g. auth or bad input.
    pub rejections: u64,
    pub timeouts: u64,
    pub short_circuits: u64,
    pub cancellations: u64,
    pub last_latency: Option<Duration>,
}

impl HealthSnapshot {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.breaker_state == CircuitState::Closed
    }
}

pub struct ResilientCompletionClient {
    inner: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    classifier: ErrorClassifier,
    metrics: HealthMetrics,
}

impl ResilientCompletionClient {
    #[must_use]
    pub fn new(
        inner: Arc<dyn CompletionClient>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            breaker,
            timeout,
            classifier: ErrorClassifier::default(),
            metrics: HealthMetrics::default(),
        }
    }

    /// Decides which remote errors count as outages.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn profile(&self) -> ProviderProfile {
        self.inner.profile()
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: Option<&CancelSignal>,
    ) -> Result<CompletionReply, CallError> {
        if !self.breaker.try_acquire() {
            HealthMetrics::bump(&self.metrics.short_circuits);
            let retry_after = self.breaker.retry_after().unwrap_or_default();
            tracing::debug!(
                breaker = self.breaker.name(),
                conversation_id = %request.conversation_id,
                "remote call short-circuited"
            );
            return Err(CallError::ShortCircuited {
                breaker: self.breaker.name().to_string(),
                retry_after,
            });
        }

        HealthMetrics::bump(&self.metrics.calls);
        let conversation_id = request.conversation_id.clone();
        let started = Instant::now();
        let call = tokio::time::timeout(self.timeout, self.inner.complete(request));

        let outcome = match await_or_cancel(call, cancel).await {
            Err(_) => {
                HealthMetrics::bump(&self.metrics.cancellations);
                self.breaker.release_trial();
                tracing::info!(conversation_id = %conversation_id, "remote call cancelled");
                return Err(CallError::Cancelled);
            }
            Ok(Err(_elapsed)) => {
                HealthMetrics::bump(&self.metrics.timeouts);
                Err(CallError::TimedOut {
                    after: self.timeout,
                })
            }
            Ok(Ok(result)) => result.map_err(CallError::Remote),
        };
        self.metrics.record_latency(started);

        match &outcome {
            Ok(_) => {
                HealthMetrics::bump(&self.metrics.successes);
                self.breaker.record_success();
            }
            Err(error) if self.counts_as_outage(error) => {
                HealthMetrics::bump(&self.metrics.failures);
                self.breaker.record_failure();
                tracing::warn!(conversation_id = %conversation_id, %error, "remote call failed");
            }
            Err(error) => {
                HealthMetrics::bump(&self.metrics.rejections);
                self.breaker.release_trial();
                tracing::info!(conversation_id = %conversation_id, %error, "remote call rejected");
            }
        }
        outcome
    }

    fn counts_as_outage(&self, error: &CallError) -> bool {
        match error {
            CallError::TimedOut { .. } => true,
            CallError::Remote(remote) => self
                .classifier
                .classify(&remote.to_string())
                .category
                .indicates_outage(),
            CallError::ShortCircuited { .. } | CallError::Cancelled => false,
        }
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let calls = load(&self.metrics.calls);
        HealthSnapshot {
            provider: self.inner.profile(),
            breaker_state: self.breaker.state(),
            consecutive_failures: self.breaker.failure_count(),
            calls,
            successes: load(&self.metrics.successes),
            failures: load(&self.metrics.failures),
            rejections: load(&self.metrics.rejections),
            timeouts: load(&self.metrics.timeouts),
            short_circuits: load(&self.metrics.short_circuits),
            cancellations: load(&self.metrics.cancellations),
            last_latency: (calls > 0)
                .then(|| Duration::from_millis(load(&self.metrics.last_latency_ms))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use completion_provider_mock::{MockCompletionClient, MockStep};

    use crate::circuit_breaker::CircuitBreakerConfig;

    fn client(step: MockStep) -> ResilientCompletionClient {
        let breaker = Arc::new(CircuitBreaker::new(
            "chat-api",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
        ));
        ResilientCompletionClient::new(
            Arc::new(MockCompletionClient::always(step)),
            breaker,
            Duration::from_secs(5),
        )
    }

    fn request(conversation_id: &str) -> CompletionRequest {
        CompletionRequest {
            conversation_id: conversation_id.to_string(),
            turns: Vec::new(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rejected_requests_leave_the_breaker_closed() {
        let client = client(MockStep::fail("HTTP 422 Unprocessable Entity: invalid parameter"));

        for index in 0..5 {
            let result = client.complete(request(&format!("conv-{index}")), None).await;
            assert!(matches!(result, Err(CallError::Remote(_))));
        }

        let health = client.health();
        assert_eq!(health.breaker_state, CircuitState::Closed);
        assert_eq!((health.failures, health.rejections), (0, 5));
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn outage_errors_open_the_breaker() {
        let client = client(MockStep::fail("connection refused"));

        for _ in 0..2 {
            let _ = client.complete(request("conv-1"), None).await;
        }
        let refused = client.complete(request("conv-2"), None).await;

        assert!(matches!(refused, Err(CallError::ShortCircuited { .. })));
        let health = client.health();
        assert_eq!(health.breaker_state, CircuitState::Open);
        assert_eq!((health.failures, health.short_circuits), (2, 1));
    }
}
