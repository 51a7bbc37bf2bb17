mod support;

use std::sync::Arc;
use std::time::Duration;

use completion_provider::Turn;
use conversation_store::{ConversationStore, LifecycleState};
use convo_guard::{
    BranchManager, CheckpointManager, CircuitBreaker, CircuitBreakerConfig, ConversationLocks,
    ErrorCategory, ErrorClassifier, IntegrityValidator, RecoveryAction, RecoveryOrchestrator,
    RecoveryPolicy, RecoveryStrategy, SequenceRepairer,
};
use pretty_assertions::assert_eq;

use support::{assistant_calls, history, memory_store, seeded_conversation, test_config};

struct Setup {
    store: Arc<dyn ConversationStore>,
    locks: ConversationLocks,
    breaker: Arc<CircuitBreaker>,
    classifier: ErrorClassifier,
    orchestrator: RecoveryOrchestrator,
}

fn setup(breaker_config: CircuitBreakerConfig) -> Setup {
    let store = memory_store();
    let validator = Arc::new(IntegrityValidator::default());
    let checkpoints = Arc::new(CheckpointManager::new(
        Arc::clone(&store),
        Arc::clone(&validator),
        10,
    ));
    let repairer = Arc::new(SequenceRepairer::new(
        Arc::clone(&store),
        Arc::clone(&validator),
        checkpoints,
    ));
    let branches = Arc::new(BranchManager::new(Arc::clone(&store), validator));
    let breaker = Arc::new(CircuitBreaker::new("chat-api", breaker_config));
    let orchestrator = RecoveryOrchestrator::new(
        RecoveryPolicy::from_config(&test_config()),
        Arc::clone(&breaker),
        repairer,
        branches,
    );
    Setup {
        store,
        locks: ConversationLocks::new(),
        breaker,
        classifier: ErrorClassifier::default(),
        orchestrator,
    }
}

#[tokio::test]
async fn rate_limit_delays_grow_then_give_up() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify("rate limit exceeded");
    assert_eq!(classification.category, ErrorCategory::RateLimit);

    let mut delays = Vec::new();
    for attempt in 1..=3 {
        let signal = setup
            .orchestrator
            .handle(&guard, "owner-1", &classification, Some("hi"))
            .expect("signal");
        assert_eq!(signal.action, RecoveryAction::RetryAfterDelay);
        assert_eq!(signal.strategy, RecoveryStrategy::Backoff);
        assert_eq!(signal.attempt, attempt);
        assert!(signal.recoverable);
        assert_eq!(signal.retry_payload.as_deref(), Some("hi"));
        delays.push(signal.delay_seconds().expect("delay"));
    }
    assert!(delays[0] > 0.0);
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));

    let give_up = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("hi"))
        .expect("signal");
    assert_eq!(give_up.action, RecoveryAction::GiveUp);
    assert!(!give_up.recoverable);
    assert!(setup.orchestrator.context(&conversation.id).is_none());
}

#[tokio::test]
async fn network_errors_use_capped_backoff_within_budget() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify("connection refused");

    let delays: Vec<Duration> = (0..5)
        .map(|_| {
            setup
                .orchestrator
                .handle(&guard, "owner-1", &classification, None)
                .expect("signal")
                .delay
                .expect("delay")
        })
        .collect();
    assert_eq!(
        delays,
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );

    let context = setup
        .orchestrator
        .context(&conversation.id)
        .expect("context is kept while retrying");
    assert_eq!(context.attempts(ErrorCategory::NetworkError), 5);
    assert_eq!(context.owner, "owner-1");

    let sixth = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");
    assert_eq!(sixth.action, RecoveryAction::GiveUp);
}

#[tokio::test]
async fn auth_and_validation_errors_are_terminal() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;

    let auth = setup
        .orchestrator
        .handle(
            &guard,
            "owner-1",
            &setup.classifier.classify("HTTP 401 invalid api key"),
            Some("hi"),
        )
        .expect("signal");
    assert_eq!(auth.action, RecoveryAction::Reauthenticate);
    assert_eq!(auth.strategy, RecoveryStrategy::UserIntervention);
    assert!(!auth.recoverable);
    assert_eq!(auth.delay, None);

    let message = "invalid request: list name must not be empty";
    let validation = setup
        .orchestrator
        .handle(&guard, "owner-1", &setup.classifier.classify(message), Some("hi"))
        .expect("signal");
    assert_eq!(validation.action, RecoveryAction::CorrectInput);
    assert!(!validation.recoverable);
    assert!(validation.user_message.contains(message));
}

#[tokio::test(start_paused = true)]
async fn open_breaker_reports_wait_without_retrying() {
    let setup = setup(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(120),
    });
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify("HTTP 503 service unavailable");

    let closed = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");
    assert_eq!(closed.action, RecoveryAction::RetryAfterDelay);

    setup.breaker.record_failure();
    let open = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");

    assert_eq!(open.action, RecoveryAction::ServiceUnavailable);
    assert!(open.recoverable);
    assert_eq!(open.delay, Some(Duration::from_secs(120)));
    assert!(open.user_message.contains("2 minutes"));
    assert!(setup.orchestrator.context(&conversation.id).is_some());
}

#[tokio::test]
async fn closed_breaker_allows_one_service_unavailable_retry() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify("HTTP 502 Bad Gateway");
    assert_eq!(classification.category, ErrorCategory::ServiceUnavailable);

    let retry = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("hi"))
        .expect("signal");
    assert_eq!(retry.action, RecoveryAction::RetryAfterDelay);
    assert_eq!(retry.strategy, RecoveryStrategy::CircuitBreakerRetry);

    let second = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("hi"))
        .expect("signal");
    assert_eq!(second.action, RecoveryAction::GiveUp);
    assert!(!second.recoverable);
    assert!(setup.breaker.is_closed());
}

#[tokio::test]
async fn structural_error_repairs_then_branches_after_budget() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(
        &setup.store,
        vec![
            Turn::user("hi"),
            Turn::assistant("hello"),
            Turn::tool_result("call_9", "stray"),
        ],
    );
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify(
        "Invalid parameter: messages with role 'tool' must be a response to a preceding message with 'tool_calls'",
    );
    assert_eq!(classification.category, ErrorCategory::ConversationStructure);

    let first = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("next"))
        .expect("signal");
    assert_eq!(first.action, RecoveryAction::RetrySameConversation);
    assert_eq!(
        history(&setup.store, &conversation.id),
        vec![Turn::user("hi"), Turn::assistant("hello")]
    );

    let second = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("next"))
        .expect("signal");
    assert_eq!(second.action, RecoveryAction::RetrySameConversation);

    let third = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, Some("next"))
        .expect("signal");
    assert_eq!(third.action, RecoveryAction::RetryNewConversation);
    assert_eq!(third.retry_payload.as_deref(), Some("next"));

    let branch = third.new_conversation.expect("branch conversation");
    assert_eq!(branch.parent_id.as_deref(), Some(conversation.id.as_str()));
    assert_eq!(
        history(&setup.store, &branch.id),
        vec![Turn::user("hi"), Turn::assistant("hello")]
    );
    let origin = setup.store.conversation(&conversation.id).expect("origin");
    assert!(origin.archived);
    assert_eq!(origin.lifecycle, LifecycleState::Error);
    assert!(setup.orchestrator.context(&conversation.id).is_none());
}

#[tokio::test]
async fn unanswered_call_is_truncated_by_structural_recovery() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(
        &setup.store,
        vec![Turn::user("hi"), assistant_calls(&["call_1"])],
    );
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup
        .classifier
        .classify("integrity violation: assistant turn 1 has unanswered tool calls");

    let signal = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");

    assert_eq!(signal.action, RecoveryAction::RetrySameConversation);
    assert_eq!(history(&setup.store, &conversation.id), vec![Turn::user("hi")]);
}

#[tokio::test(start_paused = true)]
async fn recovery_context_expires_after_ttl() {
    let setup = setup(CircuitBreakerConfig::default());
    let conversation = seeded_conversation(&setup.store, vec![Turn::user("hi")]);
    let guard = setup.locks.lock(&conversation.id).await;
    let classification = setup.classifier.classify("request timed out after 30s");

    setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");
    assert_eq!(setup.orchestrator.active_contexts(), 1);

    tokio::time::advance(test_config().recovery_context_ttl).await;
    assert!(setup.orchestrator.context(&conversation.id).is_none());

    let fresh = setup
        .orchestrator
        .handle(&guard, "owner-1", &classification, None)
        .expect("signal");
    assert_eq!(fresh.attempt, 1);
}
