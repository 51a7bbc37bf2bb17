//! Recovery policy: turns a classified failure into a signal for the caller.
//!
//! Callers branch on [`RecoverySignal::action`] and
//! [`RecoverySignal::recoverable`] only; `user_message` is display text.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conversation_store::Conversation;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::branch::BranchManager;
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{Classification, ErrorCategory, RecoveryStrategy};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::locks::{lock_unpoisoned, ConversationGuard};
use crate::repair::{RepairError, SequenceRepairer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryAfterDelay,
    RetrySameConversation,
    RetryNewConversation,
    ServiceUnavailable,
    Reauthenticate,
    CorrectInput,
    GiveUp,
}

impl RecoveryAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryAfterDelay => "retry_after_delay",
            Self::RetrySameConversation => "retry_same_conversation",
            Self::RetryNewConversation => "retry_new_conversation",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Reauthenticate => "reauthenticate",
            Self::CorrectInput => "correct_input",
            Self::GiveUp => "give_up",
        }
    }

    /// True for actions the engine acts on by calling the remote again.
    #[must_use]
    pub fn is_retry(self) -> bool {
        matches!(
            self,
            Self::RetryAfterDelay | Self::RetrySameConversation | Self::RetryNewConversation
        )
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySignal {
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub action: RecoveryAction,
    pub recoverable: bool,
    pub user_message: String,
    /// The user's original message, kept for replay.
    pub retry_payload: Option<String>,
    pub new_conversation: Option<Conversation>,
    pub delay: Option<Duration>,
    /// Attempt number within the category that produced this signal.
    pub attempt: u32,
}

impl RecoverySignal {
    #[must_use]
    pub fn delay_seconds(&self) -> Option<f64> {
        self.delay.map(|delay| delay.as_secs_f64())
    }
}

/// Attempts allowed per category before escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBudgets {
    pub rate_limit: u32,
    pub conversation_structure: u32,
    pub network_error: u32,
    pub service_unavailable: u32,
    pub unknown: u32,
}

impl Default for RecoveryBudgets {
    fn default() -> Self {
        Self {
            rate_limit: 3,
            conversation_structure: 2,
            network_error: 5,
            service_unavailable: 1,
            unknown: 3,
        }
    }
}

impl RecoveryBudgets {
    #[must_use]
    pub fn for_category(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::RateLimit => self.rate_limit,
            ErrorCategory::ConversationStructure => self.conversation_structure,
            ErrorCategory::NetworkError => self.network_error,
            ErrorCategory::ServiceUnavailable => self.service_unavailable,
            ErrorCategory::Unknown => self.unknown,
            ErrorCategory::AuthError | ErrorCategory::ValidationError => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub budgets: RecoveryBudgets,
    pub rate_limit_backoff: BackoffPolicy,
    pub retry_backoff: BackoffPolicy,
    pub context_ttl: Duration,
}

impl RecoveryPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            budgets: RecoveryBudgets::default(),
            rate_limit_backoff: BackoffPolicy::exponential_with_jitter(
                config.rate_limit_base_delay,
            ),
            retry_backoff: BackoffPolicy::capped_exponential(
                config.backoff_base_delay,
                config.max_backoff,
            ),
            context_ttl: config.recovery_context_ttl,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// In-flight recovery bookkeeping for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    pub owner: String,
    pub conversation_id: String,
    attempts: HashMap<ErrorCategory, u32>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl RecoveryContext {
    fn new(owner: &str, conversation_id: &str, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            owner: owner.to_string(),
            conversation_id: conversation_id.to_string(),
            attempts: HashMap::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    #[must_use]
    pub fn attempts(&self, category: ErrorCategory) -> u32 {
        self.attempts.get(&category).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.attempts.values().sum()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct RecoveryOrchestrator {
    policy: RecoveryPolicy,
    breaker: Arc<CircuitBreaker>,
    repairer: Arc<SequenceRepairer>,
    branches: Arc<BranchManager>,
    contexts: Mutex<HashMap<String, RecoveryContext>>,
}

impl RecoveryOrchestrator {
    #[must_use]
    pub fn new(
        policy: RecoveryPolicy,
        breaker: Arc<CircuitBreaker>,
        repairer: Arc<SequenceRepairer>,
        branches: Arc<BranchManager>,
    ) -> Self {
        Self {
            policy,
            breaker,
            repairer,
            branches,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Decides what to do about `classification` for the locked conversation.
    ///
    /// Store failures while repairing or branching are returned as errors;
    /// every other path produces a signal.
    pub fn handle(
        &self,
        guard: &ConversationGuard,
        owner: &str,
        classification: &Classification,
        retry_payload: Option<&str>,
    ) -> Result<RecoverySignal, EngineError> {
        let conversation_id = guard.conversation_id();
        let category = classification.category;
        let attempt = self.record_attempt(owner, conversation_id, category);
        let budget = self.policy.budgets.for_category(category);
        let draft = SignalDraft {
            category,
            attempt,
            retry_payload: retry_payload.map(str::to_string),
        };

        let signal = match category {
            ErrorCategory::AuthError => draft.terminal(
                RecoveryAction::Reauthenticate,
                "The assistant service rejected our credentials. Please sign in again.".to_string(),
            ),
            ErrorCategory::ValidationError => draft.terminal(
                RecoveryAction::CorrectInput,
                format!(
                    "The assistant could not accept this request: {}. Please adjust your message and try again.",
                    classification.message
                ),
            ),
            ErrorCategory::ServiceUnavailable if self.breaker.is_open() => {
                let wait = self.breaker.retry_after().unwrap_or_default();
                let mut signal = draft.signal(
                    RecoveryAction::ServiceUnavailable,
                    format!(
                        "The assistant service is unavailable. Please try again in {}.",
                        describe_wait(wait)
                    ),
                );
                signal.delay = Some(wait);
                signal
            }
            ErrorCategory::ConversationStructure if attempt > budget => {
                tracing::warn!(conversation_id, attempt, "structural recovery budget exhausted; branching");
                self.branch(guard, draft)?
            }
            ErrorCategory::ConversationStructure => self.repair_or_branch(guard, draft)?,
            _ if attempt > budget => draft.terminal(
                RecoveryAction::GiveUp,
                format!(
                    "The assistant could not complete your request after {budget} attempts. Please try again later."
                ),
            ),
            ErrorCategory::RateLimit => {
                let delay = self.policy.rate_limit_backoff.delay_for(attempt);
                let mut signal = draft.signal(
                    RecoveryAction::RetryAfterDelay,
                    format!(
                        "The assistant is handling too many requests. Retrying in {}.",
                        describe_wait(delay)
                    ),
                );
                signal.delay = Some(delay);
                signal
            }
            ErrorCategory::NetworkError
            | ErrorCategory::ServiceUnavailable
            | ErrorCategory::Unknown => {
                let delay = self.policy.retry_backoff.delay_for(attempt);
                let mut signal = draft.signal(
                    RecoveryAction::RetryAfterDelay,
                    format!(
                        "Having trouble reaching the assistant. Retrying in {}.",
                        describe_wait(delay)
                    ),
                );
                signal.delay = Some(delay);
                signal
            }
        };

        if !signal.recoverable || signal.action == RecoveryAction::RetryNewConversation {
            self.complete(conversation_id);
        }

        tracing::info!(
            conversation_id,
            category = category.as_str(),
            attempt,
            action = signal.action.as_str(),
            delay_ms = signal.delay.map(|delay| delay.as_millis() as u64),
            "recovery decision"
        );
        Ok(signal)
    }

    /// Terminal signal for a bound the caller enforces itself, such as the
    /// tool-round limit. Discards the conversation's context.
    pub fn give_up(
        &self,
        conversation_id: &str,
        retry_payload: Option<&str>,
        user_message: String,
    ) -> RecoverySignal {
        self.complete(conversation_id);
        let draft = SignalDraft {
            category: ErrorCategory::Unknown,
            attempt: 1,
            retry_payload: retry_payload.map(str::to_string),
        };
        tracing::warn!(conversation_id, %user_message, "giving up");
        draft.terminal(RecoveryAction::GiveUp, user_message)
    }

    /// Discards the context after success or a terminal outcome.
    pub fn complete(&self, conversation_id: &str) {
        lock_unpoisoned(&self.contexts).remove(conversation_id);
    }

    /// Live context for a conversation; expired contexts are purged first.
    pub fn context(&self, conversation_id: &str) -> Option<RecoveryContext> {
        let mut contexts = lock_unpoisoned(&self.contexts);
        purge_expired(&mut contexts);
        contexts.get(conversation_id).cloned()
    }

    pub fn active_contexts(&self) -> usize {
        let mut contexts = lock_unpoisoned(&self.contexts);
        purge_expired(&mut contexts);
        contexts.len()
    }

    fn record_attempt(&self, owner: &str, conversation_id: &str, category: ErrorCategory) -> u32 {
        let mut contexts = lock_unpoisoned(&self.contexts);
        purge_expired(&mut contexts);
        let context = contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| RecoveryContext::new(owner, conversation_id, self.policy.context_ttl));
        let attempts = context.attempts.entry(category).or_insert(0);
        *attempts += 1;
        *attempts
    }

    fn repair_or_branch(
        &self,
        guard: &ConversationGuard,
        draft: SignalDraft,
    ) -> Result<RecoverySignal, EngineError> {
        match self.repairer.repair(guard) {
            Ok(report) => {
                tracing::info!(
                    conversation_id = guard.conversation_id(),
                    removed = report.removed_total(),
                    "structural error repaired in place"
                );
                Ok(draft.signal(
                    RecoveryAction::RetrySameConversation,
                    "The conversation history was repaired. Retrying your message.".to_string(),
                ))
            }
            Err(RepairError::Unrepairable { violation, .. }) => {
                tracing::warn!(
                    conversation_id = guard.conversation_id(),
                    %violation,
                    "repair failed; branching"
                );
                self.branch(guard, draft)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn branch(
        &self,
        guard: &ConversationGuard,
        draft: SignalDraft,
    ) -> Result<RecoverySignal, EngineError> {
        let branch = self.branches.create_recovery_branch(guard)?;
        let mut signal = draft.signal(
            RecoveryAction::RetryNewConversation,
            "The conversation was moved to a fresh thread to recover from an error. Retrying your message.".to_string(),
        );
        signal.new_conversation = Some(branch);
        Ok(signal)
    }
}

struct SignalDraft {
    category: ErrorCategory,
    attempt: u32,
    retry_payload: Option<String>,
}

impl SignalDraft {
    fn signal(&self, action: RecoveryAction, user_message: String) -> RecoverySignal {
        RecoverySignal {
            category: self.category,
            strategy: self.category.strategy(),
            action,
            recoverable: self.category.recoverable(),
            user_message,
            retry_payload: self.retry_payload.clone(),
            new_conversation: None,
            delay: None,
            attempt: self.attempt,
        }
    }

    fn terminal(&self, action: RecoveryAction, user_message: String) -> RecoverySignal {
        RecoverySignal {
            recoverable: false,
            ..self.signal(action, user_message)
        }
    }
}

fn purge_expired(contexts: &mut HashMap<String, RecoveryContext>) {
    let now = Instant::now();
    contexts.retain(|_, context| !context.is_expired(now));
}

fn describe_wait(wait: Duration) -> String {
    let secs = wait.as_secs_f64().ceil() as u64;
    if secs >= 120 {
        format!("{} minutes", secs.div_ceil(60))
    } else if secs == 1 {
        "1 second".to_string()
    } else {
        format!("{secs} seconds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_match_documented_defaults() {
        let budgets = RecoveryBudgets::default();

        assert_eq!(budgets.for_category(ErrorCategory::RateLimit), 3);
        assert_eq!(budgets.for_category(ErrorCategory::ConversationStructure), 2);
        assert_eq!(budgets.for_category(ErrorCategory::NetworkError), 5);
        assert_eq!(budgets.for_category(ErrorCategory::ServiceUnavailable), 1);
        assert_eq!(budgets.for_category(ErrorCategory::Unknown), 3);
        assert_eq!(budgets.for_category(ErrorCategory::AuthError), 0);
    }

    #[test]
    fn waits_are_described_in_readable_units() {
        assert_eq!(describe_wait(Duration::from_millis(400)), "1 second");
        assert_eq!(describe_wait(Duration::from_secs(45)), "45 seconds");
        assert_eq!(describe_wait(Duration::from_secs(150)), "3 minutes");
    }

    #[test]
    fn action_names_are_stable() {
        assert_eq!(RecoveryAction::ServiceUnavailable.as_str(), "service_unavailable");
        assert!(RecoveryAction::RetryNewConversation.is_retry());
        assert!(!RecoveryAction::GiveUp.is_retry());
    }
}
