//! Drives one user turn through validation, the remote call, the tool loop
//! and recovery.

use std::sync::Arc;

use completion_provider::{
    CancelSignal, CompletionClient, CompletionRequest, Role, ToolDefinition,
    ToolExecutor, ToolInvocation, ToolOutcome, Turn,
};
use conversation_store::{
    Checkpoint, CheckpointSummary, Conversation, ConversationStore, NewTurn, StoredTurn,
};
use time::OffsetDateTime;

use crate::branch::{BranchManager, MergeReport, MergeStrategy};
use crate::cancel::{await_or_cancel, is_cancelled};
use crate::checkpoint::CheckpointManager;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::classifier::{Classification, ErrorCategory, ErrorClassifier};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::id_policy::{PrefixedIdPolicy, ToolCallIdPolicy};
use crate::locks::{ConversationGuard, ConversationLocks};
use crate::recovery::{
    RecoveryAction, RecoveryContext, RecoveryOrchestrator, RecoveryPolicy, RecoverySignal,
};
use crate::repair::{RepairReport, SequenceRepairer};
use crate::resilient::{CallError, HealthSnapshot, ResilientCompletionClient};
use crate::validator::{IntegrityValidator, IntegrityViolation, ValidationReport};

/// How a call to [`ConversationEngine::send_user_message`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model produced a final text reply. `conversation_id` differs from
    /// the requested id when recovery moved the exchange to a branch.
    Completed {
        conversation_id: String,
        reply: Turn,
        /// Assistant and tool turns committed by the successful exchange.
        appended: Vec<StoredTurn>,
    },
    /// Recovery needs the caller: it did not resolve in-loop.
    Recovery(RecoverySignal),
    /// Cancelled by the caller. Any round still in flight was not committed.
    Cancelled { conversation_id: String },
}

pub struct ConversationEngineBuilder {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn CompletionClient>,
    tools: Option<Arc<dyn ToolExecutor>>,
    id_policy: Arc<dyn ToolCallIdPolicy>,
    classifier: ErrorClassifier,
    breaker: Option<Arc<CircuitBreaker>>,
    config: EngineConfig,
}

impl ConversationEngineBuilder {
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn with_id_policy(mut self, policy: Arc<dyn ToolCallIdPolicy>) -> Self {
        self.id_policy = policy;
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Shares an existing breaker, e.g. one per remote dependency across
    /// several engines.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> ConversationEngine {
        let config = self.config;
        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                self.client.profile().provider_id,
                CircuitBreakerConfig {
                    failure_threshold: config.failure_threshold,
                    recovery_timeout: config.recovery_timeout,
                },
            ))
        });

        let validator = Arc::new(IntegrityValidator::new(
            self.id_policy,
            config.recency_window,
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&self.store),
            Arc::clone(&validator),
            config.checkpoint_history_limit,
        ));
        let repairer = Arc::new(SequenceRepairer::new(
            Arc::clone(&self.store),
            Arc::clone(&validator),
            Arc::clone(&checkpoints),
        ));
        let branches = Arc::new(BranchManager::new(
            Arc::clone(&self.store),
            Arc::clone(&validator),
        ));
        let orchestrator = RecoveryOrchestrator::new(
            RecoveryPolicy::from_config(&config),
            Arc::clone(&breaker),
            Arc::clone(&repairer),
            Arc::clone(&branches),
        );
        let client = ResilientCompletionClient::new(self.client, breaker, config.request_timeout)
            .with_classifier(self.classifier.clone());

        ConversationEngine {
            store: self.store,
            client,
            tools: self.tools,
            locks: ConversationLocks::new(),
            validator,
            classifier: self.classifier,
            checkpoints,
            repairer,
            branches,
            orchestrator,
            config,
        }
    }
}

pub struct ConversationEngine {
    store: Arc<dyn ConversationStore>,
    client: ResilientCompletionClient,
    tools: Option<Arc<dyn ToolExecutor>>,
    locks: ConversationLocks,
    validator: Arc<IntegrityValidator>,
    classifier: ErrorClassifier,
    checkpoints: Arc<CheckpointManager>,
    repairer: Arc<SequenceRepairer>,
    branches: Arc<BranchManager>,
    orchestrator: RecoveryOrchestrator,
    config: EngineConfig,
}

enum Exchange {
    Completed {
        reply: Turn,
        appended: Vec<StoredTurn>,
    },
    Failed(String),
    Cancelled,
    RoundsExhausted,
}

enum Next {
    Retry,
    Switch(ConversationGuard),
    Return(TurnOutcome),
}

impl ConversationEngine {
    #[must_use]
    pub fn builder(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn CompletionClient>,
    ) -> ConversationEngineBuilder {
        ConversationEngineBuilder {
            store,
            client,
            tools: None,
            id_policy: Arc::new(PrefixedIdPolicy::default()),
            classifier: ErrorClassifier::default(),
            breaker: None,
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    #[must_use]
    pub fn validator(&self) -> &IntegrityValidator {
        &self.validator
    }

    pub fn start_conversation(&self, owner: &str) -> Result<Conversation, EngineError> {
        let conversation = self.store.create_conversation(owner, None)?;
        tracing::info!(conversation_id = %conversation.id, owner, "started conversation");
        Ok(conversation)
    }

    pub fn history(&self, conversation_id: &str) -> Result<Vec<StoredTurn>, EngineError> {
        Ok(self.store.turns(conversation_id)?)
    }

    /// Appends `text` as a user turn and drives the exchange to a final reply.
    ///
    /// The conversation stays locked for the whole call. Retry signals are
    /// acted on here; any other signal is handed back as
    /// [`TurnOutcome::Recovery`].
    pub async fn send_user_message(
        &self,
        conversation_id: &str,
        text: &str,
        cancel: Option<&CancelSignal>,
    ) -> Result<TurnOutcome, EngineError> {
        let mut guard = self.locks.lock(conversation_id).await;
        let conversation = self.store.conversation(conversation_id)?;
        if conversation.archived {
            return Err(EngineError::ConversationArchived {
                conversation_id: conversation_id.to_string(),
            });
        }
        let owner = conversation.owner;
        // Seq of this call's user turn; repair or branching may remove it.
        let mut user_seq: Option<u64> = None;
        let mut branched = false;

        loop {
            let current_id = guard.conversation_id().to_string();
            if is_cancelled(cancel) {
                return Ok(TurnOutcome::Cancelled {
                    conversation_id: current_id,
                });
            }

            let turns = self.store.turns(&current_id)?;
            let classification = match self.validator.validate(&turns, OffsetDateTime::now_utc()) {
                Err(violation) => self.structural(&violation),
                Ok(_) => {
                    if user_seq.is_none() {
                        user_seq = Some(self.store.append_turn(&current_id, Turn::user(text))?.seq);
                    }

                    match self.run_exchange(&current_id, cancel).await? {
                        Exchange::Completed { reply, appended } => {
                            let mut conversation = self.store.conversation(&current_id)?;
                            conversation.mark_stable(OffsetDateTime::now_utc());
                            self.store.save_conversation(&conversation)?;
                            self.orchestrator.complete(&current_id);
                            return Ok(TurnOutcome::Completed {
                                conversation_id: current_id,
                                reply,
                                appended,
                            });
                        }
                        Exchange::Cancelled => {
                            return Ok(TurnOutcome::Cancelled {
                                conversation_id: current_id,
                            })
                        }
                        Exchange::RoundsExhausted => {
                            let signal = self.orchestrator.give_up(
                                &current_id,
                                Some(text),
                                format!(
                                    "The assistant kept calling tools without answering after {} rounds. Please rephrase your request.",
                                    self.config.max_tool_rounds
                                ),
                            );
                            return Ok(TurnOutcome::Recovery(signal));
                        }
                        Exchange::Failed(message) => self.classifier.classify(&message),
                    }
                }
            };

            let signal = self
                .orchestrator
                .handle(&guard, &owner, &classification, Some(text))?;
            match self.follow(&current_id, signal, branched, cancel).await? {
                Next::Retry => {
                    if let Some(seq) = user_seq {
                        let turns = self.store.turns(&current_id)?;
                        if !turns.iter().any(|turn| turn.seq == seq) {
                            tracing::debug!(
                                conversation_id = %current_id,
                                "repair removed the user turn; appending it again"
                            );
                            user_seq = None;
                        }
                    }
                }
                Next::Switch(next) => {
                    let seeded = self.store.turns(next.conversation_id())?;
                    user_seq = trailing_user_text(&seeded, text);
                    guard = next;
                    branched = true;
                }
                Next::Return(outcome) => return Ok(outcome),
            }
        }
    }

    /// Runs remote calls and tool rounds until the model answers with text.
    /// An assistant turn is committed together with all of its tool turns.
    async fn run_exchange(
        &self,
        conversation_id: &str,
        cancel: Option<&CancelSignal>,
    ) -> Result<Exchange, EngineError> {
        let tools = self.tool_definitions();
        let mut appended = Vec::new();

        for round in 0..self.config.max_tool_rounds {
            let turns = self.store.turns(conversation_id)?;
            let request = CompletionRequest {
                conversation_id: conversation_id.to_string(),
                turns: turns.iter().map(|turn| turn.turn.clone()).collect(),
                tools: tools.clone(),
            };

            let reply = match self.client.complete(request, cancel).await {
                Ok(reply) => reply,
                Err(CallError::Cancelled) => return Ok(Exchange::Cancelled),
                Err(error) => return Ok(Exchange::Failed(error.to_string())),
            };

            let assistant = reply.into_turn();
            if !assistant.has_tool_calls() {
                appended.push(self.store.append_turn(conversation_id, assistant.clone())?);
                return Ok(Exchange::Completed {
                    reply: assistant,
                    appended,
                });
            }

            // Shape-check the round with placeholder answers before any tool runs.
            let mut batch = vec![assistant.clone()];
            batch.extend(
                assistant
                    .tool_calls
                    .iter()
                    .map(|invocation| Turn::tool_result(invocation.id.clone(), String::new())),
            );
            let candidate: Vec<&Turn> = turns
                .iter()
                .map(|turn| &turn.turn)
                .chain(batch.iter())
                .collect();
            if let Err(violation) = self.validator.check(&candidate) {
                tracing::warn!(conversation_id, round, %violation, "rejected tool round from remote");
                return Ok(Exchange::Failed(violation.to_string()));
            }

            for (invocation, answer) in assistant.tool_calls.iter().zip(&mut batch[1..]) {
                let Ok(outcome) = await_or_cancel(self.execute_tool(invocation), cancel).await
                else {
                    tracing::info!(conversation_id, round, "cancelled while running tools");
                    return Ok(Exchange::Cancelled);
                };
                if outcome.is_error {
                    tracing::warn!(
                        conversation_id,
                        tool = %invocation.capability_name,
                        call_id = %invocation.id,
                        "tool reported an error"
                    );
                }
                answer.content = Some(outcome.content);
            }
            if is_cancelled(cancel) {
                return Ok(Exchange::Cancelled);
            }

            let batch: Vec<NewTurn> = batch.into_iter().map(NewTurn::from).collect();
            appended.extend(self.store.append_turns(conversation_id, batch)?);
            tracing::debug!(conversation_id, round, "committed tool round");
        }

        tracing::warn!(
            conversation_id,
            limit = self.config.max_tool_rounds,
            "tool round limit reached"
        );
        Ok(Exchange::RoundsExhausted)
    }

    async fn execute_tool(&self, invocation: &ToolInvocation) -> ToolOutcome {
        match &self.tools {
            Some(tools) => tools.execute(invocation).await,
            None => ToolOutcome::error(format!(
                "no tool executor is configured for '{}'",
                invocation.capability_name
            )),
        }
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .as_ref()
            .map(|tools| tools.tool_definitions())
            .unwrap_or_default()
    }

    /// Acts on a retry signal or turns it into the caller's outcome. A
    /// second branch within one call is handed back instead of followed.
    async fn follow(
        &self,
        conversation_id: &str,
        signal: RecoverySignal,
        branched: bool,
        cancel: Option<&CancelSignal>,
    ) -> Result<Next, EngineError> {
        match signal.action {
            RecoveryAction::RetryAfterDelay => {
                if let Some(delay) = signal.delay {
                    if await_or_cancel(tokio::time::sleep(delay), cancel)
                        .await
                        .is_err()
                    {
                        return Ok(Next::Return(TurnOutcome::Cancelled {
                            conversation_id: conversation_id.to_string(),
                        }));
                    }
                }
                Ok(Next::Retry)
            }
            RecoveryAction::RetrySameConversation => Ok(Next::Retry),
            RecoveryAction::RetryNewConversation if !branched => {
                match &signal.new_conversation {
                    Some(conversation) => Ok(Next::Switch(self.locks.lock(&conversation.id).await)),
                    None => Ok(Next::Return(TurnOutcome::Recovery(signal))),
                }
            }
            _ => Ok(Next::Return(TurnOutcome::Recovery(signal))),
        }
    }

    fn structural(&self, violation: &IntegrityViolation) -> Classification {
        Classification {
            category: ErrorCategory::ConversationStructure,
            message: violation.to_string(),
            matched_pattern: None,
            table_version: self.classifier.table().version(),
        }
    }

    /// Validates the stored history at the current time. Full mode raises
    /// the first violation; basic mode reports them.
    pub fn validate(&self, conversation_id: &str) -> Result<ValidationReport, EngineError> {
        let turns = self.store.turns(conversation_id)?;
        Ok(self.validator.validate(&turns, OffsetDateTime::now_utc())?)
    }

    pub async fn repair(&self, conversation_id: &str) -> Result<RepairReport, EngineError> {
        let guard = self.locks.lock(conversation_id).await;
        Ok(self.repairer.repair(&guard)?)
    }

    pub async fn create_checkpoint(
        &self,
        conversation_id: &str,
        name: Option<&str>,
    ) -> Result<Checkpoint, EngineError> {
        let guard = self.locks.lock(conversation_id).await;
        Ok(self.checkpoints.create(&guard, name)?)
    }

    pub async fn restore_checkpoint(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> Result<bool, EngineError> {
        let guard = self.locks.lock(conversation_id).await;
        Ok(self.checkpoints.restore(&guard, name)?)
    }

    pub fn list_checkpoints(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointSummary>, EngineError> {
        Ok(self.checkpoints.list(conversation_id, limit)?)
    }

    pub async fn create_recovery_branch(
        &self,
        conversation_id: &str,
    ) -> Result<Conversation, EngineError> {
        let guard = self.locks.lock(conversation_id).await;
        Ok(self.branches.create_recovery_branch(&guard)?)
    }

    pub async fn merge_branch(
        &self,
        primary_id: &str,
        branch_id: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeReport, EngineError> {
        let Some((primary, branch)) = self.locks.lock_pair(primary_id, branch_id).await else {
            return Err(EngineError::SelfMerge {
                conversation_id: primary_id.to_string(),
            });
        };
        Ok(self.branches.merge(&primary, &branch, strategy)?)
    }

    #[must_use]
    pub fn recovery_context(&self, conversation_id: &str) -> Option<RecoveryContext> {
        self.orchestrator.context(conversation_id)
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.client.health()
    }
}

/// Seq of the last turn when it is a user turn carrying `text`.
fn trailing_user_text(turns: &[StoredTurn], text: &str) -> Option<u64> {
    turns
        .last()
        .filter(|turn| turn.turn.role == Role::User && turn.turn.content.as_deref() == Some(text))
        .map(|turn| turn.seq)
}
