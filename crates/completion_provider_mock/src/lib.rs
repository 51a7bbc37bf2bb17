//! Deterministic mock implementation of the `completion_provider` contract.
//!
//! This crate contains no transport logic. Replies are scripted up front and
//! served in order, which makes recovery flows reproducible in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use completion_provider::{
    CompletionClient, CompletionError, CompletionReply, CompletionRequest, ProviderProfile,
    ToolDefinition, ToolExecutor, ToolInvocation, ToolOutcome,
};
use serde_json::json;

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// One scripted answer to a `complete` call.
#[derive(Debug, Clone)]
pub enum MockStep {
    Reply(CompletionReply),
    Fail(CompletionError),
    /// Waits before resolving the inner step.
    Delayed(Duration, Box<MockStep>),
    /// Never resolves; used to exercise timeouts and cancellation.
    Hang,
}

impl MockStep {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Reply(CompletionReply::Text {
            content: content.into(),
        })
    }

    #[must_use]
    pub fn tool_calls(invocations: Vec<ToolInvocation>) -> Self {
        Self::Reply(CompletionReply::ToolCalls {
            content: None,
            invocations,
        })
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(CompletionError::new(message))
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockStep>,
    requests: Vec<CompletionRequest>,
}

/// Scripted completion client; clones share the same script and request log.
#[derive(Debug, Clone)]
pub struct MockCompletionClient {
    model_id: String,
    fallback: Option<MockStep>,
    state: Arc<Mutex<MockState>>,
}

impl MockCompletionClient {
    /// Creates a client that serves `script` in order and then fails every
    /// further call with "mock script exhausted".
    #[must_use]
    pub fn new(script: Vec<MockStep>) -> Self {
        Self {
            model_id: "mock".to_string(),
            fallback: None,
            state: Arc::new(Mutex::new(MockState {
                script: script.into(),
                requests: Vec::new(),
            })),
        }
    }

    /// Creates a client that answers every call with the same step.
    #[must_use]
    pub fn always(step: MockStep) -> Self {
        Self::new(Vec::new()).with_fallback(step)
    }

    #[must_use]
    pub fn with_fallback(mut self, step: MockStep) -> Self {
        self.fallback = Some(step);
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.model_id = model_id.trim().to_string();
        }
        self
    }

    /// Appends more scripted steps.
    pub fn push(&self, step: MockStep) {
        lock_unpoisoned(&self.state).script.push_back(step);
    }

    /// Number of `complete` calls that reached this client.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock_unpoisoned(&self.state).requests.len()
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock_unpoisoned(&self.state).requests.clone()
    }

    fn next_step(&self, request: CompletionRequest) -> Option<MockStep> {
        let mut state = lock_unpoisoned(&self.state);
        state.requests.push(request);
        state.script.pop_front().or_else(|| self.fallback.clone())
    }
}

impl Default for MockCompletionClient {
    fn default() -> Self {
        Self::always(MockStep::text("Completed successfully."))
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionReply, CompletionError> {
        let Some(mut step) = self.next_step(request) else {
            return Err(CompletionError::new("mock script exhausted"));
        };

        loop {
            match step {
                MockStep::Reply(reply) => return Ok(reply),
                MockStep::Fail(error) => return Err(error),
                MockStep::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
                MockStep::Hang => std::future::pending::<()>().await,
            }
        }
    }
}

/// Tool executor answering by capability name and recording every call.
#[derive(Debug, Clone, Default)]
pub struct MockToolExecutor {
    outcomes: HashMap<String, ToolOutcome>,
    delay: Option<Duration>,
    executed: Arc<Mutex<Vec<ToolInvocation>>>,
}

impl MockToolExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_outcome(mut self, capability_name: impl Into<String>, outcome: ToolOutcome) -> Self {
        self.outcomes.insert(capability_name.into(), outcome);
        self
    }

    /// Delays every execution; lets tests cancel while tools are running.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn executed(&self) -> Vec<ToolInvocation> {
        lock_unpoisoned(&self.executed).clone()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.outcomes.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: None,
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute(&self, invocation: &ToolInvocation) -> ToolOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock_unpoisoned(&self.executed).push(invocation.clone());

        self.outcomes
            .get(&invocation.capability_name)
            .cloned()
            .unwrap_or_else(|| {
                ToolOutcome::error(format!("unknown tool '{}'", invocation.capability_name))
            })
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
