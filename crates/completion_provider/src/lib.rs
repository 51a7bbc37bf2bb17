//! Minimal provider-agnostic contract for one remote completion call.
//!
//! This crate defines only the turn wire model, the tool catalog, and the
//! host-mediated tool execution contract. It excludes transport details,
//! vendor payloads, and conversation recovery concerns.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared cancellation flag for an in-flight completion.
pub type CancelSignal = Arc<AtomicBool>;

/// Creates a fresh, unset cancellation flag.
#[must_use]
pub fn cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Author of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured request, emitted by the remote model, to run a named capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub capability_name: String,
    pub arguments: Value,
}

impl ToolInvocation {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        capability_name: impl Into<String>,
        arguments: impl Into<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            capability_name: capability_name.into(),
            arguments: arguments.into(),
        }
    }
}

/// One role-tagged entry of a conversation, in wire shape.
///
/// `tool_calls` is only meaningful on assistant turns and `tool_call_id` only
/// on tool turns. Both are omitted from the serialized form when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    #[must_use]
    pub fn assistant_with_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolInvocation>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Returns true for assistant turns that request at least one tool.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

impl AsRef<Turn> for Turn {
    fn as_ref(&self) -> &Turn {
        self
    }
}

/// Host-mediated tool definition exposed to the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Input for one remote completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub conversation_id: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
}

/// What the remote model answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReply {
    Text {
        content: String,
    },
    ToolCalls {
        content: Option<String>,
        invocations: Vec<ToolInvocation>,
    },
}

impl CompletionReply {
    /// Converts the reply into the assistant turn that records it.
    #[must_use]
    pub fn into_turn(self) -> Turn {
        match self {
            Self::Text { content } => Turn::assistant(content),
            Self::ToolCalls {
                content,
                invocations,
            } => Turn::assistant_with_tool_calls(content, invocations),
        }
    }
}

/// Failure reported by a remote completion client.
///
/// Only the message is contractual; callers classify failures by text
/// because remote error types are outside their control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionError {
    message: String,
    status: Option<u16>,
}

impl CompletionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Creates an error that carries the remote HTTP-like status code.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CompletionError {}

impl From<String> for CompletionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CompletionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Immutable metadata describing a completion provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Remote completion client: sends a turn sequence plus tool catalog and
/// returns either a text reply or tool invocations.
#[async_trait]
pub trait CompletionClient: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Performs one remote completion call.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionReply, CompletionError>;
}

/// Result of executing one tool invocation on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Host-side executor for tool invocations requested by the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Returns the catalog advertised to the remote model.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    /// Executes one invocation. Failures are reported as error outcomes so
    /// every invocation still receives exactly one tool turn.
    async fn execute(&self, invocation: &ToolInvocation) -> ToolOutcome;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        CompletionClient, CompletionError, CompletionReply, CompletionRequest, ProviderProfile,
        Role, ToolExecutor, ToolInvocation, ToolOutcome, Turn,
    };

    struct EchoClient;

    #[async_trait::async_trait]
    impl CompletionClient for EchoClient {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile {
                provider_id: "echo".to_string(),
                model_id: "echo-model".to_string(),
            }
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionReply, CompletionError> {
            let last = request
                .turns
                .last()
                .and_then(|turn| turn.content.clone())
                .ok_or_else(|| CompletionError::new("empty conversation"))?;
            Ok(CompletionReply::Text { content: last })
        }
    }

    struct NoTools;

    #[async_trait::async_trait]
    impl ToolExecutor for NoTools {
        async fn execute(&self, invocation: &ToolInvocation) -> ToolOutcome {
            ToolOutcome::error(format!("unknown tool {}", invocation.capability_name))
        }
    }

    #[test]
    fn user_and_tool_turns_serialize_to_wire_shape() {
        let user = serde_json::to_value(Turn::user("hi")).expect("serialize user turn");
        assert_eq!(user, json!({"role": "user", "content": "hi"}));

        let tool = serde_json::to_value(Turn::tool_result("call_1", "done"))
            .expect("serialize tool turn");
        assert_eq!(
            tool,
            json!({"role": "tool", "content": "done", "tool_call_id": "call_1"})
        );
    }

    #[test]
    fn assistant_turn_serializes_tool_calls() {
        let turn = Turn::assistant_with_tool_calls(
            None,
            vec![ToolInvocation::new("call_1", "create_list", json!({"name": "groceries"}))],
        );
        let value = serde_json::to_value(&turn).expect("serialize assistant turn");

        assert_eq!(value["role"], "assistant");
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["id"], "call_1");
        assert_eq!(value["tool_calls"][0]["capability_name"], "create_list");
        assert_eq!(value["tool_calls"][0]["arguments"]["name"], "groceries");
        assert!(turn.has_tool_calls());
    }

    #[test]
    fn wire_shape_deserializes_without_optional_fields() {
        let turn: Turn =
            serde_json::from_value(json!({"role": "system", "content": "be brief"}))
                .expect("deserialize system turn");

        assert_eq!(turn, Turn::system("be brief"));
        assert_eq!(turn.role, Role::System);
        assert!(!turn.has_tool_calls());
    }

    #[test]
    fn reply_converts_into_assistant_turn() {
        let text = CompletionReply::Text {
            content: "hello".to_string(),
        }
        .into_turn();
        assert_eq!(text, Turn::assistant("hello"));

        let calls = CompletionReply::ToolCalls {
            content: Some("working".to_string()),
            invocations: vec![ToolInvocation::new("call_9", "navigate", json!({}))],
        }
        .into_turn();
        assert_eq!(calls.role, Role::Assistant);
        assert_eq!(calls.tool_calls.len(), 1);
    }

    #[test]
    fn completion_error_display_includes_status_when_present() {
        assert_eq!(CompletionError::new("boom").to_string(), "boom");
        let error = CompletionError::with_status(429, "rate limit exceeded");
        assert_eq!(error.status(), Some(429));
        assert_eq!(error.message(), "rate limit exceeded");
        assert_eq!(error.to_string(), "HTTP 429 rate limit exceeded");
    }

    #[tokio::test]
    async fn client_and_executor_contracts_are_object_safe() {
        let client: Box<dyn CompletionClient> = Box::new(EchoClient);
        let reply = client
            .complete(CompletionRequest {
                conversation_id: "c-1".to_string(),
                turns: vec![Turn::user("ping")],
                tools: Vec::new(),
            })
            .await
            .expect("echo should reply");
        assert_eq!(
            reply,
            CompletionReply::Text {
                content: "ping".to_string()
            }
        );

        let executor: Box<dyn ToolExecutor> = Box::new(NoTools);
        assert!(executor.tool_definitions().is_empty());
        let outcome = executor
            .execute(&ToolInvocation::new("call_1", "suspend_user", json!({})))
            .await;
        assert!(outcome.is_error);
    }
}
