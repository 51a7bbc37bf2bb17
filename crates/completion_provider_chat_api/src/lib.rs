//! Chat-completions backed implementation of the `completion_provider` contract.
//!
//! This adapter only translates between conversation turns and the wire
//! payloads of `chat_api`. It never retries; recovery lives above it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_api::{
    ChatApiClient, ChatApiConfig, ChatApiError, ChatFunctionCall, ChatMessage, ChatRequest,
    ChatResponse, ChatTool, ChatToolCall,
};
use completion_provider::{
    CompletionClient, CompletionError, CompletionReply, CompletionRequest, ProviderProfile,
    ToolDefinition, ToolInvocation, Turn,
};
use serde_json::Value;

/// Stable provider identifier used for explicit startup selection.
pub const CHAT_API_PROVIDER_ID: &str = "chat-api";

const DEFAULT_MODEL_ID: &str = "gpt-4o-mini";

/// Runtime configuration for the chat-completions provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatApiProviderConfig {
    pub api_key: String,
    pub model_id: String,
    pub base_url: Option<String>,
    pub organization: Option<String>,
    pub temperature: Option<f64>,
    pub timeout: Option<Duration>,
}

impl ChatApiProviderConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: None,
            organization: None,
            temperature: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_chat_api_config(self) -> ChatApiConfig {
        let mut config = ChatApiConfig::new(self.api_key);

        if let Some(base_url) = self.base_url {
            config = config.with_base_url(base_url);
        }

        if let Some(organization) = self.organization {
            config = config.with_organization(organization);
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        config
    }
}

#[async_trait]
trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatApiError>;
}

#[async_trait]
impl ChatTransport for ChatApiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatApiError> {
        ChatApiClient::complete(self, request).await
    }
}

/// `CompletionClient` adapter backed by `chat_api` transport primitives.
pub struct ChatApiProvider {
    model_id: String,
    temperature: Option<f64>,
    transport: Arc<dyn ChatTransport>,
}

impl ChatApiProvider {
    /// Creates a provider using real HTTP transport.
    pub fn new(config: ChatApiProviderConfig) -> Result<Self, ChatApiError> {
        let model_id = sanitize_model_id(&config.model_id);
        let temperature = config.temperature;
        let transport = Arc::new(ChatApiClient::new(config.into_chat_api_config())?);

        Ok(Self {
            model_id,
            temperature,
            transport,
        })
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        let messages = request.turns.iter().map(turn_to_message).collect();
        let tools = request.tools.iter().map(definition_to_tool).collect();
        let mut chat = ChatRequest::new(self.model_id.clone(), messages).with_tools(tools);
        chat.temperature = self.temperature;
        chat
    }

    #[cfg(test)]
    fn with_transport_for_tests(model_id: &str, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            model_id: sanitize_model_id(model_id),
            temperature: None,
            transport,
        }
    }
}

#[async_trait]
impl CompletionClient for ChatApiProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: CHAT_API_PROVIDER_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionReply, CompletionError> {
        let chat = self.build_request(&request);
        tracing::debug!(
            conversation_id = %request.conversation_id,
            messages = chat.messages.len(),
            tools = chat.tools.len(),
            "sending chat completion"
        );

        let response = self
            .transport
            .complete(&chat)
            .await
            .map_err(map_transport_error)?;
        response_to_reply(response)
    }
}

fn turn_to_message(turn: &Turn) -> ChatMessage {
    ChatMessage {
        role: turn.role.as_str().to_string(),
        content: turn.content.clone(),
        tool_calls: turn.tool_calls.iter().map(invocation_to_call).collect(),
        tool_call_id: turn.tool_call_id.clone(),
    }
}

fn invocation_to_call(invocation: &ToolInvocation) -> ChatToolCall {
    let arguments = match &invocation.arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };

    ChatToolCall {
        id: invocation.id.clone(),
        kind: "function".to_string(),
        function: ChatFunctionCall {
            name: invocation.capability_name.clone(),
            arguments,
        },
    }
}

fn definition_to_tool(definition: &ToolDefinition) -> ChatTool {
    ChatTool::function(
        definition.name.clone(),
        definition.description.clone(),
        definition.input_schema.clone(),
    )
}

fn response_to_reply(response: ChatResponse) -> Result<CompletionReply, CompletionError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(CompletionError::new("response contained no choices"));
    };
    let message = choice.message;

    if message.tool_calls.is_empty() {
        return Ok(CompletionReply::Text {
            content: message.content.unwrap_or_default(),
        });
    }

    let invocations = message
        .tool_calls
        .into_iter()
        .map(|call| {
            // Unparseable arguments are kept verbatim so the executor can report them.
            let arguments = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments));
            ToolInvocation::new(call.id, call.function.name, arguments)
        })
        .collect();

    Ok(CompletionReply::ToolCalls {
        content: message.content.filter(|content| !content.is_empty()),
        invocations,
    })
}

fn map_transport_error(error: ChatApiError) -> CompletionError {
    match &error {
        ChatApiError::Status(status, message) => {
            CompletionError::with_status(status.as_u16(), message.clone())
        }
        _ => match error.status() {
            Some(status) => CompletionError::with_status(status.as_u16(), error.to_string()),
            None => CompletionError::new(error.to_string()),
        },
    }
}

fn sanitize_model_id(model_id: &str) -> String {
    let trimmed = model_id.trim();
    if trimmed.is_empty() {
        DEFAULT_MODEL_ID.to_string()
    } else {
        trimmed.to_string()
    }
}
