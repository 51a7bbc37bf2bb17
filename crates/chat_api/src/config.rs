use std::time::Duration;

use crate::url::DEFAULT_CHAT_BASE_URL;

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
///
/// Model and sampling options travel in each [`crate::ChatRequest`]; this
/// only covers where requests go and how they authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatApiConfig {
    pub api_key: String,
    /// Endpoint root; `/chat/completions` is appended when missing.
    pub base_url: String,
    /// Sent as `OpenAI-Organization` when set.
    pub organization: Option<String>,
    /// Whole-request deadline enforced by the HTTP client.
    pub timeout: Option<Duration>,
}

impl ChatApiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            organization: None,
            timeout: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
