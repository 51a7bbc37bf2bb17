//! Transport-only client primitives for OpenAI-style chat-completions endpoints.
//!
//! This crate owns request building, response parsing, and error-body
//! normalization only. Retry, timeout policy, and conversation integrity are
//! the caller's concern.

pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod payload;
pub mod url;

pub use client::ChatApiClient;
pub use config::ChatApiConfig;
pub use error::ChatApiError;
pub use reqwest::StatusCode;
pub use payload::{
    ChatChoice, ChatFunctionCall, ChatFunctionDefinition, ChatMessage, ChatRequest,
    ChatResponse, ChatTool, ChatToolCall,
};
pub use url::normalize_chat_completions_url;
