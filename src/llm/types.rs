//! LLM request/response types
//!
//! The engine only ever sends single-turn prompts, so a request is a prompt
//! plus routing metadata.

use serde::{Deserialize, Serialize};

/// Request for one completion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Sent as `X-Request-Id` for tracing
    pub correlation_id: String,
    /// Overrides the client's default model when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            correlation_id: correlation_id.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.model = if model.is_empty() { None } else { Some(model) };
        self
    }
}

/// Completion text and the model that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

impl ModelResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
        }
    }
}

/// Raw HTTP reply as seen by the retry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
