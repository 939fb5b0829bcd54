//! Core model client trait and error type

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::types::{CompletionRequest, ModelResponse};

/// Stateless model client - each call is independent (fresh context)
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Single completion request, retried per the client's retry policy
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse, LlmError>;

    /// Default model identifier
    fn model(&self) -> &str;
}

/// Errors that can occur during model calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlmError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl LlmError {
    /// HTTP statuses worth another attempt
    pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Api { status, .. } => Self::RETRYABLE_STATUSES.contains(status),
            LlmError::Network(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::MissingApiKey => false,
            LlmError::Setup(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

/// Model client that replays canned outputs in order; records every request.
///
/// Used by tests and dry runs. Once the script is exhausted every call fails
/// with `InvalidResponse`.
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModelClient {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(outputs.into_iter().map(|s| Ok(s.into())))
    }

    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse, LlmError> {
        let model = request.model.clone().unwrap_or_else(|| self.model().to_string());
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .script
            .lock()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(ModelResponse::new(content, model)),
            Some(Err(err)) => Err(err),
            None => Err(LlmError::InvalidResponse("script exhausted".to_string())),
        }
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}
