//! OpenRouter chat-completions client
//!
//! Implements [`ModelClient`] over an [`HttpTransport`] so the retry loop can be
//! exercised against scripted replies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::{ModelConfig, RetryConfig};
use crate::llm::client::{LlmError, ModelClient};
use crate::llm::retry::RetryPolicy;
use crate::llm::types::{CompletionRequest, HttpReply, ModelResponse};

/// Header carrying the correlation id
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Minimal JSON POST abstraction
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<HttpReply, LlmError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Setup(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<HttpReply, LlmError> {
        let mut builder = self.client.post(url).json(body);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(HttpReply::new(status, text))
    }
}

pub struct OpenRouterClient<T: HttpTransport = ReqwestTransport> {
    transport: T,
    api_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl OpenRouterClient<ReqwestTransport> {
    /// Build from config. A missing API key surfaces on the first call.
    pub fn from_config(model: &ModelConfig, retry: &RetryConfig) -> Result<Self, LlmError> {
        let transport = ReqwestTransport::new(Duration::from_millis(model.timeout_ms))?;
        Ok(Self::with_transport(transport, model, RetryPolicy::from_config(retry)))
    }
}

impl<T: HttpTransport> OpenRouterClient<T> {
    pub fn with_transport(transport: T, model: &ModelConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            api_url: model.api_url.clone(),
            api_key: model.api_key.clone(),
            model: model.name.clone(),
            retry,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn build_request(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_ref().unwrap_or(&self.model);
        json!({
            "model": model,
            "messages": [{"role": "user", "content": request.prompt}],
        })
    }

    fn build_headers(&self, request: &CompletionRequest) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
            ("Content-Type".to_string(), "application/json".to_string()),
            (REQUEST_ID_HEADER.to_string(), request.correlation_id.clone()),
        ]
    }

    fn parse_response(&self, reply: HttpReply, requested_model: &str) -> Result<ModelResponse, LlmError> {
        if !reply.is_success() {
            return Err(LlmError::Api {
                status: reply.status,
                message: reply.body,
            });
        }
        let body: Value = serde_json::from_str(&reply.body)
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".to_string()))?;
        let model = body["model"].as_str().unwrap_or(requested_model);
        Ok(ModelResponse::new(content, model))
    }
}

#[async_trait]
impl<T: HttpTransport> ModelClient for OpenRouterClient<T> {
    async fn complete(&self, request: CompletionRequest) -> Result<ModelResponse, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let body = self.build_request(&request);
        let headers = self.build_headers(&request);
        let requested_model = request.model.as_deref().unwrap_or(&self.model);
        let correlation_id = request.correlation_id.as_str();
        let body = &body;
        let headers = headers.as_slice();

        self.retry
            .run(|attempt| {
                async move {
                    log::debug!(
                        "POST {} model={} request_id={} attempt={}",
                        self.api_url,
                        requested_model,
                        correlation_id,
                        attempt
                    );
                    let reply = self.transport.post_json(&self.api_url, headers, body).await?;
                    self.parse_response(reply, requested_model)
                }
            })
            .await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

impl<T: HttpTransport> std::fmt::Debug for OpenRouterClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .finish()
    }
}
