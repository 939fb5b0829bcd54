//! Model client layer - OpenRouter chat completions with retry and role agents
//!
//! This module provides:
//! - Request/response types
//! - ModelClient trait for API abstraction
//! - OpenRouterClient implementation over a pluggable HTTP transport
//! - RetryPolicy with exponential backoff and jitter
//! - Role-based agents (planner, patcher, reviewer)

pub mod agents;
pub mod client;
pub mod openrouter;
pub mod retry;
pub mod types;

pub use agents::{Agent, AgentResult, AgentRole, AgentRoster};
pub use client::{LlmError, ModelClient, ScriptedModelClient};
pub use openrouter::{HttpTransport, OpenRouterClient, REQUEST_ID_HEADER, ReqwestTransport};
pub use retry::RetryPolicy;
pub use types::{CompletionRequest, HttpReply, ModelResponse};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _role = AgentRole::Patcher;
        let _request = CompletionRequest::new("p", "c");
        let _policy = RetryPolicy::immediate(1);
    }
}
