//! Role-based agents over a shared model client
//!
//! Each role prepends its own instruction preamble and may route to a
//! different model via `model.role_models`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::llm::client::{LlmError, ModelClient};
use crate::llm::types::CompletionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Patcher,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Patcher => "patcher",
            AgentRole::Reviewer => "reviewer",
        }
    }

    pub fn preamble(&self) -> &'static str {
        match self {
            AgentRole::Planner => {
                "You are a senior engineer planning a minimal change to resolve a tracked issue. \
                 Reply with a short numbered plan naming the files to touch."
            }
            AgentRole::Patcher => {
                "You are a careful engineer writing a patch. \
                 Reply with a single unified diff in git format and nothing else."
            }
            AgentRole::Reviewer => {
                "You are a code reviewer. Summarize the change, then end with one JSON object \
                 {\"verdict\": \"approve\" | \"comment\" | \"request_changes\", \"summary\": \"...\"}."
            }
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of one agent call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult {
    pub content: String,
    pub role: AgentRole,
    pub model: String,
}

#[derive(Clone)]
pub struct Agent {
    role: AgentRole,
    client: Arc<dyn ModelClient>,
    model: Option<String>,
}

impl Agent {
    pub fn new(role: AgentRole, client: Arc<dyn ModelClient>) -> Self {
        Self {
            role,
            client,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Full prompt sent to the model
    pub fn render(&self, prompt: &str) -> String {
        format!("{}\n\n{}", self.role.preamble(), prompt)
    }

    /// Call the model. `run_model` is the run's own model and applies when no
    /// role override is configured.
    pub async fn run(&self, prompt: &str, correlation_id: &str, run_model: Option<&str>) -> Result<AgentResult, LlmError> {
        let mut request = CompletionRequest::new(self.render(prompt), correlation_id);
        if let Some(model) = self.model.as_deref().or(run_model) {
            request = request.with_model(model);
        }
        log::debug!(
            "{} agent call {} ({} prompt bytes)",
            self.role,
            correlation_id,
            request.prompt.len()
        );
        let response = self.client.complete(request).await?;
        Ok(AgentResult {
            content: response.content,
            role: self.role,
            model: response.model,
        })
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("role", &self.role)
            .field("client_model", &self.client.model())
            .field("model", &self.model)
            .finish()
    }
}

/// One agent per role
#[derive(Debug, Clone)]
pub struct AgentRoster {
    pub planner: Agent,
    pub patcher: Agent,
    pub reviewer: Agent,
}

impl AgentRoster {
    /// Every role on the same client, no overrides
    pub fn uniform(client: Arc<dyn ModelClient>) -> Self {
        Self::with_overrides(client, &HashMap::new())
    }

    pub fn from_config(client: Arc<dyn ModelClient>, config: &ModelConfig) -> Self {
        Self::with_overrides(client, &config.role_models)
    }

    fn with_overrides(client: Arc<dyn ModelClient>, overrides: &HashMap<String, String>) -> Self {
        let agent = |role: AgentRole| {
            Agent::new(role, Arc::clone(&client)).with_model(overrides.get(role.as_str()).cloned())
        };
        Self {
            planner: agent(AgentRole::Planner),
            patcher: agent(AgentRole::Patcher),
            reviewer: agent(AgentRole::Reviewer),
        }
    }
}
