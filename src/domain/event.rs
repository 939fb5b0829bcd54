//! Append-only audit log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::id::{generate_event_id, now_utc};
use crate::state::RunState;

/// Event kind constants
pub mod event_kinds {
    pub const RUN_CREATED: &str = "run_created";
    pub const STATE_TRANSITION: &str = "state_transition";
    pub const PROMPT: &str = "prompt";
    pub const MODEL_OUTPUT: &str = "model_output";
    pub const PATCH_INVALID: &str = "patch_invalid";
    pub const PATCH_ACCEPTED: &str = "patch_accepted";
    pub const GUARDRAIL: &str = "guardrail";
    pub const APPLY_FAILED: &str = "apply_failed";
    pub const FAILURE: &str = "failure";
    pub const CI_SUMMARY: &str = "ci_summary";
    pub const PULL_REQUEST: &str = "pull_request";
    pub const ITERATION_CREATED: &str = "iteration_created";
    pub const LOCK_CONTENDED: &str = "lock_contended";
    pub const RETRY_REQUESTED: &str = "retry_requested";
    pub const REVIEW: &str = "review";
    pub const WORKDIR_KEPT: &str = "workdir_kept";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub run_id: String,
    /// Human-readable line
    pub message: String,
    /// One of [`event_kinds`]
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(run_id: &str, kind: &str, message: impl Into<String>, payload: Value) -> Self {
        Self {
            id: generate_event_id(),
            run_id: run_id.to_string(),
            message: message.into(),
            kind: kind.to_string(),
            payload,
            created_at: now_utc(),
        }
    }

    pub fn transition(run_id: &str, from: RunState, to: RunState) -> Self {
        Self::new(
            run_id,
            event_kinds::STATE_TRANSITION,
            format!("{} -> {}", from, to),
            json!({ "from": from.as_str(), "to": to.as_str() }),
        )
    }

    pub fn prompt(run_id: &str, stage: &str, prompt: &str) -> Self {
        Self::new(
            run_id,
            event_kinds::PROMPT,
            format!("{} prompt", stage),
            json!({ "stage": stage, "prompt": prompt }),
        )
    }

    pub fn model_output(run_id: &str, stage: &str, model: &str, content: &str) -> Self {
        Self::new(
            run_id,
            event_kinds::MODEL_OUTPUT,
            format!("{} output from {}", stage, model),
            json!({ "stage": stage, "model": model, "content": content }),
        )
    }

    /// Failure entry; `reason` is the message verbatim
    pub fn failure(run_id: &str, code: &str, reason: &str, detail: Value) -> Self {
        Self::new(
            run_id,
            event_kinds::FAILURE,
            reason,
            json!({ "code": code, "reason": reason, "detail": detail }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_new() {
        let event = EventRecord::new("run-1", event_kinds::CI_SUMMARY, "ci pending", Value::Null);
        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.run_id, "run-1");
        assert_eq!(event.kind, "ci_summary");
        assert_eq!(event.message, "ci pending");
    }

    #[test]
    fn test_transition_event() {
        let event = EventRecord::transition("run-1", RunState::New, RunState::Planned);
        assert_eq!(event.kind, event_kinds::STATE_TRANSITION);
        assert_eq!(event.message, "NEW -> PLANNED");
        assert_eq!(event.payload["from"], "NEW");
        assert_eq!(event.payload["to"], "PLANNED");
    }

    #[test]
    fn test_failure_event_keeps_reason_verbatim() {
        let event = EventRecord::failure("run-1", "apply_failed", "failed to apply diff", json!({"check": "x"}));
        assert_eq!(event.message, "failed to apply diff");
        assert_eq!(event.payload["code"], "apply_failed");
        assert_eq!(event.payload["detail"]["check"], "x");
    }

    #[test]
    fn test_prompt_and_output() {
        let prompt = EventRecord::prompt("r", "plan", "do it");
        assert_eq!(prompt.payload["prompt"], "do it");
        let output = EventRecord::model_output("r", "patch", "m/x", "diff");
        assert_eq!(output.kind, event_kinds::MODEL_OUTPUT);
        assert_eq!(output.payload["model"], "m/x");
    }
}
