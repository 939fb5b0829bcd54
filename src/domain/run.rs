//! Run record: one end-to-end attempt at resolving an issue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{generate_run_id, now_utc, run_prefix};
use crate::state::RunState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub repo_url: String,
    pub issue_number: Option<i64>,
    pub state: RunState,
    pub model: String,
    pub max_iterations: u32,
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// A fresh run in NEW
    pub fn new(repo_url: impl Into<String>, issue_number: Option<i64>, model: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            id: generate_run_id(),
            repo_url: repo_url.into(),
            issue_number,
            state: RunState::New,
            model: model.into(),
            max_iterations,
            created_at: now_utc(),
        }
    }

    /// Working branch for the given 1-based iteration
    pub fn branch_name(&self, iteration: u32) -> String {
        format!("agent/run-{}-it{}", run_prefix(&self.id), iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run() {
        let run = Run::new("https://github.com/a/b", Some(3), "m/x", 5);
        assert_eq!(run.state, RunState::New);
        assert_eq!(run.id.len(), 32);
        assert_eq!(run.max_iterations, 5);
    }

    #[test]
    fn test_branch_name() {
        let mut run = Run::new("a/b", Some(1), "m", 5);
        run.id = "0123456789abcdef0123456789abcdef".to_string();
        assert_eq!(run.branch_name(1), "agent/run-01234567-it1");
        assert_eq!(run.branch_name(2), "agent/run-01234567-it2");
    }

    #[test]
    fn test_serialization_uses_state_names() {
        let run = Run::new("a/b", None, "m", 1);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["state"], "NEW");
        assert!(json["issue_number"].is_null());
    }
}
