//! Iteration record: one accepted, applied patch within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{generate_iteration_id, now_utc};

pub const PENDING: &str = "pending";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub run_id: String,
    /// 1-based, assigned by the store
    pub index: u32,
    pub plan: String,
    pub patch_hash: String,
    pub branch: String,
    pub pr_url: Option<String>,
    pub ci_summary: String,
    pub reviewer_verdict: String,
    pub created_at: DateTime<Utc>,
}

/// Fields the executor supplies; the store assigns id and index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIteration {
    pub run_id: String,
    pub plan: String,
    pub patch_hash: String,
    pub branch: String,
    pub pr_url: Option<String>,
}

impl NewIteration {
    pub fn into_iteration(self, index: u32) -> Iteration {
        Iteration {
            id: generate_iteration_id(),
            run_id: self.run_id,
            index,
            plan: self.plan,
            patch_hash: self.patch_hash,
            branch: self.branch,
            pr_url: self.pr_url,
            ci_summary: PENDING.to_string(),
            reviewer_verdict: PENDING.to_string(),
            created_at: now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_iteration_defaults_pending() {
        let it = NewIteration {
            run_id: "r".to_string(),
            plan: "p".to_string(),
            patch_hash: "h".to_string(),
            branch: "b".to_string(),
            pr_url: None,
        }
        .into_iteration(2);
        assert_eq!(it.index, 2);
        assert_eq!(it.ci_summary, PENDING);
        assert_eq!(it.reviewer_verdict, PENDING);
        assert!(it.id.starts_with("it-"));
    }
}
