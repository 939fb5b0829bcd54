//! Review stage: a reviewer-role verdict moves a run out of REVIEWING.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{EventRecord, event_kinds};
use crate::error::{EngineError, Result};
use crate::id::correlation_id;
use crate::llm::Agent;
use crate::prompt::{PromptRenderer, ReviewContext};
use crate::state::RunState;
use crate::store::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Comment,
    RequestChanges,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Comment => "comment",
            Verdict::RequestChanges => "request_changes",
        }
    }

    /// State the run moves to, if any
    pub fn target_state(&self) -> Option<RunState> {
        match self {
            Verdict::Approve => Some(RunState::Done),
            Verdict::RequestChanges => Some(RunState::NeedsFix),
            Verdict::Comment => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewReport {
    pub verdict: Verdict,
    pub summary: String,
}

impl ReviewReport {
    const UNPARSABLE: &'static str = "Reviewer output could not be parsed.";

    /// Parse the JSON object spanning the first `{` to the last `}`; anything
    /// unparsable is a plain comment.
    pub fn parse(output: &str) -> Self {
        let fallback = || ReviewReport {
            verdict: Verdict::Comment,
            summary: Self::UNPARSABLE.to_string(),
        };
        let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) else {
            return fallback();
        };
        if end <= start {
            return fallback();
        }
        let Ok(value) = serde_json::from_str::<Value>(&output[start..=end]) else {
            return fallback();
        };
        let verdict = value
            .get("verdict")
            .cloned()
            .and_then(|v| serde_json::from_value::<Verdict>(v).ok())
            .unwrap_or(Verdict::Comment);
        let summary = value
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        ReviewReport { verdict, summary }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Reviewed { report: ReviewReport, state: RunState },
    Skipped(String),
}

pub struct ReviewStage {
    store: Arc<dyn RunStore>,
    reviewer: Agent,
    renderer: PromptRenderer,
}

impl ReviewStage {
    pub fn new(store: Arc<dyn RunStore>, reviewer: Agent) -> Result<Self> {
        Ok(Self {
            store,
            reviewer,
            renderer: PromptRenderer::new()?,
        })
    }

    pub async fn review(&self, run_id: &str, pr_summary: &str) -> Result<ReviewOutcome> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        if run.state != RunState::Reviewing {
            return Ok(ReviewOutcome::Skipped(format!("run is {}", run.state)));
        }

        let plan = self
            .store
            .list_iterations(&run.id)?
            .last()
            .map(|it| it.plan.clone())
            .unwrap_or_default();
        let title = match run.issue_number {
            Some(n) => format!("{}#{}", run.repo_url, n),
            None => run.repo_url.clone(),
        };
        let prompt = self.renderer.review(&ReviewContext {
            title: &title,
            plan: &plan,
            summary: pr_summary,
        })?;
        self.store.add_log(&EventRecord::prompt(&run.id, "review", &prompt))?;

        let result = self
            .reviewer
            .run(&prompt, &correlation_id(&run.id, "review", 1), Some(&run.model))
            .await?;
        self.store
            .add_log(&EventRecord::model_output(&run.id, "review", &result.model, &result.content))?;

        let report = ReviewReport::parse(&result.content);
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::REVIEW,
            format!("review verdict: {}", report.verdict),
            json!({ "verdict": report.verdict.as_str(), "summary": report.summary }),
        ))?;

        let state = match report.verdict.target_state() {
            Some(target) => {
                self.store.transition_state(&run.id, RunState::Reviewing, target)?;
                self.store
                    .add_log(&EventRecord::transition(&run.id, RunState::Reviewing, target))?;
                log::info!("Run {}: REVIEWING -> {} ({})", run.id, target, report.verdict);
                target
            }
            None => RunState::Reviewing,
        };
        Ok(ReviewOutcome::Reviewed { report, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewIteration, Run};
    use crate::llm::{AgentRole, ScriptedModelClient};
    use crate::store::SqliteStore;

    #[test]
    fn test_parse_verdicts() {
        let report = ReviewReport::parse("Looks good.\n{\"verdict\": \"approve\", \"summary\": \"fine\"}");
        assert_eq!(report.verdict, Verdict::Approve);
        assert_eq!(report.summary, "fine");

        let report = ReviewReport::parse("{\"verdict\": \"request_changes\", \"summary\": \"tests missing\"}");
        assert_eq!(report.verdict, Verdict::RequestChanges);
    }

    #[test]
    fn test_parse_fallbacks() {
        assert_eq!(ReviewReport::parse("no json here").verdict, Verdict::Comment);
        assert_eq!(ReviewReport::parse("} backwards {").verdict, Verdict::Comment);
        assert_eq!(ReviewReport::parse("{not json}").summary, ReviewReport::UNPARSABLE);
        assert_eq!(ReviewReport::parse("{\"verdict\": \"maybe\"}").verdict, Verdict::Comment);
    }

    fn reviewing_run(store: &SqliteStore) -> Run {
        let run = Run::new("https://github.com/acme/widgets", Some(3), "m/x", 5);
        store.create_run(&run).unwrap();
        for (from, to) in [
            (RunState::New, RunState::Planned),
            (RunState::Planned, RunState::Coding),
            (RunState::Coding, RunState::PrOpened),
            (RunState::PrOpened, RunState::CiRunning),
            (RunState::CiRunning, RunState::Reviewing),
        ] {
            store.transition_state(&run.id, from, to).unwrap();
        }
        store
            .add_iteration(NewIteration {
                run_id: run.id.clone(),
                plan: "1. add /health".to_string(),
                patch_hash: "h".to_string(),
                branch: run.branch_name(1),
                pr_url: None,
            })
            .unwrap();
        run
    }

    async fn review_with(output: &str) -> (Arc<SqliteStore>, Run, ReviewOutcome, Arc<ScriptedModelClient>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let run = reviewing_run(&store);
        let client = Arc::new(ScriptedModelClient::new([output]));
        let stage = ReviewStage::new(store.clone(), Agent::new(AgentRole::Reviewer, client.clone())).unwrap();
        let outcome = stage.review(&run.id, "PR #9 adds /health").await.unwrap();
        (store, run, outcome, client)
    }

    #[tokio::test]
    async fn test_approve_moves_to_done() {
        let (store, run, outcome, client) = review_with("{\"verdict\": \"approve\", \"summary\": \"ok\"}").await;
        assert!(matches!(outcome, ReviewOutcome::Reviewed { state: RunState::Done, .. }));
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().state, RunState::Done);
        let prompt = &client.requests()[0].prompt;
        assert!(prompt.contains("1. add /health"));
        assert!(prompt.contains("PR #9 adds /health"));
    }

    #[tokio::test]
    async fn test_request_changes_moves_to_needs_fix() {
        let (store, run, _, _) = review_with("{\"verdict\": \"request_changes\", \"summary\": \"no\"}").await;
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().state, RunState::NeedsFix);
        let reviews: Vec<_> = store
            .list_logs(&run.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == event_kinds::REVIEW)
            .collect();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].payload["verdict"], "request_changes");
    }

    #[tokio::test]
    async fn test_comment_stays_reviewing() {
        let (store, run, outcome, _) = review_with("garbage").await;
        assert!(matches!(outcome, ReviewOutcome::Reviewed { state: RunState::Reviewing, .. }));
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().state, RunState::Reviewing);
    }

    #[tokio::test]
    async fn test_skips_runs_not_reviewing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let run = Run::new("a/b", Some(1), "m", 5);
        store.create_run(&run).unwrap();
        let client = Arc::new(ScriptedModelClient::new(["unused"]));
        let stage = ReviewStage::new(store.clone(), Agent::new(AgentRole::Reviewer, client.clone())).unwrap();
        let outcome = stage.review(&run.id, "x").await.unwrap();
        assert_eq!(outcome, ReviewOutcome::Skipped("run is NEW".to_string()));
        assert_eq!(client.call_count(), 0);
    }
}
