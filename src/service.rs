//! Run creation, retry requests and run reports.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::domain::{EventRecord, Iteration, Run, event_kinds};
use crate::error::{EngineError, Result};
use crate::queue::WorkQueue;
use crate::state::RunState;
use crate::store::RunStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub repo_url: String,
    pub issue_number: Option<i64>,
    /// Falls back to `model.name`
    pub model: Option<String>,
    /// Falls back to `runs.max_iterations`
    pub max_iterations: Option<u32>,
}

/// Everything recorded about one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub iterations: Vec<Iteration>,
    pub events: Vec<EventRecord>,
}

pub struct RunService {
    config: Arc<Config>,
    store: Arc<dyn RunStore>,
    queue: WorkQueue,
}

impl RunService {
    pub fn new(config: Arc<Config>, store: Arc<dyn RunStore>, queue: WorkQueue) -> Self {
        Self { config, store, queue }
    }

    /// Store a NEW run and enqueue it
    pub fn create_run(&self, request: CreateRunRequest) -> Result<Run> {
        let model = request
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.config.model.name.clone());
        let max_iterations = request.max_iterations.unwrap_or(self.config.runs.max_iterations);
        let run = Run::new(request.repo_url, request.issue_number, model, max_iterations);

        self.store.create_run(&run)?;
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::RUN_CREATED,
            "run created",
            json!({
                "repo_url": run.repo_url,
                "issue_number": run.issue_number,
                "model": run.model,
                "max_iterations": run.max_iterations,
            }),
        ))?;
        log::info!("Created run {} for {} #{:?}", run.id, run.repo_url, run.issue_number);
        self.queue.enqueue(&run.id)?;
        Ok(run)
    }

    /// Send the latest run for an issue back to NEEDS_FIX and enqueue it
    pub fn retry_issue(&self, repo_url: &str, issue_number: i64) -> Result<Run> {
        let mut run = self
            .store
            .latest_run_for_issue(repo_url, issue_number)?
            .ok_or_else(|| EngineError::RunNotFound(format!("{}#{}", repo_url, issue_number)))?;

        let from = run.state;
        self.store.transition_state(&run.id, from, RunState::NeedsFix)?;
        self.store
            .add_log(&EventRecord::transition(&run.id, from, RunState::NeedsFix))?;
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::RETRY_REQUESTED,
            "retry requested",
            json!({ "repo_url": repo_url, "issue_number": issue_number, "from": from.as_str() }),
        ))?;
        run.state = RunState::NeedsFix;
        log::info!("Run {} sent back for a fix from {}", run.id, from);
        self.queue.enqueue(&run.id)?;
        Ok(run)
    }

    pub fn report(&self, run_id: &str) -> Result<RunReport> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        Ok(RunReport {
            iterations: self.store.list_iterations(&run.id)?,
            events: self.store.list_logs(&run.id)?,
            run,
        })
    }

    /// Enqueue every run that can make progress (NEW or NEEDS_FIX)
    pub fn enqueue_pending(&self) -> Result<usize> {
        let mut count = 0;
        for run in self.store.list_runs()? {
            if matches!(run.state, RunState::New | RunState::NeedsFix) {
                self.queue.enqueue(&run.id)?;
                count += 1;
            }
        }
        Ok(count)
    }
}
