//! RunExecutor drives one run from NEW (or NEEDS_FIX) to REVIEWING or FAILED.
//!
//! Every state change goes through the store's compare-and-set and is logged
//! before the next stage starts. Stage failures of any kind (guardrails, bad
//! model output, git, remote API) end in CODING -> FAILED with a typed reason.
//! Store and configuration errors escape `process`, after a best-effort move
//! of the run to FAILED so it is not left mid-stage.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tempfile::TempDir;

use crate::config::Config;
use crate::domain::{EventRecord, Iteration, NewIteration, Run, event_kinds};
use crate::error::{EngineError, FailureReason, Result, StageError};
use crate::github::{NewPullRequest, RepositoryApi, parse_repo_locator};
use crate::guardrails::GuardrailEngine;
use crate::id::run_prefix;
use crate::llm::{AgentRoster, ModelClient};
use crate::pipeline::{PatchPipeline, collect_context};
use crate::state::RunState;
use crate::store::{IssueLock, RunStore};
use crate::vcs::{GitError, GitOutput, VersionControl};

/// What `process` did with a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A PR is open and the run waits for review
    Reviewing { iteration: Iteration },
    Failed(FailureReason),
    /// Nothing was done; the string says why
    Skipped(String),
}

pub struct RunExecutor {
    config: Arc<Config>,
    repo_api: Arc<dyn RepositoryApi>,
    vcs: Arc<dyn VersionControl>,
    store: Arc<dyn RunStore>,
    pipeline: PatchPipeline,
    guardrails: GuardrailEngine,
}

impl RunExecutor {
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn ModelClient>,
        repo_api: Arc<dyn RepositoryApi>,
        vcs: Arc<dyn VersionControl>,
        store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        let roster = AgentRoster::from_config(client, &config.model);
        let pipeline = PatchPipeline::new(config.pipeline.clone(), roster.planner, roster.patcher)?;
        let guardrails = GuardrailEngine::new(config.guardrails.clone());
        Ok(Self {
            config,
            repo_api,
            vcs,
            store,
            pipeline,
            guardrails,
        })
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Process one run. Runs outside NEW/NEEDS_FIX, and runs whose issue is
    /// locked by another worker (even one on this same run), are skipped
    /// without touching their state.
    pub async fn process(&self, run_id: &str) -> Result<RunOutcome> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if !matches!(run.state, RunState::New | RunState::NeedsFix) {
            log::info!("Skipping run {} in state {}", run.id, run.state);
            return Ok(RunOutcome::Skipped(format!("run is {}", run.state)));
        }

        let lock = run.issue_number.map(|n| IssueLock::new(&run.repo_url, n, &run.id));
        if let Some(lock) = &lock
            && !self.store.try_lock_issue(lock)?
        {
            log::warn!(
                "Run {}: issue {}#{} is locked by another worker",
                run.id,
                lock.repo_url,
                lock.issue_number
            );
            self.store.add_log(&EventRecord::new(
                &run.id,
                event_kinds::LOCK_CONTENDED,
                "issue is being processed by another worker",
                json!({ "repo_url": lock.repo_url, "issue_number": lock.issue_number }),
            ))?;
            return Ok(RunOutcome::Skipped("issue locked by another worker".to_string()));
        }

        let outcome = self.drive(run.clone()).await;

        if let Some(lock) = &lock
            && let Err(e) = self.store.release_issue_lock(lock)
        {
            log::error!("Run {}: failed to release issue lock: {}", run.id, e);
        }
        outcome
    }

    async fn drive(&self, run: Run) -> Result<RunOutcome> {
        log::info!("Processing run {} ({}) from {}", run.id, run.repo_url, run.state);
        let iterations = self.store.list_iterations(&run.id)?;

        // Until this first compare-and-set succeeds the run may belong to someone else
        let claim = if run.state == RunState::New {
            RunState::Planned
        } else {
            RunState::Coding
        };
        self.transition(&run.id, run.state, claim)?;

        match self.stages(&run, &iterations).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.abort(&run.id, &e);
                Err(e)
            }
        }
    }

    async fn stages(&self, run: &Run, iterations: &[Iteration]) -> Result<RunOutcome> {
        if run.state == RunState::New {
            self.transition(&run.id, RunState::Planned, RunState::Coding)?;
        }

        let mut workdir = None;
        let mut detail = Value::Null;
        let result = self.code(run, iterations, &mut workdir, &mut detail).await;
        self.release_workdir(run, workdir)?;

        match result {
            Ok(iteration) => {
                log::info!("Run {} is REVIEWING with iteration {}", run.id, iteration.index);
                Ok(RunOutcome::Reviewing { iteration })
            }
            Err(StageError::Failed(reason)) => {
                self.fail(run, &reason, detail)?;
                Ok(RunOutcome::Failed(reason))
            }
            Err(StageError::Engine(e)) => Err(e),
        }
    }

    /// Move a run hit by an engine error to FAILED from wherever it stopped.
    /// Errors here are only logged; the original error is what the caller sees.
    fn abort(&self, run_id: &str, error: &EngineError) {
        log::error!("Run {} aborted: {}", run_id, error);
        let current = match self.store.get_run(run_id) {
            Ok(Some(run)) => run.state,
            Ok(None) => return,
            Err(e) => {
                log::error!("Run {}: cannot read state after abort: {}", run_id, e);
                return;
            }
        };
        if !current.can_transition_to(RunState::Failed) {
            return;
        }
        let reason = FailureReason::Internal(error.to_string());
        let recorded = self.transition(run_id, current, RunState::Failed).and_then(|()| {
            self.store.add_log(&EventRecord::failure(
                run_id,
                reason.code(),
                &reason.to_string(),
                json!({ "from": current.as_str() }),
            ))
        });
        if let Err(e) = recorded {
            log::error!("Run {}: failed to record abort: {}", run_id, e);
        }
    }

    /// Everything that happens in CODING. On success the run has been moved
    /// on to REVIEWING.
    async fn code(
        &self,
        run: &Run,
        iterations: &[Iteration],
        workdir: &mut Option<TempDir>,
        detail: &mut Value,
    ) -> std::result::Result<Iteration, StageError> {
        if iterations.len() as u32 >= run.max_iterations {
            return Err(FailureReason::IterationBudgetExhausted(run.max_iterations).into());
        }
        let (owner, name, issue_number) = self.check_preconditions(run)?;
        let previous_hash = iterations.last().map(|it| it.patch_hash.clone());
        let iteration_number = iterations.len() as u32 + 1;

        let issue = self.repo_api.get_issue(&owner, &name, issue_number).await?;
        let repo_info = self.repo_api.get_repo(&owner, &name).await?;
        let plan = self.pipeline.plan(self.store.as_ref(), run, &issue).await?;

        let dir = self.make_workdir(run)?;
        let checkout = dir.path().join("repo");
        *workdir = Some(dir);

        let url = run.repo_url.clone();
        let dest = checkout.clone();
        if let Err(e) = self.blocking(move |vcs| vcs.clone_shallow(&url, &dest)).await {
            *detail = json!({ "error": e.to_string() });
            return Err(FailureReason::CloneFailed.into());
        }
        if !checkout.join(".git").exists() {
            return Err(FailureReason::CloneFailed.into());
        }

        let branch = run.branch_name(iteration_number);
        let (path, name_) = (checkout.clone(), branch.clone());
        self.blocking(move |vcs| vcs.create_branch(&path, &name_)).await?;

        let config = self.pipeline.config().clone();
        let (path, issue_) = (checkout.clone(), issue.clone());
        let context = self
            .blocking(move |vcs| collect_context(&config, vcs, &path, &issue_))
            .await?;

        let patch = self
            .pipeline
            .generate_patch(self.store.as_ref(), run, &plan, &context)
            .await?;

        let report = self.guardrails.evaluate(&patch.diff, previous_hash.as_deref());
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::GUARDRAIL,
            report.summary(),
            json!({ "ok": report.ok(), "failures": report.failures(), "hash": patch.hash }),
        ))?;
        if !report.ok() {
            return Err(FailureReason::Guardrail(report.failures()).into());
        }

        let applied = self.apply(&checkout, &patch.diff, false).await?;
        if !applied.success {
            let check = self.apply(&checkout, &patch.diff, true).await?;
            *detail = json!({ "apply_stderr": applied.stderr, "check_stderr": check.stderr });
            self.store.add_log(&EventRecord::new(
                &run.id,
                event_kinds::APPLY_FAILED,
                "git apply rejected the patch",
                detail.clone(),
            ))?;
            return Err(FailureReason::ApplyFailed.into());
        }

        let message = format!("Resolve #{}: {}", issue.number, issue.title);
        let path = checkout.clone();
        self.blocking(move |vcs| vcs.commit_all(&path, &message)).await?;
        let (path, branch_) = (checkout.clone(), branch.clone());
        self.blocking(move |vcs| vcs.push(&path, &branch_)).await?;

        let pr = self
            .repo_api
            .create_pull_request(
                &owner,
                &name,
                &NewPullRequest {
                    title: format!("Fix #{}: {}", issue.number, issue.title),
                    head: branch.clone(),
                    base: repo_info.default_branch.clone(),
                    body: format!("Resolves #{}\n\n## Plan\n\n{}\n", issue.number, plan),
                },
            )
            .await?;
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::PULL_REQUEST,
            format!("opened {}", pr.html_url),
            json!({ "number": pr.number, "url": pr.html_url, "branch": branch }),
        ))?;

        let iteration = self.store.add_iteration(NewIteration {
            run_id: run.id.clone(),
            plan,
            patch_hash: patch.hash,
            branch,
            pr_url: Some(pr.html_url),
        })?;
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::ITERATION_CREATED,
            format!("iteration {}", iteration.index),
            json!({ "index": iteration.index, "patch_hash": iteration.patch_hash }),
        ))?;

        self.transition(&run.id, RunState::Coding, RunState::PrOpened)?;
        self.transition(&run.id, RunState::PrOpened, RunState::CiRunning)?;
        self.store.add_log(&EventRecord::new(
            &run.id,
            event_kinds::CI_SUMMARY,
            "ci summary pending",
            json!({ "ci_summary": iteration.ci_summary }),
        ))?;
        self.transition(&run.id, RunState::CiRunning, RunState::Reviewing)?;
        Ok(iteration)
    }

    /// Credential, issue number and locator checks; no collaborator is called
    fn check_preconditions(&self, run: &Run) -> std::result::Result<(String, String, u64), FailureReason> {
        if self.config.model.api_key.is_empty() {
            return Err(FailureReason::MissingCredential("model api key".to_string()));
        }
        if self.config.github.token.is_empty() {
            return Err(FailureReason::MissingCredential("repository token".to_string()));
        }
        let issue_number = match run.issue_number {
            Some(n) if n > 0 => n as u64,
            _ => return Err(FailureReason::InvalidIssueNumber),
        };
        let (owner, name) =
            parse_repo_locator(&run.repo_url).ok_or_else(|| FailureReason::InvalidRepoLocator(run.repo_url.clone()))?;
        Ok((owner, name, issue_number))
    }

    fn make_workdir(&self, run: &Run) -> std::io::Result<TempDir> {
        let prefix = format!("patchrun-{}-", run_prefix(&run.id));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.config.git.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    fn release_workdir(&self, run: &Run, workdir: Option<TempDir>) -> Result<()> {
        let Some(dir) = workdir else {
            return Ok(());
        };
        if self.config.git.keep_workdirs {
            let path: PathBuf = dir.keep();
            log::info!("Run {}: keeping working copy at {}", run.id, path.display());
            self.store.add_log(&EventRecord::new(
                &run.id,
                event_kinds::WORKDIR_KEPT,
                format!("working copy kept at {}", path.display()),
                json!({ "path": path.display().to_string() }),
            ))?;
        } else if let Err(e) = dir.close() {
            log::warn!("Run {}: failed to remove working copy: {}", run.id, e);
        }
        Ok(())
    }

    async fn apply(&self, repo: &std::path::Path, diff: &str, check_only: bool) -> std::result::Result<GitOutput, GitError> {
        let (path, diff) = (repo.to_path_buf(), diff.to_string());
        self.blocking(move |vcs| {
            if check_only {
                vcs.apply_check(&path, &diff)
            } else {
                vcs.apply(&path, &diff)
            }
        })
        .await
    }

    /// Run a VCS call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> std::result::Result<T, GitError>
    where
        F: FnOnce(&dyn VersionControl) -> std::result::Result<T, GitError> + Send + 'static,
        T: Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        tokio::task::spawn_blocking(move || f(vcs.as_ref()))
            .await
            .map_err(|e| GitError::Spawn(format!("git task failed: {}", e)))?
    }

    fn transition(&self, run_id: &str, from: RunState, to: RunState) -> Result<()> {
        self.store.transition_state(run_id, from, to)?;
        self.store.add_log(&EventRecord::transition(run_id, from, to))?;
        log::info!("Run {}: {} -> {}", run_id, from, to);
        Ok(())
    }

    fn fail(&self, run: &Run, reason: &FailureReason, detail: Value) -> Result<()> {
        log::error!("Run {} failed: {}", run.id, reason);
        self.transition(&run.id, RunState::Coding, RunState::Failed)?;
        self.store
            .add_log(&EventRecord::failure(&run.id, reason.code(), &reason.to_string(), detail))?;
        Ok(())
    }
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor")
            .field("pipeline", &self.pipeline)
            .field("guardrails", &self.guardrails)
            .finish_non_exhaustive()
    }
}
