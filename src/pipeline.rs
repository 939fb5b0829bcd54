//! Planning and patch generation.
//!
//! The pipeline turns an issue into a plan, gathers a little repository
//! context, and asks the patcher for a diff until one passes structural
//! validation or the attempt budget runs out.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde_json::json;

use crate::config::PipelineConfig;
use crate::diff::{DiffError, extract_diff, hash_diff, validate};
use crate::domain::{EventRecord, Run, event_kinds};
use crate::error::{FailureReason, Result, StageError};
use crate::github::Issue;
use crate::id::correlation_id;
use crate::llm::Agent;
use crate::prompt::{PatchContext, PlanContext, PromptRenderer, Snippet};
use crate::store::RunStore;
use crate::vcs::{GitError, VersionControl};

/// Keywords matched against issue text to pick files worth showing the model
pub const KEYWORDS: &[&str] = &[
    "api", "auth", "cache", "cli", "config", "database", "endpoint", "error", "health", "handler", "login", "model",
    "parser", "route", "server", "test",
];

/// Snippets and file listing handed to the patch prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoContext {
    pub snippets: Vec<Snippet>,
    pub files: Vec<String>,
}

/// A diff that passed validation, with its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedPatch {
    pub diff: String,
    pub hash: String,
}

/// Keywords from [`KEYWORDS`] present in `text`, case-insensitive
pub fn matched_keywords(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    KEYWORDS.iter().copied().filter(|k| lower.contains(k)).collect()
}

/// Pick relevant files by keyword and read a bounded prefix of each.
///
/// Blocking; callers on the runtime use `spawn_blocking`.
pub fn collect_context(
    config: &PipelineConfig,
    vcs: &dyn VersionControl,
    repo: &Path,
    issue: &Issue,
) -> std::result::Result<RepoContext, GitError> {
    let text = format!("{}\n{}", issue.title, issue.body_text());
    let mut relevant: Vec<String> = Vec::new();
    'keywords: for keyword in matched_keywords(&text) {
        for path in vcs.grep(repo, keyword)? {
            if relevant.len() >= config.max_relevant_files {
                break 'keywords;
            }
            if !relevant.contains(&path) {
                relevant.push(path);
            }
        }
    }

    let snippets = relevant
        .into_iter()
        .filter_map(|path| match read_prefix(&repo.join(&path), config.snippet_bytes) {
            Ok(content) => Some(Snippet { path, content }),
            Err(e) => {
                log::warn!("Skipping snippet {}: {}", path, e);
                None
            }
        })
        .collect();

    let mut files = vcs.list_files(repo)?;
    files.truncate(config.max_listed_files);

    Ok(RepoContext { snippets, files })
}

fn read_prefix(path: &Path, limit: usize) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    File::open(path)?.take(limit as u64).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

pub struct PatchPipeline {
    config: PipelineConfig,
    planner: Agent,
    patcher: Agent,
    renderer: PromptRenderer,
}

impl PatchPipeline {
    pub fn new(config: PipelineConfig, planner: Agent, patcher: Agent) -> Result<Self> {
        Ok(Self {
            config,
            planner,
            patcher,
            renderer: PromptRenderer::new()?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ask the planner for a plan; the text is returned verbatim
    pub async fn plan(&self, store: &dyn RunStore, run: &Run, issue: &Issue) -> std::result::Result<String, StageError> {
        let prompt = self.renderer.plan(&PlanContext {
            title: &issue.title,
            body: issue.body_text(),
        })?;
        store.add_log(&EventRecord::prompt(&run.id, "plan", &prompt))?;

        let result = self
            .planner
            .run(&prompt, &correlation_id(&run.id, "plan", 1), Some(&run.model))
            .await?;
        store.add_log(&EventRecord::model_output(&run.id, "plan", &result.model, &result.content))?;
        log::info!("Run {} planned ({} bytes)", run.id, result.content.len());
        Ok(result.content)
    }

    pub fn collect_context(
        &self,
        vcs: &dyn VersionControl,
        repo: &Path,
        issue: &Issue,
    ) -> std::result::Result<RepoContext, GitError> {
        collect_context(&self.config, vcs, repo, issue)
    }

    pub fn build_patch_prompt(&self, plan: &str, context: &RepoContext, previous_error: Option<&str>) -> Result<String> {
        self.renderer.patch(&PatchContext {
            plan,
            snippets: &context.snippets,
            files: &context.files,
            previous_error,
        })
    }

    /// Ask the patcher for a diff, feeding each rejection back into the next
    /// attempt. Every rejected attempt logs one `patch_invalid` event.
    pub async fn generate_patch(
        &self,
        store: &dyn RunStore,
        run: &Run,
        plan: &str,
        context: &RepoContext,
    ) -> std::result::Result<AcceptedPatch, StageError> {
        let attempts = self.config.max_patch_attempts.max(1);
        let mut last_error: Option<DiffError> = None;

        for attempt in 1..=attempts {
            let previous = last_error.as_ref().map(|e| e.to_string());
            let prompt = self.build_patch_prompt(plan, context, previous.as_deref())?;
            store.add_log(&EventRecord::prompt(&run.id, "patch", &prompt))?;

            let result = self
                .patcher
                .run(&prompt, &correlation_id(&run.id, "patch", attempt), Some(&run.model))
                .await?;
            store.add_log(&EventRecord::model_output(&run.id, "patch", &result.model, &result.content))?;

            let diff = extract_diff(&result.content);
            match validate(&diff) {
                Ok(()) => {
                    let hash = hash_diff(&diff);
                    store.add_log(&EventRecord::new(
                        &run.id,
                        event_kinds::PATCH_ACCEPTED,
                        format!("patch accepted on attempt {}", attempt),
                        json!({ "attempt": attempt, "hash": hash }),
                    ))?;
                    return Ok(AcceptedPatch { diff, hash });
                }
                Err(e) => {
                    log::warn!("Run {} patch attempt {}/{} invalid: {}", run.id, attempt, attempts, e);
                    store.add_log(&EventRecord::new(
                        &run.id,
                        event_kinds::PATCH_INVALID,
                        format!("invalid diff from model: {}", e),
                        json!({ "attempt": attempt, "reason": e.to_string() }),
                    ))?;
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(DiffError::Empty) | None => FailureReason::EmptyDiff,
            Some(e) => FailureReason::InvalidDiffFormat(e.to_string()),
        }
        .into())
    }
}

impl std::fmt::Debug for PatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPipeline")
            .field("config", &self.config)
            .field("planner", &self.planner)
            .field("patcher", &self.patcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AgentRole, ScriptedModelClient};
    use crate::store::SqliteStore;
    use std::sync::{Arc, Mutex};

    const GOOD: &str = "diff --git a/src/health.rs b/src/health.rs\n--- /dev/null\n+++ b/src/health.rs\n@@ -0,0 +1 @@\n+pub fn health() -> &'static str { \"ok\" }\n";

    fn pipeline(client: Arc<ScriptedModelClient>) -> PatchPipeline {
        PatchPipeline::new(
            PipelineConfig::default(),
            Agent::new(AgentRole::Planner, client.clone()),
            Agent::new(AgentRole::Patcher, client),
        )
        .unwrap()
    }

    fn fixture() -> (SqliteStore, Run, Issue) {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = Run::new("https://github.com/acme/widgets", Some(1), "m/x", 5);
        store.create_run(&run).unwrap();
        let issue = Issue {
            number: 1,
            title: "add health endpoint".to_string(),
            body: Some("Expose GET /health".to_string()),
        };
        (store, run, issue)
    }

    fn kinds(store: &SqliteStore, run: &Run, kind: &str) -> usize {
        store.list_logs(&run.id).unwrap().iter().filter(|e| e.kind == kind).count()
    }

    #[tokio::test]
    async fn test_plan_returned_verbatim_and_logged() {
        let (store, run, issue) = fixture();
        let client = Arc::new(ScriptedModelClient::new(["1. add route\n2. test it"]));
        let plan = pipeline(client.clone()).plan(&store, &run, &issue).await.unwrap();
        assert_eq!(plan, "1. add route\n2. test it");
        assert!(client.requests()[0].prompt.contains("add health endpoint"));
        assert_eq!(client.requests()[0].model.as_deref(), Some("m/x"));
        assert_eq!(kinds(&store, &run, event_kinds::PROMPT), 1);
        assert_eq!(kinds(&store, &run, event_kinds::MODEL_OUTPUT), 1);
    }

    #[tokio::test]
    async fn test_first_valid_patch_accepted() {
        let (store, run, _) = fixture();
        let client = Arc::new(ScriptedModelClient::new([format!("```diff\n{}```", GOOD)]));
        let patch = pipeline(client.clone())
            .generate_patch(&store, &run, "plan", &RepoContext::default())
            .await
            .unwrap();
        assert_eq!(patch.diff, GOOD);
        assert_eq!(patch.hash, hash_diff(GOOD));
        assert_eq!(client.call_count(), 1);
        assert_eq!(kinds(&store, &run, event_kinds::PATCH_INVALID), 0);
    }

    #[tokio::test]
    async fn test_retry_after_invalid_output() {
        let (store, run, _) = fixture();
        let client = Arc::new(ScriptedModelClient::new(["I cannot do that".to_string(), GOOD.to_string()]));
        let patch = pipeline(client.clone())
            .generate_patch(&store, &run, "plan", &RepoContext::default())
            .await
            .unwrap();
        assert_eq!(patch.diff, GOOD);
        assert_eq!(client.call_count(), 2);
        assert_eq!(kinds(&store, &run, event_kinds::PATCH_INVALID), 1);

        let second_prompt = &client.requests()[1].prompt;
        assert!(second_prompt.contains("Your previous answer was rejected: missing diff --git header"));
    }

    #[tokio::test]
    async fn test_both_attempts_invalid() {
        let (store, run, _) = fixture();
        let client = Arc::new(ScriptedModelClient::new(["nope", "diff --git a/x b/x\n+no hunk\n", "never"]));
        let err = pipeline(client.clone())
            .generate_patch(&store, &run, "plan", &RepoContext::default())
            .await
            .unwrap_err();
        match err {
            StageError::Failed(reason) => {
                assert_eq!(reason, FailureReason::InvalidDiffFormat("missing @@ hunk marker".to_string()));
                assert!(reason.to_string().starts_with("invalid diff from model"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.call_count(), 2);
        assert_eq!(kinds(&store, &run, event_kinds::PATCH_INVALID), 2);
    }

    #[tokio::test]
    async fn test_empty_outputs_fail_as_empty() {
        let (store, run, _) = fixture();
        let client = Arc::new(ScriptedModelClient::new(["", "```\n```"]));
        let err = pipeline(client)
            .generate_patch(&store, &run, "plan", &RepoContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(FailureReason::EmptyDiff)));
    }

    #[tokio::test]
    async fn test_model_error_is_collaborator_failure() {
        let (store, run, _) = fixture();
        let client = Arc::new(ScriptedModelClient::with_results([Err(crate::llm::LlmError::Api {
            status: 503,
            message: "down".to_string(),
        })]));
        let err = pipeline(client)
            .generate_patch(&store, &run, "plan", &RepoContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(FailureReason::Collaborator(_))));
    }

    #[test]
    fn test_matched_keywords() {
        assert_eq!(matched_keywords("Add HEALTH endpoint"), vec!["endpoint", "health"]);
        assert!(matched_keywords("refactor everything").is_empty());
    }

    struct FakeVcs {
        grep_calls: Mutex<Vec<String>>,
    }

    impl VersionControl for FakeVcs {
        fn clone_shallow(&self, _url: &str, _dest: &Path) -> std::result::Result<(), GitError> {
            Ok(())
        }
        fn create_branch(&self, _repo: &Path, _name: &str) -> std::result::Result<(), GitError> {
            Ok(())
        }
        fn apply(&self, _repo: &Path, _diff: &str) -> std::result::Result<crate::vcs::GitOutput, GitError> {
            unreachable!()
        }
        fn apply_check(&self, _repo: &Path, _diff: &str) -> std::result::Result<crate::vcs::GitOutput, GitError> {
            unreachable!()
        }
        fn commit_all(&self, _repo: &Path, _message: &str) -> std::result::Result<(), GitError> {
            Ok(())
        }
        fn push(&self, _repo: &Path, _branch: &str) -> std::result::Result<(), GitError> {
            Ok(())
        }
        fn list_files(&self, _repo: &Path) -> std::result::Result<Vec<String>, GitError> {
            Ok((0..10).map(|i| format!("f{}.rs", i)).collect())
        }
        fn grep(&self, _repo: &Path, keyword: &str) -> std::result::Result<Vec<String>, GitError> {
            self.grep_calls.lock().unwrap().push(keyword.to_string());
            Ok(match keyword {
                "endpoint" => vec!["src/server.rs".to_string(), "src/missing.rs".to_string()],
                "health" => vec!["src/server.rs".to_string(), "README.md".to_string()],
                _ => vec![],
            })
        }
    }

    #[test]
    fn test_collect_context_bounds() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/server.rs"), "x".repeat(50)).unwrap();
        std::fs::write(temp.path().join("README.md"), "# readme").unwrap();

        let vcs = FakeVcs {
            grep_calls: Mutex::new(Vec::new()),
        };
        let config = PipelineConfig {
            snippet_bytes: 10,
            max_listed_files: 4,
            ..Default::default()
        };
        let issue = Issue {
            number: 1,
            title: "add health endpoint".to_string(),
            body: None,
        };
        let context = collect_context(&config, &vcs, temp.path(), &issue).unwrap();

        assert_eq!(*vcs.grep_calls.lock().unwrap(), vec!["endpoint", "health"]);
        // missing file is skipped, duplicates collapse
        let paths: Vec<_> = context.snippets.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["src/server.rs", "README.md"]);
        assert_eq!(context.snippets[0].content, "x".repeat(10));
        assert_eq!(context.files.len(), 4);
    }

    #[test]
    fn test_collect_context_caps_relevant_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let vcs = FakeVcs {
            grep_calls: Mutex::new(Vec::new()),
        };
        let config = PipelineConfig {
            max_relevant_files: 1,
            ..Default::default()
        };
        let issue = Issue {
            number: 1,
            title: "health endpoint".to_string(),
            body: None,
        };
        let context = collect_context(&config, &vcs, temp.path(), &issue).unwrap();
        // src/server.rs does not exist in this temp dir, so no snippet survives
        assert!(context.snippets.is_empty());
        assert_eq!(*vcs.grep_calls.lock().unwrap(), vec!["endpoint"]);
    }
}
