//! Error types for patchrun
//!
//! Centralized error handling using thiserror. `EngineError` covers the
//! infrastructure the engine cannot recover from (store, configuration).
//! `FailureReason` is the typed reason a run lands in FAILED; it is what the
//! audit log records verbatim.

use thiserror::Error;

use crate::github::GithubError;
use crate::llm::LlmError;
use crate::vcs::GitError;

/// All error types that can escape the engine boundary
#[derive(Debug, Error)]
pub enum EngineError {
    /// Run not found in storage
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Transition not present in the lifecycle table
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Store(String),

    /// Model client error
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Repository API error
    #[error("GitHub error: {0}")]
    Github(#[from] GithubError),

    /// Local git error
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a run was moved to FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("invalid repository locator: {0}")]
    InvalidRepoLocator(String),

    #[error("missing or invalid issue number")]
    InvalidIssueNumber,

    #[error("max iterations reached ({0})")]
    IterationBudgetExhausted(u32),

    #[error("failed to clone repo")]
    CloneFailed,

    #[error("invalid diff from model: empty output")]
    EmptyDiff,

    #[error("invalid diff from model: {0}")]
    InvalidDiffFormat(String),

    #[error("guardrail stop: {}", .0.join("; "))]
    Guardrail(Vec<String>),

    #[error("failed to apply diff")]
    ApplyFailed,

    #[error("{0}")]
    Collaborator(String),

    /// The engine itself failed mid-run (store, config)
    #[error("internal error: {0}")]
    Internal(String),
}

impl FailureReason {
    /// Short machine-readable tag stored in event payloads
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::MissingCredential(_) => "missing_credential",
            FailureReason::InvalidRepoLocator(_) => "invalid_repo_locator",
            FailureReason::InvalidIssueNumber => "invalid_issue_number",
            FailureReason::IterationBudgetExhausted(_) => "iteration_budget_exhausted",
            FailureReason::CloneFailed => "clone_failed",
            FailureReason::EmptyDiff => "empty_diff",
            FailureReason::InvalidDiffFormat(_) => "invalid_diff_format",
            FailureReason::Guardrail(_) => "guardrail",
            FailureReason::ApplyFailed => "apply_failed",
            FailureReason::Collaborator(_) => "collaborator",
            FailureReason::Internal(_) => "internal",
        }
    }
}

impl From<LlmError> for FailureReason {
    fn from(err: LlmError) -> Self {
        FailureReason::Collaborator(format!("model call failed: {}", err))
    }
}

impl From<GithubError> for FailureReason {
    fn from(err: GithubError) -> Self {
        FailureReason::Collaborator(format!("repository api call failed: {}", err))
    }
}

impl From<GitError> for FailureReason {
    fn from(err: GitError) -> Self {
        FailureReason::Collaborator(format!("git failed: {}", err))
    }
}

/// Outcome of a failed stage: either the run fails with a reason, or the
/// engine itself hit an infrastructure error (store, config).
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(FailureReason),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<FailureReason> for StageError {
    fn from(reason: FailureReason) -> Self {
        StageError::Failed(reason)
    }
}

impl From<LlmError> for StageError {
    fn from(err: LlmError) -> Self {
        StageError::Failed(err.into())
    }
}

impl From<GithubError> for StageError {
    fn from(err: GithubError) -> Self {
        StageError::Failed(err.into())
    }
}

impl From<GitError> for StageError {
    fn from(err: GitError) -> Self {
        StageError::Failed(err.into())
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Failed(FailureReason::Collaborator(format!("io failed: {}", err)))
    }
}
