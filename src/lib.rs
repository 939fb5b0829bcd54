//! patchrun - issue-to-pull-request automation
//!
//! A run takes one tracked issue through planning, patch generation,
//! guardrail checks and a pull request, recording every transition and
//! model exchange in a durable audit log.

pub mod config;
pub mod diff;
pub mod domain;
pub mod error;
pub mod executor;
pub mod github;
pub mod guardrails;
pub mod id;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod review;
pub mod service;
pub mod state;
pub mod store;
pub mod vcs;

pub use config::Config;
pub use error::{EngineError, FailureReason, Result};
pub use executor::{RunExecutor, RunOutcome};
pub use queue::{WorkQueue, WorkerPool, work_queue};
pub use service::{CreateRunRequest, RunReport, RunService};
pub use state::RunState;
pub use store::{IssueLock, RunStore, SqliteStore};
