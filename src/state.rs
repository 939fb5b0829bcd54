//! Run lifecycle state machine.
//!
//! A pure transition table: no I/O and no state of its own. Every state change
//! a run goes through is checked here before the store is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    New,
    Planned,
    Coding,
    PrOpened,
    CiRunning,
    Reviewing,
    NeedsFix,
    Done,
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 9] = [
        RunState::New,
        RunState::Planned,
        RunState::Coding,
        RunState::PrOpened,
        RunState::CiRunning,
        RunState::Reviewing,
        RunState::NeedsFix,
        RunState::Done,
        RunState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::New => "NEW",
            RunState::Planned => "PLANNED",
            RunState::Coding => "CODING",
            RunState::PrOpened => "PR_OPENED",
            RunState::CiRunning => "CI_RUNNING",
            RunState::Reviewing => "REVIEWING",
            RunState::NeedsFix => "NEEDS_FIX",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    /// States reachable in one step from this one
    pub fn allowed_targets(&self) -> &'static [RunState] {
        match self {
            RunState::New => &[RunState::Planned],
            RunState::Planned => &[RunState::Coding],
            RunState::Coding => &[RunState::PrOpened, RunState::Failed],
            RunState::PrOpened => &[RunState::CiRunning, RunState::Failed],
            RunState::CiRunning => &[RunState::Reviewing, RunState::NeedsFix, RunState::Failed],
            RunState::Reviewing => &[RunState::Done, RunState::NeedsFix, RunState::Failed],
            RunState::NeedsFix => &[RunState::Coding, RunState::Failed],
            RunState::Done | RunState::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: RunState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Returns true if no transition leaves this state
    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Checked transition: returns `target` or an `InvalidTransition` error
    pub fn transition_to(self, target: RunState) -> Result<RunState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(EngineError::InvalidTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        RunState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| EngineError::Store(format!("unknown run state: {}", s)))
    }
}

/// True only if both names are valid states and `target` is reachable from
/// `current` in one step.
pub fn can_transition(current: &str, target: &str) -> bool {
    match (current.parse::<RunState>(), target.parse::<RunState>()) {
        (Ok(current), Ok(target)) => current.can_transition_to(target),
        _ => false,
    }
}

/// Returns `target` on a valid transition, `InvalidTransition` otherwise.
pub fn advance(current: &str, target: &str) -> Result<RunState> {
    if !can_transition(current, target) {
        return Err(EngineError::InvalidTransition {
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    target.parse()
}
