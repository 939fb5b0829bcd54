//! Guardrail checks applied to every candidate patch before it touches the
//! working copy.
//!
//! Checks are stateless and side-effect free. A patch is accepted only if all
//! of them pass, and every failing reason is reported together.

use crate::config::GuardrailConfig;
use crate::diff::{diff_stats, hash_diff, is_noop};

pub const REASON_OK: &str = "ok";
pub const REASON_EMPTY: &str = "diff is empty";
pub const REASON_IDENTICAL: &str = "diff hash is identical";
pub const REASON_TOO_MANY_FILES: &str = "too many files touched";
pub const REASON_TOO_MANY_LINES: &str = "too many lines touched";
pub const REASON_NO_PROGRESS: &str = "no positive progress";

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailResult {
    pub ok: bool,
    pub reason: String,
}

impl GuardrailResult {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            ok: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Combined outcome of every patch check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailReport {
    pub results: Vec<(&'static str, GuardrailResult)>,
}

impl GuardrailReport {
    pub fn ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.ok)
    }

    /// Reasons of every failing check, in check order
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| !r.ok)
            .map(|(_, r)| r.reason.clone())
            .collect()
    }

    /// One-line summary for the audit log
    pub fn summary(&self) -> String {
        self.results
            .iter()
            .map(|(name, r)| format!("{}: {}", name, r.reason))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Patch acceptance checks with injected thresholds
#[derive(Debug, Clone, Default)]
pub struct GuardrailEngine {
    config: GuardrailConfig,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    /// Reject empty diffs and diffs identical to the previous iteration's
    pub fn check_noop(&self, diff: &str, previous_patch_hash: Option<&str>) -> GuardrailResult {
        if is_noop(diff) {
            return GuardrailResult::fail(REASON_EMPTY);
        }
        if let Some(previous) = previous_patch_hash
            && !previous.is_empty()
            && previous == hash_diff(diff)
        {
            return GuardrailResult::fail(REASON_IDENTICAL);
        }
        GuardrailResult::pass(REASON_OK)
    }

    /// Reject diffs above the configured file or line maxima; values at the
    /// maximum pass.
    pub fn check_scope(&self, diff: &str) -> GuardrailResult {
        let stats = diff_stats(diff);
        let mut reasons = Vec::new();
        if stats.files > self.config.max_patch_files {
            reasons.push(REASON_TOO_MANY_FILES);
        }
        if stats.lines > self.config.max_patch_lines {
            reasons.push(REASON_TOO_MANY_LINES);
        }
        if reasons.is_empty() {
            GuardrailResult::pass(REASON_OK)
        } else {
            GuardrailResult::fail(reasons.join("; "))
        }
    }

    /// CI feedback check: error count must drop, or reach zero
    pub fn check_positive_progress(&self, previous_errors: usize, current_errors: usize) -> GuardrailResult {
        if current_errors < previous_errors {
            return GuardrailResult::pass("ci errors reduced");
        }
        if current_errors == 0 {
            return GuardrailResult::pass("ci green");
        }
        GuardrailResult::fail(REASON_NO_PROGRESS)
    }

    /// Run every patch check
    pub fn evaluate(&self, diff: &str, previous_patch_hash: Option<&str>) -> GuardrailReport {
        GuardrailReport {
            results: vec![
                ("noop", self.check_noop(diff, previous_patch_hash)),
                ("scope", self.check_scope(diff)),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(files: usize, lines: usize) -> GuardrailEngine {
        GuardrailEngine::new(GuardrailConfig {
            max_patch_files: files,
            max_patch_lines: lines,
        })
    }

    fn file_diff(name: &str, added: usize) -> String {
        let mut diff = format!("diff --git a/{0} b/{0}\n--- a/{0}\n+++ b/{0}\n@@ -0,0 +1,{1} @@\n", name, added);
        for i in 0..added {
            diff.push_str(&format!("+line {}\n", i));
        }
        diff
    }

    #[test]
    fn test_noop_empty() {
        let g = GuardrailEngine::default();
        assert_eq!(g.check_noop("", None), GuardrailResult::fail(REASON_EMPTY));
        assert_eq!(g.check_noop(" \n\t", Some("abc")), GuardrailResult::fail(REASON_EMPTY));
    }

    #[test]
    fn test_noop_identical_hash() {
        let g = GuardrailEngine::default();
        let diff = file_diff("a.rs", 1);
        let previous = hash_diff(&diff);
        assert_eq!(g.check_noop(&diff, Some(&previous)), GuardrailResult::fail(REASON_IDENTICAL));
    }

    #[test]
    fn test_noop_distinct_diffs_pass() {
        let g = GuardrailEngine::default();
        let first = file_diff("a.rs", 1);
        let second = file_diff("b.rs", 1);
        assert!(g.check_noop(&first, None).ok);
        assert!(g.check_noop(&second, Some(&hash_diff(&first))).ok);
    }

    #[test]
    fn test_scope_boundaries_pass() {
        let g = engine(2, 4);
        let diff = format!("{}{}", file_diff("a.rs", 2), file_diff("b.rs", 2));
        assert!(g.check_scope(&diff).ok);
    }

    #[test]
    fn test_scope_too_many_files() {
        let g = engine(1, 100);
        let diff = format!("{}{}", file_diff("a.rs", 1), file_diff("b.rs", 1));
        assert_eq!(g.check_scope(&diff), GuardrailResult::fail(REASON_TOO_MANY_FILES));
    }

    #[test]
    fn test_scope_too_many_lines() {
        let g = engine(5, 3);
        let diff = file_diff("a.rs", 4);
        assert_eq!(g.check_scope(&diff), GuardrailResult::fail(REASON_TOO_MANY_LINES));
    }

    #[test]
    fn test_scope_reports_both() {
        let g = engine(0, 0);
        let result = g.check_scope(&file_diff("a.rs", 1));
        assert!(!result.ok);
        assert!(result.reason.contains(REASON_TOO_MANY_FILES));
        assert!(result.reason.contains(REASON_TOO_MANY_LINES));
    }

    #[test]
    fn test_positive_progress() {
        let g = GuardrailEngine::default();
        assert!(g.check_positive_progress(5, 3).ok);
        assert!(g.check_positive_progress(0, 0).ok);
        assert_eq!(g.check_positive_progress(3, 3), GuardrailResult::fail(REASON_NO_PROGRESS));
        assert!(!g.check_positive_progress(2, 4).ok);
    }

    #[test]
    fn test_evaluate_collects_every_failure() {
        let g = engine(0, 0);
        let diff = file_diff("a.rs", 1);
        let report = g.evaluate(&diff, Some(&hash_diff(&diff)));
        assert!(!report.ok());
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0], REASON_IDENTICAL);
        assert!(failures[1].contains(REASON_TOO_MANY_FILES));
        assert!(report.summary().starts_with("noop: diff hash is identical, scope: "));
    }

    #[test]
    fn test_evaluate_ok() {
        let report = GuardrailEngine::default().evaluate(&file_diff("a.rs", 3), None);
        assert!(report.ok());
        assert!(report.failures().is_empty());
        assert_eq!(report.summary(), "noop: ok, scope: ok");
    }
}
