//! Unified diff helpers: hashing, stats, extraction from model output, and
//! structural validation.

use sha2::{Digest, Sha256};
use thiserror::Error;

const GIT_HEADER: &str = "diff --git";
const HUNK_MARKER: &str = "@@";

/// Structural problems with a candidate diff
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("diff is empty")]
    Empty,

    #[error("missing diff --git header")]
    MissingHeader,

    #[error("missing @@ hunk marker")]
    MissingHunk,
}

/// Files and changed lines in a diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: usize,
    pub lines: usize,
}

/// Content hash of a diff (hex SHA-256), the idempotency key across iterations
pub fn hash_diff(diff: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diff.as_bytes());
    hex::encode(hasher.finalize())
}

/// True for empty or whitespace-only diffs
pub fn is_noop(diff: &str) -> bool {
    diff.trim().is_empty()
}

/// Count `diff --git` headers and added/removed lines, ignoring the
/// `+++`/`---` path headers.
pub fn diff_stats(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in diff.lines() {
        if line.starts_with(GIT_HEADER) {
            stats.files += 1;
        }
        if line.starts_with('+') && !line.starts_with("+++") {
            stats.lines += 1;
        }
        if line.starts_with('-') && !line.starts_with("---") {
            stats.lines += 1;
        }
    }
    stats
}

/// Check that a diff is non-empty, has a git header and at least one hunk.
pub fn validate(diff: &str) -> Result<(), DiffError> {
    if is_noop(diff) {
        return Err(DiffError::Empty);
    }
    if !diff.contains(GIT_HEADER) {
        return Err(DiffError::MissingHeader);
    }
    if !diff.contains(HUNK_MARKER) {
        return Err(DiffError::MissingHunk);
    }
    Ok(())
}

/// Turn raw model output into a candidate diff.
///
/// Strips a fenced code block wrapper and a leading bare `diff` line, then
/// synthesizes `diff --git` headers when the model left them out. Non-empty
/// results always end with a newline, which `git apply` requires.
pub fn extract_diff(raw: &str) -> String {
    let unfenced = strip_code_fence(raw);
    let unmarked = strip_diff_marker(&unfenced);
    let mut diff = normalize_headers(&unmarked);
    if !diff.is_empty() && !diff.ends_with('\n') {
        diff.push('\n');
    }
    diff
}

/// Return the body of the first fenced code block, or the trimmed text when
/// there is no fence. An unterminated fence runs to the end of the text.
pub fn strip_code_fence(text: &str) -> String {
    let mut lines = text.lines();
    if !text.lines().any(|l| l.trim_start().starts_with("```")) {
        return text.trim_matches('\n').to_string();
    }

    let mut body = Vec::new();
    for line in lines.by_ref() {
        if line.trim_start().starts_with("```") {
            break;
        }
    }
    for line in lines {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// Drop a leading line that is just the word `diff`.
pub fn strip_diff_marker(text: &str) -> String {
    let trimmed = text.trim_start_matches('\n');
    match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim() == "diff" => rest.to_string(),
        None if trimmed.trim() == "diff" => String::new(),
        _ => trimmed.to_string(),
    }
}

/// Insert `diff --git a/<old> b/<new>` before each consecutive `--- `/`+++ `
/// pair when the diff has no git header at all. Diffs that already carry one
/// are returned unchanged.
pub fn normalize_headers(diff: &str) -> String {
    if diff.contains(GIT_HEADER) {
        return diff.to_string();
    }

    let lines: Vec<&str> = diff.lines().collect();
    let mut out = Vec::with_capacity(lines.len() + 2);
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let (Some(old), Some(next)) = (line.strip_prefix("--- "), lines.get(i + 1))
            && let Some(new) = next.strip_prefix("+++ ")
        {
            let (old, new) = header_paths(old, new);
            out.push(format!("{} a/{} b/{}", GIT_HEADER, old, new));
            out.push(line.to_string());
            out.push(next.to_string());
            i += 2;
            continue;
        }
        out.push(line.to_string());
        i += 1;
    }

    let mut joined = out.join("\n");
    if diff.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

fn header_paths(old: &str, new: &str) -> (String, String) {
    let old = clean_path(old);
    let new = clean_path(new);
    match (old.as_str(), new.as_str()) {
        ("/dev/null", _) => (new.clone(), new),
        (_, "/dev/null") => (old.clone(), old),
        _ => (old, new),
    }
}

fn clean_path(raw: &str) -> String {
    // `--- a/file.rs\t2024-01-01 ...` style timestamps follow a tab
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}
