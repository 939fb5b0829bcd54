//! Version-control operations on a run's working copy, via the `git` binary.
//!
//! All calls block; async callers go through `spawn_blocking`.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::GitConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GitError {
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to execute git: {0}")]
    Spawn(String),
}

/// Captured result of a git command that is allowed to fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    fn from_output(output: &std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

pub trait VersionControl: Send + Sync {
    /// `git clone --depth 1 <url> <dest>`
    fn clone_shallow(&self, url: &str, dest: &Path) -> Result<(), GitError>;

    fn create_branch(&self, repo: &Path, name: &str) -> Result<(), GitError>;

    /// Three-way apply with whitespace fix; a rejected patch is `success: false`
    fn apply(&self, repo: &Path, diff: &str) -> Result<GitOutput, GitError>;

    /// Check-only apply, for diagnostics
    fn apply_check(&self, repo: &Path, diff: &str) -> Result<GitOutput, GitError>;

    /// Stage everything and commit
    fn commit_all(&self, repo: &Path, message: &str) -> Result<(), GitError>;

    fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Tracked paths, repository-relative
    fn list_files(&self, repo: &Path) -> Result<Vec<String>, GitError>;

    /// Tracked paths whose content contains `keyword` (case-insensitive)
    fn grep(&self, repo: &Path, keyword: &str) -> Result<Vec<String>, GitError>;
}

/// `git` subprocess implementation
#[derive(Debug, Clone)]
pub struct GitCli {
    remote: String,
    committer_name: String,
    committer_email: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::from_config(&GitConfig::default())
    }
}

impl GitCli {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            committer_name: config.committer_name.clone(),
            committer_email: config.committer_email.clone(),
        }
    }

    fn output(&self, cwd: Option<&Path>, args: &[&str]) -> Result<GitOutput, GitError> {
        log::debug!("git {}", args.join(" "));
        let mut command = Command::new("git");
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|e| GitError::Spawn(e.to_string()))?;
        Ok(GitOutput::from_output(&output))
    }

    fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.output(cwd, args)?;
        if !out.success {
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.first().copied().unwrap_or_default()),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    fn run_with_stdin(&self, repo: &Path, args: &[&str], input: &str) -> Result<GitOutput, GitError> {
        log::debug!("git {} (<{} bytes on stdin)", args.join(" "), input.len());
        let mut child = Command::new("git")
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GitError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| GitError::Spawn(format!("writing stdin: {}", e)))?;
        }

        let output = child.wait_with_output().map_err(|e| GitError::Spawn(e.to_string()))?;
        Ok(GitOutput::from_output(&output))
    }
}

fn lines(stdout: &str) -> Vec<String> {
    stdout.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
}

impl VersionControl for GitCli {
    fn clone_shallow(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        let dest = dest.to_string_lossy();
        self.run(None, &["clone", "--depth", "1", url, dest.as_ref()])?;
        Ok(())
    }

    fn create_branch(&self, repo: &Path, name: &str) -> Result<(), GitError> {
        self.run(Some(repo), &["checkout", "-b", name])?;
        Ok(())
    }

    fn apply(&self, repo: &Path, diff: &str) -> Result<GitOutput, GitError> {
        if diff.trim().is_empty() {
            return Ok(GitOutput {
                success: false,
                stdout: String::new(),
                stderr: "empty diff".to_string(),
            });
        }
        self.run_with_stdin(repo, &["apply", "--3way", "--whitespace=fix", "-"], diff)
    }

    fn apply_check(&self, repo: &Path, diff: &str) -> Result<GitOutput, GitError> {
        self.run_with_stdin(repo, &["apply", "--check", "-"], diff)
    }

    fn commit_all(&self, repo: &Path, message: &str) -> Result<(), GitError> {
        self.run(Some(repo), &["add", "."])?;
        let name = format!("user.name={}", self.committer_name);
        let email = format!("user.email={}", self.committer_email);
        self.run(Some(repo), &["-c", &name, "-c", &email, "commit", "-m", message])
            .map_err(|e| match e {
                GitError::CommandFailed { stderr, .. } => GitError::CommandFailed {
                    command: "git commit".to_string(),
                    stderr,
                },
                other => other,
            })?;
        Ok(())
    }

    fn push(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run(Some(repo), &["push", &self.remote, branch])?;
        Ok(())
    }

    fn list_files(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run(Some(repo), &["ls-files"])?;
        Ok(lines(&out.stdout))
    }

    fn grep(&self, repo: &Path, keyword: &str) -> Result<Vec<String>, GitError> {
        let out = self.output(Some(repo), &["grep", "-l", "-i", "-F", "-e", keyword])?;
        if out.success {
            return Ok(lines(&out.stdout));
        }
        // exit 1 with empty stderr just means no match
        if out.stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        Err(GitError::CommandFailed {
            command: "git grep".to_string(),
            stderr: out.stderr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    /// Source repository with one commit containing README.md and src/server.rs
    fn setup_test_repo() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let repo_path = temp.path().join("origin");
        std::fs::create_dir_all(repo_path.join("src")).unwrap();

        git(&repo_path, &["init"]);
        git(&repo_path, &["config", "user.email", "test@test.com"]);
        git(&repo_path, &["config", "user.name", "Test"]);

        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        std::fs::write(repo_path.join("src/server.rs"), "fn routes() {\n    index();\n}\n").unwrap();
        git(&repo_path, &["add", "."]);
        git(&repo_path, &["commit", "-m", "Initial commit"]);

        (temp, repo_path)
    }

    /// Produce a real diff against the source repo, then restore it
    fn readme_diff(repo: &Path) -> String {
        std::fs::write(repo.join("README.md"), "# Test\n\nHealth endpoint docs.\n").unwrap();
        let diff = git(repo, &["diff"]);
        git(repo, &["checkout", "--", "README.md"]);
        diff
    }

    fn clone_into(temp: &TempDir, source: &Path, name: &str) -> PathBuf {
        let dest = temp.path().join(name);
        let url = format!("file://{}", source.display());
        GitCli::default().clone_shallow(&url, &dest).unwrap();
        dest
    }

    #[test]
    fn test_clone_shallow() {
        let (temp, source) = setup_test_repo();
        let dest = clone_into(&temp, &source, "work");
        assert!(dest.join(".git").exists());
        assert!(dest.join("README.md").exists());
    }

    #[test]
    fn test_clone_bad_url_fails() {
        let temp = TempDir::new().unwrap();
        let result = GitCli::default().clone_shallow("file:///nonexistent/repo", &temp.path().join("x"));
        assert!(matches!(result, Err(GitError::CommandFailed { .. })));
    }

    #[test]
    fn test_apply_commit_push() {
        let (temp, source) = setup_test_repo();
        let diff = readme_diff(&source);
        let work = clone_into(&temp, &source, "work");
        let git_cli = GitCli::default();

        git_cli.create_branch(&work, "agent/run-test-it1").unwrap();
        let applied = git_cli.apply(&work, &diff).unwrap();
        assert!(applied.success, "apply failed: {}", applied.stderr);
        assert!(std::fs::read_to_string(work.join("README.md")).unwrap().contains("Health endpoint"));

        git_cli.commit_all(&work, "Add health docs").unwrap();
        let log = git(&work, &["log", "-1", "--format=%an <%ae> %s"]);
        assert_eq!(log.trim(), "patchrun <patchrun@users.noreply.github.com> Add health docs");

        git_cli.push(&work, "agent/run-test-it1").unwrap();
        let branches = git(&source, &["branch", "--list", "agent/run-test-it1"]);
        assert!(branches.contains("agent/run-test-it1"));
    }

    #[test]
    fn test_apply_rejects_bad_patch_and_check_explains() {
        let (temp, source) = setup_test_repo();
        let work = clone_into(&temp, &source, "work");
        let diff = "diff --git a/missing.txt b/missing.txt\n--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-a\n+b\n";
        let git_cli = GitCli::default();

        let applied = git_cli.apply(&work, diff).unwrap();
        assert!(!applied.success);

        let check = git_cli.apply_check(&work, diff).unwrap();
        assert!(!check.success);
        assert!(check.stderr.contains("missing.txt"));
    }

    #[test]
    fn test_apply_empty_diff() {
        let (_temp, source) = setup_test_repo();
        let out = GitCli::default().apply(&source, "  \n").unwrap();
        assert!(!out.success);
    }

    #[test]
    fn test_commit_without_changes_fails() {
        let (_temp, source) = setup_test_repo();
        let result = GitCli::default().commit_all(&source, "nothing");
        assert!(matches!(result, Err(GitError::CommandFailed { command, .. }) if command == "git commit"));
    }

    #[test]
    fn test_list_files_and_grep() {
        let (_temp, source) = setup_test_repo();
        let git_cli = GitCli::default();

        let mut files = git_cli.list_files(&source).unwrap();
        files.sort();
        assert_eq!(files, vec!["README.md".to_string(), "src/server.rs".to_string()]);

        assert_eq!(git_cli.grep(&source, "ROUTES").unwrap(), vec!["src/server.rs".to_string()]);
        assert!(git_cli.grep(&source, "nothing-matches-this").unwrap().is_empty());
    }
}
