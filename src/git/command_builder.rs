//! Type-safe Git command builder for consistent command execution
//!
//! This module provides a fluent API for building and executing Git commands,
//! so every invocation shares the same timeout handling, logging and failure
//! classification.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::GIT_LOCAL_TIMEOUT;
use crate::core::{BkstgError, classify_git_failure};
use crate::utils::platform::get_git_command;

/// Type-safe builder for constructing and executing Git commands.
///
/// # Examples
///
/// ```rust,no_run
/// use bkstg::git::command_builder::GitCommand;
/// use std::path::Path;
///
/// # async fn example() -> anyhow::Result<()> {
/// let head = GitCommand::rev_parse("HEAD")
///     .current_dir(Path::new("/path/to/clone"))
///     .execute_stdout()
///     .await?;
///
/// GitCommand::fetch_branch("main")
///     .current_dir(Path::new("/path/to/clone"))
///     .with_timeout(Some(std::time::Duration::from_secs(60)))
///     .with_context("platform")
///     .execute_success()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Configuration
///
/// - **Timeout**: [`GIT_LOCAL_TIMEOUT`]; network builders override it
/// - **Prompts**: `GIT_TERMINAL_PROMPT=0` so missing credentials fail fast
///   instead of hanging on a prompt
/// - **Process lifetime**: the child is killed when the future is dropped,
///   which is how caller cancellation reaches the Git process
pub struct GitCommand {
    /// Command arguments to pass to Git
    args: Vec<String>,

    /// Working directory, passed to Git via `-C`
    current_dir: Option<std::path::PathBuf>,

    /// Environment variables to set for the Git process
    env_vars: Vec<(String, String)>,

    /// Maximum duration to wait for command completion (None = no timeout)
    timeout_duration: Option<Duration>,

    /// Optional context string for log messages
    context: Option<String>,

    /// Remote URL for network commands, used in error messages
    remote_url: Option<String>,
}

impl Default for GitCommand {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            current_dir: None,
            env_vars: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
            timeout_duration: Some(GIT_LOCAL_TIMEOUT),
            context: None,
            remote_url: None,
        }
    }
}

/// Output from a Git command.
#[derive(Debug, Clone, Default)]
pub struct GitCommandOutput {
    /// Exit code (`None` if terminated by a signal)
    pub code: Option<i32>,
    /// Standard output from the Git command
    pub stdout: String,
    /// Standard error output from the Git command
    pub stderr: String,
}

impl GitCommandOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl GitCommand {
    /// Creates a new Git command builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory for Git command execution.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds a single argument to the Git command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the Git command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the Git command execution.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Set a custom timeout for the command (None for no timeout)
    pub const fn with_timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Set a context for logging (e.g., source name)
    ///
    /// The context is included in debug log messages to tell concurrent
    /// operations on different sources apart.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Record the remote URL this command talks to, for error messages.
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// The Git subcommand, skipping `-C <dir>`.
    fn operation(&self) -> String {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            // Skip `-c key=value` configuration overrides
            if arg == "-c" {
                args.next();
                continue;
            }
            return arg.clone();
        }
        "unknown".to_string()
    }

    fn log_prefix(&self) -> String {
        self.context.as_ref().map(|ctx| format!("({ctx}) ")).unwrap_or_default()
    }

    /// Run the command and return its raw output regardless of exit code.
    ///
    /// Only spawn failures and timeouts are errors here. Use this for commands
    /// whose non-zero exit code carries meaning (`merge-base --is-ancestor`,
    /// `merge-tree`).
    pub async fn run(self) -> Result<GitCommandOutput> {
        let start = std::time::Instant::now();
        let git_command = get_git_command();
        let mut cmd = Command::new(git_command);

        let mut full_args = Vec::new();
        if let Some(ref dir) = self.current_dir {
            full_args.push("-C".to_string());
            full_args.push(dir.display().to_string());
        }
        full_args.extend(self.args.iter().cloned());

        cmd.args(&full_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let prefix = self.log_prefix();
        tracing::debug!(
            target: "git",
            "{}Executing command: {} {}",
            prefix,
            git_command,
            full_args.join(" ")
        );

        let output_future = cmd.output();
        let output = if let Some(duration) = self.timeout_duration {
            if let Ok(result) = timeout(duration, output_future).await {
                result.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        anyhow::Error::from(BkstgError::GitNotFound)
                    } else {
                        anyhow::Error::from(e)
                            .context(format!("Failed to execute git {}", full_args.join(" ")))
                    }
                })?
            } else {
                tracing::warn!(
                    target: "git",
                    "{}Command timed out after {} seconds: git {}",
                    prefix,
                    duration.as_secs(),
                    full_args.join(" ")
                );
                return Err(BkstgError::Timeout {
                    operation: format!("git {}", self.operation()),
                    seconds: duration.as_secs(),
                }
                .into());
            }
        } else {
            output_future
                .await
                .with_context(|| format!("Failed to execute git {}", full_args.join(" ")))?
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !stdout.trim().is_empty() {
            tracing::trace!(target: "git", "{}{}", prefix, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(target: "git", "{}{}", prefix, stderr.trim());
        }

        let elapsed = start.elapsed();
        if elapsed.as_secs() > 1 {
            tracing::info!(
                target: "git::perf",
                "{}Git {} took {:.2}s",
                prefix,
                self.operation(),
                elapsed.as_secs_f64()
            );
        } else if elapsed.as_millis() > 100 {
            tracing::debug!(
                target: "git::perf",
                "{}Git {} took {}ms",
                prefix,
                self.operation(),
                elapsed.as_millis()
            );
        }

        Ok(GitCommandOutput {
            code: output.status.code(),
            stdout,
            stderr,
        })
    }

    /// Execute the command, failing with a classified [`BkstgError`] on a
    /// non-zero exit code.
    pub async fn execute(self) -> Result<GitCommandOutput> {
        let operation = self.operation();
        let url = self.remote_url.clone();
        let output = self.run().await?;

        if !output.success() {
            tracing::debug!(
                target: "git",
                "Command failed with exit code: {:?}",
                output.code
            );
            let detail = if output.stderr.trim().is_empty() {
                &output.stdout
            } else {
                &output.stderr
            };
            return Err(classify_git_failure(&operation, url.as_deref(), detail).into());
        }

        Ok(output)
    }

    /// Execute the command and return only stdout as a trimmed string
    pub async fn execute_stdout(self) -> Result<String> {
        let output = self.execute().await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Execute the command and check for success
    pub async fn execute_success(self) -> Result<()> {
        self.execute().await?;
        Ok(())
    }

    /// Execute a command whose exit code 1 means "no" rather than failure.
    ///
    /// Returns `Ok(true)` on 0, `Ok(false)` on 1 and a classified error on
    /// anything else.
    pub async fn execute_predicate(self) -> Result<bool> {
        let operation = self.operation();
        let url = self.remote_url.clone();
        let output = self.run().await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(classify_git_failure(&operation, url.as_deref(), &output.stderr).into()),
        }
    }
}

// Convenience builders for the operations the sync engine needs

impl GitCommand {
    /// Clone without checking out files, so sparse checkout can be configured
    /// before the first checkout.
    ///
    /// Remote clones use a blobless partial clone. Local URLs (`file://`,
    /// absolute or relative paths) get a full clone because partial clone is
    /// not supported by the local transport.
    pub fn clone_no_checkout(url: &str, branch: &str, target: impl AsRef<Path>) -> Self {
        let mut args = vec!["clone".to_string(), "--no-checkout".to_string()];

        let is_local = url.starts_with("file://")
            || url.starts_with('/')
            || url.starts_with('.')
            || (url.len() > 1 && url.chars().nth(1) == Some(':'));
        if !is_local {
            args.push("--filter=blob:none".to_string());
        }

        args.extend([
            "--branch".to_string(),
            branch.to_string(),
            "--origin".to_string(),
            crate::constants::REMOTE_NAME.to_string(),
            url.to_string(),
            target.as_ref().display().to_string(),
        ]);
        Self::new().args(args).with_remote_url(url)
    }

    /// Enable cone-mode sparse checkout restricted to `directories`.
    pub fn sparse_checkout_set(directories: &[String]) -> Self {
        Self::new().args(["sparse-checkout", "set", "--cone"]).args(directories.iter().cloned())
    }

    /// Fetch a single branch and update its remote-tracking ref.
    pub fn fetch_branch(branch: &str) -> Self {
        let remote = crate::constants::REMOTE_NAME;
        Self::new().args([
            "fetch".to_string(),
            "--quiet".to_string(),
            remote.to_string(),
            format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}"),
        ])
    }

    /// Create a checkout command
    pub fn checkout(ref_name: &str) -> Self {
        Self::new().args(["checkout", "--quiet", ref_name])
    }

    /// Create and switch to a new branch at HEAD
    pub fn checkout_new_branch(branch_name: &str) -> Self {
        Self::new().args(["checkout", "--quiet", "-b", branch_name])
    }

    /// Hard-reset the working tree and index to `reference`
    pub fn reset_hard(reference: &str) -> Self {
        Self::new().args(["reset", "--hard", "--quiet", reference])
    }

    /// Remove untracked files and directories
    pub fn clean() -> Self {
        Self::new().args(["clean", "-fd", "--quiet"])
    }

    /// Resolve a reference to a commit id
    pub fn rev_parse(ref_name: &str) -> Self {
        Self::new().args(["rev-parse", "--verify", "--quiet", &format!("{ref_name}^{{commit}}")])
    }

    /// Predicate: is `ancestor` an ancestor of `descendant`
    pub fn is_ancestor(ancestor: &str, descendant: &str) -> Self {
        Self::new().args(["merge-base", "--is-ancestor", ancestor, descendant])
    }

    /// Count commits reachable from `to` but not from `from`
    pub fn rev_list_count(from: &str, to: &str) -> Self {
        Self::new().args(["rev-list", "--count", &format!("{from}..{to}")])
    }

    /// In-memory merge of two commits; exit 1 signals conflicts.
    ///
    /// Requires Git 2.38 or newer.
    pub fn merge_tree(ours: &str, theirs: &str) -> Self {
        Self::new().args([
            "-c",
            "core.quotePath=false",
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            ours,
            theirs,
        ])
    }

    /// Paths with unmerged index entries
    pub fn unmerged_paths() -> Self {
        Self::new().args(["-c", "core.quotePath=false", "diff", "--name-only", "--diff-filter=U"])
    }

    /// Fast-forward only merge
    pub fn merge_ff_only(reference: &str) -> Self {
        Self::new().args(["merge", "--ff-only", "--quiet", reference])
    }

    /// Non-committing merge used by the worktree trial-merge fallback
    pub fn merge_no_commit(reference: &str) -> Self {
        Self::new().args(["merge", "--no-commit", "--no-ff", reference])
    }

    /// Merge with an automatic merge commit message
    pub fn merge(reference: &str) -> Self {
        Self::new().args(["merge", "--no-edit", reference])
    }

    /// Abort an in-progress merge
    pub fn merge_abort() -> Self {
        Self::new().args(["merge", "--abort"])
    }

    /// Machine-readable working tree status
    pub fn status_porcelain() -> Self {
        Self::new().args(["-c", "core.quotePath=false", "status", "--porcelain", "--untracked-files=all"])
    }

    /// Stage paths (all changes when `paths` is empty)
    pub fn add_paths(paths: &[String]) -> Self {
        if paths.is_empty() {
            Self::new().args(["add", "--all"])
        } else {
            Self::new().args(["add", "--all", "--"]).args(paths.iter().cloned())
        }
    }

    /// Commit; with `paths`, only those paths are committed
    pub fn commit(message: &str, paths: &[String]) -> Self {
        let cmd = Self::new().args(["commit", "--quiet", "-m", message]);
        if paths.is_empty() {
            cmd
        } else {
            cmd.arg("--").args(paths.iter().cloned())
        }
    }

    /// Push a local branch to the remote branch of the same name
    pub fn push(branch: &str, set_upstream: bool) -> Self {
        let cmd = Self::new().arg("push").arg("--quiet");
        let cmd = if set_upstream { cmd.arg("--set-upstream") } else { cmd };
        cmd.args([crate::constants::REMOTE_NAME, branch])
    }

    /// Create a command to get the current branch
    pub fn current_branch() -> Self {
        Self::new().args(["branch", "--show-current"])
    }

    /// Create a command to get the remote URL
    pub fn remote_url() -> Self {
        Self::new().args(["remote", "get-url", crate::constants::REMOTE_NAME])
    }

    /// Add a detached worktree at `reference`
    pub fn worktree_add_detached(worktree_path: impl AsRef<Path>, reference: &str) -> Self {
        Self::new().args([
            "worktree".to_string(),
            "add".to_string(),
            "--detach".to_string(),
            "--quiet".to_string(),
            worktree_path.as_ref().display().to_string(),
            reference.to_string(),
        ])
    }

    /// Remove a worktree, discarding its changes
    pub fn worktree_remove(worktree_path: impl AsRef<Path>) -> Self {
        Self::new().args([
            "worktree",
            "remove",
            "--force",
            &worktree_path.as_ref().display().to_string(),
        ])
    }

    /// Prune stale worktree administrative files
    pub fn worktree_prune() -> Self {
        Self::new().args(["worktree", "prune"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder_basic() {
        let cmd = GitCommand::new().arg("status").arg("--short");
        assert_eq!(cmd.args, vec!["status", "--short"]);
        assert_eq!(cmd.operation(), "status");
        assert_eq!(GitCommand::status_porcelain().operation(), "status");
        assert_eq!(GitCommand::merge_tree("HEAD", "origin/main").operation(), "merge-tree");
    }

    #[test]
    fn test_prompts_disabled_by_default() {
        let cmd = GitCommand::new();
        assert!(cmd.env_vars.iter().any(|(k, v)| k == "GIT_TERMINAL_PROMPT" && v == "0"));
    }

    #[tokio::test]
    async fn test_git_version_runs() {
        let output = GitCommand::new().args(["--version"]).execute().await.unwrap();
        assert!(output.stdout.starts_with("git version"));
    }

    #[tokio::test]
    async fn test_failure_is_classified() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = GitCommand::rev_parse("HEAD")
            .current_dir(temp.path())
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BkstgError>(),
            Some(BkstgError::GitCommandError { .. })
        ));
    }

    #[test]
    fn test_clone_builder_local_url_skips_filter() {
        let cmd = GitCommand::clone_no_checkout("file:///srv/repo.git", "main", "/tmp/target");
        assert_eq!(cmd.args[0], "clone");
        assert!(!cmd.args.iter().any(|a| a.starts_with("--filter")));
        assert_eq!(cmd.remote_url.as_deref(), Some("file:///srv/repo.git"));
    }

    #[test]
    fn test_clone_builder_remote_url_uses_filter() {
        let cmd =
            GitCommand::clone_no_checkout("https://github.com/acme/cat.git", "main", "/tmp/t");
        assert!(cmd.args.contains(&"--filter=blob:none".to_string()));
    }

    #[test]
    fn test_fetch_branch_refspec() {
        let cmd = GitCommand::fetch_branch("main");
        assert_eq!(cmd.args.last().unwrap(), "+refs/heads/main:refs/remotes/origin/main");
    }

    #[test]
    fn test_commit_with_paths() {
        let cmd = GitCommand::commit("msg", &["catalogs/a.yaml".to_string()]);
        assert_eq!(cmd.args, vec!["commit", "--quiet", "-m", "msg", "--", "catalogs/a.yaml"]);
    }

    #[test]
    fn test_push_with_upstream() {
        let cmd = GitCommand::push("bkstg-sync-1", true);
        assert_eq!(cmd.args, vec!["push", "--quiet", "--set-upstream", "origin", "bkstg-sync-1"]);
    }
}
