//! Version-control capability interface.
//!
//! Everything above this module talks to the version-control client through
//! [`VcsTransport::execute`], passing a [`GitOp`] and receiving a [`GitOutput`].
//! The sync state machine and the clone manager are therefore testable against
//! an in-memory fake (see `test_utils::FakeVcs`) and are not tied to a specific
//! client binary.
//!
//! [`GitCliTransport`] is the production implementation. It drives the system
//! `git` binary through [`command_builder::GitCommand`], which applies
//! timeouts and classifies failures into [`crate::core::BkstgError`].
//!
//! # Read-only operations
//!
//! [`GitOp::is_read_only`] marks the operations the state detector may use:
//! they never touch the working tree or the index. Fetch only updates
//! remote-tracking refs. The trial merge runs in memory (`merge-tree`), or in a
//! throwaway worktree on Git versions without `merge-tree --write-tree`.

pub mod command_builder;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::constants::{GIT_CLONE_TIMEOUT, GIT_FETCH_TIMEOUT};
use crate::core::BkstgError;
use command_builder::GitCommand;

/// Outcome of a merge or trial merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The histories merge without textual conflicts
    Clean,
    /// Paths that conflict, relative to the repository root
    Conflict(Vec<String>),
}

/// One operation against a repository working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOp {
    /// Clone `url` at `branch` into the target path, checking out only
    /// `sparse_paths` (everything when empty)
    SparseClone {
        /// Remote URL
        url: String,
        /// Branch to check out
        branch: String,
        /// Directories to include in the sparse checkout
        sparse_paths: Vec<String>,
    },
    /// Update the remote-tracking ref of `branch`
    Fetch {
        /// Branch to fetch
        branch: String,
    },
    /// Resolve a reference to a commit id
    RevParse {
        /// Reference (e.g., `HEAD`, `origin/main`)
        reference: String,
    },
    /// Whether `ancestor` is reachable from `descendant`
    IsAncestor {
        /// Candidate ancestor
        ancestor: String,
        /// Candidate descendant
        descendant: String,
    },
    /// Number of commits reachable from `to` but not from `from`
    CountCommits {
        /// Exclusive lower bound
        from: String,
        /// Inclusive upper bound
        to: String,
    },
    /// Non-destructive merge of `theirs` into `ours`
    TrialMerge {
        /// Our side
        ours: String,
        /// Their side
        theirs: String,
    },
    /// Reset working tree, index and current branch to `reference`
    ResetHard {
        /// Target reference
        reference: String,
    },
    /// Delete untracked files and directories
    CleanUntracked,
    /// Fast-forward the current branch to `reference`
    MergeFastForward {
        /// Target reference
        reference: String,
    },
    /// Merge `reference` into the current branch
    Merge {
        /// Reference to merge
        reference: String,
    },
    /// Abort an in-progress merge
    AbortMerge,
    /// Porcelain status of the working tree
    StatusPorcelain,
    /// Stage `paths` (all changes when empty)
    Stage {
        /// Paths relative to the repository root
        paths: Vec<String>,
    },
    /// Commit staged changes; with `paths`, only those paths
    Commit {
        /// Commit message
        message: String,
        /// Paths relative to the repository root
        paths: Vec<String>,
    },
    /// Push local `branch` to the remote branch of the same name
    Push {
        /// Branch to push
        branch: String,
        /// Record the remote branch as upstream
        set_upstream: bool,
    },
    /// Create `name` at HEAD and switch to it
    CreateBranch {
        /// New branch name
        name: String,
    },
    /// Switch to an existing branch
    Checkout {
        /// Branch name
        branch: String,
    },
    /// Name of the checked-out branch
    CurrentBranch,
    /// URL of the remote
    RemoteUrl,
}

impl GitOp {
    /// Operations that never modify the working tree, the index or local
    /// branches.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::RevParse { .. }
                | Self::IsAncestor { .. }
                | Self::CountCommits { .. }
                | Self::TrialMerge { .. }
                | Self::StatusPorcelain
                | Self::CurrentBranch
                | Self::RemoteUrl
        )
    }

    /// Operations that talk to the remote.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::SparseClone { .. } | Self::Fetch { .. } | Self::Push { .. })
    }

    /// Short name for logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SparseClone { .. } => "clone",
            Self::Fetch { .. } => "fetch",
            Self::RevParse { .. } => "rev-parse",
            Self::IsAncestor { .. } => "is-ancestor",
            Self::CountCommits { .. } => "count-commits",
            Self::TrialMerge { .. } => "trial-merge",
            Self::ResetHard { .. } => "reset",
            Self::CleanUntracked => "clean",
            Self::MergeFastForward { .. } => "merge-ff",
            Self::Merge { .. } => "merge",
            Self::AbortMerge => "merge-abort",
            Self::StatusPorcelain => "status",
            Self::Stage { .. } => "add",
            Self::Commit { .. } => "commit",
            Self::Push { .. } => "push",
            Self::CreateBranch { .. } => "create-branch",
            Self::Checkout { .. } => "checkout",
            Self::CurrentBranch => "current-branch",
            Self::RemoteUrl => "remote-url",
        }
    }
}

impl fmt::Display for GitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a [`GitOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOutput {
    /// Operation completed with nothing to report
    Done,
    /// Textual result (commit id, branch name, status)
    Text(String),
    /// Predicate result
    Flag(bool),
    /// Numeric result
    Count(usize),
    /// Merge result
    Merge(MergeOutcome),
}

impl GitOutput {
    fn mismatch(&self, expected: &str) -> anyhow::Error {
        BkstgError::Other {
            message: format!("expected {expected} output from transport, got {self:?}"),
        }
        .into()
    }

    /// Text payload.
    pub fn into_text(self) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    /// Predicate payload.
    pub fn into_flag(self) -> Result<bool> {
        match self {
            Self::Flag(flag) => Ok(flag),
            other => Err(other.mismatch("flag")),
        }
    }

    /// Numeric payload.
    pub fn into_count(self) -> Result<usize> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(other.mismatch("count")),
        }
    }

    /// Merge payload.
    pub fn into_merge(self) -> Result<MergeOutcome> {
        match self {
            Self::Merge(outcome) => Ok(outcome),
            other => Err(other.mismatch("merge")),
        }
    }
}

/// Capability interface over the version-control client.
#[async_trait]
pub trait VcsTransport: Send + Sync {
    /// Run `op` against the working copy at `repo`.
    ///
    /// For [`GitOp::SparseClone`], `repo` is the directory to create.
    async fn execute(&self, repo: &Path, op: GitOp) -> Result<GitOutput>;
}

/// Parses `git status --porcelain` output into changed paths.
///
/// Quoted paths (names with spaces, quotes, control characters or, without
/// `core.quotePath=false`, non-ASCII bytes) are unescaped.
#[must_use]
pub fn parse_porcelain(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| line.get(3..).filter(|path| !path.is_empty()))
        .map(|path| {
            // Renames are reported as "old -> new"
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            unquote_path(path)
        })
        .collect()
}

/// Conflicted paths from `merge-tree --write-tree --name-only --no-messages`:
/// the tree id line, then one path per line up to the first blank line.
#[must_use]
pub fn parse_merge_tree_conflicts(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .map(unquote_path)
        .collect()
}

/// Unmerged index entries of the working tree at `repo`. Empty when the
/// listing itself fails.
async fn unmerged_paths(repo: &Path) -> Vec<String> {
    match GitCommand::unmerged_paths().current_dir(repo).execute_stdout().await {
        Ok(stdout) => stdout.lines().filter(|l| !l.is_empty()).map(unquote_path).collect(),
        Err(e) => {
            tracing::debug!(target: "git", "Failed to list unmerged paths: {e}");
            Vec::new()
        }
    }
}

/// Reverses Git's C-style path quoting, including octal byte escapes.
#[must_use]
pub fn unquote_path(path: &str) -> String {
    let Some(inner) = path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) else {
        return path.to_string();
    };
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes().peekable();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match chars.next() {
            Some(d @ b'0'..=b'7') => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&o @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(o - b'0');
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(u8::try_from(value).unwrap_or(b'?'));
            }
            Some(b'a') => bytes.push(0x07),
            Some(b'b') => bytes.push(0x08),
            Some(b'f') => bytes.push(0x0c),
            Some(b'n') => bytes.push(b'\n'),
            Some(b'r') => bytes.push(b'\r'),
            Some(b't') => bytes.push(b'\t'),
            Some(b'v') => bytes.push(0x0b),
            Some(other) => bytes.push(other),
            None => bytes.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// [`VcsTransport`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCliTransport {
    network_timeout: Duration,
    clone_timeout: Duration,
}

impl Default for GitCliTransport {
    fn default() -> Self {
        Self {
            network_timeout: GIT_FETCH_TIMEOUT,
            clone_timeout: GIT_CLONE_TIMEOUT,
        }
    }
}

impl GitCliTransport {
    /// Creates a transport with explicit network and clone timeouts.
    #[must_use]
    pub const fn new(network_timeout: Duration, clone_timeout: Duration) -> Self {
        Self {
            network_timeout,
            clone_timeout,
        }
    }

    async fn sparse_clone(
        &self,
        target: &Path,
        url: &str,
        branch: &str,
        sparse_paths: &[String],
    ) -> Result<()> {
        GitCommand::clone_no_checkout(url, branch, target)
            .with_timeout(Some(self.clone_timeout))
            .execute_success()
            .await?;

        if !sparse_paths.is_empty() {
            GitCommand::sparse_checkout_set(sparse_paths)
                .current_dir(target)
                .execute_success()
                .await
                .context("Failed to configure sparse checkout")?;
        }

        GitCommand::checkout(branch)
            .current_dir(target)
            .with_timeout(Some(self.clone_timeout))
            .execute_success()
            .await
            .with_context(|| format!("Failed to check out branch '{branch}'"))
    }

    async fn trial_merge(&self, repo: &Path, ours: &str, theirs: &str) -> Result<MergeOutcome> {
        let output = GitCommand::merge_tree(ours, theirs).current_dir(repo).run().await?;
        match output.code {
            Some(0) => Ok(MergeOutcome::Clean),
            Some(1) => Ok(MergeOutcome::Conflict(parse_merge_tree_conflicts(&output.stdout))),
            _ => {
                tracing::debug!(
                    target: "git",
                    "merge-tree --write-tree unavailable, falling back to worktree trial merge"
                );
                self.trial_merge_in_worktree(repo, ours, theirs).await
            }
        }
    }

    /// Trial merge inside a throwaway detached worktree, leaving the main
    /// working tree and index untouched.
    async fn trial_merge_in_worktree(
        &self,
        repo: &Path,
        ours: &str,
        theirs: &str,
    ) -> Result<MergeOutcome> {
        let worktree = std::env::temp_dir().join(format!("bkstg-trial-{}", uuid::Uuid::new_v4()));
        GitCommand::worktree_add_detached(&worktree, ours)
            .current_dir(repo)
            .execute_success()
            .await
            .context("Failed to create trial merge worktree")?;

        let merge = GitCommand::merge_no_commit(theirs)
            .current_dir(&worktree)
            .env("GIT_AUTHOR_NAME", "bkstg")
            .env("GIT_AUTHOR_EMAIL", "bkstg@localhost")
            .env("GIT_COMMITTER_NAME", "bkstg")
            .env("GIT_COMMITTER_EMAIL", "bkstg@localhost")
            .run()
            .await;
        let conflicts = match &merge {
            Ok(output) if !output.success() => unmerged_paths(&worktree).await,
            _ => Vec::new(),
        };

        if let Err(e) = GitCommand::worktree_remove(&worktree).current_dir(repo).execute_success().await
        {
            tracing::warn!("Failed to remove trial merge worktree {}: {e}", worktree.display());
            let _ = crate::utils::fs::remove_dir_all(&worktree).await;
            let _ = GitCommand::worktree_prune().current_dir(repo).execute_success().await;
        }

        let merge = merge?;
        if merge.success() {
            Ok(MergeOutcome::Clean)
        } else if merge.stdout.contains("CONFLICT") || merge.stderr.contains("CONFLICT") {
            Ok(MergeOutcome::Conflict(conflicts))
        } else {
            Err(BkstgError::GitCommandError {
                operation: "merge".to_string(),
                stderr: merge.stderr,
            }
            .into())
        }
    }
}

#[async_trait]
impl VcsTransport for GitCliTransport {
    async fn execute(&self, repo: &Path, op: GitOp) -> Result<GitOutput> {
        let context = repo.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

        let output = match op {
            GitOp::SparseClone { url, branch, sparse_paths } => {
                self.sparse_clone(repo, &url, &branch, &sparse_paths).await?;
                GitOutput::Done
            }
            GitOp::Fetch { branch } => {
                GitCommand::fetch_branch(&branch)
                    .current_dir(repo)
                    .with_context(context)
                    .with_timeout(Some(self.network_timeout))
                    .execute_success()
                    .await?;
                GitOutput::Done
            }
            GitOp::RevParse { reference } => GitOutput::Text(
                GitCommand::rev_parse(&reference).current_dir(repo).execute_stdout().await?,
            ),
            GitOp::IsAncestor { ancestor, descendant } => GitOutput::Flag(
                GitCommand::is_ancestor(&ancestor, &descendant)
                    .current_dir(repo)
                    .execute_predicate()
                    .await?,
            ),
            GitOp::CountCommits { from, to } => {
                let raw =
                    GitCommand::rev_list_count(&from, &to).current_dir(repo).execute_stdout().await?;
                GitOutput::Count(
                    raw.parse().with_context(|| format!("Unexpected rev-list output: {raw}"))?,
                )
            }
            GitOp::TrialMerge { ours, theirs } => {
                GitOutput::Merge(self.trial_merge(repo, &ours, &theirs).await?)
            }
            GitOp::ResetHard { reference } => {
                GitCommand::reset_hard(&reference).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::CleanUntracked => {
                GitCommand::clean().current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::MergeFastForward { reference } => {
                GitCommand::merge_ff_only(&reference).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::Merge { reference } => {
                let output = GitCommand::merge(&reference).current_dir(repo).run().await?;
                if output.success() {
                    GitOutput::Merge(MergeOutcome::Clean)
                } else if output.stdout.contains("CONFLICT") {
                    GitOutput::Merge(MergeOutcome::Conflict(unmerged_paths(repo).await))
                } else {
                    return Err(BkstgError::GitCommandError {
                        operation: "merge".to_string(),
                        stderr: output.stderr,
                    }
                    .into());
                }
            }
            GitOp::AbortMerge => {
                GitCommand::merge_abort().current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::StatusPorcelain => GitOutput::Text(
                GitCommand::status_porcelain().current_dir(repo).execute().await?.stdout,
            ),
            GitOp::Stage { paths } => {
                GitCommand::add_paths(&paths).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::Commit { message, paths } => {
                GitCommand::commit(&message, &paths).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::Push { branch, set_upstream } => {
                let url = GitCommand::remote_url().current_dir(repo).execute_stdout().await.ok();
                let mut cmd = GitCommand::push(&branch, set_upstream)
                    .current_dir(repo)
                    .with_context(context)
                    .with_timeout(Some(self.network_timeout));
                if let Some(url) = url {
                    cmd = cmd.with_remote_url(url);
                }
                cmd.execute_success().await?;
                GitOutput::Done
            }
            GitOp::CreateBranch { name } => {
                GitCommand::checkout_new_branch(&name).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::Checkout { branch } => {
                GitCommand::checkout(&branch).current_dir(repo).execute_success().await?;
                GitOutput::Done
            }
            GitOp::CurrentBranch => GitOutput::Text(
                GitCommand::current_branch().current_dir(repo).execute_stdout().await?,
            ),
            GitOp::RemoteUrl => GitOutput::Text(
                GitCommand::remote_url().current_dir(repo).execute_stdout().await?,
            ),
        };
        Ok(output)
    }
}
