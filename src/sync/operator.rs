//! Mutating synchronization operations.
//!
//! Every operation on one repository runs under that repository's entry in a
//! [`KeyedLocks`] table, so two pulls (or a pull and a push) on the same source
//! never interleave while distinct sources proceed concurrently.
//!
//! | Operation                | Allowed from                                  |
//! |--------------------------|-----------------------------------------------|
//! | `pull`                   | any state; diverged histories fail with `PullConflict` |
//! | `push`                   | `LOCAL_AHEAD` (`SYNCED` is a no-op)           |
//! | `create_review_request`  | `DIVERGED`, `CONFLICT`, and `LOCAL_AHEAD` under `ahead_or_diverged` |
//! | `force_sync`             | any cloned state                              |
//!
//! `force_sync` is destructive and is never reached from a read path.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::state::{Comparison, StateDetector, SyncState, unmerged_in_status};
use crate::clone::{CloneHandle, CloneManager, CloneSpec};
use crate::config::{RepositorySource, ReviewRequestPolicy, Settings};
use crate::core::BkstgError;
use crate::git::{GitOp, GitOutput};
use crate::hosting::{CreateReviewRequest, HostingClient, ReviewRequest};
use crate::utils::{KeyedLocks, atomic_write, normalize_path};

/// Outcome of a successful sync operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Configured source name
    pub source_name: String,
    /// State after the operation
    pub state: SyncState,
    /// Human-readable summary
    pub message: String,
}

/// Mutating operations over source working copies.
#[derive(Clone)]
pub struct SyncOperator {
    clones: CloneManager,
    detector: StateDetector,
    hosting: Arc<dyn HostingClient>,
    settings: Settings,
    locks: KeyedLocks,
}

impl std::fmt::Debug for SyncOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOperator").field("clones", &self.clones).finish_non_exhaustive()
    }
}

impl SyncOperator {
    /// Creates an operator.
    pub fn new(clones: CloneManager, hosting: Arc<dyn HostingClient>, settings: Settings) -> Self {
        Self {
            detector: StateDetector::new(clones.clone()),
            clones,
            hosting,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Read-only detector over the same working copies.
    #[must_use]
    pub const fn detector(&self) -> &StateDetector {
        &self.detector
    }

    /// Clone specification for a source under the current settings.
    #[must_use]
    pub fn spec(&self, source: &RepositorySource) -> CloneSpec {
        CloneSpec::for_source(source, &self.settings)
    }

    fn require_handle(&self, source: &RepositorySource) -> Result<CloneHandle> {
        self.clones.handle(&self.spec(source)).ok_or_else(|| {
            BkstgError::NotCloned {
                source_name: source.name.clone(),
            }
            .into()
        })
    }

    async fn run(&self, handle: &CloneHandle, op: GitOp) -> Result<GitOutput> {
        let name = op.name();
        self.clones
            .transport()
            .execute(&handle.local_path, op)
            .await
            .with_context(|| format!("git {name} failed for '{}'", handle.label))
    }

    /// Fails while a merge left unmerged paths: staging them would record the
    /// conflict markers as the resolution.
    async fn refuse_unmerged(&self, handle: &CloneHandle, operation: &str) -> Result<()> {
        let status = self.run(handle, GitOp::StatusPorcelain).await?.into_text()?;
        let unmerged = unmerged_in_status(&status);
        if unmerged.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            target: "sync",
            "Refusing to {operation} '{}' with unmerged paths: {}",
            handle.label,
            unmerged.join(", ")
        );
        Err(BkstgError::InvalidSyncState {
            operation: operation.to_string(),
            state: format!("{} (unmerged: {})", SyncState::Conflict, unmerged.join(", ")),
        }
        .into())
    }

    /// Commits every pending change on the checked-out branch. Returns the
    /// number of files committed.
    async fn commit_pending(
        &self,
        handle: &CloneHandle,
        operation: &str,
        message: impl FnOnce(usize) -> String,
    ) -> Result<usize> {
        self.refuse_unmerged(handle, operation).await?;
        let paths = self.detector.uncommitted_paths(handle).await?;
        if paths.is_empty() {
            return Ok(0);
        }
        let count = paths.len();
        self.run(handle, GitOp::Stage { paths: Vec::new() }).await?;
        self.run(
            handle,
            GitOp::Commit {
                message: message(count),
                paths: Vec::new(),
            },
        )
        .await?;
        tracing::info!(target: "sync", "Committed {count} pending file(s) in '{}'", handle.label);
        Ok(count)
    }

    /// Fetches and integrates remote changes.
    ///
    /// Clones the source first if needed. Fast-forwards when the remote is
    /// ahead; fails with [`BkstgError::PullConflict`] when histories diverged,
    /// leaving the working copy untouched so the caller can re-query state.
    pub async fn pull(&self, source: &RepositorySource) -> Result<SyncResult> {
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;

        let handle = self.clones.ensure_clone(&spec).await?;
        self.clones.refresh(&handle).await?;

        let Comparison { state, .. } = self.detector.compare(&handle).await?;
        let message = match state {
            SyncState::Synced | SyncState::LocalAhead(_) => "Already up to date".to_string(),
            SyncState::RemoteAhead(n) => {
                self.run(
                    &handle,
                    GitOp::MergeFastForward {
                        reference: handle.remote_tracking_ref.clone(),
                    },
                )
                .await?;
                format!("Pulled {n} commit(s)")
            }
            SyncState::Diverged | SyncState::Conflict => {
                return Err(BkstgError::PullConflict {
                    source_name: source.name.clone(),
                }
                .into());
            }
            SyncState::NotCloned | SyncState::Unknown => {
                return Err(BkstgError::InvalidSyncState {
                    operation: "pull".to_string(),
                    state: state.to_string(),
                }
                .into());
            }
        };

        let after = self.detector.compare(&handle).await?.state;
        tracing::info!(target: "sync", "Pull of '{}': {message}", source.name);
        Ok(SyncResult {
            source_name: source.name.clone(),
            state: after,
            message,
        })
    }

    /// Publishes local commits to the source branch.
    ///
    /// Pending changes are committed first. The push updates the
    /// remote-tracking ref, so a subsequent state check reports `SYNCED`
    /// without another fetch.
    pub async fn push(&self, source: &RepositorySource) -> Result<SyncResult> {
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;
        let handle = self.require_handle(source)?;

        self.commit_pending(&handle, "push", |n| format!("bkstg: Update {n} file(s)")).await?;
        self.clones.refresh(&handle).await?;

        let Comparison { state, ahead, .. } = self.detector.compare(&handle).await?;
        match state {
            SyncState::LocalAhead(_) => {}
            SyncState::Synced => {
                return Ok(SyncResult {
                    source_name: source.name.clone(),
                    state,
                    message: "Nothing to push".to_string(),
                });
            }
            other => {
                return Err(BkstgError::InvalidSyncState {
                    operation: "push".to_string(),
                    state: other.to_string(),
                }
                .into());
            }
        }

        self.run(
            &handle,
            GitOp::Push {
                branch: handle.head_ref.clone(),
                set_upstream: false,
            },
        )
        .await?;

        let after = self.detector.compare(&handle).await?.state;
        tracing::info!(target: "sync", "Pushed {ahead} commit(s) from '{}'", source.name);
        Ok(SyncResult {
            source_name: source.name.clone(),
            state: after,
            message: format!("Pushed {ahead} commit(s)"),
        })
    }

    /// Opens a review request from the local head on a new branch.
    ///
    /// The source branch itself is never pushed and stays checked out
    /// afterwards, whatever the outcome.
    pub async fn create_review_request(
        &self,
        source: &RepositorySource,
        title: &str,
        body: &str,
    ) -> Result<ReviewRequest> {
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;
        let handle = self.require_handle(source)?;

        let branch = format!(
            "{}{}",
            self.settings.review_branch_prefix,
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );

        self.commit_pending(&handle, "create a review request", |_| {
            format!("bkstg: Changes for PR {branch}")
        })
        .await?;
        self.clones.refresh(&handle).await?;
        let state = self.detector.compare(&handle).await?.state;
        check_review_allowed(state, self.settings.review_request_policy)?;

        self.run(&handle, GitOp::CreateBranch { name: branch.clone() }).await?;

        let result = self.publish_review_branch(source, &handle, &branch, title, body).await;

        if let Err(e) = self
            .run(
                &handle,
                GitOp::Checkout {
                    branch: handle.head_ref.clone(),
                },
            )
            .await
        {
            tracing::error!(target: "sync", "Failed to switch '{}' back to {}: {e:#}", source.name, handle.head_ref);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    async fn publish_review_branch(
        &self,
        source: &RepositorySource,
        handle: &CloneHandle,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<ReviewRequest> {
        self.run(
            handle,
            GitOp::Push {
                branch: branch.to_string(),
                set_upstream: true,
            },
        )
        .await?;

        let request = self
            .hosting
            .create_review_request(CreateReviewRequest {
                repository: source.slug(),
                head: branch.to_string(),
                base: source.branch.clone(),
                title: title.to_string(),
                body: body.to_string(),
            })
            .await?;
        tracing::info!(target: "sync", "Opened review request for '{}': {}", source.name, request.url);
        Ok(request)
    }

    /// Discards every local commit and change, resetting to the freshly
    /// fetched remote head.
    ///
    /// Falls back to a full re-clone when the reset itself fails.
    pub async fn force_sync(&self, source: &RepositorySource) -> Result<SyncResult> {
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;
        let handle = self.require_handle(source)?;

        self.clones.refresh(&handle).await?;

        let reset = async {
            // An interrupted merge blocks reset on some Git versions
            let _ = self.run(&handle, GitOp::AbortMerge).await;
            self.clones.reset(&handle, &handle.remote_tracking_ref).await
        };
        let handle = match reset.await {
            Ok(()) => handle,
            Err(e) => {
                tracing::warn!(
                    target: "sync",
                    "Reset of '{}' failed, re-cloning: {e:#}",
                    source.name
                );
                self.clones.reclone(&spec).await?
            }
        };

        let after = self.detector.compare(&handle).await?.state;
        tracing::warn!(target: "sync", "Force-synced '{}', local changes discarded", source.name);
        Ok(SyncResult {
            source_name: source.name.clone(),
            state: after,
            message: "Force sync complete - local changes discarded".to_string(),
        })
    }

    /// Commits `changed_paths` (relative to the working copy root) after an
    /// external write. Does nothing when the source disables auto-commit or
    /// none of the paths changed. Never pushes.
    ///
    /// Returns the new head commit when a commit was made.
    pub async fn auto_commit(
        &self,
        source: &RepositorySource,
        changed_paths: &[String],
        message: &str,
    ) -> Result<Option<String>> {
        if !auto_commits(source) || changed_paths.is_empty() {
            return Ok(None);
        }
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;
        let handle = self.require_handle(source)?;

        self.refuse_unmerged(&handle, "auto-commit").await?;
        self.commit_paths(&handle, &source.name, changed_paths, message).await
    }

    /// Writes `content` to `target` in the working copy and auto-commits it.
    ///
    /// The write and the commit run under one hold of the repository lock, so
    /// a concurrent `force_sync` either runs before the write or discards the
    /// finished commit; it can never drop the file in between. `target` must
    /// lie inside the working copy.
    ///
    /// Returns the new head commit when a commit was made.
    pub async fn write_and_commit(
        &self,
        source: &RepositorySource,
        target: &Path,
        content: &[u8],
        message: &str,
    ) -> Result<Option<String>> {
        let spec = self.spec(source);
        let _guard = self.locks.lock(&spec.key).await;
        let handle = self.require_handle(source)?;

        let in_clone = normalize_path(target)
            .strip_prefix(normalize_path(&handle.local_path))
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .map_err(|_| BkstgError::Other {
                message: format!("{} is outside the working copy of '{}'", target.display(), source.name),
            })?;

        let commit = auto_commits(source);
        if commit {
            self.refuse_unmerged(&handle, "auto-commit").await?;
        }
        atomic_write(target, content)?;
        tracing::debug!(target: "sync", "Wrote {in_clone} in '{}'", source.name);

        if !commit {
            return Ok(None);
        }
        self.commit_paths(&handle, &source.name, &[in_clone], message).await
    }

    /// Stages and commits whichever of `changed_paths` are dirty. The caller
    /// holds the repository lock.
    async fn commit_paths(
        &self,
        handle: &CloneHandle,
        source_name: &str,
        changed_paths: &[String],
        message: &str,
    ) -> Result<Option<String>> {
        let dirty = self.detector.uncommitted_paths(handle).await?;
        let paths: Vec<String> =
            changed_paths.iter().filter(|p| dirty.contains(p)).cloned().collect();
        if paths.is_empty() {
            return Ok(None);
        }

        self.run(handle, GitOp::Stage { paths: paths.clone() }).await?;
        self.run(
            handle,
            GitOp::Commit {
                message: message.to_string(),
                paths,
            },
        )
        .await?;

        let head = self.run(handle, GitOp::RevParse { reference: "HEAD".to_string() }).await?.into_text()?;
        tracing::debug!(target: "sync", "Auto-committed {} in '{source_name}'", &head[..head.len().min(8)]);
        Ok(Some(head))
    }

    /// Open review requests previously created by bkstg for this source.
    pub async fn list_open_review_requests(&self, source: &RepositorySource) -> Result<Vec<ReviewRequest>> {
        self.hosting
            .list_open_review_requests(&source.slug(), &self.settings.review_branch_prefix)
            .await
    }

    /// Fetches every cloned source. Sources are independent; one failure does
    /// not stop the others.
    pub async fn refresh_all(&self, sources: &[RepositorySource]) -> Vec<(String, Result<()>)> {
        let tasks = sources.iter().filter(|s| s.is_syncable()).map(|source| async move {
            let result = match self.clones.handle(&self.spec(source)) {
                Some(handle) => {
                    let _guard = self.locks.lock(&handle.key).await;
                    self.clones.refresh(&handle).await
                }
                None => Ok(()),
            };
            (source.name.clone(), result)
        });
        futures::future::join_all(tasks).await
    }
}

fn auto_commits(source: &RepositorySource) -> bool {
    source.auto_commit && source.is_syncable()
}

fn check_review_allowed(state: SyncState, policy: ReviewRequestPolicy) -> Result<()> {
    match (state, policy) {
        (SyncState::Diverged | SyncState::Conflict, _)
        | (SyncState::LocalAhead(_), ReviewRequestPolicy::AheadOrDiverged) => Ok(()),
        (SyncState::LocalAhead(_), ReviewRequestPolicy::DivergedOnly) => {
            Err(BkstgError::ReviewRequestNotAllowed {
                state: state.to_string(),
                policy: policy.to_string(),
            }
            .into())
        }
        _ => Err(BkstgError::InvalidSyncState {
            operation: "create a review request".to_string(),
            state: state.to_string(),
        }
        .into()),
    }
}
