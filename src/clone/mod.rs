//! Working copy lifecycle.
//!
//! [`CloneManager`] owns the clone directory. Every source and every resolved
//! external location gets exactly one sparse working copy, at a deterministic
//! path, so repeated runs reuse prior clones instead of fetching again:
//!
//! ```text
//! ~/.bkstg-clones/
//! ├── .locks/                                 # cross-process file locks
//! ├── .staging/                               # clones in progress
//! ├── acme_platform-catalog_main/             # source clone
//! └── acme_payments_main__loc-1a2b3c4d/       # nested location clone
//! ```
//!
//! # Guarantees
//!
//! - `ensure_clone` is idempotent: an existing valid working copy is returned
//!   without touching the network.
//! - A working copy is never half-initialized: clones are built under
//!   `.staging/` and renamed into place only after the checkout succeeded.
//!   Failure, timeout and caller cancellation remove the staging directory.
//! - A working copy that fails validation is removed and re-cloned once. A
//!   second failure is surfaced as [`BkstgError::CorruptClone`].
//! - Calls for the same working copy are mutually exclusive (in-process keyed
//!   lock plus a file lock); calls for distinct working copies run in parallel.

pub mod lock;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RepositorySource, Settings, repository_url};
use crate::constants::{GIT_CLONE_TIMEOUT, GIT_FETCH_TIMEOUT, REMOTE_NAME};
use crate::core::BkstgError;
use crate::git::{GitOp, VcsTransport};
use crate::utils::KeyedLocks;
use crate::utils::fs::{ensure_dir, remove_dir_all};
use lock::CloneLock;

/// Directory holding clones that are still being built.
pub const STAGING_DIR: &str = ".staging";

/// Everything needed to create one working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// Directory name under the clone root; also the lock key
    pub key: String,
    /// Human-readable name for logs and errors (source name or location id)
    pub label: String,
    /// Remote URL
    pub url: String,
    /// Branch to track
    pub branch: String,
    /// Path inside the repository the catalog lives under
    pub subpath: String,
}

impl CloneSpec {
    /// Spec for a configured source.
    #[must_use]
    pub fn for_source(source: &RepositorySource, settings: &Settings) -> Self {
        Self {
            key: clone_dir_name(&source.owner, &source.repo, &source.branch, None),
            label: source.name.clone(),
            url: source.remote_url(&settings.git_base_url),
            branch: source.branch.clone(),
            subpath: source.subpath.clone(),
        }
    }

    /// Spec for a resolved external location.
    ///
    /// The directory gets a suffix derived from `path` so that two locations
    /// in the same repository and branch never share a sparse checkout.
    #[must_use]
    pub fn for_location(owner: &str, repo: &str, branch: &str, path: &str, base_url: &str) -> Self {
        Self {
            key: clone_dir_name(owner, repo, branch, Some(path)),
            label: format!("{owner}/{repo}@{branch}"),
            url: repository_url(base_url, owner, repo),
            branch: branch.to_string(),
            subpath: path.to_string(),
        }
    }

    /// Directories to include in the sparse checkout.
    ///
    /// A subpath naming a single YAML file checks out its parent directory;
    /// an empty subpath checks out everything.
    #[must_use]
    pub fn sparse_paths(&self) -> Vec<String> {
        let trimmed = self.subpath.trim_matches('/');
        if trimmed.is_empty() {
            return Vec::new();
        }
        let is_file = Path::new(trimmed)
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if is_file {
            match trimmed.rsplit_once('/') {
                Some((parent, _)) => vec![parent.to_string()],
                None => Vec::new(),
            }
        } else {
            vec![trimmed.to_string()]
        }
    }
}

/// `<owner>_<repo>_<branch>` with an optional `__loc-<hash>` suffix.
#[must_use]
pub fn clone_dir_name(owner: &str, repo: &str, branch: &str, nested_path: Option<&str>) -> String {
    let sanitize = |s: &str| {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
            .collect::<String>()
    };
    let base = format!("{}_{}_{}", sanitize(owner), sanitize(repo), sanitize(branch));
    match nested_path {
        Some(path) => {
            let digest = Sha256::digest(path.trim_matches('/').as_bytes());
            format!("{base}__loc-{}", &hex::encode(digest)[..8])
        }
        None => base,
    }
}

/// A working copy managed by [`CloneManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneHandle {
    /// Lock key and directory name
    pub key: String,
    /// Human-readable name
    pub label: String,
    /// Root of the working copy
    pub local_path: PathBuf,
    /// Local branch that is checked out
    pub head_ref: String,
    /// Remote-tracking ref the branch is compared against
    pub remote_tracking_ref: String,
    /// Catalog subpath inside the working copy
    pub subpath: String,
}

impl CloneHandle {
    fn from_spec(spec: &CloneSpec, local_path: PathBuf) -> Self {
        Self {
            key: spec.key.clone(),
            label: spec.label.clone(),
            local_path,
            head_ref: spec.branch.clone(),
            remote_tracking_ref: format!("{REMOTE_NAME}/{}", spec.branch),
            subpath: spec.subpath.clone(),
        }
    }

    /// Directory the catalog is read from.
    #[must_use]
    pub fn catalog_root(&self) -> PathBuf {
        let trimmed = self.subpath.trim_matches('/');
        if trimmed.is_empty() { self.local_path.clone() } else { self.local_path.join(trimmed) }
    }
}

/// Owner of the on-disk clone directory.
#[derive(Clone)]
pub struct CloneManager {
    root: PathBuf,
    transport: Arc<dyn VcsTransport>,
    locks: KeyedLocks,
    clone_timeout: Duration,
    network_timeout: Duration,
}

impl std::fmt::Debug for CloneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneManager").field("root", &self.root).finish_non_exhaustive()
    }
}

impl CloneManager {
    /// Creates a manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn VcsTransport>) -> Self {
        Self {
            root: root.into(),
            transport,
            locks: KeyedLocks::new(),
            clone_timeout: GIT_CLONE_TIMEOUT,
            network_timeout: GIT_FETCH_TIMEOUT,
        }
    }

    /// Overrides the clone and fetch deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, clone_timeout: Duration, network_timeout: Duration) -> Self {
        self.clone_timeout = clone_timeout;
        self.network_timeout = network_timeout;
        self
    }

    /// Root of the clone directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Transport used for every Git operation.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn VcsTransport> {
        &self.transport
    }

    /// Deterministic path of the working copy for `spec`.
    #[must_use]
    pub fn clone_path(&self, spec: &CloneSpec) -> PathBuf {
        self.root.join(&spec.key)
    }

    /// Handle for an existing working copy, without validating it.
    #[must_use]
    pub fn handle(&self, spec: &CloneSpec) -> Option<CloneHandle> {
        let path = self.clone_path(spec);
        path.is_dir().then(|| CloneHandle::from_spec(spec, path))
    }

    /// Creates the working copy if absent; otherwise returns the existing one.
    pub async fn ensure_clone(&self, spec: &CloneSpec) -> Result<CloneHandle> {
        self.ensure_clone_with_cancel(spec, std::future::pending()).await
    }

    /// [`ensure_clone`](Self::ensure_clone) that gives up as soon as `cancel`
    /// completes, removing any partial working copy.
    pub async fn ensure_clone_with_cancel(
        &self,
        spec: &CloneSpec,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<CloneHandle> {
        let _guard = self.locks.lock(&spec.key).await;
        ensure_dir(&self.root)?;
        let _file_lock = CloneLock::acquire(&self.root, &spec.key).await?;

        let path = self.clone_path(spec);
        let mut recloning = false;
        if path.exists() {
            match self.validate(&path).await {
                Ok(()) => {
                    tracing::debug!("Reusing working copy for '{}' at {}", spec.label, path.display());
                    return Ok(CloneHandle::from_spec(spec, path));
                }
                Err(reason) => {
                    tracing::warn!(
                        "Working copy for '{}' is corrupt ({reason}), re-cloning",
                        spec.label
                    );
                    remove_dir_all(&path).await?;
                    recloning = true;
                }
            }
        }

        self.create(spec, &path, cancel).await?;

        if let Err(reason) = self.validate(&path).await {
            remove_dir_all(&path).await?;
            let attempt = if recloning { "re-clone" } else { "fresh clone" };
            return Err(BkstgError::CorruptClone {
                path: path.display().to_string(),
                reason: format!("{attempt} failed validation: {reason}"),
            }
            .into());
        }

        Ok(CloneHandle::from_spec(spec, path))
    }

    /// Builds the clone under `.staging/` and renames it into place.
    async fn create(
        &self,
        spec: &CloneSpec,
        path: &Path,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let staging_root = self.root.join(STAGING_DIR);
        ensure_dir(&staging_root)?;
        let staging = staging_root.join(format!("{}-{}", spec.key, uuid::Uuid::new_v4()));

        tracing::info!("Cloning '{}' from {} (branch {})", spec.label, spec.url, spec.branch);

        let op = GitOp::SparseClone {
            url: spec.url.clone(),
            branch: spec.branch.clone(),
            sparse_paths: spec.sparse_paths(),
        };
        let clone = tokio::time::timeout(self.clone_timeout, self.transport.execute(&staging, op));
        tokio::pin!(cancel);

        let outcome: Result<()> = tokio::select! {
            result = clone => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(BkstgError::Timeout {
                    operation: format!("clone of {}", spec.url),
                    seconds: self.clone_timeout.as_secs(),
                }
                .into()),
            },
            () = &mut cancel => Err(BkstgError::Cancelled {
                operation: format!("clone of '{}'", spec.label),
            }
            .into()),
        };

        if let Err(e) = outcome {
            if let Err(cleanup) = remove_dir_all(&staging).await {
                tracing::warn!("Failed to clean up staging clone: {cleanup:#}");
            }
            return Err(e.context(format!("Failed to clone '{}'", spec.label)));
        }

        tokio::fs::rename(&staging, path).await.with_context(|| {
            format!("Failed to move clone into place at {}", path.display())
        })?;
        Ok(())
    }

    /// A working copy is valid when it has Git metadata and a resolvable HEAD.
    async fn validate(&self, path: &Path) -> std::result::Result<(), String> {
        if !path.join(".git").exists() {
            return Err("missing .git directory".to_string());
        }
        self.transport
            .execute(
                path,
                GitOp::RevParse {
                    reference: "HEAD".to_string(),
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| format!("HEAD does not resolve: {e}"))
    }

    /// Fetches remote refs. Never touches the working tree.
    pub async fn refresh(&self, handle: &CloneHandle) -> Result<()> {
        self.refresh_with_cancel(handle, std::future::pending()).await
    }

    /// [`refresh`](Self::refresh) with caller-supplied cancellation.
    pub async fn refresh_with_cancel(
        &self,
        handle: &CloneHandle,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let _guard = self.locks.lock(&handle.key).await;
        let fetch = tokio::time::timeout(
            self.network_timeout,
            self.transport.execute(
                &handle.local_path,
                GitOp::Fetch {
                    branch: handle.head_ref.clone(),
                },
            ),
        );
        tokio::pin!(cancel);

        tokio::select! {
            result = fetch => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e.context(format!("Failed to fetch '{}'", handle.label))),
                Err(_) => Err(BkstgError::Timeout {
                    operation: format!("fetch of '{}'", handle.label),
                    seconds: self.network_timeout.as_secs(),
                }
                .into()),
            },
            () = &mut cancel => Err(BkstgError::Cancelled {
                operation: format!("fetch of '{}'", handle.label),
            }
            .into()),
        }
    }

    /// Hard-resets the working tree to `reference` and deletes untracked
    /// files, discarding all local changes.
    pub async fn reset(&self, handle: &CloneHandle, reference: &str) -> Result<()> {
        let _guard = self.locks.lock(&handle.key).await;
        tracing::info!("Resetting '{}' to {}", handle.label, reference);
        self.transport
            .execute(
                &handle.local_path,
                GitOp::ResetHard {
                    reference: reference.to_string(),
                },
            )
            .await
            .with_context(|| format!("Failed to reset '{}' to {reference}", handle.label))?;
        self.transport
            .execute(&handle.local_path, GitOp::CleanUntracked)
            .await
            .with_context(|| format!("Failed to clean '{}'", handle.label))?;
        Ok(())
    }

    /// Deletes the working copy.
    pub async fn remove(&self, handle: &CloneHandle) -> Result<()> {
        let _guard = self.locks.lock(&handle.key).await;
        let _file_lock = CloneLock::acquire(&self.root, &handle.key).await?;
        tracing::info!("Removing working copy {}", handle.local_path.display());
        remove_dir_all(&handle.local_path).await
    }

    /// Deletes and re-creates the working copy from scratch.
    pub async fn reclone(&self, spec: &CloneSpec) -> Result<CloneHandle> {
        if let Some(handle) = self.handle(spec) {
            self.remove(&handle).await?;
        }
        self.ensure_clone(spec).await
    }

    /// Brings an untouched working copy up to its fetched remote head.
    ///
    /// Used for read-only location clones. Does nothing when local-only
    /// commits or uncommitted changes exist, or when the remote is not ahead.
    /// Returns whether the working copy moved.
    pub async fn fast_forward_if_behind(&self, handle: &CloneHandle) -> Result<bool> {
        let _guard = self.locks.lock(&handle.key).await;
        let path = &handle.local_path;

        let status = self.transport.execute(path, GitOp::StatusPorcelain).await?.into_text()?;
        if !status.trim().is_empty() {
            return Ok(false);
        }

        let head = self
            .transport
            .execute(path, GitOp::RevParse { reference: "HEAD".to_string() })
            .await?
            .into_text()?;
        let remote = self
            .transport
            .execute(path, GitOp::RevParse { reference: handle.remote_tracking_ref.clone() })
            .await?
            .into_text()?;
        if head == remote {
            return Ok(false);
        }

        let behind = self
            .transport
            .execute(
                path,
                GitOp::IsAncestor {
                    ancestor: head,
                    descendant: remote,
                },
            )
            .await?
            .into_flag()?;
        if !behind {
            return Ok(false);
        }

        self.transport
            .execute(path, GitOp::MergeFastForward { reference: handle.remote_tracking_ref.clone() })
            .await?;
        Ok(true)
    }
}
