//! Read-only synchronization state detection.
//!
//! [`StateDetector`] compares a working copy's local head with its
//! remote-tracking ref. It may fetch (which only moves remote-tracking refs)
//! but never touches the working tree, the index or local branches, so it is
//! safe to call as often as a UI refreshes.
//!
//! The comparison is ref-based: uncommitted changes are reported separately in
//! [`SyncStatus::uncommitted`] and do not change the [`SyncState`].

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;

use crate::clone::{CloneHandle, CloneManager, CloneSpec};
use crate::constants::STATE_CHECK_RETRY_DELAY_MS;
use crate::core::is_retryable;
use crate::git::{GitOp, MergeOutcome, parse_porcelain, unquote_path};

/// Relationship between a working copy and its remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "commits", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// No working copy exists
    NotCloned,
    /// Local head equals the remote-tracking ref
    Synced,
    /// Local has this many commits the remote lacks
    LocalAhead(usize),
    /// Remote has this many commits local lacks
    RemoteAhead(usize),
    /// Both sides have unique commits that merge cleanly
    Diverged,
    /// Both sides have unique commits that conflict
    Conflict,
    /// State could not be determined (network, auth, timeout)
    Unknown,
}

impl SyncState {
    /// Whether local has commits to publish.
    #[must_use]
    pub const fn has_local_commits(self) -> bool {
        matches!(self, Self::LocalAhead(_) | Self::Diverged | Self::Conflict)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCloned => write!(f, "NOT_CLONED"),
            Self::Synced => write!(f, "SYNCED"),
            Self::LocalAhead(n) => write!(f, "LOCAL_AHEAD({n})"),
            Self::RemoteAhead(n) => write!(f, "REMOTE_AHEAD({n})"),
            Self::Diverged => write!(f, "DIVERGED"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Per-source status row as shown by `bkstg sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Configured source name
    pub source_name: String,
    /// Detected state
    pub state: SyncState,
    /// Commits only on the local side
    pub ahead: usize,
    /// Commits only on the remote side
    pub behind: usize,
    /// Files with uncommitted changes
    pub uncommitted: usize,
    /// Conflicting files when the state is `CONFLICT`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    /// Human-readable summary
    pub message: String,
}

impl SyncStatus {
    fn new(source_name: &str, comparison: Comparison, uncommitted: usize) -> Self {
        let Comparison { state, ahead, behind, conflicts } = comparison;
        let mut message = match state {
            SyncState::NotCloned => "Not cloned".to_string(),
            SyncState::Synced => "Up to date".to_string(),
            SyncState::LocalAhead(n) => format!("{n} commit(s) to push"),
            SyncState::RemoteAhead(n) => format!("{n} commit(s) to pull"),
            SyncState::Diverged => format!("+{ahead}/-{behind} commits diverged"),
            SyncState::Conflict => "Merge conflicts detected".to_string(),
            SyncState::Unknown => "Unable to get status".to_string(),
        };
        if uncommitted > 0 {
            message.push_str(&format!(", {uncommitted} uncommitted change(s)"));
        }
        Self {
            source_name: source_name.to_string(),
            state,
            ahead,
            behind,
            uncommitted,
            conflicts,
            message,
        }
    }
}

/// Result of comparing local head with the remote-tracking ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Comparison {
    pub state: SyncState,
    pub ahead: usize,
    pub behind: usize,
    /// Conflicting paths, only for [`SyncState::Conflict`]
    pub conflicts: Vec<String>,
}

impl Comparison {
    const fn of(state: SyncState, ahead: usize, behind: usize) -> Self {
        Self {
            state,
            ahead,
            behind,
            conflicts: Vec::new(),
        }
    }
}

/// Porcelain codes for unmerged paths.
const UNMERGED: &[&str] = &["DD", "AU", "UD", "UA", "DU", "AA", "UU"];

/// Paths with unmerged entries in `git status --porcelain` output, as left by
/// an interrupted merge.
pub(crate) fn unmerged_in_status(status: &str) -> Vec<String> {
    status
        .lines()
        .filter(|line| line.get(..2).is_some_and(|code| UNMERGED.contains(&code)))
        .filter_map(|line| line.get(3..))
        .map(unquote_path)
        .collect()
}

/// Read-only state computation over working copies.
#[derive(Debug, Clone)]
pub struct StateDetector {
    clones: CloneManager,
}

impl StateDetector {
    /// Creates a detector over the working copies of `clones`.
    #[must_use]
    pub const fn new(clones: CloneManager) -> Self {
        Self {
            clones,
        }
    }

    /// Current state of the working copy for `spec`.
    ///
    /// With `fetch`, remote-tracking refs are updated first; a retryable
    /// failure is retried once. Any failure yields [`SyncState::Unknown`].
    pub async fn compute_state(&self, spec: &CloneSpec, fetch: bool) -> SyncState {
        let Some(handle) = self.clones.handle(spec) else {
            return SyncState::NotCloned;
        };
        match self.inspect(&handle, fetch).await {
            Ok(comparison) => comparison.state,
            Err(e) => {
                tracing::warn!(target: "sync", "State check for '{}' failed: {e:#}", handle.label);
                SyncState::Unknown
            }
        }
    }

    /// State plus ahead/behind and uncommitted counts for one source.
    pub async fn status(&self, source_name: &str, spec: &CloneSpec, fetch: bool) -> SyncStatus {
        let Some(handle) = self.clones.handle(spec) else {
            return SyncStatus::new(source_name, Comparison::of(SyncState::NotCloned, 0, 0), 0);
        };
        let comparison = match self.inspect(&handle, fetch).await {
            Ok(comparison) => comparison,
            Err(e) => {
                tracing::warn!(target: "sync", "State check for '{source_name}' failed: {e:#}");
                return SyncStatus::new(source_name, Comparison::of(SyncState::Unknown, 0, 0), 0);
            }
        };
        let uncommitted = match self.uncommitted_paths(&handle).await {
            Ok(paths) => paths.len(),
            Err(e) => {
                tracing::warn!(target: "sync", "Status of '{source_name}' failed: {e:#}");
                0
            }
        };
        SyncStatus::new(source_name, comparison, uncommitted)
    }

    async fn inspect(&self, handle: &CloneHandle, fetch: bool) -> Result<Comparison> {
        if fetch {
            self.fetch_with_retry(handle).await?;
        }
        self.compare(handle).await
    }

    /// Fetches, retrying once on network failures and timeouts.
    pub(crate) async fn fetch_with_retry(&self, handle: &CloneHandle) -> Result<()> {
        let strategy = ExponentialBackoff::from_millis(STATE_CHECK_RETRY_DELAY_MS)
            .max_delay(Duration::from_secs(2))
            .take(1);
        RetryIf::start(
            strategy,
            || self.clones.refresh(handle),
            |e: &anyhow::Error| {
                let retry = is_retryable(e);
                if retry {
                    tracing::debug!(target: "sync", "Retrying fetch of '{}': {e}", handle.label);
                }
                retry
            },
        )
        .await
    }

    /// Paths with uncommitted changes.
    pub(crate) async fn uncommitted_paths(&self, handle: &CloneHandle) -> Result<Vec<String>> {
        let status = self
            .clones
            .transport()
            .execute(&handle.local_path, GitOp::StatusPorcelain)
            .await?
            .into_text()?;
        Ok(parse_porcelain(&status))
    }

    /// Compares local head with the remote-tracking ref over already-fetched
    /// refs.
    pub(crate) async fn compare(&self, handle: &CloneHandle) -> Result<Comparison> {
        let transport = self.clones.transport();
        let path = &handle.local_path;

        let status = transport.execute(path, GitOp::StatusPorcelain).await?.into_text()?;
        let local = transport
            .execute(path, GitOp::RevParse { reference: "HEAD".to_string() })
            .await?
            .into_text()?;
        let remote = transport
            .execute(path, GitOp::RevParse { reference: handle.remote_tracking_ref.clone() })
            .await?
            .into_text()?;

        let count = |from: &str, to: &str| {
            transport.execute(
                path,
                GitOp::CountCommits {
                    from: from.to_string(),
                    to: to.to_string(),
                },
            )
        };
        let is_ancestor = |ancestor: &str, descendant: &str| {
            transport.execute(
                path,
                GitOp::IsAncestor {
                    ancestor: ancestor.to_string(),
                    descendant: descendant.to_string(),
                },
            )
        };

        let unmerged = unmerged_in_status(&status);
        if !unmerged.is_empty() {
            let ahead = count(&remote, &local).await?.into_count()?;
            let behind = count(&local, &remote).await?.into_count()?;
            return Ok(Comparison {
                conflicts: unmerged,
                ..Comparison::of(SyncState::Conflict, ahead, behind)
            });
        }

        if local == remote {
            return Ok(Comparison::of(SyncState::Synced, 0, 0));
        }

        if is_ancestor(&remote, &local).await?.into_flag()? {
            let ahead = count(&remote, &local).await?.into_count()?;
            return Ok(Comparison::of(SyncState::LocalAhead(ahead), ahead, 0));
        }

        if is_ancestor(&local, &remote).await?.into_flag()? {
            let behind = count(&local, &remote).await?.into_count()?;
            return Ok(Comparison::of(SyncState::RemoteAhead(behind), 0, behind));
        }

        let ahead = count(&remote, &local).await?.into_count()?;
        let behind = count(&local, &remote).await?.into_count()?;
        let outcome = transport
            .execute(path, GitOp::TrialMerge { ours: local, theirs: remote })
            .await?
            .into_merge()?;
        Ok(match outcome {
            MergeOutcome::Clean => Comparison::of(SyncState::Diverged, ahead, behind),
            MergeOutcome::Conflict(conflicts) => Comparison {
                conflicts,
                ..Comparison::of(SyncState::Conflict, ahead, behind)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BkstgError;
    use crate::test_utils::FakeVcs;
    use std::sync::Arc;
    use tempfile::TempDir;

    const URL: &str = "https://github.com/acme/catalog.git";

    struct Fixture {
        _temp: TempDir,
        fake: Arc<FakeVcs>,
        clones: CloneManager,
        detector: StateDetector,
        spec: CloneSpec,
    }

    impl Fixture {
        async fn cloned() -> Self {
            let temp = TempDir::new().unwrap();
            let fake = Arc::new(FakeVcs::new());
            fake.add_remote(URL, "main", &[("catalogs/a.yaml", "a"), ("catalogs/b.yaml", "b")]);
            let clones = CloneManager::new(temp.path(), fake.clone());
            let spec = CloneSpec {
                key: "acme_catalog_main".to_string(),
                label: "catalog".to_string(),
                url: URL.to_string(),
                branch: "main".to_string(),
                subpath: String::new(),
            };
            clones.ensure_clone(&spec).await.unwrap();
            let detector = StateDetector::new(clones.clone());
            Self { _temp: temp, fake, clones, detector, spec }
        }

        fn path(&self) -> std::path::PathBuf {
            self.clones.clone_path(&self.spec)
        }
    }

    #[tokio::test]
    async fn test_not_cloned() {
        let temp = TempDir::new().unwrap();
        let clones = CloneManager::new(temp.path(), Arc::new(FakeVcs::new()));
        let detector = StateDetector::new(clones);
        let spec = CloneSpec {
            key: "missing".to_string(),
            label: "missing".to_string(),
            url: URL.to_string(),
            branch: "main".to_string(),
            subpath: String::new(),
        };
        assert_eq!(detector.compute_state(&spec, true).await, SyncState::NotCloned);
    }

    #[tokio::test]
    async fn test_synced_after_clone() {
        let fx = Fixture::cloned().await;
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_local_ahead() {
        let fx = Fixture::cloned().await;
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "a2")]);
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "a3")]);
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::LocalAhead(2));
    }

    #[tokio::test]
    async fn test_remote_ahead_only_after_fetch() {
        let fx = Fixture::cloned().await;
        fx.fake.remote_commit(URL, "main", &[("catalogs/c.yaml", "c")]);

        assert_eq!(fx.detector.compute_state(&fx.spec, false).await, SyncState::Synced);
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::RemoteAhead(1));
    }

    #[tokio::test]
    async fn test_diverged_when_changes_merge_cleanly() {
        let fx = Fixture::cloned().await;
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "local")]);
        fx.fake.remote_commit(URL, "main", &[("catalogs/b.yaml", "remote")]);

        let status = fx.detector.status("catalog", &fx.spec, true).await;
        assert_eq!(status.state, SyncState::Diverged);
        assert_eq!((status.ahead, status.behind), (1, 1));
        assert_eq!(status.message, "+1/-1 commits diverged");
    }

    #[tokio::test]
    async fn test_conflict_when_same_file_changed() {
        let fx = Fixture::cloned().await;
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "local"), ("catalogs/b.yaml", "local")]);
        fx.fake.remote_commit(URL, "main", &[("catalogs/a.yaml", "remote"), ("catalogs/c.yaml", "c")]);
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::Conflict);

        let status = fx.detector.status("catalog", &fx.spec, false).await;
        assert_eq!(status.state, SyncState::Conflict);
        assert_eq!(status.conflicts, vec!["catalogs/a.yaml"]);
    }

    #[tokio::test]
    async fn test_interrupted_merge_lists_unmerged_paths() {
        let fx = Fixture::cloned().await;
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "local")]);
        fx.fake.remote_commit(URL, "main", &[("catalogs/a.yaml", "remote")]);
        fx.clones.transport().execute(&fx.path(), GitOp::Fetch { branch: "main".into() }).await.unwrap();
        fx.clones
            .transport()
            .execute(&fx.path(), GitOp::Merge { reference: "origin/main".into() })
            .await
            .unwrap();

        let status = fx.detector.status("catalog", &fx.spec, false).await;
        assert_eq!(status.state, SyncState::Conflict);
        assert_eq!(status.conflicts, vec!["catalogs/a.yaml"]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conflicts"][0], "catalogs/a.yaml");
    }

    #[tokio::test]
    async fn test_no_conflicts_listed_when_synced() {
        let fx = Fixture::cloned().await;
        let status = fx.detector.status("catalog", &fx.spec, false).await;
        assert!(status.conflicts.is_empty());
        assert!(serde_json::to_value(&status).unwrap().get("conflicts").is_none());
    }

    #[tokio::test]
    async fn test_network_failure_is_unknown() {
        let fx = Fixture::cloned().await;
        fx.fake.set_offline(true);
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::Unknown);
        // Offline fetch was attempted twice: the first try plus one retry
        assert_eq!(fx.fake.call_count("fetch"), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let fx = Fixture::cloned().await;
        fx.fake.set_auth_failure(true);
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::Unknown);
        assert_eq!(fx.fake.call_count("fetch"), 1);
    }

    #[tokio::test]
    async fn test_transient_timeout_recovers_on_retry() {
        let fx = Fixture::cloned().await;
        fx.fake.remote_commit(URL, "main", &[("catalogs/c.yaml", "c")]);
        fx.fake.fail_next(
            "fetch",
            BkstgError::Timeout {
                operation: "fetch".to_string(),
                seconds: 60,
            },
        );
        assert_eq!(fx.detector.compute_state(&fx.spec, true).await, SyncState::RemoteAhead(1));
    }

    #[tokio::test]
    async fn test_compute_state_is_read_only() {
        let fx = Fixture::cloned().await;
        fx.fake.local_commit(&fx.path(), &[("catalogs/a.yaml", "local")]);
        fx.fake.remote_commit(URL, "main", &[("catalogs/a.yaml", "remote")]);
        fx.fake.write_file(&fx.path(), "catalogs/new.yaml", "uncommitted");

        let head = fx.fake.head(&fx.path()).unwrap();
        let mutating_before = fx.fake.mutating_calls();
        for _ in 0..3 {
            fx.detector.compute_state(&fx.spec, true).await;
        }
        assert_eq!(fx.fake.head(&fx.path()).unwrap(), head);
        assert_eq!(fx.fake.mutating_calls(), mutating_before);
        assert_eq!(fx.fake.dirty_paths(&fx.path()), vec!["catalogs/new.yaml"]);
    }

    #[tokio::test]
    async fn test_uncommitted_changes_reported_separately() {
        let fx = Fixture::cloned().await;
        fx.fake.write_file(&fx.path(), "catalogs/a.yaml", "edited");

        let status = fx.detector.status("catalog", &fx.spec, false).await;
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.uncommitted, 1);
        assert_eq!(status.message, "Up to date, 1 uncommitted change(s)");
    }

    #[test]
    fn test_unmerged_detection() {
        assert_eq!(
            unmerged_in_status("UU catalogs/a.yaml\n M catalogs/b.yaml\nAA \"catalogs/c d.yaml\"\n"),
            vec!["catalogs/a.yaml", "catalogs/c d.yaml"]
        );
        assert!(unmerged_in_status(" M catalogs/a.yaml\n?? b.yaml\n").is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SyncState::LocalAhead(3).to_string(), "LOCAL_AHEAD(3)");
        assert_eq!(SyncState::NotCloned.to_string(), "NOT_CLONED");
    }
}
