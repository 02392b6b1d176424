//! Loading the content of one location.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::LocationTarget;
use crate::catalog::{SourcedEntity, read_target};
use crate::clone::{CloneManager, CloneSpec};

/// Loads the entities stored directly at a location.
#[async_trait]
pub trait LocationFetcher: Send + Sync {
    /// Entities at `target`, without following nested locations.
    async fn fetch(&self, target: &LocationTarget) -> Result<Vec<SourcedEntity>>;
}

/// [`LocationFetcher`] reading GitHub targets through read-only sparse
/// clones and local targets straight from disk.
#[derive(Debug, Clone)]
pub struct CatalogFetcher {
    clones: CloneManager,
    git_base_url: String,
}

impl CatalogFetcher {
    /// Creates a fetcher cloning from `git_base_url` (e.g. `https://github.com`).
    pub fn new(clones: CloneManager, git_base_url: impl Into<String>) -> Self {
        Self {
            clones,
            git_base_url: git_base_url.into(),
        }
    }

    async fn fetch_github(&self, owner: &str, repo: &str, branch: &str, path: &str) -> Result<Vec<SourcedEntity>> {
        let spec = CloneSpec::for_location(owner, repo, branch, path, &self.git_base_url);
        let existed = self.clones.handle(&spec).is_some();
        let handle = self.clones.ensure_clone(&spec).await?;

        if existed {
            // A stale copy is still usable when the remote is unreachable
            let update = async {
                self.clones.refresh(&handle).await?;
                self.clones.fast_forward_if_behind(&handle).await
            };
            match update.await {
                Ok(true) => tracing::debug!(target: "location", "Updated {}", spec.label),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    target: "location",
                    "Using cached copy of {}: update failed: {e:#}",
                    spec.label
                ),
            }
        }

        let target = handle.catalog_root();
        read_target(&target).with_context(|| format!("Failed to read {path} from {}", spec.label))
    }
}

#[async_trait]
impl LocationFetcher for CatalogFetcher {
    async fn fetch(&self, target: &LocationTarget) -> Result<Vec<SourcedEntity>> {
        match target {
            LocationTarget::Github { owner, repo, branch, path } => {
                self.fetch_github(owner, repo, branch, path).await
            }
            LocationTarget::Local(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_target(&path))
                    .await
                    .context("Failed to spawn blocking task for catalog read")?
            }
        }
    }
}
