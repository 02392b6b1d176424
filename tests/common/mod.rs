//! Shared helpers for the integration suite.
//!
//! A [`Workspace`] is a temporary directory holding a bare "remote" catalog
//! repository, a teammate's working copy that publishes to it, a clone
//! directory for bkstg and a `bkstg.yaml` pointing at all of it.

use anyhow::Result;
use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use bkstg::config::{BkstgConfig, RepositorySource, Settings};
use bkstg::engine::Engine;
use bkstg::git::GitCliTransport;
use bkstg::test_utils::{FakeHost, RemoteFixture, TestGit};

pub const SOURCE: &str = "platform";

pub const CHECKOUT: &str = "apiVersion: backstage.io/v1alpha1
kind: Component
metadata:
  name: checkout
  scores:
    - {score_id: test_coverage, value: 85}
    - {score_id: doc_quality, value: 70}
spec:
  owner: team-a
";

pub const SCORECARD: &str = "apiVersion: backstage.io/v1alpha1
kind: ScorecardDefinition
metadata:
  name: quality
spec:
  ranks:
    - id: overall
      name: Overall
      target_kinds: [Component]
      score_refs: [test_coverage, doc_quality]
      formula: \"(test_coverage * 0.6) + (doc_quality * 0.4)\"
      thresholds:
        - {min: 90, label: S}
        - {min: 80, label: A}
        - {min: 60, label: B}
        - {min: 0, label: C}
";

/// Temporary catalog setup backed by real git repositories.
pub struct Workspace {
    pub temp: TempDir,
    pub remote: RemoteFixture,
    pub host: Arc<FakeHost>,
}

impl Workspace {
    /// Remote seeded with one component and one scorecard.
    pub fn new() -> Result<Self> {
        Self::with_files(&[
            ("catalogs/components/checkout.yaml", CHECKOUT),
            ("catalogs/scorecards/quality.yaml", SCORECARD),
        ])
    }

    pub fn with_files(files: &[(&str, &str)]) -> Result<Self> {
        let temp = TempDir::new()?;
        let remote = RemoteFixture::create(&temp.path().join("platform"), "main", files)?;
        Ok(Self {
            temp,
            remote,
            host: Arc::new(FakeHost::new()),
        })
    }

    pub fn clone_dir(&self) -> PathBuf {
        self.temp.path().join("clones")
    }

    pub fn source(&self) -> RepositorySource {
        RepositorySource::github(SOURCE, "acme", "platform", "main").with_url(self.remote.url())
    }

    pub fn config(&self) -> BkstgConfig {
        BkstgConfig {
            sources: vec![self.source()],
            settings: Settings {
                clone_dir: self.clone_dir().display().to_string(),
                ..Settings::default()
            },
            ..BkstgConfig::default()
        }
    }

    /// Engine driving the real git binary and a recording hosting client.
    pub fn engine(&self) -> Result<Engine> {
        Engine::new(self.config(), Arc::new(GitCliTransport::default()), self.host.clone())
    }

    /// Working copy bkstg manages for the source.
    pub fn working_copy(&self) -> TestGit {
        TestGit::new(self.clone_dir().join("acme_platform_main"))
    }

    /// Clones the source through `engine` and gives the clone a commit
    /// identity.
    pub async fn cloned_engine(&self) -> Result<Engine> {
        let engine = self.engine()?;
        engine.pull(SOURCE).await?;
        self.working_copy().config_user()?;
        Ok(engine)
    }

    /// Writes `bkstg.yaml` into a project directory and returns its path.
    pub async fn write_config(&self, config: &BkstgConfig) -> Result<PathBuf> {
        let path = self.temp.path().join("project").join("bkstg.yaml");
        config.save_to(&path).await?;
        Ok(path)
    }
}

/// `bkstg` binary with logging quiet and no user configuration leaking in.
pub fn bkstg_cmd(project_dir: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("bkstg")?;
    cmd.current_dir(project_dir)
        .env_remove("BKSTG_CONFIG")
        .env_remove("RUST_LOG")
        .env("HOME", project_dir)
        .env("NO_COLOR", "1");
    Ok(cmd)
}
