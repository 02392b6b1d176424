//! Configuration for bkstg (`bkstg.yaml`).
//!
//! The configuration lists the repositories that back the catalog and a few
//! engine settings. It is loaded once per process and treated as immutable.
//!
//! # Lookup Order
//!
//! 1. An explicit path (`--config`), which must exist
//! 2. The `BKSTG_CONFIG` environment variable
//! 3. `<project>/bkstg.yaml`
//! 4. `~/.bkstg/bkstg.yaml`
//! 5. Built-in defaults (no sources)
//!
//! # Format
//!
//! ```yaml
//! version: 1
//! sources:
//!   - name: platform
//!     type: github
//!     owner: acme
//!     repo: platform-catalog
//!     branch: main
//!     path: catalogs
//!     sync_enabled: true
//!     auto_commit: true
//! settings:
//!   cache_ttl: 300
//!   max_workers: 5
//!   clone_dir: ~/.bkstg-clones
//!   review_request_policy: ahead_or_diverged
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::constants::{
    DEFAULT_CACHE_TTL_SECS, DEFAULT_CLONE_DIR, DEFAULT_MAX_WORKERS, GIT_CLONE_TIMEOUT,
    GIT_FETCH_TIMEOUT, REVIEW_BRANCH_PREFIX,
};
use crate::core::BkstgError;
use crate::utils::platform::resolve_path;

/// File name looked up at project and user level.
pub const CONFIG_FILE_NAME: &str = "bkstg.yaml";

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV_VAR: &str = "BKSTG_CONFIG";

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BkstgConfig {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Repositories backing the catalog, in priority order
    #[serde(default)]
    pub sources: Vec<RepositorySource>,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,

    /// Directory the configuration was loaded from, used to resolve
    /// relative local source paths.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

const fn default_version() -> u32 {
    1
}

impl Default for BkstgConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            sources: Vec::new(),
            settings: Settings::default(),
            base_dir: None,
        }
    }
}

/// Kind of backing store for a source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A GitHub repository, cloned and synchronized by bkstg
    #[default]
    Github,
    /// A plain local directory, read in place and never synchronized
    Local,
}

/// A configured repository (or local directory) backing part of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositorySource {
    /// Unique name used on the command line
    pub name: String,

    /// Backing store kind
    #[serde(rename = "type", default)]
    pub kind: SourceKind,

    /// Repository owner (organization or user)
    #[serde(default)]
    pub owner: String,

    /// Repository name
    #[serde(default)]
    pub repo: String,

    /// Branch to track
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Subpath inside the repository holding the catalog; for local sources
    /// the directory itself
    #[serde(default, rename = "path")]
    pub subpath: String,

    /// Whether the source participates at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether the source is cloned and synchronized
    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    /// Whether entity and scorecard writes are committed automatically
    #[serde(default = "default_true")]
    pub auto_commit: bool,

    /// Explicit remote URL, overriding the one derived from owner/repo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

const fn default_true() -> bool {
    true
}

impl RepositorySource {
    /// Creates a GitHub source with default flags.
    pub fn github(
        name: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Github,
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            subpath: String::new(),
            enabled: true,
            sync_enabled: true,
            auto_commit: true,
            url: None,
        }
    }

    /// Sets the catalog subpath.
    #[must_use]
    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = subpath.into();
        self
    }

    /// Sets an explicit remote URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Remote URL of the repository.
    #[must_use]
    pub fn remote_url(&self, base_url: &str) -> String {
        self.url.clone().unwrap_or_else(|| repository_url(base_url, &self.owner, &self.repo))
    }

    /// `owner/repo` slug as understood by the hosting CLI.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Whether this source is cloned and synchronized.
    #[must_use]
    pub fn is_syncable(&self) -> bool {
        self.enabled && self.sync_enabled && self.kind == SourceKind::Github
    }
}

/// Builds `<base>/<owner>/<repo>.git`.
#[must_use]
pub fn repository_url(base_url: &str, owner: &str, repo: &str) -> String {
    format!("{}/{}/{}.git", base_url.trim_end_matches('/'), owner, repo)
}

/// Whether a review request may be opened from the `LOCAL_AHEAD` state.
///
/// `DIVERGED` always permits a review request; this policy decides the
/// ahead-of-remote case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewRequestPolicy {
    /// Review requests from `LOCAL_AHEAD` or `DIVERGED`
    #[default]
    AheadOrDiverged,
    /// Review requests only from `DIVERGED`
    DivergedOnly,
}

impl std::fmt::Display for ReviewRequestPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AheadOrDiverged => write!(f, "ahead_or_diverged"),
            Self::DivergedOnly => write!(f, "diverged_only"),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Lifetime of a resolved location cache entry, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,

    /// Maximum location fetches in flight
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Root directory for working copies (`~` and `$VARS` are expanded)
    #[serde(default = "default_clone_dir")]
    pub clone_dir: String,

    /// Timeout for fetch and push, in seconds
    #[serde(default = "default_network_timeout")]
    pub network_timeout: u64,

    /// Timeout for clone, in seconds
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,

    /// Which states permit a review request
    #[serde(default)]
    pub review_request_policy: ReviewRequestPolicy,

    /// Prefix of review request branches
    #[serde(default = "default_review_branch_prefix")]
    pub review_branch_prefix: String,

    /// Base URL used to derive remote URLs from owner/repo
    #[serde(default = "default_git_base_url")]
    pub git_base_url: String,
}

const fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

const fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_clone_dir() -> String {
    DEFAULT_CLONE_DIR.to_string()
}

const fn default_network_timeout() -> u64 {
    GIT_FETCH_TIMEOUT.as_secs()
}

const fn default_clone_timeout() -> u64 {
    GIT_CLONE_TIMEOUT.as_secs()
}

fn default_review_branch_prefix() -> String {
    REVIEW_BRANCH_PREFIX.to_string()
}

fn default_git_base_url() -> String {
    "https://github.com".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            max_workers: default_max_workers(),
            clone_dir: default_clone_dir(),
            network_timeout: default_network_timeout(),
            clone_timeout: default_clone_timeout(),
            review_request_policy: ReviewRequestPolicy::default(),
            review_branch_prefix: default_review_branch_prefix(),
            git_base_url: default_git_base_url(),
        }
    }
}

impl Settings {
    /// Location cache TTL.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// Network timeout for fetch and push.
    #[must_use]
    pub const fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout)
    }

    /// Timeout for clone.
    #[must_use]
    pub const fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout)
    }

    /// Expanded clone directory.
    pub fn clone_dir(&self) -> Result<PathBuf> {
        resolve_path(&self.clone_dir)
    }
}

impl BkstgConfig {
    /// Load configuration following the documented lookup order.
    pub async fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path).await;
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
            && !path.is_empty()
        {
            return Self::load_from(&resolve_path(&path)?).await;
        }

        let project_path = project_dir.join(CONFIG_FILE_NAME);
        if project_path.exists() {
            return Self::load_from(&project_path).await;
        }

        if let Ok(user_path) = Self::user_path()
            && user_path.exists()
        {
            return Self::load_from(&user_path).await;
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE_NAME);
        Ok(Self::default())
    }

    /// Load and validate configuration from a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        tracing::debug!(
            "Loaded {} source(s) from {}",
            config.sources.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse configuration YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path`, creating parent directories.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// `~/.bkstg/bkstg.yaml`.
    pub fn user_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?;
        Ok(home.join(".bkstg").join(CONFIG_FILE_NAME))
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(config_error("source with empty name"));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(config_error(format!("duplicate source name '{}'", source.name)));
            }
            match source.kind {
                SourceKind::Github => {
                    if source.owner.is_empty() || source.repo.is_empty() {
                        return Err(config_error(format!(
                            "source '{}' needs both owner and repo",
                            source.name
                        )));
                    }
                    if source.branch.is_empty() {
                        return Err(config_error(format!(
                            "source '{}' has an empty branch",
                            source.name
                        )));
                    }
                }
                SourceKind::Local => {
                    if source.subpath.is_empty() {
                        return Err(config_error(format!(
                            "local source '{}' needs a path",
                            source.name
                        )));
                    }
                }
            }
        }
        if self.settings.max_workers == 0 {
            return Err(config_error("settings.max_workers must be at least 1"));
        }
        Ok(())
    }

    /// Enabled sources in declaration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &RepositorySource> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Look up a source by name, suggesting the closest configured name.
    pub fn find_source(&self, name: &str) -> Result<&RepositorySource, BkstgError> {
        self.sources.iter().find(|s| s.name == name).ok_or_else(|| BkstgError::SourceNotFound {
            name: name.to_string(),
            suggestion: closest_name(name, self.sources.iter().map(|s| s.name.as_str())),
        })
    }

    /// Directory of a local source, resolved against the config file.
    pub fn local_source_dir(&self, source: &RepositorySource) -> Result<PathBuf> {
        let path = resolve_path(&source.subpath)?;
        if path.is_absolute() {
            return Ok(path);
        }
        Ok(self.base_dir.clone().unwrap_or_else(|| PathBuf::from(".")).join(path))
    }
}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    BkstgError::ConfigError {
        message: message.into(),
    }
    .into()
}

fn closest_name<'a>(target: &str, names: impl Iterator<Item = &'a str>) -> Option<String> {
    names
        .map(|name| (name, strsim::levenshtein(target, name)))
        .filter(|(_, distance)| *distance <= 3)
        .min_by_key(|(_, distance)| *distance)
        .map(|(name, _)| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
version: 1
sources:
  - name: platform
    type: github
    owner: acme
    repo: platform-catalog
    path: catalogs
  - name: payments
    owner: acme
    repo: payments
    branch: develop
    sync_enabled: false
    auto_commit: false
settings:
  cache_ttl: 60
  max_workers: 3
  review_request_policy: diverged_only
"#;

    #[test]
    fn test_parse_defaults_applied() {
        let config = BkstgConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);

        let platform = &config.sources[0];
        assert_eq!(platform.branch, "main");
        assert_eq!(platform.subpath, "catalogs");
        assert!(platform.enabled && platform.sync_enabled && platform.auto_commit);

        let payments = &config.sources[1];
        assert_eq!(payments.kind, SourceKind::Github);
        assert_eq!(payments.branch, "develop");
        assert!(!payments.is_syncable());

        assert_eq!(config.settings.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.settings.max_workers, 3);
        assert_eq!(config.settings.review_request_policy, ReviewRequestPolicy::DivergedOnly);
        assert_eq!(config.settings.review_branch_prefix, "bkstg-sync-");
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = BkstgConfig::from_yaml("").unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r"
sources:
  - {name: a, owner: o, repo: r}
  - {name: a, owner: o, repo: s}
";
        let err = BkstgConfig::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate source name"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = "settings:\n  max_workers: 0\n";
        assert!(BkstgConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_find_source_suggests_closest() {
        let config = BkstgConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.find_source("platform").is_ok());

        match config.find_source("platfrom") {
            Err(BkstgError::SourceNotFound { suggestion, .. }) => {
                assert_eq!(suggestion.as_deref(), Some("platform"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_remote_url_derivation() {
        let source = RepositorySource::github("x", "acme", "catalog", "main");
        assert_eq!(source.remote_url("https://github.com/"), "https://github.com/acme/catalog.git");

        let source = source.with_url("file:///srv/catalog.git");
        assert_eq!(source.remote_url("https://github.com"), "file:///srv/catalog.git");
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join(CONFIG_FILE_NAME);

        let config = BkstgConfig::from_yaml(SAMPLE).unwrap();
        config.save_to(&path).await.unwrap();

        let reloaded = BkstgConfig::load_from(&path).await.unwrap();
        assert_eq!(reloaded.sources, config.sources);
        assert_eq!(reloaded.base_dir.as_deref(), path.parent());
    }

    #[tokio::test]
    async fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing.yaml");
        assert!(BkstgConfig::load(temp.path(), Some(&missing)).await.is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_project_file_found() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();

        // SAFETY: serialized with the other env-reading tests
        unsafe { std::env::remove_var(CONFIG_ENV_VAR) };
        let config = BkstgConfig::load(temp.path(), None).await.unwrap();
        assert_eq!(config.sources.len(), 2);
    }

    #[test]
    fn test_local_source_dir_relative_to_config() {
        let yaml = "sources:\n  - {name: local, type: local, path: ./catalog}\n";
        let mut config = BkstgConfig::from_yaml(yaml).unwrap();
        config.base_dir = Some(PathBuf::from("/srv/project"));
        let dir = config.local_source_dir(&config.sources[0]).unwrap();
        assert_eq!(dir, PathBuf::from("/srv/project/./catalog"));
    }
}
