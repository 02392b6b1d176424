//! Location graph resolution.
//!
//! A `Location` entity points at other catalogs: files or directories in
//! GitHub repositories, or local files. Locations found in fetched content are
//! followed recursively, so the references form a graph:
//!
//! - [`LocationTarget`] / [`LocationRef`]: one edge, parsed from a target
//!   string.
//! - [`cache::LocationCache`]: per-session cache of fetched location content
//!   with lazy expiry and in-flight de-duplication.
//! - [`fetcher::LocationFetcher`]: loads the entities of one location.
//! - [`resolver::LocationResolver`]: walks the graph with cycle detection,
//!   bounded parallelism and first-wins entity de-duplication.

pub mod cache;
pub mod fetcher;
pub mod resolver;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::catalog::Entity;
use crate::utils::normalize_path;

pub use cache::LocationCache;
pub use fetcher::{CatalogFetcher, LocationFetcher};
pub use resolver::{LocationResolver, LocationWarning, Resolution};

static GITHUB_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([^/]+)/([^/]+)/(?:blob|tree)/([^/]+)(?:/(.*))?$").ok()
});

static GITHUB_RAW_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^https://raw\.githubusercontent\.com/([^/]+)/([^/]+)/([^/]+)/(.+)$").ok()
});

/// Whether a missing target is an error or expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// Failure is reported at error level
    #[default]
    Required,
    /// Failure is reported as a warning
    Optional,
}

/// `spec` of a `Location` entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct LocationSpec {
    /// `url` or `file`
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Single target
    #[serde(default)]
    pub target: Option<String>,
    /// Additional targets
    #[serde(default)]
    pub targets: Vec<String>,
    /// Presence of every target
    #[serde(default)]
    pub presence: Presence,
}

impl LocationSpec {
    /// Reads the spec of a `Location` entity.
    #[must_use]
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        if !entity.is_location() {
            return None;
        }
        match serde_yaml::from_value(entity.spec.clone()) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(target: "location", "Invalid Location spec on {}: {e}", entity.id());
                None
            }
        }
    }

    /// `target` followed by `targets`.
    #[must_use]
    pub fn all_targets(&self) -> Vec<&str> {
        self.target.iter().chain(self.targets.iter()).map(String::as_str).collect()
    }
}

/// Where a location's content lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocationTarget {
    /// A path inside a GitHub repository at a branch or ref
    Github {
        /// Repository owner
        owner: String,
        /// Repository name
        repo: String,
        /// Branch or ref
        branch: String,
        /// File or directory inside the repository (empty for the root)
        path: String,
    },
    /// A file or directory on the local file system
    Local(PathBuf),
}

impl LocationTarget {
    /// Parses a target string.
    ///
    /// Relative local targets resolve against `base_dir`, which is the
    /// directory of the file declaring the location. Returns `None` for
    /// unsupported URLs.
    #[must_use]
    pub fn parse(target: &str, base_dir: &Path) -> Option<Self> {
        let target = target.trim();
        if target.starts_with("http://") || target.starts_with("https://") {
            return Self::parse_github_url(target);
        }
        let path = target.strip_prefix("file://").unwrap_or(target);
        let path = Path::new(path);
        let absolute = if path.is_absolute() { path.to_path_buf() } else { base_dir.join(path) };
        Some(Self::Local(normalize_path(&absolute)))
    }

    fn parse_github_url(url: &str) -> Option<Self> {
        let url = url.split(['?', '#']).next().unwrap_or(url);
        [&*GITHUB_URL, &*GITHUB_RAW_URL].into_iter().flatten().find_map(|re| {
            let caps = re.captures(url)?;
            Some(Self::Github {
                owner: caps.get(1)?.as_str().to_string(),
                repo: caps.get(2)?.as_str().trim_end_matches(".git").to_string(),
                branch: caps.get(3)?.as_str().to_string(),
                path: caps.get(4).map_or("", |m| m.as_str()).trim_matches('/').to_string(),
            })
        })
    }

    /// Identity used for caching and cycle detection.
    #[must_use]
    pub fn id(&self) -> LocationId {
        match self {
            Self::Github { owner, repo, branch, path } => {
                LocationId(format!("github:{owner}/{repo}@{branch}/{path}"))
            }
            Self::Local(path) => LocationId(format!("file:{}", path.display())),
        }
    }
}

/// Identity of a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LocationId(String);

impl LocationId {
    /// Borrowed form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One edge of the location graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRef {
    /// Where the content lives
    pub target: LocationTarget,
    /// Whether failure is expected
    pub presence: Presence,
    /// Location that declared this reference; `None` for roots
    pub parent: Option<LocationId>,
}

impl LocationRef {
    /// Creates a root reference.
    #[must_use]
    pub const fn root(target: LocationTarget, presence: Presence) -> Self {
        Self {
            target,
            presence,
            parent: None,
        }
    }

    /// Identity of the referenced location.
    #[must_use]
    pub fn id(&self) -> LocationId {
        self.target.id()
    }

    /// References declared by a `Location` entity read from `origin`.
    ///
    /// Unsupported targets are logged and skipped.
    #[must_use]
    pub fn from_entity(entity: &Entity, origin: &Path, parent: Option<&LocationId>) -> Vec<Self> {
        let Some(spec) = LocationSpec::from_entity(entity) else {
            return Vec::new();
        };
        let base_dir = origin.parent().unwrap_or_else(|| Path::new("."));
        spec.all_targets()
            .into_iter()
            .filter_map(|raw| {
                let target = LocationTarget::parse(raw, base_dir);
                if target.is_none() {
                    tracing::warn!(
                        target: "location",
                        "Unsupported location target (only GitHub URLs and files): {raw}"
                    );
                }
                target
            })
            .map(|target| Self {
                target,
                presence: spec.presence,
                parent: parent.cloned(),
            })
            .collect()
    }
}
