//! Catalog entities and directory scanning.
//!
//! Entities are Backstage-style YAML documents. This crate inspects only their
//! identity (`kind`, `metadata.namespace`, `metadata.name`), their score
//! values and, for `Location` entities, the target fields. Everything else is
//! kept as opaque YAML.
//!
//! A source's catalog lives under `<root>/catalogs/` (or `<root>` itself when
//! it is named `catalogs`). Scanning walks it recursively for `*.yaml` and
//! `*.yml` files, skipping the `scorecards/` directory which holds scorecard
//! definitions rather than entities.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::constants::{CATALOGS_DIR, SCORE_NA_VALUE, SCORECARDS_DIR};

/// Namespace used when `metadata.namespace` is absent.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A recorded score on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreValue {
    /// Score definition identifier
    pub score_id: String,
    /// Value; `-1` means "not applicable"
    pub value: f64,
    /// Scorecard the score belongs to, when scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorecard_id: Option<String>,
    /// Free-form justification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Entity metadata; unknown keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Name, unique per kind and namespace
    pub name: String,
    /// Namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Recorded scores
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scores: Vec<ScoreValue>,
    /// Remaining metadata fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A catalog entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// API version, e.g. `backstage.io/v1alpha1`
    #[serde(default)]
    pub api_version: String,
    /// Kind, e.g. `Component`
    pub kind: String,
    /// Metadata
    pub metadata: EntityMetadata,
    /// Kind-specific body, opaque here
    #[serde(default)]
    pub spec: serde_yaml::Value,
}

/// `kind:namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId(String);

impl EntityId {
    /// Borrowed form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Entity {
    /// Stable identifier used for de-duplication.
    #[must_use]
    pub fn id(&self) -> EntityId {
        let namespace = self.metadata.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        EntityId(format!("{}:{}/{}", self.kind, namespace, self.metadata.name))
    }

    /// Whether this is a `Location` entity.
    #[must_use]
    pub fn is_location(&self) -> bool {
        self.kind.eq_ignore_ascii_case("location")
    }

    /// Score values keyed by score id.
    ///
    /// Not-applicable scores (`-1`) are omitted, so a rank referencing them
    /// becomes unratable. With `scorecard_id`, scores scoped to a different
    /// scorecard are ignored; unscoped scores always apply.
    #[must_use]
    pub fn score_values(&self, scorecard_id: Option<&str>) -> HashMap<String, f64> {
        self.metadata
            .scores
            .iter()
            .filter(|s| match (scorecard_id, s.scorecard_id.as_deref()) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            })
            .filter(|s| s.value.is_finite() && s.value != SCORE_NA_VALUE)
            .map(|s| (s.score_id.clone(), s.value))
            .collect()
    }
}

/// An entity together with the file it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedEntity {
    /// The entity
    pub entity: Entity,
    /// File the entity was read from
    pub origin: PathBuf,
}

/// Directory holding the catalog for a source rooted at `root`.
#[must_use]
pub fn catalogs_dir(root: &Path) -> PathBuf {
    if root.file_name().is_some_and(|n| n == CATALOGS_DIR) && root.is_dir() {
        root.to_path_buf()
    } else {
        root.join(CATALOGS_DIR)
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Parses every entity document in a YAML file.
///
/// Documents without `kind` and `metadata.name` are not entities and are
/// skipped.
pub fn parse_entities(content: &str) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document).context("Invalid YAML")?;
        if value.is_null() {
            continue;
        }
        let looks_like_entity = value.get("kind").is_some()
            && value.get("metadata").and_then(|m| m.get("name")).is_some();
        if !looks_like_entity {
            continue;
        }
        entities.push(serde_yaml::from_value(value).context("Invalid entity")?);
    }
    Ok(entities)
}

/// Reads entities from one file.
pub fn read_file(path: &Path) -> Result<Vec<SourcedEntity>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entities =
        parse_entities(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(entities
        .into_iter()
        .map(|entity| SourcedEntity {
            entity,
            origin: path.to_path_buf(),
        })
        .collect())
}

/// Reads entities from every YAML file under `dir`, in path order.
///
/// Unparseable files are logged and skipped.
pub fn scan_dir(dir: &Path) -> Vec<SourcedEntity> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == SCORECARDS_DIR))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && is_yaml(e.path()))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();

    let mut entities = Vec::new();
    for file in files {
        match read_file(&file) {
            Ok(mut found) => entities.append(&mut found),
            Err(e) => tracing::warn!("Skipping {}: {e:#}", file.display()),
        }
    }
    entities
}

/// Reads the catalog of a source rooted at `root`.
#[must_use]
pub fn scan_catalog(root: &Path) -> Vec<SourcedEntity> {
    let dir = catalogs_dir(root);
    if !dir.is_dir() {
        tracing::debug!("No catalog directory at {}", dir.display());
        return Vec::new();
    }
    scan_dir(&dir)
}

/// Reads a location target path: a single file, or a directory scanned
/// recursively.
pub fn read_target(path: &Path) -> Result<Vec<SourcedEntity>> {
    if path.is_dir() {
        Ok(scan_dir(path))
    } else {
        read_file(path)
    }
}
