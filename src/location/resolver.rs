//! Recursive resolution of the location graph.
//!
//! Each root reference is walked depth-first with an explicit stack. The
//! current traversal path is kept alongside it, so a reference back onto the
//! path is reported with the full chain and that branch is cut while the rest
//! of the walk continues.
//!
//! Roots are walked concurrently (at most `max_workers` at a time), but their
//! results are merged in root order. A location reached from several places
//! contributes its entities once, at the first place it was reached, and
//! entity identifiers are de-duplicated first-wins over that order.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::cache::LocationCache;
use super::fetcher::LocationFetcher;
use super::{LocationId, LocationRef, Presence};
use crate::catalog::{EntityId, SourcedEntity};

/// A non-fatal problem found while resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationWarning {
    /// A reference pointed back onto the current traversal path
    CycleDetected {
        /// Path from the first occurrence to the repeated location
        chain: Vec<LocationId>,
    },
    /// A location could not be fetched or parsed
    FetchFailed {
        /// Location that failed
        location: LocationId,
        /// Whether the reference was required
        required: bool,
        /// Failure description
        reason: String,
    },
    /// An entity identifier was already taken by an earlier entity
    DuplicateEntity {
        /// Duplicated identifier
        entity_id: EntityId,
        /// File of the entity that was kept
        kept_origin: PathBuf,
        /// File of the entity that was dropped
        dropped_origin: PathBuf,
    },
}

impl fmt::Display for LocationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { chain } => {
                let chain: Vec<&str> = chain.iter().map(LocationId::as_str).collect();
                write!(f, "Location cycle detected: {}", chain.join(" → "))
            }
            Self::FetchFailed { location, required, reason } => {
                let presence = if *required { "required" } else { "optional" };
                write!(f, "Failed to load {presence} location {location}: {reason}")
            }
            Self::DuplicateEntity { entity_id, kept_origin, dropped_origin } => write!(
                f,
                "Duplicate entity {entity_id} in {} ignored (already defined in {})",
                dropped_origin.display(),
                kept_origin.display()
            ),
        }
    }
}

/// Result of a resolution: the merged entity set plus everything skipped.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// De-duplicated entities in traversal order
    pub entities: Vec<SourcedEntity>,
    /// Problems encountered
    pub warnings: Vec<LocationWarning>,
}

/// First-wins entity set keyed by [`EntityId`].
#[derive(Debug, Default)]
pub struct EntitySet {
    origins: HashMap<EntityId, PathBuf>,
    entities: Vec<SourcedEntity>,
}

impl EntitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `sourced` unless its identifier is taken, in which case a
    /// [`LocationWarning::DuplicateEntity`] is recorded instead.
    pub fn push(&mut self, sourced: SourcedEntity, warnings: &mut Vec<LocationWarning>) {
        let id = sourced.entity.id();
        if let Some(kept) = self.origins.get(&id) {
            let warning = LocationWarning::DuplicateEntity {
                entity_id: id,
                kept_origin: kept.clone(),
                dropped_origin: sourced.origin,
            };
            tracing::warn!(target: "location", "{warning}");
            warnings.push(warning);
            return;
        }
        self.origins.insert(id, sourced.origin.clone());
        self.entities.push(sourced);
    }

    /// Number of entities kept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether nothing was kept.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Kept entities in insertion order.
    #[must_use]
    pub fn into_entities(self) -> Vec<SourcedEntity> {
        self.entities
    }
}

enum Frame {
    Enter(LocationRef),
    Exit,
}

/// Everything one root reached, in pre-order.
#[derive(Default)]
struct Walk {
    visited: Vec<(LocationId, Arc<Vec<SourcedEntity>>)>,
    warnings: Vec<LocationWarning>,
}

/// Resolves location references into a merged entity set.
///
/// One resolver is one catalog-load session: its [`LocationCache`] lives as
/// long as the resolver does.
#[derive(Clone)]
pub struct LocationResolver {
    fetcher: Arc<dyn LocationFetcher>,
    cache: LocationCache,
    max_workers: usize,
}

impl fmt::Debug for LocationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationResolver")
            .field("cache", &self.cache)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl LocationResolver {
    /// Creates a resolver with an empty cache.
    ///
    /// `max_workers` bounds the number of root references walked at once and
    /// is clamped to at least one.
    #[must_use]
    pub fn new(fetcher: Arc<dyn LocationFetcher>, ttl: Duration, max_workers: usize) -> Self {
        Self {
            fetcher,
            cache: LocationCache::new(ttl),
            max_workers: max_workers.max(1),
        }
    }

    /// The session cache.
    #[must_use]
    pub const fn cache(&self) -> &LocationCache {
        &self.cache
    }

    /// Drops the cached content of one location.
    pub fn invalidate(&self, id: &LocationId) -> bool {
        self.cache.invalidate(id)
    }

    /// Drops all cached content.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Resolves `roots` and every location reachable from them.
    pub async fn resolve(&self, roots: Vec<LocationRef>) -> Resolution {
        tracing::debug!(
            target: "location",
            "Resolving {} root location(s) with {} worker(s)",
            roots.len(),
            self.max_workers
        );

        // `buffered` keeps root order in its output
        let walks: Vec<Walk> = stream::iter(roots)
            .map(|root| self.walk(root))
            .buffered(self.max_workers)
            .collect()
            .await;

        let mut warnings = Vec::new();
        let mut emitted: HashSet<LocationId> = HashSet::new();
        let mut entities = EntitySet::new();
        for walk in walks {
            warnings.extend(walk.warnings);
            for (id, content) in walk.visited {
                if !emitted.insert(id) {
                    continue;
                }
                for sourced in content.iter() {
                    entities.push(sourced.clone(), &mut warnings);
                }
            }
        }

        tracing::debug!(
            target: "location",
            "Resolved {} entities from {} location(s), {} warning(s)",
            entities.len(),
            emitted.len(),
            warnings.len()
        );
        Resolution {
            entities: entities.into_entities(),
            warnings,
        }
    }

    async fn walk(&self, root: LocationRef) -> Walk {
        let mut walk = Walk::default();
        let mut path: Vec<LocationId> = Vec::new();
        let mut expanded: HashSet<LocationId> = HashSet::new();
        let mut stack = vec![Frame::Enter(root)];

        while let Some(frame) = stack.pop() {
            let reference = match frame {
                Frame::Exit => {
                    path.pop();
                    continue;
                }
                Frame::Enter(reference) => reference,
            };
            let id = reference.id();

            if let Some(start) = path.iter().position(|p| *p == id) {
                let mut chain = path[start..].to_vec();
                chain.push(id);
                let warning = LocationWarning::CycleDetected { chain };
                tracing::warn!(target: "location", "{warning}");
                walk.warnings.push(warning);
                continue;
            }
            if !expanded.insert(id.clone()) {
                continue;
            }

            let content = match self.load(&reference).await {
                Ok(content) => content,
                Err(e) => {
                    let required = reference.presence == Presence::Required;
                    let warning = LocationWarning::FetchFailed {
                        location: id,
                        required,
                        reason: format!("{e:#}"),
                    };
                    if required {
                        tracing::error!(target: "location", "{warning}");
                    } else {
                        tracing::warn!(target: "location", "{warning}");
                    }
                    walk.warnings.push(warning);
                    continue;
                }
            };

            let children: Vec<LocationRef> = content
                .iter()
                .filter(|sourced| sourced.entity.is_location())
                .flat_map(|sourced| {
                    LocationRef::from_entity(&sourced.entity, &sourced.origin, Some(&id))
                })
                .collect();

            walk.visited.push((id.clone(), content));
            path.push(id);
            stack.push(Frame::Exit);
            stack.extend(children.into_iter().rev().map(Frame::Enter));
        }

        walk
    }

    async fn load(&self, reference: &LocationRef) -> anyhow::Result<Arc<Vec<SourcedEntity>>> {
        let id = reference.id();
        let fetcher = self.fetcher.clone();
        self.cache
            .get_or_fetch(&id, || async move {
                tracing::debug!(target: "location", "Fetching {}", reference.id());
                fetcher.fetch(&reference.target).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_entities;
    use crate::location::LocationTarget;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves local targets from an in-memory map of path to YAML.
    #[derive(Default)]
    struct MapFetcher {
        files: HashMap<PathBuf, String>,
        calls: Mutex<HashMap<LocationId, usize>>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MapFetcher {
        fn with(mut self, path: &str, yaml: impl Into<String>) -> Self {
            self.files.insert(PathBuf::from(path), yaml.into());
            self
        }

        fn calls(&self, path: &str) -> usize {
            let id = LocationTarget::Local(PathBuf::from(path)).id();
            self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl LocationFetcher for MapFetcher {
        async fn fetch(&self, target: &LocationTarget) -> Result<Vec<SourcedEntity>> {
            *self.calls.lock().unwrap().entry(target.id()).or_default() += 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let LocationTarget::Local(path) = target else {
                return Err(anyhow!("unsupported target"));
            };
            let yaml = self.files.get(path).ok_or_else(|| anyhow!("{} not found", path.display()))?;
            Ok(parse_entities(yaml)?
                .into_iter()
                .map(|entity| SourcedEntity {
                    entity,
                    origin: path.clone(),
                })
                .collect())
        }
    }

    fn location(name: &str, targets: &[&str]) -> String {
        let mut yaml = format!("kind: Location\nmetadata:\n  name: {name}\nspec:\n  type: file\n  targets:\n");
        for target in targets {
            yaml.push_str(&format!("    - {target}\n"));
        }
        yaml
    }

    fn component(name: &str) -> String {
        format!("kind: Component\nmetadata:\n  name: {name}\n")
    }

    fn doc(parts: &[String]) -> String {
        parts.join("---\n")
    }

    fn root(path: &str) -> LocationRef {
        LocationRef::root(LocationTarget::Local(PathBuf::from(path)), Presence::Required)
    }

    fn resolver(fetcher: Arc<MapFetcher>) -> LocationResolver {
        LocationResolver::new(fetcher, Duration::from_secs(60), 4)
    }

    fn names(resolution: &Resolution) -> Vec<String> {
        resolution.entities.iter().map(|s| s.entity.metadata.name.clone()).collect()
    }

    #[tokio::test]
    async fn test_self_reference_terminates() {
        let fetcher = Arc::new(
            MapFetcher::default().with("/c/a.yaml", doc(&[location("a", &["./a.yaml"]), component("svc-a")])),
        );
        let resolution = resolver(fetcher.clone()).resolve(vec![root("/c/a.yaml")]).await;

        assert_eq!(names(&resolution), vec!["a", "svc-a"]);
        assert_eq!(fetcher.calls("/c/a.yaml"), 1);
        assert!(matches!(
            &resolution.warnings[..],
            [LocationWarning::CycleDetected { chain }] if chain.len() == 2 && chain[0] == chain[1]
        ));
    }

    #[tokio::test]
    async fn test_diamond_loads_shared_location_once() {
        let fetcher = Arc::new(
            MapFetcher::default()
                .with("/c/a.yaml", location("a", &["./b.yaml", "./c.yaml"]))
                .with("/c/b.yaml", location("b", &["./d.yaml"]))
                .with("/c/c.yaml", location("c", &["./d.yaml"]))
                .with("/c/d.yaml", component("svc-d")),
        );
        let resolution = resolver(fetcher.clone()).resolve(vec![root("/c/a.yaml")]).await;

        assert_eq!(names(&resolution), vec!["a", "b", "svc-d", "c"]);
        assert_eq!(fetcher.calls("/c/d.yaml"), 1);
        assert!(resolution.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_reports_full_chain_and_continues() {
        let fetcher = Arc::new(
            MapFetcher::default()
                .with("/c/a.yaml", location("a", &["./b.yaml", "./e.yaml"]))
                .with("/c/b.yaml", location("b", &["./c.yaml"]))
                .with("/c/c.yaml", location("c", &["./a.yaml"]))
                .with("/c/e.yaml", component("svc-e")),
        );
        let resolution = resolver(fetcher).resolve(vec![root("/c/a.yaml")]).await;

        assert_eq!(names(&resolution), vec!["a", "b", "c", "svc-e"]);
        let [LocationWarning::CycleDetected { chain }] = &resolution.warnings[..] else {
            panic!("expected one cycle warning, got {:?}", resolution.warnings);
        };
        let chain: Vec<&str> = chain.iter().map(LocationId::as_str).collect();
        assert_eq!(chain, vec!["file:/c/a.yaml", "file:/c/b.yaml", "file:/c/c.yaml", "file:/c/a.yaml"]);
        assert!(resolution.warnings[0].to_string().contains(" → "));
    }

    #[tokio::test]
    async fn test_duplicate_entities_first_visited_wins() {
        let fetcher = Arc::new(
            MapFetcher::default()
                .with("/c/first.yaml", format!("{}  description: first\n", component("svc")))
                .with("/c/second.yaml", format!("{}  description: second\n", component("svc"))),
        );
        let resolution = resolver(fetcher)
            .resolve(vec![root("/c/first.yaml"), root("/c/second.yaml")])
            .await;

        assert_eq!(resolution.entities.len(), 1);
        assert_eq!(resolution.entities[0].origin, Path::new("/c/first.yaml"));
        assert!(matches!(
            &resolution.warnings[..],
            [LocationWarning::DuplicateEntity { dropped_origin, .. }] if dropped_origin == Path::new("/c/second.yaml")
        ));
    }

    #[tokio::test]
    async fn test_cache_within_ttl_makes_no_fetch_calls() {
        let fetcher = Arc::new(
            MapFetcher::default()
                .with("/c/a.yaml", doc(&[location("a", &["./b.yaml"]), component("svc-a")]))
                .with("/c/b.yaml", component("svc-b")),
        );
        let resolver = resolver(fetcher.clone());

        resolver.resolve(vec![root("/c/a.yaml")]).await;
        assert_eq!(fetcher.total_calls(), 2);
        let again = resolver.resolve(vec![root("/c/a.yaml")]).await;
        assert_eq!(fetcher.total_calls(), 2);
        assert_eq!(names(&again), vec!["a", "svc-a", "svc-b"]);

        assert!(resolver.invalidate(&LocationTarget::Local(PathBuf::from("/c/b.yaml")).id()));
        resolver.resolve(vec![root("/c/a.yaml")]).await;
        assert_eq!(fetcher.calls("/c/b.yaml"), 2);
        assert_eq!(fetcher.calls("/c/a.yaml"), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let fetcher = Arc::new(MapFetcher::default().with("/c/a.yaml", component("svc-a")));
        let resolver = LocationResolver::new(fetcher.clone(), Duration::from_millis(20), 2);

        resolver.resolve(vec![root("/c/a.yaml")]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        resolver.resolve(vec![root("/c/a.yaml")]).await;
        assert_eq!(fetcher.calls("/c/a.yaml"), 2);
    }

    #[tokio::test]
    async fn test_missing_targets_warn_by_presence() {
        let fetcher = Arc::new(
            MapFetcher::default().with("/c/a.yaml", doc(&[location("a", &["./gone.yaml"]), component("svc-a")])),
        );
        let optional =
            LocationRef::root(LocationTarget::Local(PathBuf::from("/c/missing.yaml")), Presence::Optional);
        let resolution = resolver(fetcher).resolve(vec![root("/c/a.yaml"), optional]).await;

        assert_eq!(names(&resolution), vec!["a", "svc-a"]);
        let required: Vec<bool> = resolution
            .warnings
            .iter()
            .filter_map(|w| match w {
                LocationWarning::FetchFailed { required, .. } => Some(*required),
                _ => None,
            })
            .collect();
        assert_eq!(required, vec![true, false]);
    }

    #[tokio::test]
    async fn test_roots_resolve_with_bounded_parallelism() {
        let mut fetcher = MapFetcher {
            delay: Duration::from_millis(40),
            ..MapFetcher::default()
        };
        let mut roots = Vec::new();
        for i in 0..6 {
            let path = format!("/c/r{i}.yaml");
            fetcher = fetcher.with(&path, component(&format!("svc-{i}")));
            roots.push(root(&path));
        }
        let fetcher = Arc::new(fetcher);
        let resolver = LocationResolver::new(fetcher.clone(), Duration::from_secs(60), 2);

        let resolution = resolver.resolve(roots).await;
        assert_eq!(
            names(&resolution),
            vec!["svc-0", "svc-1", "svc-2", "svc-3", "svc-4", "svc-5"]
        );
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert!(fetcher.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shared_location_across_roots_is_fetched_once() {
        let mut fetcher = MapFetcher {
            delay: Duration::from_millis(30),
            ..MapFetcher::default()
        };
        fetcher = fetcher
            .with("/c/x.yaml", location("x", &["./shared.yaml"]))
            .with("/c/y.yaml", location("y", &["./shared.yaml"]))
            .with("/c/shared.yaml", component("svc-shared"));
        let fetcher = Arc::new(fetcher);

        let resolution = resolver(fetcher.clone())
            .resolve(vec![root("/c/x.yaml"), root("/c/y.yaml")])
            .await;
        assert_eq!(fetcher.calls("/c/shared.yaml"), 1);
        assert_eq!(names(&resolution), vec!["x", "svc-shared", "y"]);
        assert!(resolution.warnings.is_empty());
    }
}
