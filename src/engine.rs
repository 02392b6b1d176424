//! Entry point tying the clone, sync, location and scorecard layers together.
//!
//! [`Engine`] is what the CLI (or any other presentation layer) talks to. It
//! owns one [`CloneManager`] shared by the [`SyncOperator`] and the location
//! fetcher, so sources and resolved locations live side by side in the same
//! clone directory under the same locks.
//!
//! One engine is one catalog-load session: its location cache lives as long
//! as the engine.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{EntityId, SourcedEntity, catalogs_dir, scan_catalog};
use crate::clone::{CloneManager, CloneSpec};
use crate::config::{BkstgConfig, RepositorySource, SourceKind};
use crate::constants::SCORECARDS_DIR;
use crate::core::BkstgError;
use crate::git::{GitCliTransport, VcsTransport};
use crate::hosting::{GhCliHost, HostingClient, ReviewRequest};
use crate::location::resolver::EntitySet;
use crate::location::{CatalogFetcher, LocationRef, LocationResolver, LocationTarget, Resolution};
use crate::scorecard::{FormulaCache, RankResult, Scorecards};
use crate::sync::{SyncOperator, SyncResult, SyncStatus};
use crate::utils::fs::is_within;
use crate::utils::{atomic_write, command_exists, get_git_command, normalize_path};

/// Everything produced by [`Engine::load_catalog`].
#[derive(Debug, Default)]
pub struct CatalogLoad {
    /// De-duplicated entities: configured sources first, then resolved
    /// locations
    pub entities: Vec<SourcedEntity>,
    /// Rank results per entity
    pub ranks: BTreeMap<EntityId, Vec<RankResult>>,
    /// Scorecards found in configured sources
    pub scorecards: Scorecards,
    /// Location and de-duplication warnings
    pub warnings: Vec<crate::location::LocationWarning>,
    /// Sources that could not be read, with the reason
    pub source_errors: Vec<(String, String)>,
}

/// A source's catalog directory on disk.
struct SourceRoot {
    source: RepositorySource,
    catalog_dir: PathBuf,
}

/// Sync and catalog engine.
#[derive(Debug)]
pub struct Engine {
    config: BkstgConfig,
    clones: CloneManager,
    operator: SyncOperator,
    resolver: LocationResolver,
    formulas: Arc<FormulaCache>,
}

impl Engine {
    /// Creates an engine over explicit transports.
    pub fn new(
        config: BkstgConfig,
        transport: Arc<dyn VcsTransport>,
        hosting: Arc<dyn HostingClient>,
    ) -> Result<Self> {
        let settings = &config.settings;
        let clone_dir = settings.clone_dir().context("Failed to resolve clone directory")?;
        let clones = CloneManager::new(clone_dir, transport)
            .with_timeouts(settings.clone_timeout(), settings.network_timeout());
        let operator = SyncOperator::new(clones.clone(), hosting, settings.clone());
        let fetcher = Arc::new(CatalogFetcher::new(clones.clone(), settings.git_base_url.clone()));
        let resolver = LocationResolver::new(fetcher, settings.cache_ttl(), settings.max_workers);

        Ok(Self {
            config,
            clones,
            operator,
            resolver,
            formulas: Arc::new(FormulaCache::new()),
        })
    }

    /// Creates an engine driving the `git` and `gh` command-line clients.
    pub fn from_config(config: BkstgConfig) -> Result<Self> {
        if !command_exists(get_git_command()) {
            tracing::warn!("'{}' not found in PATH; GitHub sources will be unavailable", get_git_command());
        }
        let transport = Arc::new(GitCliTransport::new(
            config.settings.network_timeout(),
            config.settings.clone_timeout(),
        ));
        Self::new(config, transport, Arc::new(GhCliHost::default()))
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &BkstgConfig {
        &self.config
    }

    /// Clone manager shared by every layer.
    #[must_use]
    pub const fn clones(&self) -> &CloneManager {
        &self.clones
    }

    /// Sync operator.
    #[must_use]
    pub const fn operator(&self) -> &SyncOperator {
        &self.operator
    }

    /// Location resolver of this session.
    #[must_use]
    pub const fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    /// A configured source by name.
    pub fn source(&self, name: &str) -> Result<&RepositorySource> {
        Ok(self.config.find_source(name)?)
    }

    fn syncable_source(&self, name: &str) -> Result<&RepositorySource> {
        let source = self.source(name)?;
        if !source.is_syncable() {
            return Err(BkstgError::InvalidSyncState {
                operation: "synchronize".to_string(),
                state: format!("sync disabled for '{name}'"),
            }
            .into());
        }
        Ok(source)
    }

    /// Status of every synchronized source, computed concurrently.
    ///
    /// With `fetch`, remote refs are refreshed first; a source whose remote
    /// cannot be reached reports `UNKNOWN`.
    pub async fn list_sources(&self, fetch: bool) -> Vec<SyncStatus> {
        let detector = self.operator.detector();
        let checks = self.config.enabled_sources().filter(|s| s.is_syncable()).map(|source| {
            let spec = self.operator.spec(source);
            async move { detector.status(&source.name, &spec, fetch).await }
        });
        futures::future::join_all(checks).await
    }

    /// Fetches every cloned source.
    pub async fn refresh_all(&self) -> Vec<(String, Result<()>)> {
        let sources: Vec<RepositorySource> = self.config.enabled_sources().cloned().collect();
        self.operator.refresh_all(&sources).await
    }

    /// See [`SyncOperator::pull`].
    pub async fn pull(&self, source_name: &str) -> Result<SyncResult> {
        self.operator.pull(self.syncable_source(source_name)?).await
    }

    /// See [`SyncOperator::push`].
    pub async fn push(&self, source_name: &str) -> Result<SyncResult> {
        self.operator.push(self.syncable_source(source_name)?).await
    }

    /// See [`SyncOperator::force_sync`].
    pub async fn force_sync(&self, source_name: &str) -> Result<SyncResult> {
        self.operator.force_sync(self.syncable_source(source_name)?).await
    }

    /// See [`SyncOperator::create_review_request`].
    pub async fn create_review_request(
        &self,
        source_name: &str,
        title: &str,
        body: &str,
    ) -> Result<ReviewRequest> {
        self.operator.create_review_request(self.syncable_source(source_name)?, title, body).await
    }

    /// Open review requests created by bkstg for a source.
    pub async fn list_review_requests(&self, source_name: &str) -> Result<Vec<ReviewRequest>> {
        self.operator.list_open_review_requests(self.syncable_source(source_name)?).await
    }

    /// Resolves location references with this session's cache.
    pub async fn resolve_locations(&self, roots: Vec<LocationRef>) -> Resolution {
        self.resolver.resolve(roots).await
    }

    /// Catalog directory of a source, cloning it when needed.
    ///
    /// Synchronized sources are read as they are, local edits included.
    /// Read-only GitHub sources are brought up to date first when they can
    /// be.
    async fn source_root(&self, source: &RepositorySource) -> Result<PathBuf> {
        let root = match source.kind {
            SourceKind::Local => self.config.local_source_dir(source)?,
            SourceKind::Github => {
                let spec = CloneSpec::for_source(source, &self.config.settings);
                let existed = self.clones.handle(&spec).is_some();
                let handle = self.clones.ensure_clone(&spec).await?;
                if existed && !source.sync_enabled {
                    let update = async {
                        self.clones.refresh(&handle).await?;
                        self.clones.fast_forward_if_behind(&handle).await
                    };
                    if let Err(e) = update.await {
                        tracing::warn!("Using cached copy of '{}': {e:#}", source.name);
                    }
                }
                handle.catalog_root()
            }
        };
        Ok(catalogs_dir(&root))
    }

    async fn source_roots(&self, errors: &mut Vec<(String, String)>) -> Vec<SourceRoot> {
        let sources: Vec<RepositorySource> = self.config.enabled_sources().cloned().collect();
        let lookups = sources.iter().map(|source| self.source_root(source));
        let results = futures::future::join_all(lookups).await;

        let mut roots = Vec::new();
        for (source, result) in sources.into_iter().zip(results) {
            match result {
                Ok(catalog_dir) => roots.push(SourceRoot {
                    source,
                    catalog_dir,
                }),
                Err(e) => {
                    tracing::error!("Failed to load source '{}': {e:#}", source.name);
                    errors.push((source.name, format!("{e:#}")));
                }
            }
        }
        roots
    }

    fn load_scorecards_from(&self, roots: &[SourceRoot]) -> Scorecards {
        let mut scorecards = Scorecards::with_cache(self.formulas.clone());
        for root in roots {
            let failures = scorecards.load_dir(&root.catalog_dir.join(SCORECARDS_DIR));
            for (file, reason) in failures {
                tracing::warn!("Scorecard file {} of '{}' ignored: {reason}", file.display(), root.source.name);
            }
        }
        scorecards
    }

    /// Scorecards defined in the configured sources.
    pub async fn load_scorecards(&self) -> Scorecards {
        let mut errors = Vec::new();
        let roots = self.source_roots(&mut errors).await;
        self.load_scorecards_from(&roots)
    }

    /// Rates `scores` (score id to value) for one rank of one scorecard.
    pub async fn evaluate_rank(
        &self,
        scorecard_id: &str,
        rank_id: &str,
        scores: &HashMap<String, f64>,
    ) -> Result<RankResult> {
        let scorecards = self.load_scorecards().await;
        Ok(scorecards.evaluate_rank(scorecard_id, rank_id, scores)?)
    }

    /// Loads the aggregated catalog.
    ///
    /// Entities from configured sources come first, in configuration order.
    /// `Location` entities found there are resolved, skipping targets inside
    /// a configured catalog since those are already loaded. Every entity is
    /// then rated against the active scorecards.
    pub async fn load_catalog(&self) -> CatalogLoad {
        let mut load = CatalogLoad::default();
        let roots = self.source_roots(&mut load.source_errors).await;

        let mut entities = EntitySet::new();
        let mut location_refs = Vec::new();
        for root in &roots {
            let found = scan_catalog(&root.catalog_dir);
            tracing::debug!("Read {} entities from '{}'", found.len(), root.source.name);
            for sourced in found {
                if sourced.entity.is_location() {
                    location_refs.extend(LocationRef::from_entity(&sourced.entity, &sourced.origin, None));
                }
                entities.push(sourced, &mut load.warnings);
            }
        }

        let external: Vec<LocationRef> = location_refs
            .into_iter()
            .filter(|r| match &r.target {
                LocationTarget::Local(path) => !roots.iter().any(|root| is_within(&root.catalog_dir, path)),
                LocationTarget::Github { .. } => true,
            })
            .collect();
        if !external.is_empty() {
            let resolution = self.resolver.resolve(external).await;
            load.warnings.extend(resolution.warnings);
            for sourced in resolution.entities {
                entities.push(sourced, &mut load.warnings);
            }
        }

        load.scorecards = self.load_scorecards_from(&roots);
        load.entities = entities.into_entities();
        for sourced in &load.entities {
            let results = load.scorecards.rate_entity(&sourced.entity);
            if !results.is_empty() {
                load.ranks.insert(sourced.entity.id(), results);
            }
        }

        tracing::info!(
            "Loaded {} entities ({} warning(s), {} scorecard(s))",
            load.entities.len(),
            load.warnings.len(),
            load.scorecards.len()
        );
        load
    }

    /// Writes an entity or scorecard file into a source's catalog and
    /// auto-commits it when the source allows.
    ///
    /// `relative_path` is relative to the source's catalog directory and may
    /// not leave it. Returns the new head commit when a commit was made.
    pub async fn write_catalog_file(
        &self,
        source_name: &str,
        relative_path: &str,
        content: &str,
    ) -> Result<Option<String>> {
        let source = self.source(source_name)?;
        let catalog_dir = self.source_root(source).await?;

        let target = normalize_path(&catalog_dir.join(relative_path));
        if Path::new(relative_path).is_absolute() || !is_within(&catalog_dir, &target) {
            return Err(BkstgError::Other {
                message: format!("Path '{relative_path}' is outside the catalog of '{source_name}'"),
            }
            .into());
        }
        if source.kind == SourceKind::Local {
            atomic_write(&target, content.as_bytes())?;
            tracing::debug!("Wrote {}", target.display());
            return Ok(None);
        }
        self.operator
            .write_and_commit(source, &target, content.as_bytes(), &format!("bkstg: Update {relative_path}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::location::LocationWarning;
    use crate::scorecard::RankOutcome;
    use crate::sync::SyncState;
    use crate::test_utils::{FakeHost, FakeVcs};
    use tempfile::TempDir;

    const PLATFORM: &str = "https://github.com/acme/platform.git";
    const PAYMENTS: &str = "https://github.com/acme/payments.git";

    const SCORECARD: &str = r#"
kind: ScorecardDefinition
metadata:
  name: quality
spec:
  ranks:
    - id: overall
      name: Overall
      target_kinds: [Component]
      score_refs: [test_coverage, doc_quality]
      formula: "(test_coverage*0.6)+(doc_quality*0.4)"
      thresholds:
        - {min: 90, label: S}
        - {min: 80, label: A}
        - {min: 60, label: B}
        - {min: 40, label: C}
        - {min: 0, label: D}
"#;

    const COMPONENT: &str = "kind: Component
metadata:
  name: checkout
  scores:
    - {score_id: test_coverage, value: 85}
    - {score_id: doc_quality, value: 70}
";

    const LOCATIONS: &str = "kind: Location
metadata:
  name: external
spec:
  type: url
  targets:
    - https://github.com/acme/payments/blob/main/catalogs/services.yaml
    - ./components/checkout.yaml
";

    struct Fixture {
        _temp: TempDir,
        fake: Arc<FakeVcs>,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let fake = Arc::new(FakeVcs::new());
        fake.add_remote(
            PLATFORM,
            "main",
            &[
                ("catalogs/components/checkout.yaml", COMPONENT),
                ("catalogs/locations.yaml", LOCATIONS),
                ("catalogs/scorecards/quality.yaml", SCORECARD),
            ],
        );
        fake.add_remote(
            PAYMENTS,
            "main",
            &[(
                "catalogs/services.yaml",
                "kind: Component\nmetadata:\n  name: payments\n---\nkind: Component\nmetadata:\n  name: checkout\n",
            )],
        );

        let config = BkstgConfig {
            sources: vec![RepositorySource::github("platform", "acme", "platform", "main")],
            settings: Settings {
                clone_dir: temp.path().join("clones").display().to_string(),
                ..Settings::default()
            },
            ..BkstgConfig::default()
        };
        let engine = Engine::new(config, fake.clone(), Arc::new(FakeHost::new())).unwrap();
        Fixture {
            _temp: temp,
            fake,
            engine,
        }
    }

    #[tokio::test]
    async fn test_load_catalog_merges_sources_locations_and_ranks() {
        let fx = fixture();
        let load = fx.engine.load_catalog().await;

        let ids: Vec<String> = load.entities.iter().map(|s| s.entity.id().to_string()).collect();
        assert_eq!(
            ids,
            vec!["Component:default/checkout", "Location:default/external", "Component:default/payments"]
        );
        assert!(load.source_errors.is_empty());

        // The external copy of "checkout" loses to the configured source
        assert!(matches!(
            &load.warnings[..],
            [LocationWarning::DuplicateEntity { entity_id, .. }] if entity_id.as_str() == "Component:default/checkout"
        ));

        let checkout = &load.ranks[&load.entities[0].entity.id()];
        assert_eq!(checkout[0].outcome.label(), Some("B"));
        let payments = &load.ranks[&load.entities[2].entity.id()];
        assert!(matches!(payments[0].outcome, RankOutcome::Unratable { .. }));
    }

    #[tokio::test]
    async fn test_second_load_reuses_clones_and_cache() {
        let fx = fixture();
        fx.engine.load_catalog().await;
        fx.engine.load_catalog().await;
        assert_eq!(fx.fake.call_count("clone"), 2);
        assert_eq!(fx.fake.call_count("fetch"), 0);
    }

    #[tokio::test]
    async fn test_list_sources_and_pull() {
        let fx = fixture();
        let before = fx.engine.list_sources(false).await;
        assert_eq!(before[0].state, SyncState::NotCloned);

        let result = fx.engine.pull("platform").await.unwrap();
        assert_eq!(result.state, SyncState::Synced);
        let after = fx.engine.list_sources(true).await;
        assert_eq!(after[0].message, "Up to date");
    }

    #[tokio::test]
    async fn test_unknown_source_suggests_name() {
        let fx = fixture();
        let err = fx.engine.pull("platfrom").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BkstgError>(),
            Some(BkstgError::SourceNotFound { suggestion: Some(s), .. }) if s == "platform"
        ));
    }

    #[tokio::test]
    async fn test_evaluate_rank_from_source_scorecards() {
        let fx = fixture();
        let scores = HashMap::from([("test_coverage".to_string(), 95.0), ("doc_quality".to_string(), 90.0)]);
        let result = fx.engine.evaluate_rank("quality", "overall", &scores).await.unwrap();
        assert_eq!(result.outcome.label(), Some("S"));
    }

    #[tokio::test]
    async fn test_write_catalog_file_auto_commits() {
        let fx = fixture();
        let before = fx.engine.list_sources(false).await;
        assert_eq!(before[0].state, SyncState::NotCloned);

        let head = fx
            .engine
            .write_catalog_file("platform", "components/cart.yaml", "kind: Component\nmetadata:\n  name: cart\n")
            .await
            .unwrap();
        assert!(head.is_some());
        let status = fx.engine.list_sources(false).await;
        assert_eq!(status[0].state, SyncState::LocalAhead(1));
        assert_eq!(status[0].uncommitted, 0);

        let escaped = fx.engine.write_catalog_file("platform", "../../outside.yaml", "x").await;
        assert!(escaped.is_err());
    }
}
