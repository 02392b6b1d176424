//! Catalog aggregation over real clones and local location targets.

use anyhow::Result;
use bkstg::config::{RepositorySource, SourceKind};
use bkstg::location::LocationWarning;
use bkstg::scorecard::{RankOutcome, UnratableReason};
use std::collections::HashMap;
use std::path::Path;

use crate::common::{SOURCE, Workspace};

fn write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn ids(load: &bkstg::engine::CatalogLoad) -> Vec<String> {
    load.entities.iter().map(|s| s.entity.id().to_string()).collect()
}

/// Workspace whose catalog points at `external/` outside every source:
/// `team.yaml` and `more.yaml` reference each other, and one optional target
/// does not exist.
fn workspace_with_locations() -> Result<Workspace> {
    let ws = Workspace::new()?;
    let external = ws.temp.path().join("external");
    write(
        &external.join("team.yaml"),
        "kind: Component\nmetadata:\n  name: team-service\n---\n\
         kind: Location\nmetadata:\n  name: team-more\nspec:\n  target: ./more.yaml\n",
    )?;
    write(
        &external.join("more.yaml"),
        "kind: Component\nmetadata:\n  name: billing\n---\n\
         kind: Location\nmetadata:\n  name: back-to-team\nspec:\n  target: ./team.yaml\n",
    )?;

    let locations = format!(
        "kind: Location\nmetadata:\n  name: teams\nspec:\n  type: file\n  target: {team}\n---\n\
         kind: Location\nmetadata:\n  name: maybe\nspec:\n  type: file\n  presence: optional\n  target: {missing}\n",
        team = external.join("team.yaml").display(),
        missing = external.join("missing.yaml").display(),
    );
    ws.remote.publish(&[("catalogs/locations.yaml", locations.as_str())], "Add locations")?;
    Ok(ws)
}

#[tokio::test]
async fn test_load_catalog_follows_locations() -> Result<()> {
    let ws = workspace_with_locations()?;
    let engine = ws.engine()?;
    let load = engine.load_catalog().await;

    assert!(load.source_errors.is_empty(), "{:?}", load.source_errors);
    let ids = ids(&load);
    assert_eq!(ids[0], "Component:default/checkout");
    for expected in ["Component:default/team-service", "Component:default/billing"] {
        assert!(ids.contains(&expected.to_string()), "missing {expected} in {ids:?}");
    }
    let team = ids.iter().position(|i| i == "Component:default/team-service");
    let billing = ids.iter().position(|i| i == "Component:default/billing");
    assert!(team < billing);

    let cycle = load.warnings.iter().find_map(|w| match w {
        LocationWarning::CycleDetected { chain } => Some(chain),
        _ => None,
    });
    let chain = cycle.expect("cycle warning");
    assert!(chain.first().is_some_and(|id| id.as_str().ends_with("team.yaml")));
    assert!(chain.last().is_some_and(|id| id.as_str().ends_with("team.yaml")));

    assert!(load.warnings.iter().any(|w| matches!(
        w,
        LocationWarning::FetchFailed { location, required: false, .. } if location.as_str().ends_with("missing.yaml")
    )));
    Ok(())
}

#[tokio::test]
async fn test_load_catalog_rates_components() -> Result<()> {
    let ws = workspace_with_locations()?;
    let engine = ws.engine()?;
    let load = engine.load_catalog().await;

    assert_eq!(load.scorecards.len(), 1);
    let checkout = load.entities.iter().find(|s| s.entity.metadata.name == "checkout").map(|s| s.entity.id());
    let results = &load.ranks[&checkout.expect("checkout loaded")];
    assert_eq!(results.len(), 1);
    match &results[0].outcome {
        RankOutcome::Rated { value, label } => {
            assert!((value - 79.0).abs() < 1e-9);
            assert_eq!(label.as_str(), "B");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let billing = load.entities.iter().find(|s| s.entity.metadata.name == "billing").map(|s| s.entity.id());
    let results = &load.ranks[&billing.expect("billing loaded")];
    assert!(matches!(
        &results[0].outcome,
        RankOutcome::Unratable { reason: UnratableReason::MissingScore { .. } }
    ));

    // Location entities are not rated
    assert!(load.ranks.keys().all(|id| id.as_str().starts_with("Component:")));
    Ok(())
}

#[tokio::test]
async fn test_local_source_wins_duplicates() -> Result<()> {
    let ws = Workspace::new()?;
    let local_dir = ws.temp.path().join("local-catalog");
    write(
        &local_dir.join("catalogs/checkout.yaml"),
        "kind: Component\nmetadata:\n  name: checkout\n  title: Local copy\n",
    )?;

    let mut config = ws.config();
    let local = RepositorySource {
        kind: SourceKind::Local,
        sync_enabled: false,
        ..RepositorySource::github("local", "", "", "main").with_subpath(local_dir.display().to_string())
    };
    config.sources.insert(0, local);
    let engine = bkstg::engine::Engine::new(
        config,
        std::sync::Arc::new(bkstg::git::GitCliTransport::default()),
        ws.host.clone(),
    )?;

    let load = engine.load_catalog().await;
    let checkout: Vec<_> = load.entities.iter().filter(|s| s.entity.metadata.name == "checkout").collect();
    assert_eq!(checkout.len(), 1);
    assert!(checkout[0].origin.starts_with(&local_dir));
    assert!(load.warnings.iter().any(|w| matches!(w, LocationWarning::DuplicateEntity { .. })));

    // Only the GitHub source is synchronized
    let statuses = engine.list_sources(false).await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].source_name, SOURCE);
    Ok(())
}

#[tokio::test]
async fn test_evaluate_rank_uses_source_scorecards() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.engine()?;

    let scores = HashMap::from([("test_coverage".to_string(), 100.0), ("doc_quality".to_string(), 50.0)]);
    let result = engine.evaluate_rank("quality", "overall", &scores).await?;
    assert_eq!(result.outcome.label(), Some("A"));

    let partial = HashMap::from([("test_coverage".to_string(), 100.0)]);
    let result = engine.evaluate_rank("quality", "overall", &partial).await?;
    assert!(result.outcome.label().is_none());

    assert!(engine.evaluate_rank("quality", "missing", &scores).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_write_outside_catalog_is_rejected() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    assert!(engine.write_catalog_file(SOURCE, "../escape.yaml", "x").await.is_err());
    assert!(!ws.working_copy().repo_path().join("escape.yaml").exists());
    assert!(ws.working_copy().status_porcelain()?.is_empty());
    Ok(())
}

const MIXED_SCORECARD: &str = "apiVersion: backstage.io/v1alpha1
kind: ScorecardDefinition
metadata:
  name: mixed
spec:
  ranks:
    - id: overall
      name: Overall
      score_refs: [test_coverage]
      formula: \"test_coverage\"
      thresholds:
        - {min: 80, label: A}
        - {min: 0, label: B}
    - id: ownership
      name: Ownership
      score_refs: [test_coverage, doc_quality]
      entity_refs: [owner]
      rules:
        - condition: \"entity.owner == 'team-a'\"
          formula: \"doc_quality\"
        - formula: \"test_coverage\"
      thresholds:
        - {min: 80, label: A}
        - {min: 0, label: B}
    - id: verdict
      name: Verdict
      score_refs: [doc_quality]
      label_function: |
        if doc_quality >= 60:
            return 'documented'
        return 'undocumented'
    - id: broken
      name: Broken
      formula: \"missing_score * 2\"
      thresholds:
        - {min: 0, label: B}
";

#[tokio::test]
async fn test_scorecard_modes_and_broken_rank_isolation() -> Result<()> {
    let ws = Workspace::with_files(&[
        ("catalogs/components/checkout.yaml", crate::common::CHECKOUT),
        ("catalogs/scorecards/mixed.yaml", MIXED_SCORECARD),
    ])?;
    let engine = ws.engine()?;
    let load = engine.load_catalog().await;

    assert_eq!(load.scorecards.len(), 1);
    let card = load.scorecards.get("mixed")?;
    assert_eq!(card.ranks.len(), 3);
    assert_eq!(card.skipped.len(), 1);
    assert_eq!(card.skipped[0].rank_id, "broken");

    let checkout = load.entities[0].entity.id();
    let outcomes: HashMap<&str, &RankOutcome> =
        load.ranks[&checkout].iter().map(|r| (r.rank_id.as_str(), &r.outcome)).collect();
    assert_eq!(outcomes["overall"].label(), Some("A"));
    assert_eq!(outcomes["ownership"].value(), Some(70.0));
    assert_eq!(outcomes["ownership"].label(), Some("B"));
    assert_eq!(
        outcomes["verdict"],
        &RankOutcome::Labelled {
            label: "documented".to_string()
        }
    );

    let bare = engine
        .evaluate_rank("mixed", "ownership", &HashMap::from([
            ("test_coverage".to_string(), 85.0),
            ("doc_quality".to_string(), 70.0),
        ]))
        .await?;
    assert_eq!(bare.outcome.value(), Some(85.0));
    Ok(())
}
