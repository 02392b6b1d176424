//! Command-line smoke tests.

use anyhow::Result;
use predicates::prelude::*;

use crate::common::{SOURCE, Workspace, bkstg_cmd};

#[test]
fn test_help_lists_commands() -> Result<()> {
    let temp = tempfile::TempDir::new()?;
    bkstg_cmd(temp.path())?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("force-sync"))
        .stdout(predicate::str::contains("review-request"))
        .stdout(predicate::str::contains("rank"));
    Ok(())
}

#[tokio::test]
async fn test_sources_pull_and_status_table() -> Result<()> {
    let ws = Workspace::new()?;
    let config = ws.write_config(&ws.config()).await?;
    let project = config.parent().expect("config has a parent");

    bkstg_cmd(project)?
        .arg("sources")
        .assert()
        .success()
        .stdout(predicate::str::contains(SOURCE))
        .stdout(predicate::str::contains("NOT_CLONED"));

    bkstg_cmd(project)?
        .args(["pull", SOURCE])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already up to date"));

    bkstg_cmd(project)?
        .args(["sources", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"SYNCED\""));
    Ok(())
}

#[tokio::test]
async fn test_unknown_source_fails_with_suggestion() -> Result<()> {
    let ws = Workspace::new()?;
    let config = ws.write_config(&ws.config()).await?;

    bkstg_cmd(ws.temp.path())?
        .args(["--config", &config.display().to_string(), "pull", "platfrom"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Source 'platfrom' is not configured"))
        .stderr(predicate::str::contains("platform"));
    Ok(())
}

#[tokio::test]
async fn test_force_sync_requires_confirmation() -> Result<()> {
    let ws = Workspace::new()?;
    let config = ws.write_config(&ws.config()).await?;
    let project = config.parent().expect("config has a parent");

    bkstg_cmd(project)?
        .args(["force-sync", SOURCE])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    Ok(())
}

#[tokio::test]
async fn test_load_and_rank_commands() -> Result<()> {
    let ws = Workspace::new()?;
    let config = ws.write_config(&ws.config()).await?;
    let project = config.parent().expect("config has a parent");

    bkstg_cmd(project)?
        .args(["load", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Component:default/checkout"))
        .stdout(predicate::str::contains("\"label\": \"B\""));

    bkstg_cmd(project)?
        .args(["rank", "quality", "overall", "test_coverage=95", "doc_quality=90"])
        .assert()
        .success()
        .stdout(predicate::str::contains("quality/overall: S"));

    bkstg_cmd(project)?
        .args(["rank", "quality", "overall", "test_coverage=95"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unratable"));

    bkstg_cmd(project)?
        .args(["rank", "quality", "overall", "test_coverage"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SCORE=VALUE"));
    Ok(())
}
