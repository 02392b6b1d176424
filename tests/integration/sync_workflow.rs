//! End-to-end sync behavior against a real remote.

use anyhow::Result;
use bkstg::core::BkstgError;
use bkstg::sync::SyncState;

use crate::common::{SOURCE, Workspace};

async fn state_of(engine: &bkstg::engine::Engine) -> SyncState {
    engine.list_sources(true).await[0].state
}

#[tokio::test]
async fn test_first_pull_clones_and_reports_synced() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.engine()?;

    assert_eq!(engine.list_sources(false).await[0].state, SyncState::NotCloned);

    let result = engine.pull(SOURCE).await?;
    assert_eq!(result.state, SyncState::Synced);
    assert_eq!(result.message, "Already up to date");
    assert!(ws.working_copy().repo_path().join("catalogs/components/checkout.yaml").is_file());

    let status = &engine.list_sources(true).await[0];
    assert_eq!(status.state, SyncState::Synced);
    assert_eq!(status.message, "Up to date");
    Ok(())
}

#[tokio::test]
async fn test_pull_fast_forwards_teammate_commits() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    ws.remote.publish(&[("catalogs/components/cart.yaml", "kind: Component\nmetadata:\n  name: cart\n")], "Add cart")?;
    ws.remote.publish(&[("catalogs/components/search.yaml", "kind: Component\nmetadata:\n  name: search\n")], "Add search")?;
    assert_eq!(state_of(&engine).await, SyncState::RemoteAhead(2));

    let result = engine.pull(SOURCE).await?;
    assert_eq!(result.message, "Pulled 2 commit(s)");
    assert_eq!(result.state, SyncState::Synced);
    assert_eq!(ws.working_copy().rev_parse_head()?, ws.remote.head()?);
    assert!(ws.working_copy().repo_path().join("catalogs/components/search.yaml").is_file());
    Ok(())
}

#[tokio::test]
async fn test_write_then_push_publishes_commit() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let head = engine
        .write_catalog_file(SOURCE, "components/cart.yaml", "kind: Component\nmetadata:\n  name: cart\n")
        .await?;
    assert!(head.is_some());
    assert_eq!(state_of(&engine).await, SyncState::LocalAhead(1));

    let result = engine.push(SOURCE).await?;
    assert_eq!(result.message, "Pushed 1 commit(s)");
    assert_eq!(result.state, SyncState::Synced);
    assert_eq!(ws.remote.head()?, ws.working_copy().rev_parse_head()?);

    let again = engine.push(SOURCE).await?;
    assert_eq!(again.message, "Nothing to push");
    Ok(())
}

#[tokio::test]
async fn test_push_commits_pending_changes_first() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let copy = ws.working_copy();
    copy.write_file("catalogs/components/checkout.yaml", "kind: Component\nmetadata:\n  name: checkout\n")?;
    copy.write_file("catalogs/components/new.yaml", "kind: Component\nmetadata:\n  name: new\n")?;

    let status = &engine.list_sources(false).await[0];
    assert_eq!(status.state, SyncState::Synced);
    assert_eq!(status.uncommitted, 2);

    engine.push(SOURCE).await?;
    assert!(copy.status_porcelain()?.is_empty());
    let subject = std::process::Command::new("git")
        .args(["log", "-1", "--format=%s"])
        .current_dir(copy.repo_path())
        .output()?;
    assert_eq!(String::from_utf8_lossy(&subject.stdout).trim(), "bkstg: Update 2 file(s)");
    assert_eq!(ws.remote.head()?, copy.rev_parse_head()?);
    Ok(())
}

#[tokio::test]
async fn test_diverged_histories_refuse_pull() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let copy = ws.working_copy();
    copy.commit_files(&[("catalogs/components/local.yaml", "kind: Component\nmetadata:\n  name: local\n")], "Local")?;
    ws.remote.publish(&[("catalogs/components/remote.yaml", "kind: Component\nmetadata:\n  name: remote\n")], "Remote")?;

    let status = &engine.list_sources(true).await[0];
    assert_eq!(status.state, SyncState::Diverged);
    assert_eq!((status.ahead, status.behind), (1, 1));

    let head_before = copy.rev_parse_head()?;
    let err = engine.pull(SOURCE).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<BkstgError>(), Some(BkstgError::PullConflict { .. })));
    assert_eq!(copy.rev_parse_head()?, head_before);
    assert!(copy.status_porcelain()?.is_empty());

    let push = engine.push(SOURCE).await;
    assert!(push.is_err());
    Ok(())
}

#[tokio::test]
async fn test_conflicting_edits_are_detected() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    ws.working_copy().commit_files(
        &[("catalogs/components/checkout.yaml", "kind: Component\nmetadata:\n  name: checkout\n  title: Local\n")],
        "Local title",
    )?;
    ws.remote.publish(
        &[("catalogs/components/checkout.yaml", "kind: Component\nmetadata:\n  name: checkout\n  title: Remote\n")],
        "Remote title",
    )?;

    assert_eq!(state_of(&engine).await, SyncState::Conflict);
    // Detection must not touch the working tree
    assert!(ws.working_copy().status_porcelain()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_interrupted_merge_is_never_pushed() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;
    let checkout = "catalogs/components/checkout.yaml";

    let copy = ws.working_copy();
    copy.commit_files(&[(checkout, "kind: Component\nmetadata:\n  name: checkout\n  title: Local\n")], "Local title")?;
    let published = ws.remote.publish(
        &[(checkout, "kind: Component\nmetadata:\n  name: checkout\n  title: Remote\n")],
        "Remote title",
    )?;
    copy.fetch()?;
    assert!(!copy.merge("origin/main")?);

    let status = &engine.list_sources(false).await[0];
    assert_eq!(status.state, SyncState::Conflict);
    assert_eq!(status.conflicts, vec![checkout.to_string()]);

    let err = engine.push(SOURCE).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<BkstgError>(), Some(BkstgError::InvalidSyncState { .. })));
    let err = engine.create_review_request(SOURCE, "Resolve", "").await.unwrap_err();
    assert!(matches!(err.downcast_ref::<BkstgError>(), Some(BkstgError::InvalidSyncState { .. })));

    assert_eq!(ws.remote.head()?, published);
    assert!(ws.remote.bare.branches()?.iter().all(|b| !b.starts_with("bkstg-sync-")));
    assert!(ws.host.created().is_empty());
    assert!(copy.status_porcelain()?.contains("UU "));

    let result = engine.force_sync(SOURCE).await?;
    assert_eq!(result.state, SyncState::Synced);
    let content = std::fs::read_to_string(copy.repo_path().join(checkout))?;
    assert!(content.contains("title: Remote"));
    assert!(!content.contains("<<<<<<<"));
    Ok(())
}

#[tokio::test]
async fn test_diverged_conflict_lists_files() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;
    let checkout = "catalogs/components/checkout.yaml";

    ws.working_copy().commit_files(&[(checkout, "kind: Component\nmetadata:\n  name: checkout\n  title: A\n")], "A")?;
    ws.remote.publish(&[(checkout, "kind: Component\nmetadata:\n  name: checkout\n  title: B\n")], "B")?;

    let status = &engine.list_sources(true).await[0];
    assert_eq!(status.state, SyncState::Conflict);
    assert_eq!(status.conflicts, vec![checkout.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_non_ascii_file_names_are_auto_committed() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let head = engine
        .write_catalog_file(SOURCE, "components/café.yaml", "kind: Component\nmetadata:\n  name: cafe\n")
        .await?;
    assert!(head.is_some());
    assert!(ws.working_copy().status_porcelain()?.is_empty());
    assert_eq!(state_of(&engine).await, SyncState::LocalAhead(1));
    Ok(())
}

#[tokio::test]
async fn test_force_sync_discards_local_work() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let copy = ws.working_copy();
    copy.commit_files(&[("catalogs/components/local.yaml", "kind: Component\nmetadata:\n  name: local\n")], "Local")?;
    copy.write_file("catalogs/scratch.yaml", "kind: Component\nmetadata:\n  name: scratch\n")?;
    ws.remote.publish(&[("catalogs/components/remote.yaml", "kind: Component\nmetadata:\n  name: remote\n")], "Remote")?;

    let result = engine.force_sync(SOURCE).await?;
    assert_eq!(result.state, SyncState::Synced);
    assert_eq!(result.message, "Force sync complete - local changes discarded");
    assert_eq!(copy.rev_parse_head()?, ws.remote.head()?);
    assert!(!copy.repo_path().join("catalogs/scratch.yaml").exists());
    assert!(!copy.repo_path().join("catalogs/components/local.yaml").exists());
    assert!(copy.repo_path().join("catalogs/components/remote.yaml").is_file());
    Ok(())
}

#[tokio::test]
async fn test_review_request_publishes_branch_and_restores_checkout() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    engine
        .write_catalog_file(SOURCE, "components/cart.yaml", "kind: Component\nmetadata:\n  name: cart\n")
        .await?;
    let remote_head = ws.remote.head()?;

    let request = engine.create_review_request(SOURCE, "Add cart", "New component").await?;
    assert!(request.head.starts_with("bkstg-sync-"));
    assert_eq!(request.base, "main");

    let created = ws.host.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].title, "Add cart");
    assert_eq!(created[0].repository, "acme/platform");

    // The branch exists remotely; the source branch itself was not pushed
    assert!(ws.remote.bare.branches()?.contains(&request.head));
    assert_eq!(ws.remote.head()?, remote_head);
    assert_eq!(ws.working_copy().get_current_branch()?, "main");
    Ok(())
}

#[tokio::test]
async fn test_review_request_requires_local_commits() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    let err = engine.create_review_request(SOURCE, "Nothing", "").await.unwrap_err();
    assert!(matches!(err.downcast_ref::<BkstgError>(), Some(BkstgError::InvalidSyncState { .. })));
    assert!(ws.host.created().is_empty());
    assert_eq!(ws.working_copy().get_current_branch()?, "main");
    Ok(())
}

#[tokio::test]
async fn test_unreachable_remote_reports_unknown() -> Result<()> {
    let ws = Workspace::new()?;
    let engine = ws.cloned_engine().await?;

    std::fs::remove_dir_all(ws.remote.bare.repo_path())?;
    let status = &engine.list_sources(true).await[0];
    assert_eq!(status.state, SyncState::Unknown);
    assert_eq!(status.message, "Unable to get status");

    // Without fetching, the last known remote state is still usable
    assert_eq!(engine.list_sources(false).await[0].state, SyncState::Synced);
    Ok(())
}
