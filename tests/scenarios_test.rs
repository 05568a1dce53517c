// End-to-end scenarios over the public service API.
//
// Covers snapshots, layered directories, branching, comparison, update,
// flatten and reset, each run against a fresh in-memory repository.

use anyhow::Result;
use strata::{AvmError, AvmRepository, AvmService, DiffCode, NameFilter, UpdateOptions};

async fn setup() -> Result<AvmService> {
    let service = AvmService::new(AvmRepository::in_memory());
    service.create_store("main").await?;
    service.create_store("layer").await?;
    service.create_directory("main:/", "a").await?;
    service.create_file("main:/a", "foo", b"hi").await?;
    Ok(service)
}

async fn layered() -> Result<AvmService> {
    let service = setup().await?;
    service.create_layered_directory("main:/a", "layer:/", "layer").await?;
    Ok(service)
}

// ============================================================================
// Snapshots and layering
// ============================================================================

#[tokio::test]
async fn test_snapshot_freezes_content() -> Result<()> {
    let service = setup().await?;
    let version = service.create_snapshot("main", Some("first"), None).await?;
    assert_eq!(version, 1);

    service.write_file("main:/a/foo", b"later").await?;
    assert!(service.lookup(1, "main:/a/foo").await?.is_file());
    assert_eq!(service.get_file_content(1, "main:/a/foo").await?, b"hi".to_vec());
    assert_eq!(service.get_file_content(-1, "main:/a/foo@1").await?, b"hi".to_vec());
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"later".to_vec());

    let versions = service.get_store_versions("main").await?;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[1].tag.as_deref(), Some("first"));
    Ok(())
}

#[tokio::test]
async fn test_new_layer_matches_its_target() -> Result<()> {
    let service = layered().await?;
    let diffs = service.compare(-1, "layer:/layer", -1, "main:/a", None).await?;
    assert!(diffs.is_empty());
    assert_eq!(service.get_file_content(-1, "layer:/layer/foo").await?, b"hi".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_write_through_layer_then_update_and_flatten() -> Result<()> {
    let service = layered().await?;
    service.write_file("layer:/layer/foo", b"new").await?;

    let diffs = service.compare(-1, "layer:/layer", -1, "main:/a", None).await?;
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].to_string(), "[layer:/layer/foo > main:/a/foo]");
    assert_eq!(diffs[0].code, DiffCode::Newer);

    service.update(&diffs, &UpdateOptions::default()).await?;
    assert!(service.compare(-1, "layer:/layer", -1, "main:/a", None).await?.is_empty());
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"new".to_vec());

    service.flatten("layer:/layer", "main:/a").await?;
    assert!(service.get_directory_listing(-1, "layer:/layer", true).await?.is_empty());
    assert!(service.get_layering_info(-1, "layer:/layer/foo").await?.background);
    assert_eq!(service.get_file_content(-1, "layer:/layer/foo").await?, b"new".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_closing_cycle_is_rejected_without_creating_nodes() -> Result<()> {
    let service = setup().await?;
    service.create_layered_directory("main:/c", "main:/", "b").await?;
    let nodes = service.repository().node_count();

    let result = service.create_layered_directory("main:/b", "main:/", "c").await;
    assert!(matches!(result, Err(AvmError::Cycle(_))));
    assert_eq!(service.repository().node_count(), nodes);
    assert!(matches!(service.lookup(-1, "main:/c").await, Err(AvmError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_branch_falls_behind_its_source() -> Result<()> {
    let service = setup().await?;
    service.create_branch(-1, "main:/a", "main:/", "branch").await?;
    service.write_file("main:/a/foo", b"moved on").await?;

    let diffs = service.compare(-1, "main:/branch", -1, "main:/a", None).await?;
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].source_path, "main:/branch/foo");
    assert_eq!(diffs[0].code, DiffCode::Older);
    Ok(())
}

#[tokio::test]
async fn test_layer_writes_never_touch_committed_target() -> Result<()> {
    let service = layered().await?;
    let before = service.create_snapshot("main", None, None).await?;

    service.write_file("layer:/layer/foo", b"override").await?;
    service.create_file("layer:/layer", "extra", b"only here").await?;
    service.create_directory("layer:/layer", "nested").await?;
    let after = service.create_snapshot("main", None, None).await?;

    assert!(service.compare(before, "main:/", after, "main:/", None).await?.is_empty());
    assert!(service.compare(before, "main:/", -1, "main:/", None).await?.is_empty());
    assert_eq!(service.get_file_content(after, "main:/a/foo").await?, b"hi".to_vec());
    assert!(matches!(service.lookup(-1, "main:/a/extra").await, Err(AvmError::NotFound(_))));
    Ok(())
}

// ============================================================================
// Comparison
// ============================================================================

#[tokio::test]
async fn test_compare_orders_parents_first_and_honours_filter() -> Result<()> {
    let service = setup().await?;
    service.create_store("other").await?;
    service.create_directory("other:/", "a").await?;
    service.create_directory("main:/a", "sub").await?;
    service.create_file("main:/a/sub", "x", b"x").await?;
    service.create_file("main:/a", "notes.bak", b"old").await?;

    let diffs = service.compare(-1, "main:/a", -1, "other:/a", None).await?;
    let paths: Vec<_> = diffs.iter().map(|d| d.source_path.as_str()).collect();
    assert_eq!(paths, vec!["main:/a/foo", "main:/a/notes.bak", "main:/a/sub"]);
    assert!(diffs.windows(2).all(|w| w[0].order_value < w[1].order_value));

    let filter = NameFilter::new("*.BAK");
    let filtered = service.compare(-1, "main:/a", -1, "other:/a", Some(&filter)).await?;
    assert_eq!(filtered.len(), 2);

    let missing = service.compare(-1, "main:/a", -1, "other:/missing", None).await?;
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].dest_path, "other:/missing");
    Ok(())
}

#[tokio::test]
async fn test_removed_entry_is_newer_than_live_one() -> Result<()> {
    let service = layered().await?;
    service.remove_node("layer:/layer", "foo").await?;

    let diffs = service.compare(-1, "layer:/layer", -1, "main:/a", None).await?;
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].code, DiffCode::Newer);

    service.update(&diffs, &UpdateOptions::default()).await?;
    assert!(matches!(service.lookup(-1, "main:/a/foo").await, Err(AvmError::NotFound(_))));
    assert!(service.compare(-1, "layer:/layer", -1, "main:/a", None).await?.is_empty());
    Ok(())
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn test_update_refuses_to_regress_unless_asked() -> Result<()> {
    let service = setup().await?;
    service.create_branch(-1, "main:/a", "main:/", "branch").await?;
    service.write_file("main:/a/foo", b"newer").await?;
    let diffs = service.compare(-1, "main:/branch", -1, "main:/a", None).await?;

    let refused = service.update(&diffs, &UpdateOptions::default()).await;
    assert!(matches!(refused, Err(AvmError::Conflict(_))));

    let skip = UpdateOptions { ignore_older: true, ..UpdateOptions::default() };
    service.update(&diffs, &skip).await?;
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"newer".to_vec());

    let force = UpdateOptions { override_older: true, ..UpdateOptions::default() };
    service.update(&diffs, &force).await?;
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"hi".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_update_shares_frozen_subtrees_across_stores() -> Result<()> {
    let service = setup().await?;
    service.create_store("mirror").await?;
    let diffs = service.compare(-1, "main:/a", -1, "mirror:/a", None).await?;
    assert_eq!(diffs.len(), 1);

    let options = UpdateOptions { tag: Some("sync".to_string()), ..UpdateOptions::default() };
    service.update(&diffs, &options).await?;
    assert!(service.compare(-1, "main:/a", -1, "mirror:/a", None).await?.is_empty());
    assert_eq!(service.lookup(-1, "main:/a").await?.id, service.lookup(-1, "mirror:/a").await?.id);
    assert_eq!(service.get_latest_snapshot_id("mirror").await?, 1);
    let versions = service.get_store_versions("mirror").await?;
    assert_eq!(versions[1].tag.as_deref(), Some("sync"));

    service.write_file("mirror:/a/foo", b"mirror only").await?;
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"hi".to_vec());
    assert_eq!(service.compare(-1, "main:/a", -1, "mirror:/a", None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_update_rejects_snapshot_destination() -> Result<()> {
    let service = setup().await?;
    service.create_store("mirror").await?;
    let diffs = service.compare(-1, "main:/a", 0, "mirror:/a", None).await?;
    let result = service.update(&diffs, &UpdateOptions::default()).await;
    assert!(matches!(result, Err(AvmError::BadArgument(_))));
    Ok(())
}

#[tokio::test]
async fn test_failed_update_publishes_no_snapshot() -> Result<()> {
    let service = setup().await?;
    service.create_store("other").await?;
    let diffs = service.compare(-1, "main:/a", -1, "other:/x/y", None).await?;
    assert_eq!(diffs.len(), 1);
    let before = service.get_next_version_id("main").await?;

    let options = UpdateOptions { snapshot_source: true, ..UpdateOptions::default() };
    let result = service.update(&diffs, &options).await;
    assert!(matches!(result, Err(AvmError::NotFound(_))));
    assert_eq!(service.get_next_version_id("main").await?, before);
    assert_eq!(service.get_store_versions("main").await?.len(), 1);
    assert_eq!(service.get_next_version_id("other").await?, 1);
    assert!(service.get_store("main").await?.has_changes);
    assert!(matches!(service.lookup(before, "main:/a").await, Err(AvmError::NotFound(_))));

    service.create_directory("other:/", "x").await?;
    service.update(&diffs, &UpdateOptions::default()).await?;
    assert_eq!(service.get_next_version_id("main").await?, before + 1);
    assert_eq!(service.get_file_content(-1, "other:/x/y/foo").await?, b"hi".to_vec());
    assert_eq!(service.get_file_content(before, "main:/a/foo").await?, b"hi".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_failed_branch_publishes_no_snapshot() -> Result<()> {
    let service = setup().await?;
    let result = service.create_branch(-1, "main:/a", "main:/missing", "branch").await;
    assert!(matches!(result, Err(AvmError::NotFound(_))));
    assert_eq!(service.get_next_version_id("main").await?, 1);
    assert!(service.get_store("main").await?.has_changes);
    Ok(())
}

// ============================================================================
// Flatten and reset
// ============================================================================

#[tokio::test]
async fn test_flatten_promotes_overrides_and_is_idempotent() -> Result<()> {
    let service = layered().await?;
    service.write_file("layer:/layer/foo", b"promoted").await?;
    service.create_file("layer:/layer", "extra", b"new file").await?;

    service.flatten("layer:/layer", "main:/a").await?;
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"promoted".to_vec());
    assert_eq!(service.get_file_content(-1, "main:/a/extra").await?, b"new file".to_vec());
    assert!(service.get_directory_listing(-1, "layer:/layer", true).await?.is_empty());
    assert!(service.compare(-1, "layer:/layer", -1, "main:/a", None).await?.is_empty());

    let nodes = service.repository().node_count();
    let layer_state = service.get_store("layer").await?;
    service.flatten("layer:/layer", "main:/a").await?;
    assert_eq!(service.repository().node_count(), nodes);
    assert_eq!(service.get_store("layer").await?, layer_state);
    Ok(())
}

#[tokio::test]
async fn test_flatten_requires_layered_directory() -> Result<()> {
    let service = setup().await?;
    let result = service.flatten("main:/a", "main:/a").await;
    assert!(matches!(result, Err(AvmError::WrongType(_))));
    Ok(())
}

#[tokio::test]
async fn test_reset_layer_discards_overrides() -> Result<()> {
    let service = layered().await?;
    service.write_file("layer:/layer/foo", b"discard me").await?;
    service.create_file("layer:/layer", "extra", b"x").await?;

    service.reset_layer("layer:/layer").await?;
    assert!(service.get_directory_listing(-1, "layer:/layer", true).await?.is_empty());
    assert_eq!(service.get_file_content(-1, "layer:/layer/foo").await?, b"hi".to_vec());
    assert!(matches!(service.lookup(-1, "layer:/layer/extra").await, Err(AvmError::NotFound(_))));

    let result = service.reset_layer("main:/a").await;
    assert!(matches!(result, Err(AvmError::WrongType(_))));
    Ok(())
}

#[tokio::test]
async fn test_retarget_switches_what_shows_through() -> Result<()> {
    let service = layered().await?;
    service.create_directory("main:/", "b").await?;
    service.create_file("main:/b", "bar", b"bar").await?;

    service.retarget_layered_directory("layer:/layer", "main:/b").await?;
    assert!(service.lookup(-1, "layer:/layer/bar").await.is_ok());
    assert!(matches!(service.lookup(-1, "layer:/layer/foo").await, Err(AvmError::NotFound(_))));

    let own = service.retarget_layered_directory("layer:/layer", "layer:/layer").await;
    assert!(matches!(own, Err(AvmError::Cycle(_))));
    Ok(())
}
