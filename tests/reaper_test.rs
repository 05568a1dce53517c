// Orphan reaper behaviour against live repositories.

use anyhow::Result;
use serde_json::json;
use std::time::Duration;
use strata::config::ReaperConfig;
use strata::{AvmRepository, AvmService, OrphanReaper};

async fn main_store() -> Result<AvmService> {
    let service = AvmService::new(AvmRepository::in_memory());
    service.create_store("main").await?;
    service.create_directory("main:/", "a").await?;
    service.create_file("main:/a", "foo", b"hi").await?;
    Ok(service)
}

#[tokio::test]
async fn test_purged_store_is_reclaimed() -> Result<()> {
    let service = main_store().await?;
    let kept = service.repository().node_count();

    service.create_store("scratch").await?;
    service.create_file("scratch:/", "tmp", b"scratch data").await?;
    service.set_node_property("scratch:/tmp", "cm:title", json!("temporary")).await?;
    service.purge_store("scratch").await?;

    let reaper = OrphanReaper::new(service.repository().clone(), ReaperConfig::default());
    let stats = reaper.sweep_once().await?;
    assert_eq!(stats.reclaimed_nodes, 3);
    assert_eq!(stats.reclaimed_contents, 1);
    assert_eq!(stats.reclaimed_property_owners, 1);
    assert_eq!(service.repository().node_count(), kept);
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"hi".to_vec());

    let again = reaper.sweep_once().await?;
    assert_eq!(again.reclaimed_nodes, 0);
    Ok(())
}

#[tokio::test]
async fn test_layer_target_survives_sweeps() -> Result<()> {
    let service = main_store().await?;
    service.create_store("layer").await?;
    service.create_layered_directory("main:/a", "layer:/", "layer").await?;
    service.write_file("layer:/layer/foo", b"override").await?;

    let reaper = OrphanReaper::new(service.repository().clone(), ReaperConfig::default());
    let stats = reaper.sweep_once().await?;
    assert_eq!(stats.reclaimed_nodes, 0);
    assert_eq!(service.get_file_content(-1, "layer:/layer/foo").await?, b"override".to_vec());
    assert_eq!(service.get_file_content(-1, "main:/a/foo").await?, b"hi".to_vec());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeps_concurrent_with_writes_lose_nothing() -> Result<()> {
    let service = main_store().await?;
    let writer = service.clone();
    let writes = tokio::spawn(async move {
        for i in 0..40 {
            writer.create_file("main:/a", &format!("f{i}"), format!("{i}").as_bytes()).await?;
            if i % 10 == 0 {
                writer.create_snapshot("main", None, None).await?;
            }
        }
        anyhow::Ok(())
    });

    let config = ReaperConfig { yield_every: 1, ..ReaperConfig::default() };
    let reaper = OrphanReaper::new(service.repository().clone(), config);
    for _ in 0..10 {
        reaper.sweep_once().await?;
        tokio::task::yield_now().await;
    }
    writes.await??;
    reaper.sweep_once().await?;

    for i in 0..40 {
        let content = service.get_file_content(-1, &format!("main:/a/f{i}")).await?;
        assert_eq!(content, format!("{i}").into_bytes());
    }
    assert_eq!(service.get_file_content(1, "main:/a/foo").await?, b"hi".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_background_reaper_runs_until_stopped() -> Result<()> {
    let service = main_store().await?;
    let kept = service.repository().node_count();
    service.create_store("scratch").await?;
    service.create_file("scratch:/", "tmp", b"x").await?;
    service.purge_store("scratch").await?;

    let config = ReaperConfig { interval_seconds: 1, ..ReaperConfig::default() };
    let reaper = OrphanReaper::new(service.repository().clone(), config);
    reaper.start();
    for _ in 0..50 {
        if service.repository().node_count() == kept {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    reaper.stop().await;
    assert!(!reaper.is_running());
    assert_eq!(service.repository().node_count(), kept);
    Ok(())
}
