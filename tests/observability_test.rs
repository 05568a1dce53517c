// Index events, metrics and configuration loading.

use anyhow::Result;
use prometheus::Registry;
use std::io::Write;
use std::sync::Arc;
use strata::config::{Config, ReaperConfig};
use strata::storage::{ChannelIndexSink, IndexEvent};
use strata::{AvmError, AvmMetrics, AvmRepository, AvmService, OrphanReaper};

#[tokio::test]
async fn test_events_follow_commits() -> Result<()> {
    let (sink, mut events) = ChannelIndexSink::new();
    let repo = AvmRepository::builder(Config::default()).index_sink(Arc::new(sink)).build();
    let service = AvmService::new(repo);

    service.create_store("main").await?;
    let foo = service.create_file("main:/", "foo", b"hi").await?;
    service.create_snapshot("main", None, None).await?;
    service.rename("main:/", "foo", "main:/", "bar").await?;
    assert!(service.create_file("main:/", "bar", b"dup").await.is_err());
    service.rename_store("main", "trunk").await?;

    assert_eq!(events.try_recv()?, IndexEvent::StoreCreated { store: "main".to_string() });
    assert_eq!(
        events.try_recv()?,
        IndexEvent::Created { path: "main:/foo".to_string(), node_id: foo.id }
    );
    assert_eq!(events.try_recv()?, IndexEvent::Snapshotted { store: "main".to_string(), version: 1 });
    assert_eq!(
        events.try_recv()?,
        IndexEvent::Renamed { from: "main:/foo".to_string(), to: "main:/bar".to_string() }
    );
    assert_eq!(
        events.try_recv()?,
        IndexEvent::StoreRenamed { from: "main".to_string(), to: "trunk".to_string() }
    );
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_metrics_count_operations_and_errors() -> Result<()> {
    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(AvmMetrics::new(registry.clone())?);
    let repo = AvmRepository::builder(Config::default()).metrics(metrics.clone()).build();
    let service = AvmService::new(repo.clone());

    service.create_store("main").await?;
    service.create_file("main:/", "foo", b"hi").await?;
    let missing = service.lookup(-1, "main:/missing").await;
    assert!(matches!(missing, Err(AvmError::NotFound(_))));
    service.create_snapshot("main", None, None).await?;
    OrphanReaper::new(repo, ReaperConfig::default()).sweep_once().await?;

    assert_eq!(metrics.operations_total.with_label_values(&["create_file"]).get(), 1.0);
    assert_eq!(metrics.operation_errors.with_label_values(&["lookup", "not_found"]).get(), 1.0);
    assert_eq!(metrics.snapshots_total.get(), 1.0);
    assert_eq!(metrics.reaper_sweeps_total.get(), 1.0);
    assert_eq!(metrics.nodes.get(), service.repository().node_count() as f64);
    assert!(!registry.gather().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lineage_reads_are_recorded() -> Result<()> {
    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(AvmMetrics::new(registry)?);
    let repo = AvmRepository::builder(Config::default()).metrics(metrics.clone()).build();
    let service = AvmService::new(repo);

    service.create_store("main").await?;
    let foo = service.create_file("main:/", "foo", b"hi").await?;
    service.get_history(foo.id, 10).await?;
    service.get_common_ancestor(foo.id, foo.id).await?;
    service.get_paths(foo.id).await?;
    service.get_head_paths(foo.id).await?;
    service.get_paths_in_store_head(foo.id, "main").await?;
    service.get_a_path(foo.id).await?;
    assert!(service.get_history(9999, 10).await.is_err());

    for operation in [
        "get_common_ancestor",
        "get_paths",
        "get_head_paths",
        "get_paths_in_store_head",
        "get_a_path",
    ] {
        assert_eq!(metrics.operations_total.with_label_values(&[operation]).get(), 1.0);
    }
    assert_eq!(metrics.operations_total.with_label_values(&["get_history"]).get(), 2.0);
    assert_eq!(
        metrics.operation_errors.with_label_values(&["get_history", "not_found"]).get(),
        1.0
    );
    Ok(())
}

#[test]
fn test_engine_limits_load_from_file() -> Result<()> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    writeln!(file, "[engine]\nmax_path_depth = 3\n\n[reaper]\nenabled = false\ninterval_seconds = 5")?;

    let config = Config::load_from(file.path())?;
    assert_eq!(config.engine.max_path_depth, 3);
    assert_eq!(config.engine.max_indirection_depth, 64);
    assert!(!config.reaper.enabled);
    assert_eq!(config.reaper.interval_seconds, 5);
    Ok(())
}

#[tokio::test]
async fn test_path_depth_limit_applies_to_comparison() -> Result<()> {
    let mut config = Config::default();
    config.engine.max_path_depth = 1;
    let service = AvmService::new(AvmRepository::builder(config).build());
    service.create_store("left").await?;
    service.create_store("right").await?;
    for store in ["left", "right"] {
        service.create_directory(&format!("{store}:/"), "a").await?;
        service.create_directory(&format!("{store}:/a"), "b").await?;
        service.create_file(&format!("{store}:/a/b"), "c", store.as_bytes()).await?;
    }

    let result = service.compare(-1, "left:/", -1, "right:/", None).await;
    assert!(matches!(result, Err(AvmError::BadArgument(_))));
    Ok(())
}
