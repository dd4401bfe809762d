//! Integration tests for the health monitor and idle reclaimer.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tenant_db_pool::config::ManagerConfig;
use tenant_db_pool::db::{
    ConnectionManager, DbPool, DbTransaction, PoolLimits, PoolRequest, PoolSettings,
};
use tenant_db_pool::error::DbError;
use tenant_db_pool::models::{HealthStatus, PoolOwner};

fn manager(dir: &TempDir, idle_timeout: Duration) -> Arc<ConnectionManager> {
    let base = format!("sqlite://{}", dir.path().display());
    let mut config = ManagerConfig::new(format!("{}/control.db", base)).with_tenant_base_url(base);
    config.idle_timeout = idle_timeout;
    config.bootstrap_retry_delay = Duration::from_millis(10);
    ConnectionManager::new(config).unwrap()
}

#[tokio::test]
async fn test_idle_pools_are_reclaimed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Duration::from_millis(50));
    let control_key = manager.config().control_plane_key.clone();

    manager.get_pool("stale", None).await.unwrap();
    manager.get_pool("busy", None).await.unwrap();
    let tenant_url = format!("sqlite://{}/acme.db", dir.path().display());
    manager
        .get_pool("tenant_acme", Some(PoolRequest::url(tenant_url)))
        .await
        .unwrap();
    manager.get_pool(&control_key, None).await.unwrap();
    let held = manager.acquire("busy").await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    manager.get_pool("fresh", None).await.unwrap();

    let evicted = manager.reclaim_idle_pools().await;
    assert_eq!(evicted, vec!["stale".to_string()]);
    assert!(!manager.has_pool("stale").await);
    assert!(manager.has_pool("busy").await);
    assert!(manager.has_pool("fresh").await);
    assert!(manager.has_pool("tenant_acme").await);
    assert!(manager.has_pool(&control_key).await);

    drop(held);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_pool_degrades_then_is_dropped() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Duration::from_secs(1800));

    let pool = manager.get_pool("reports", None).await.unwrap();
    pool.close().await;

    for _ in 0..3 {
        manager.run_health_checks().await;
    }
    let stats = manager.pool_stats("reports").await.unwrap();
    assert_eq!(stats.health, HealthStatus::Degraded);
    assert_eq!(stats.consecutive_errors, 3);
    assert!(stats.last_error.is_some());
    assert!(stats.last_error_time.is_some());
    assert!(manager.governor().is_high_load());

    let mut recreated = Vec::new();
    for _ in 0..3 {
        recreated.extend(manager.run_health_checks().await.recreated);
    }
    assert_eq!(recreated, vec!["reports".to_string()]);
    assert!(!manager.has_pool("reports").await);

    // The next request builds a fresh pool
    let fresh = manager.get_pool("reports", None).await.unwrap();
    fresh.probe().await.unwrap();
    let report = manager.run_health_checks().await;
    assert_eq!(report.healthy, 1);
    assert!(!report.high_load);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_critical_control_plane_pool_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Duration::from_secs(1800));
    let control_key = manager.config().control_plane_key.clone();

    let pool = manager.get_pool(&control_key, None).await.unwrap();
    pool.close().await;

    let mut recreated = Vec::new();
    for _ in 0..6 {
        recreated.extend(manager.run_health_checks().await.recreated);
    }
    assert_eq!(recreated, vec![control_key.clone()]);

    let stats = manager.pool_stats(&control_key).await.unwrap();
    assert_eq!(stats.owner, PoolOwner::ControlPlane);
    assert_eq!(stats.consecutive_errors, 0);
    assert_eq!(stats.health, HealthStatus::Healthy);

    let rebuilt = manager.get_existing_pool(&control_key).await.unwrap();
    rebuilt.probe().await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_healthy_pool_reports_no_errors() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Duration::from_secs(1800));
    manager.get_pool("reports", None).await.unwrap();

    let report = manager.run_health_checks().await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.healthy, 1);
    assert_eq!(
        manager.pool_stats("reports").await.unwrap().consecutive_errors,
        0
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_dropped_tenant_pool_is_not_rebuilt_from_base_url() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, Duration::from_secs(1800));

    let url = format!("sqlite://{}/acme_real.db", dir.path().display());
    let settings = PoolSettings::probe(Duration::from_secs(5)).with_create_if_missing(true);
    let pool = DbPool::connect(&url, &settings).await.unwrap();
    manager
        .register_pool("tenant_acme", pool.clone(), PoolLimits::for_pool(&pool))
        .await
        .unwrap();
    pool.close().await;

    let mut recreated = Vec::new();
    for _ in 0..6 {
        recreated.extend(manager.run_health_checks().await.recreated);
    }
    assert_eq!(recreated, vec!["tenant_acme".to_string()]);
    assert!(!manager.has_pool("tenant_acme").await);

    let err = manager
        .transaction("tenant_acme", async |_tx: &mut DbTransaction| Ok(()), Some(0))
        .await
        .unwrap_err();
    match err {
        DbError::Operation { key, source, .. } => {
            assert_eq!(key, "tenant_acme");
            assert!(matches!(*source, DbError::PoolNotFound { .. }));
        }
        other => panic!("expected Operation error, got {other:?}"),
    }
    let err = manager.get_pool("tenant_acme", None).await.unwrap_err();
    assert!(matches!(err, DbError::PoolNotFound { .. }));

    assert!(!manager.has_pool("tenant_acme").await);
    assert!(!dir.path().join("tenant_acme.db").exists());
    assert_eq!(manager.pools_created(), 0);
    manager.shutdown().await;
}
