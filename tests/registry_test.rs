//! Integration tests for the pool registry.
//!
//! All tests run against SQLite files in a temporary directory; no database
//! server is required.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tenant_db_pool::config::ManagerConfig;
use tenant_db_pool::db::{ConnectionManager, DbPool, PoolLimits, PoolRequest, PoolSettings};
use tenant_db_pool::error::{DbError, ErrorKind};
use tenant_db_pool::models::{DatabaseType, PoolOwner};

fn test_config(dir: &TempDir) -> ManagerConfig {
    let base = format!("sqlite://{}", dir.path().display());
    let mut config = ManagerConfig::new(format!("{}/control.db", base)).with_tenant_base_url(base);
    config.bootstrap_retry_delay = Duration::from_millis(10);
    config
}

async fn sqlite_pool(dir: &TempDir, name: &str) -> DbPool {
    let url = format!("sqlite://{}/{}.db", dir.path().display(), name);
    let settings = PoolSettings::probe(Duration::from_secs(5)).with_create_if_missing(true);
    DbPool::connect(&url, &settings).await.unwrap()
}

#[tokio::test]
async fn test_concurrent_get_pool_creates_one_pool() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.get_pool("shared", None).await
        }));
    }
    for handle in handles {
        let pool = handle.await.unwrap().unwrap();
        assert_eq!(pool.db_type(), DatabaseType::SQLite);
    }

    assert_eq!(manager.pools_created(), 1);
    assert_eq!(manager.all_pool_stats().await.len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_get_pool_with_explicit_url_and_limits() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();
    let url = format!("sqlite://{}/analytics.db?queue_limit=7", dir.path().display());

    manager
        .get_pool(
            "analytics",
            Some(PoolRequest {
                url: Some(url),
                connection_limit: Some(2),
                queue_limit: None,
            }),
        )
        .await
        .unwrap();

    let stats = manager.pool_stats("analytics").await.unwrap();
    assert_eq!(stats.connection_limit, 2);
    assert_eq!(stats.queue_limit, 7);
    assert!(dir.path().join("analytics.db").exists());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_register_pool_replaces_and_closes_previous() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();

    let first = sqlite_pool(&dir, "first").await;
    manager
        .register_pool("tenant_acme", first.clone(), PoolLimits::for_pool(&first))
        .await
        .unwrap();
    assert!(manager.has_pool("tenant_acme").await);

    let second = sqlite_pool(&dir, "second").await;
    manager
        .register_pool("tenant_acme", second.clone(), PoolLimits::for_pool(&second))
        .await
        .unwrap();

    // The previous handle is closed in the background
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(first.is_closed());
    assert!(!second.is_closed());

    let stats = manager.pool_stats("tenant_acme").await.unwrap();
    assert_eq!(stats.owner, PoolOwner::External);
    // External registrations are not counted as created pools
    assert_eq!(manager.pools_created(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_close_all_pools_keeps_protected_keys() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();
    let control_key = manager.config().control_plane_key.clone();

    manager.get_pool(&control_key, None).await.unwrap();
    manager.get_pool("reports", None).await.unwrap();
    let tenant = sqlite_pool(&dir, "acme").await;
    manager
        .register_pool("tenant_acme", tenant.clone(), PoolLimits::for_pool(&tenant))
        .await
        .unwrap();
    assert!(manager.start());

    let closed = manager.close_all_pools().await;
    assert_eq!(closed, vec!["reports".to_string()]);
    assert!(!manager.is_running());
    assert!(!manager.has_pool("reports").await);
    assert!(manager.has_pool(&control_key).await);
    assert!(manager.has_pool("tenant_acme").await);

    manager.shutdown().await;
    assert!(!manager.has_pool(&control_key).await);
    assert!(tenant.is_closed());
}

#[tokio::test]
async fn test_acquire_rejects_when_queue_is_full() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();
    let url = format!("sqlite://{}/busy.db", dir.path().display());
    manager
        .get_pool(
            "busy",
            Some(PoolRequest {
                url: Some(url),
                connection_limit: Some(1),
                queue_limit: Some(0),
            }),
        )
        .await
        .unwrap();

    let mut held = manager.acquire("busy").await.unwrap();
    held.execute("CREATE TABLE IF NOT EXISTS t (id INTEGER)", &[])
        .await
        .unwrap();
    assert_eq!(held.key(), "busy");

    let err = manager.acquire("busy").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLimitExceeded);
    assert!(matches!(err, DbError::Operation { .. }));

    drop(held);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut conn = manager.acquire("busy").await.unwrap();
    let rows = conn.fetch_all("SELECT COUNT(*) AS n FROM t", &[]).await.unwrap();
    assert_eq!(rows[0]["n"], 0);
    drop(conn);

    assert_eq!(manager.pool_stats("busy").await.unwrap().pending, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_test_connection_never_registers() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();
    let file = dir.path().join("probe.db");
    std::fs::File::create(&file).unwrap();

    let ok = manager
        .test_connection(&format!("sqlite://{}", file.display()))
        .await;
    assert!(ok.success);
    assert!(ok.kind.is_none());

    let missing = manager
        .test_connection(&format!("sqlite://{}/nope/missing.db", dir.path().display()))
        .await;
    assert!(!missing.success);
    assert!(missing.message.is_some());

    assert!(manager.all_pool_stats().await.is_empty());
}

#[tokio::test]
async fn test_close_pool_then_recreate() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();

    manager.get_pool("reports", None).await.unwrap();
    assert!(manager.close_pool("reports").await);
    assert!(!manager.close_pool("reports").await);
    assert!(manager.get_existing_pool("reports").await.is_err());

    manager.get_pool("reports", None).await.unwrap();
    assert_eq!(manager.pools_created(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_pools_created_under_high_load_are_throttled() {
    let dir = TempDir::new().unwrap();
    let manager = ConnectionManager::new(test_config(&dir)).unwrap();
    let wide = |name: &str| PoolRequest {
        url: Some(format!("sqlite://{}/{}.db", dir.path().display(), name)),
        connection_limit: Some(20),
        queue_limit: None,
    };

    manager.get_pool("before", Some(wide("before"))).await.unwrap();
    manager.governor().note_pressure("before", 9, 10);
    assert!(manager.governor().is_high_load());

    manager.get_pool("during", Some(wide("during"))).await.unwrap();
    assert_eq!(manager.pool_stats("during").await.unwrap().connection_limit, 14);
    // Pools that already existed keep their size
    assert_eq!(manager.pool_stats("before").await.unwrap().connection_limit, 20);
    manager.shutdown().await;
}
