//! Integration tests for the transactional executor.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tenant_db_pool::config::ManagerConfig;
use tenant_db_pool::db::{ConnectionManager, DbTransaction};
use tenant_db_pool::error::{DbError, DbResult, ErrorKind};
use tenant_db_pool::models::QueryParam;

async fn manager_with_table(dir: &TempDir) -> Arc<ConnectionManager> {
    let base = format!("sqlite://{}", dir.path().display());
    let mut config = ManagerConfig::new(format!("{}/control.db", base)).with_tenant_base_url(base);
    config.retry.base_delay = Duration::from_millis(1);
    let manager = ConnectionManager::new(config).unwrap();

    manager
        .transaction(
            "ledger",
            async |tx: &mut DbTransaction| {
                tx.execute(
                    "CREATE TABLE IF NOT EXISTS entries (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL)",
                    &[],
                )
                .await?;
                Ok(())
            },
            None,
        )
        .await
        .unwrap();
    manager
}

async fn entry_count(manager: &ConnectionManager) -> i64 {
    manager
        .transaction(
            "ledger",
            async |tx: &mut DbTransaction| {
                tx.fetch_optional_i64("SELECT COUNT(*) FROM entries", &[])
                    .await
                    .map(|n| n.unwrap_or(0))
            },
            Some(0),
        )
        .await
        .unwrap()
}

fn deadlock() -> DbError {
    DbError::database(
        ErrorKind::Deadlock,
        "Deadlock found when trying to get lock",
        Some("1213".to_string()),
        ErrorKind::Deadlock.suggestion(),
    )
}

#[tokio::test]
async fn test_deadlock_is_retried_until_success() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with_table(&dir).await;

    let mut calls: i64 = 0;
    let result = manager
        .transaction(
            "ledger",
            async |tx: &mut DbTransaction| {
                calls += 1;
                tx.execute("INSERT INTO entries (amount) VALUES (?)", &[QueryParam::Int(calls)])
                    .await?;
                if calls < 3 {
                    return Err(deadlock());
                }
                Ok(calls)
            },
            Some(3),
        )
        .await
        .unwrap();

    assert_eq!(result, 3);
    assert_eq!(calls, 3);
    // Failed attempts were rolled back
    assert_eq!(entry_count(&manager).await, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_retries_exhausted_returns_last_error() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with_table(&dir).await;

    let mut calls = 0;
    let result: DbResult<()> = manager
        .transaction(
            "ledger",
            async |_tx: &mut DbTransaction| {
                calls += 1;
                Err(deadlock())
            },
            Some(2),
        )
        .await;

    assert_eq!(calls, 3);
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadlock);
    match err {
        DbError::Operation { key, operation, .. } => {
            assert_eq!(key, "ledger");
            assert_eq!(operation, "transaction");
        }
        other => panic!("expected context on error, got {other:?}"),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn test_non_retryable_error_rolls_back_once() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with_table(&dir).await;

    let mut calls = 0;
    let result: DbResult<()> = manager
        .transaction(
            "ledger",
            async |tx: &mut DbTransaction| {
                calls += 1;
                tx.execute("INSERT INTO entries (amount) VALUES (?)", &[QueryParam::Int(10)])
                    .await?;
                // NOT NULL violation
                tx.execute("INSERT INTO entries (amount) VALUES (NULL)", &[])
                    .await?;
                Ok(())
            },
            Some(3),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(calls, 1);
    assert_eq!(entry_count(&manager).await, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_committed_work_is_visible_and_connection_released() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with_table(&dir).await;

    let id = manager
        .transaction(
            "ledger",
            async |tx: &mut DbTransaction| {
                let result = tx
                    .execute("INSERT INTO entries (amount) VALUES (?)", &[QueryParam::Int(42)])
                    .await?;
                Ok(result.last_insert_id)
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(id, Some(1));

    // The single SQLite connection went back to the pool
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut conn = manager.acquire("ledger").await.unwrap();
    let rows = conn
        .fetch_all("SELECT amount FROM entries", &[])
        .await
        .unwrap();
    assert_eq!(rows[0]["amount"], 42);
    drop(conn);
    manager.shutdown().await;
}
