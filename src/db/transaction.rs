//! Transactional executor.
//!
//! A unit of work runs inside one transaction on one pooled connection. On
//! failure the transaction is rolled back before the error is classified;
//! lock conflicts and lost connections replay the whole unit of work with
//! exponential backoff. The connection goes back to the pool when the
//! [`DbTransaction`] is dropped, so release happens on every exit path,
//! including cancellation of the calling future.

use crate::config::RetryPolicy;
use crate::db::macros::{execute_bound, fetch_i64, fetch_json};
use crate::db::params;
use crate::db::pool::{mysql_write_result, postgres_write_result, sqlite_write_result};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, JsonRow, QueryParam, WriteResult};
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use tracing::{debug, info, warn};

/// Database-specific transaction wrapper.
///
/// Holds its connection until committed, rolled back or dropped; dropping
/// an open transaction rolls it back.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }

    /// Execute a write statement within the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<WriteResult> {
        let result = match self {
            DbTransaction::MySql(tx) => {
                execute_bound!(params::mysql_query, &mut **tx, sql, params).map(mysql_write_result)
            }
            DbTransaction::Postgres(tx) => {
                execute_bound!(params::postgres_query, &mut **tx, sql, params)
                    .map(postgres_write_result)
            }
            DbTransaction::SQLite(tx) => {
                execute_bound!(params::sqlite_query, &mut **tx, sql, params)
                    .map(sqlite_write_result)
            }
        }?;

        debug!(
            sql = %sql,
            rows_affected = result.rows_affected,
            "Executed in transaction"
        );
        Ok(result)
    }

    /// Run a query within the transaction.
    pub async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        match self {
            DbTransaction::MySql(tx) => fetch_json!(params::mysql_query, &mut **tx, sql, params),
            DbTransaction::Postgres(tx) => {
                fetch_json!(params::postgres_query, &mut **tx, sql, params)
            }
            DbTransaction::SQLite(tx) => fetch_json!(params::sqlite_query, &mut **tx, sql, params),
        }
    }

    /// Fetch a single integer within the transaction, `None` when no row matched.
    pub async fn fetch_optional_i64(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<i64>> {
        match self {
            DbTransaction::MySql(tx) => fetch_i64!(params::mysql_query, &mut **tx, sql, params),
            DbTransaction::Postgres(tx) => {
                fetch_i64!(params::postgres_query, &mut **tx, sql, params)
            }
            DbTransaction::SQLite(tx) => fetch_i64!(params::sqlite_query, &mut **tx, sql, params),
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction")
            .field("db_type", &self.db_type())
            .finish_non_exhaustive()
    }
}

/// Roll back, logging instead of propagating a rollback failure.
async fn rollback_quietly(key: &str, tx: DbTransaction) {
    if let Err(e) = tx.rollback().await {
        warn!(pool_key = %key, error = %e, "Rollback failed");
    }
}

/// Run `work` in a transaction obtained from `begin`, retrying transient failures.
///
/// `begin` is called afresh for every attempt so a replay never reuses a
/// connection that may have been lost. At most `max_retries + 1` attempts
/// are made.
pub(crate) async fn run_transaction<T>(
    key: &str,
    policy: &RetryPolicy,
    max_retries: u32,
    mut begin: impl AsyncFnMut() -> DbResult<DbTransaction>,
    mut work: impl AsyncFnMut(&mut DbTransaction) -> DbResult<T>,
) -> DbResult<T> {
    let mut attempt: u32 = 0;
    loop {
        let attempt_id = uuid::Uuid::new_v4();
        let outcome = match begin().await {
            Ok(mut tx) => match work(&mut tx).await {
                Ok(value) => tx.commit().await.map(|()| value),
                Err(e) => {
                    rollback_quietly(key, tx).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        pool_key = %key,
                        attempt_id = %attempt_id,
                        attempts = attempt + 1,
                        "Transaction succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= max_retries {
            if err.is_retryable() {
                warn!(
                    pool_key = %key,
                    attempts = attempt + 1,
                    kind = %err.kind(),
                    "Transaction retries exhausted"
                );
            }
            return Err(err.with_context(key, "transaction"));
        }

        let delay = policy.delay_for(attempt);
        warn!(
            pool_key = %key,
            attempt_id = %attempt_id,
            attempt = attempt + 1,
            kind = %err.kind(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transaction failed with transient error, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
