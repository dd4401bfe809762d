//! Control-plane schema bootstrapper.
//!
//! Owns the pool for the shared control-plane database. On first use it
//! makes sure the database itself exists, then the tables and foreign keys of
//! a [`SchemaDefinition`]. Every step checks before it creates, so running
//! the bootstrap again against a correct schema changes nothing.
//!
//! # Concurrency
//!
//! - The handle lives in a `tokio::sync::RwLock`; readers clone the pool and
//!   release the lock before any query runs.
//! - `connect_lock` serialises database creation and reconnects so only one
//!   caller rebuilds a lost handle.
//! - Verified table names are cached in a `std::sync::Mutex` that is never
//!   held across an await point.

use crate::config::{ManagerConfig, PoolOptions, RetryPolicy, database_name};
use crate::db::pool::{DbPool, PoolSettings, server_url};
use crate::db::schema::{SchemaDefinition, introspect, validate_identifier};
use crate::db::transaction::{DbTransaction, run_transaction};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{DatabaseType, JsonRow, QueryParam, WriteResult};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as TokioMutex, RwLock as TokioRwLock};
use tracing::{debug, error, info, warn};

/// What `ensure_table` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    /// Verified earlier in this process; no query issued.
    Cached,
    /// Already present in the database.
    Existing,
    Created,
}

/// Summary of one `initialize_tables` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub schema_version: i64,
    pub tables_created: Vec<String>,
    pub tables_verified: Vec<String>,
    pub constraints_added: Vec<String>,
    /// Constraints that already existed.
    pub constraints_skipped: Vec<String>,
    /// Constraints the database refused; logged, not fatal.
    pub constraints_failed: Vec<String>,
    /// Constraints the dialect cannot add to an existing table.
    pub constraints_unsupported: Vec<String>,
    pub version_recorded: bool,
}

#[derive(Debug)]
pub struct SchemaBootstrapper {
    url: String,
    key: String,
    db_type: DatabaseType,
    pool_options: PoolOptions,
    schema: SchemaDefinition,
    max_attempts: u32,
    retry_delay: Duration,
    deadline: Option<Duration>,
    handle: TokioRwLock<Option<DbPool>>,
    connect_lock: TokioMutex<()>,
    database_ready: AtomicBool,
    verified_tables: std::sync::Mutex<HashSet<String>>,
    connections_opened: Arc<AtomicU64>,
}

/// Wait before reconnect `attempt + 1`.
///
/// A server out of connections gets a linearly growing pause of
/// `2 * attempt * base`; everything else retries after `base`.
fn retry_delay_for(kind: ErrorKind, attempt: u32, base: Duration) -> Duration {
    match kind {
        ErrorKind::ConnectionLimitExceeded => base.saturating_mul(attempt.saturating_mul(2)),
        _ => base,
    }
}

impl SchemaBootstrapper {
    /// Bootstrapper for the control-plane database with the built-in schema.
    ///
    /// Does not connect; the first operation does.
    pub fn new(config: &ManagerConfig) -> DbResult<Self> {
        let db_type = DatabaseType::from_connection_string(&config.control_plane_url)
            .ok_or_else(|| {
                DbError::invalid_input(
                    "Unsupported control-plane URL. Use mysql://, postgres:// or sqlite:",
                )
            })?;
        let schema = SchemaDefinition::control_plane();
        schema.validate()?;

        Ok(Self {
            url: config.control_plane_url.clone(),
            key: config.control_plane_key.clone(),
            db_type,
            pool_options: config.pool_options.clone(),
            schema,
            max_attempts: config.bootstrap_max_attempts.max(1),
            retry_delay: config.bootstrap_retry_delay,
            deadline: config.bootstrap_deadline,
            handle: TokioRwLock::new(None),
            connect_lock: TokioMutex::new(()),
            database_ready: AtomicBool::new(false),
            verified_tables: std::sync::Mutex::new(HashSet::new()),
            connections_opened: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    /// Counter of physical connections opened by the control-plane pool.
    pub fn connections_opened(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.connections_opened)
    }

    fn settings(&self) -> PoolSettings {
        PoolSettings::from_options(&self.pool_options, self.db_type)
            .with_create_if_missing(true)
            .with_counter(self.connections_opened())
    }

    /// Make sure the control-plane database exists and point the handle at it.
    ///
    /// Only the first successful call creates the database and swaps the
    /// handle; later calls return immediately.
    pub async fn ensure_database(&self) -> DbResult<()> {
        if self.database_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.database_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        if let (Some(exists_sql), Some(name)) = (
            introspect::database_exists(self.db_type),
            database_name(&self.url),
        ) {
            validate_identifier(&name)?;
            let server = DbPool::connect(&server_url(&self.url)?, &PoolSettings::probe(
                Duration::from_secs(self.pool_options.acquire_timeout_or_default()),
            ))
            .await?;
            let created = self.create_database_if_missing(&server, exists_sql, &name).await;
            server.close().await;
            created?;
        }

        let pool = DbPool::connect(&self.url, &self.settings()).await?;
        let previous = self.handle.write().await.replace(pool);
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }

        self.database_ready.store(true, Ordering::Release);
        info!(pool_key = %self.key, db_type = %self.db_type, "Control-plane database ready");
        Ok(())
    }

    async fn create_database_if_missing(
        &self,
        server: &DbPool,
        exists_sql: &str,
        name: &str,
    ) -> DbResult<()> {
        let found = server
            .fetch_optional_i64(exists_sql, &[QueryParam::from(name)])
            .await?
            .unwrap_or(0);
        if found > 0 {
            debug!(database = %name, "Control-plane database exists");
            return Ok(());
        }

        let Some(create_sql) = introspect::create_database(self.db_type, name) else {
            return Ok(());
        };
        match server.execute(&create_sql, &[]).await {
            Ok(_) => {
                info!(database = %name, "Created control-plane database");
                Ok(())
            }
            // Created concurrently by another process
            Err(e) if e.kind() == ErrorKind::SchemaConflict => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current handle, rebuilt when missing or closed.
    async fn current_handle(&self) -> DbResult<DbPool> {
        if let Some(pool) = self.handle.read().await.as_ref().filter(|p| !p.is_closed()) {
            return Ok(pool.clone());
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(pool) = self.handle.read().await.as_ref().filter(|p| !p.is_closed()) {
            return Ok(pool.clone());
        }

        info!(pool_key = %self.key, "Reconnecting to control-plane database");
        let pool = DbPool::connect(&self.url, &self.settings()).await?;
        *self.handle.write().await = Some(pool.clone());
        Ok(pool)
    }

    async fn try_connect(&self) -> DbResult<DbPool> {
        self.ensure_database().await?;
        let pool = self.current_handle().await?;
        pool.probe().await?;
        Ok(pool)
    }

    /// Verify connectivity, retrying transient failures.
    ///
    /// "Too many connections" backs off by `retry_delay * 2 * attempt`; other
    /// transient failures wait `retry_delay`. Credential and missing-database
    /// errors fail on the first attempt. Running out of attempts, or of the
    /// optional deadline, is fatal.
    pub async fn ensure_connection(&self) -> DbResult<DbPool> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.try_connect().await {
                Ok(pool) => {
                    if attempt > 1 {
                        info!(pool_key = %self.key, attempt, "Control-plane connection restored");
                    }
                    return Ok(pool);
                }
                Err(e) => e,
            };

            let kind = err.kind();
            let fatal = matches!(kind, ErrorKind::AuthDenied | ErrorKind::UnknownDatabase)
                || matches!(err, DbError::InvalidInput { .. } | DbError::Schema { .. });
            if fatal || attempt >= self.max_attempts {
                error!(
                    pool_key = %self.key,
                    attempt,
                    kind = %kind,
                    error = %err,
                    "Control-plane connection failed"
                );
                return Err(DbError::bootstrap(attempt, kind, err.to_string()));
            }

            let delay = retry_delay_for(kind, attempt, self.retry_delay);
            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    error!(
                        pool_key = %self.key,
                        attempt,
                        deadline_secs = deadline.as_secs(),
                        "Control-plane connection deadline exceeded"
                    );
                    return Err(DbError::bootstrap(
                        attempt,
                        kind,
                        format!("deadline of {}s exceeded: {}", deadline.as_secs(), err),
                    ));
                }
            }

            if kind == ErrorKind::ConnectionLimitExceeded {
                warn!(
                    pool_key = %self.key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Control-plane server has too many connections, backing off"
                );
            } else {
                warn!(
                    pool_key = %self.key,
                    attempt,
                    kind = %kind,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Control-plane connection failed, retrying"
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Drop the current handle so the next `ensure_connection` rebuilds it.
    pub async fn invalidate(&self) {
        let previous = self.handle.write().await.take();
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }
    }

    fn is_verified(&self, table: &str) -> bool {
        self.verified_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table)
    }

    fn mark_verified(&self, table: &str) {
        self.verified_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    /// Create `name` from the schema definition unless it already exists.
    pub async fn ensure_table(&self, name: &str) -> DbResult<TableStatus> {
        if self.is_verified(name) {
            return Ok(TableStatus::Cached);
        }

        let table = self.schema.table(name).ok_or_else(|| {
            DbError::schema(format!("Table '{}' is not part of the schema", name), name)
        })?;
        let pool = self.ensure_connection().await?;

        let exists = pool
            .fetch_optional_i64(
                introspect::table_exists(self.db_type),
                &[QueryParam::from(name)],
            )
            .await?
            .unwrap_or(0)
            > 0;
        if exists {
            self.mark_verified(name);
            return Ok(TableStatus::Existing);
        }

        // SQLite cannot add constraints later, so they go into CREATE TABLE
        let inline_keys = match self.db_type {
            DatabaseType::SQLite => self.schema.foreign_keys_for(name),
            DatabaseType::MySQL | DatabaseType::PostgreSQL => Vec::new(),
        };
        let status = match pool
            .execute(&table.create_sql(self.db_type, &inline_keys), &[])
            .await
        {
            Ok(_) => {
                info!(table = %name, "Created table");
                TableStatus::Created
            }
            Err(e) if e.kind() == ErrorKind::SchemaConflict => TableStatus::Existing,
            Err(e) => return Err(e.with_context(&self.key, format!("create table {}", name))),
        };
        self.mark_verified(name);
        Ok(status)
    }

    /// Ensure every table, then every foreign key, then the schema version.
    ///
    /// Constraint failures are logged and reported, never returned.
    pub async fn initialize_tables(&self) -> DbResult<BootstrapReport> {
        let mut report = BootstrapReport {
            schema_version: self.schema.version,
            ..Default::default()
        };

        for table in &self.schema.tables {
            match self.ensure_table(&table.name).await? {
                TableStatus::Created => report.tables_created.push(table.name.clone()),
                TableStatus::Existing | TableStatus::Cached => {
                    report.tables_verified.push(table.name.clone())
                }
            }
        }

        let pool = self.ensure_connection().await?;
        for fk in &self.schema.foreign_keys {
            let bind = match self.db_type {
                DatabaseType::SQLite => vec![
                    QueryParam::from(fk.table.as_str()),
                    QueryParam::from(fk.column.as_str()),
                    QueryParam::from(fk.references_table.as_str()),
                ],
                DatabaseType::MySQL | DatabaseType::PostgreSQL => vec![
                    QueryParam::from(fk.table.as_str()),
                    QueryParam::from(fk.name.as_str()),
                ],
            };
            let exists = match pool
                .fetch_optional_i64(introspect::foreign_key_exists(self.db_type), &bind)
                .await
            {
                Ok(count) => count.unwrap_or(0) > 0,
                Err(e) => {
                    warn!(constraint = %fk.name, error = %e, "Could not inspect constraint");
                    report.constraints_failed.push(fk.name.clone());
                    continue;
                }
            };
            if exists {
                debug!(constraint = %fk.name, "Constraint exists");
                report.constraints_skipped.push(fk.name.clone());
                continue;
            }

            if self.db_type == DatabaseType::SQLite {
                warn!(
                    constraint = %fk.name,
                    table = %fk.table,
                    "SQLite cannot add a constraint to an existing table, skipping"
                );
                report.constraints_unsupported.push(fk.name.clone());
                continue;
            }

            match pool.execute(&fk.add_sql(), &[]).await {
                Ok(_) => {
                    info!(constraint = %fk.name, table = %fk.table, "Added constraint");
                    report.constraints_added.push(fk.name.clone());
                }
                Err(e) if e.kind() == ErrorKind::SchemaConflict => {
                    report.constraints_skipped.push(fk.name.clone());
                }
                Err(e) => {
                    warn!(
                        constraint = %fk.name,
                        table = %fk.table,
                        error = %e,
                        "Failed to add constraint"
                    );
                    report.constraints_failed.push(fk.name.clone());
                }
            }
        }

        report.version_recorded = self.record_version(&pool).await?;
        info!(
            created = report.tables_created.len(),
            verified = report.tables_verified.len(),
            constraints_added = report.constraints_added.len(),
            constraints_failed = report.constraints_failed.len(),
            "Control-plane schema initialized"
        );
        Ok(report)
    }

    /// Insert the schema version row if absent. Returns whether it was inserted.
    async fn record_version(&self, pool: &DbPool) -> DbResult<bool> {
        if self.schema.table("schema_version").is_none() {
            return Ok(false);
        }
        let version = QueryParam::Int(self.schema.version);
        let placeholder = self.db_type.placeholder(1);
        let present = pool
            .fetch_optional_i64(
                &format!("SELECT COUNT(*) FROM schema_version WHERE version = {}", placeholder),
                std::slice::from_ref(&version),
            )
            .await?
            .unwrap_or(0)
            > 0;
        if present {
            return Ok(false);
        }
        match pool
            .execute(
                &format!("INSERT INTO schema_version (version) VALUES ({})", placeholder),
                &[version],
            )
            .await
        {
            Ok(_) => Ok(true),
            // Recorded concurrently
            Err(e) if e.kind() == ErrorKind::SchemaConflict => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run a read query on a freshly verified connection.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let pool = self.ensure_connection().await?;
        pool.fetch_all(sql, params)
            .await
            .map_err(|e| e.with_context(&self.key, "query"))
    }

    /// Insert one row. Column names are validated identifiers.
    pub async fn insert(&self, table: &str, values: &[(&str, QueryParam)]) -> DbResult<WriteResult> {
        validate_identifier(table)?;
        if values.is_empty() {
            return Err(DbError::invalid_input("Insert requires at least one column"));
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (i, (column, _)) in values.iter().enumerate() {
            validate_identifier(column)?;
            columns.push(*column);
            placeholders.push(self.db_type.placeholder(i + 1));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<QueryParam> = values.iter().map(|(_, v)| v.clone()).collect();

        let pool = self.ensure_connection().await?;
        pool.execute(&sql, &params)
            .await
            .map_err(|e| e.with_context(&self.key, format!("insert into {}", table)))
    }

    /// Update rows matching every equality filter. Returns rows affected.
    pub async fn update(
        &self,
        table: &str,
        values: &[(&str, QueryParam)],
        filters: &[(&str, QueryParam)],
    ) -> DbResult<u64> {
        validate_identifier(table)?;
        if values.is_empty() {
            return Err(DbError::invalid_input("Update requires at least one column"));
        }
        let set = self.assignments(values, 1, ", ")?;
        let filter = self.where_clause(filters, values.len() + 1)?;
        let sql = format!("UPDATE {} SET {} WHERE {}", table, set, filter);
        let params: Vec<QueryParam> = values
            .iter()
            .chain(filters)
            .map(|(_, v)| v.clone())
            .collect();

        let pool = self.ensure_connection().await?;
        pool.execute(&sql, &params)
            .await
            .map(|r| r.rows_affected)
            .map_err(|e| e.with_context(&self.key, format!("update {}", table)))
    }

    /// Delete rows matching every equality filter. Returns rows affected.
    pub async fn delete(&self, table: &str, filters: &[(&str, QueryParam)]) -> DbResult<u64> {
        validate_identifier(table)?;
        let filter = self.where_clause(filters, 1)?;
        let sql = format!("DELETE FROM {} WHERE {}", table, filter);
        let params: Vec<QueryParam> = filters.iter().map(|(_, v)| v.clone()).collect();

        let pool = self.ensure_connection().await?;
        pool.execute(&sql, &params)
            .await
            .map(|r| r.rows_affected)
            .map_err(|e| e.with_context(&self.key, format!("delete from {}", table)))
    }

    fn assignments(
        &self,
        pairs: &[(&str, QueryParam)],
        first: usize,
        separator: &str,
    ) -> DbResult<String> {
        let parts = pairs
            .iter()
            .enumerate()
            .map(|(i, (column, _))| {
                validate_identifier(column)?;
                Ok(format!("{} = {}", column, self.db_type.placeholder(first + i)))
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(parts.join(separator))
    }

    /// Equality filters joined with AND. Empty filters are rejected so a
    /// missing condition never touches every row.
    fn where_clause(&self, filters: &[(&str, QueryParam)], first: usize) -> DbResult<String> {
        if filters.is_empty() {
            return Err(DbError::invalid_input(
                "At least one filter is required for update and delete",
            ));
        }
        self.assignments(filters, first, " AND ")
    }

    /// Run `work` in one transaction on one connection: commit on success,
    /// roll back on error. No retries.
    pub async fn transaction<T>(
        &self,
        work: impl AsyncFnMut(&mut DbTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        let pool = self.ensure_connection().await?;
        let no_retry = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        run_transaction(&self.key, &no_retry, 0, async || pool.begin().await, work).await
    }

    /// Close the control-plane pool. A later operation reconnects.
    pub async fn close(&self) {
        let previous = self.handle.write().await.take();
        if let Some(pool) = previous {
            pool.close().await;
            info!(pool_key = %self.key, "Closed control-plane pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backs_off_on_connection_limit() {
        let base = Duration::from_millis(100);
        let kind = ErrorKind::ConnectionLimitExceeded;
        assert_eq!(retry_delay_for(kind, 1, base), Duration::from_millis(200));
        assert_eq!(retry_delay_for(kind, 2, base), Duration::from_millis(400));
        assert_eq!(retry_delay_for(kind, 5, base), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_delay_is_flat_for_other_errors() {
        let base = Duration::from_millis(100);
        for kind in [ErrorKind::ConnectionLost, ErrorKind::Deadlock, ErrorKind::Unknown] {
            assert_eq!(retry_delay_for(kind, 1, base), base);
            assert_eq!(retry_delay_for(kind, 4, base), base);
        }
    }

    #[test]
    fn test_rejects_unsupported_url() {
        let config = ManagerConfig::new("redis://localhost");
        assert!(matches!(
            SchemaBootstrapper::new(&config),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
