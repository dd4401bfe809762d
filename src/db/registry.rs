//! Pool registry.
//!
//! Maps string keys to live connection pools for the control-plane database
//! and an open-ended set of per-tenant or per-purpose databases.
//!
//! # Design
//!
//! - **`OnceCell` per key**: concurrent first-time requests for a key share a
//!   single pool creation; losers wait and receive the same handle.
//! - **Owners**: managed pools are created here on demand, the control-plane
//!   pool comes from the [`SchemaBootstrapper`], external pools are built and
//!   registered by a collaborator such as tenant provisioning. A tenant key
//!   with no explicit URL is never built here; it fails with `PoolNotFound`
//!   until the provisioner registers it again.
//! - **Protected keys** (the control-plane key and the tenant prefix) are never
//!   reclaimed for idleness and survive `close_all_pools`.
//!
//! # Lock Ordering
//!
//! - The map lock is held only to look up, insert or remove cells, never
//!   across pool I/O. Pools are closed after the lock is released.
//! - Per-entry timestamps and health records use `std::sync` locks that are
//!   never held across an await point.

use crate::config::{ManagerConfig, PoolOptions};
use crate::db::bootstrap::SchemaBootstrapper;
use crate::db::governor::LoadGovernor;
use crate::db::pool::{DbConnection, DbPool, PoolSettings, database_url_for};
use crate::db::schema::validate_identifier;
use crate::db::transaction::{DbTransaction, run_transaction};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{ConnectionTestResult, DatabaseType, HealthStatus, PoolOwner, PoolStats};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) type PoolCell = Arc<OnceCell<Arc<PoolEntry>>>;

#[derive(Debug, Default)]
struct HealthState {
    consecutive_errors: u32,
    status: HealthStatus,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
}

/// Per-request overrides for a pool created by `get_pool`.
#[derive(Debug, Clone, Default)]
pub struct PoolRequest {
    /// Full database URL. Derived from the tenant base URL when absent.
    pub url: Option<String>,
    pub connection_limit: Option<u32>,
    pub queue_limit: Option<u32>,
}

impl PoolRequest {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// Limits recorded for an externally built pool.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub connection_limit: u32,
    pub queue_limit: u32,
    /// Counter the pool's `after_connect` hook increments, if it has one.
    pub connections_opened: Arc<AtomicU64>,
}

impl PoolLimits {
    /// Limits read from the pool itself with the default queue limit.
    pub fn for_pool(pool: &DbPool) -> Self {
        Self {
            connection_limit: pool.max_connections(),
            queue_limit: PoolOptions::default().queue_limit_or_default(),
            connections_opened: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// One registered pool with its usage and health counters.
pub struct PoolEntry {
    key: String,
    pool: DbPool,
    owner: PoolOwner,
    connection_limit: u32,
    queue_limit: u32,
    created_at: Instant,
    /// Uses std::sync::RwLock (not tokio) to avoid holding locks across await points.
    last_used: std::sync::RwLock<Instant>,
    /// Callers waiting for a connection from a saturated pool.
    pending: AtomicU32,
    connections_opened: Arc<AtomicU64>,
    health: std::sync::Mutex<HealthState>,
}

impl PoolEntry {
    fn new(key: &str, pool: DbPool, owner: PoolOwner, limits: PoolLimits) -> Self {
        let now = Instant::now();
        Self {
            key: key.to_string(),
            pool,
            owner,
            connection_limit: limits.connection_limit,
            queue_limit: limits.queue_limit,
            created_at: now,
            last_used: std::sync::RwLock::new(now),
            pending: AtomicU32::new(0),
            connections_opened: limits.connections_opened,
            health: std::sync::Mutex::new(HealthState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn owner(&self) -> PoolOwner {
        self.owner
    }

    pub fn queue_limit(&self) -> u32 {
        self.queue_limit
    }

    /// Update last-used time. Synchronous - does not hold locks across await.
    pub fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.write() {
            *last_used = Instant::now();
        }
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> u32 {
        self.pool.in_use()
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthStatus {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .consecutive_errors
    }

    /// A probe succeeded: step the error count down and reclassify.
    pub fn record_success(&self, degraded: u32, critical: u32) -> HealthStatus {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        health.consecutive_errors = health.consecutive_errors.saturating_sub(1);
        health.status = HealthStatus::classify(health.consecutive_errors, degraded, critical);
        health.status
    }

    /// A probe failed: count it, remember the error and reclassify.
    pub fn record_failure(&self, err: &DbError, degraded: u32, critical: u32) -> HealthStatus {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        health.last_error = Some(err.to_string());
        health.last_error_time = Some(Utc::now());
        health.status = HealthStatus::classify(health.consecutive_errors, degraded, critical);
        health.status
    }

    pub fn stats(&self) -> PoolStats {
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        PoolStats {
            key: self.key.clone(),
            owner: self.owner,
            health: health.status,
            connection_limit: self.connection_limit,
            queue_limit: self.queue_limit,
            acquired: self.pool.in_use(),
            idle: self.pool.num_idle(),
            pending: self.pending(),
            total_connections: self.connections_opened.load(Ordering::Relaxed),
            consecutive_errors: health.consecutive_errors,
            last_error: health.last_error.clone(),
            last_error_time: health.last_error_time,
            idle_for_secs: self.idle_for().as_secs(),
        }
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("db_type", &self.pool.db_type())
            .field("connection_limit", &self.connection_limit)
            .field("queue_limit", &self.queue_limit)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Decrements the pending counter when the wait ends, however it ends.
struct PendingGuard<'a>(&'a AtomicU32);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pooled connection that refreshes its pool's last-used time when released.
pub struct TrackedConnection {
    conn: DbConnection,
    entry: Arc<PoolEntry>,
}

impl TrackedConnection {
    pub fn key(&self) -> &str {
        &self.entry.key
    }
}

impl Deref for TrackedConnection {
    type Target = DbConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for TrackedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.entry.touch();
    }
}

impl std::fmt::Debug for TrackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("key", &self.entry.key)
            .field("db_type", &self.conn.db_type())
            .finish()
    }
}

/// Owns every pool in the process, the control-plane bootstrapper and the
/// background health and idle loops.
pub struct ConnectionManager {
    pub(crate) config: ManagerConfig,
    pub(crate) pools: TokioRwLock<HashMap<String, PoolCell>>,
    pub(crate) bootstrapper: SchemaBootstrapper,
    pub(crate) governor: LoadGovernor,
    pools_created: AtomicU64,
    pub(crate) health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    pub(crate) cleanup_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until the first pool is requested.
    pub fn new(config: ManagerConfig) -> DbResult<Arc<Self>> {
        config.pool_options.validate().map_err(DbError::invalid_input)?;
        if config.degraded_threshold > config.critical_threshold {
            return Err(DbError::invalid_input(format!(
                "degraded threshold ({}) cannot exceed critical threshold ({})",
                config.degraded_threshold, config.critical_threshold
            )));
        }

        let bootstrapper = SchemaBootstrapper::new(&config)?;
        let governor = LoadGovernor::from_config(&config);
        Ok(Arc::new(Self {
            config,
            pools: TokioRwLock::new(HashMap::new()),
            bootstrapper,
            governor,
            pools_created: AtomicU64::new(0),
            health_task: std::sync::Mutex::new(None),
            cleanup_task: std::sync::Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bootstrapper(&self) -> &SchemaBootstrapper {
        &self.bootstrapper
    }

    pub fn governor(&self) -> &LoadGovernor {
        &self.governor
    }

    /// Pools created by this manager since start (external registrations excluded).
    pub fn pools_created(&self) -> u64 {
        self.pools_created.load(Ordering::Relaxed)
    }

    /// Cached handle for `key`, creating the pool on first use.
    ///
    /// Concurrent first-time calls for the same key create exactly one pool.
    pub async fn get_pool(&self, key: &str, request: Option<PoolRequest>) -> DbResult<DbPool> {
        let entry = self.get_entry(key, request.as_ref()).await?;
        Ok(entry.pool.clone())
    }

    async fn cell_for(&self, key: &str) -> PoolCell {
        {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(key) {
                return Arc::clone(cell);
            }
        }
        let mut pools = self.pools.write().await;
        // Double-check after acquiring write lock
        Arc::clone(
            pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    pub(crate) async fn get_entry(
        &self,
        key: &str,
        request: Option<&PoolRequest>,
    ) -> DbResult<Arc<PoolEntry>> {
        // A closed handle is evicted once and rebuilt
        for _ in 0..2 {
            let cell = self.cell_for(key).await;
            let entry = match cell
                .get_or_try_init(|| self.create_entry(key, request))
                .await
            {
                Ok(entry) => entry,
                Err(e) => {
                    self.discard_empty_cell(key, &cell).await;
                    return Err(e);
                }
            };
            if !entry.pool.is_closed() {
                entry.touch();
                return Ok(Arc::clone(entry));
            }
            debug!(pool_key = %key, "Registered pool is closed, rebuilding");
            self.evict_if_current(key, entry).await;
        }
        Err(DbError::internal(format!(
            "Pool for '{}' was closed while being created",
            key
        )))
    }

    /// Drop a cell whose creation failed, unless another caller filled it.
    async fn discard_empty_cell(&self, key: &str, cell: &PoolCell) {
        let mut pools = self.pools.write().await;
        let stale = pools
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            pools.remove(key);
        }
    }

    /// Remove `entry` from the map if it is still the one registered under `key`.
    pub(crate) async fn evict_if_current(&self, key: &str, entry: &Arc<PoolEntry>) -> bool {
        let mut pools = self.pools.write().await;
        let current = pools
            .get(key)
            .and_then(|cell| cell.get())
            .is_some_and(|registered| Arc::ptr_eq(registered, entry));
        if current {
            pools.remove(key);
        }
        current
    }

    async fn create_entry(&self, key: &str, request: Option<&PoolRequest>) -> DbResult<Arc<PoolEntry>> {
        if key == self.config.control_plane_key {
            let pool = self.bootstrapper.ensure_connection().await?;
            let limits = PoolLimits {
                connection_limit: pool.max_connections(),
                queue_limit: self.config.pool_options.queue_limit_or_default(),
                connections_opened: self.bootstrapper.connections_opened(),
            };
            self.pools_created.fetch_add(1, Ordering::Relaxed);
            info!(pool_key = %key, "Registered control-plane pool");
            return Ok(Arc::new(PoolEntry::new(key, pool, PoolOwner::ControlPlane, limits)));
        }

        let url = match request.and_then(|r| r.url.as_deref()) {
            Some(url) => url.to_string(),
            // Tenant pools carry their own credentials; only the provisioner builds them
            None if self.config.is_tenant_key(key) => {
                debug!(pool_key = %key, "Tenant pool not registered");
                return Err(DbError::pool_not_found(key));
            }
            None => {
                let base = self.config.tenant_base_url.as_deref().ok_or_else(|| {
                    DbError::invalid_input(format!(
                        "No URL given for '{}' and no tenant base URL configured",
                        key
                    ))
                })?;
                validate_identifier(key)?;
                database_url_for(base, key)?
            }
        };
        let db_type = DatabaseType::from_connection_string(&url).ok_or_else(|| {
            DbError::invalid_input(format!("Unsupported connection URL for '{}'", key))
        })?;
        let (url, url_options) = PoolOptions::from_url(&url).map_err(DbError::invalid_input)?;
        let options = url_options.or(&self.config.pool_options);

        let requested = request
            .and_then(|r| r.connection_limit)
            .unwrap_or_else(|| options.max_connections_or_default(db_type.is_sqlite()));
        let connection_limit = self.governor.effective_limit(requested);
        let queue_limit = request
            .and_then(|r| r.queue_limit)
            .unwrap_or_else(|| options.queue_limit_or_default());

        let counter = Arc::new(AtomicU64::new(0));
        let settings = PoolSettings::from_options(&options, db_type)
            .with_max_connections(connection_limit)
            .with_create_if_missing(db_type.is_sqlite())
            .with_counter(Arc::clone(&counter));
        let pool = DbPool::connect(&url, &settings)
            .await
            .map_err(|e| e.with_context(key, "create pool"))?;

        self.pools_created.fetch_add(1, Ordering::Relaxed);
        if connection_limit < requested {
            warn!(
                pool_key = %key,
                requested,
                connection_limit,
                "Created pool with throttled connection limit"
            );
        } else {
            info!(
                pool_key = %key,
                db_type = %db_type,
                connection_limit,
                queue_limit,
                "Created pool"
            );
        }

        let limits = PoolLimits {
            connection_limit: pool.max_connections(),
            queue_limit,
            connections_opened: counter,
        };
        Ok(Arc::new(PoolEntry::new(key, pool, PoolOwner::Managed, limits)))
    }

    /// Register a pool built elsewhere. An existing pool under `key` is retired.
    ///
    /// The control-plane key belongs to the bootstrapper and is rejected.
    pub async fn register_pool(&self, key: &str, pool: DbPool, limits: PoolLimits) -> DbResult<()> {
        if key == self.config.control_plane_key {
            return Err(DbError::invalid_input(format!(
                "'{}' is the control-plane key and cannot be registered externally",
                key
            )));
        }
        let entry = Arc::new(PoolEntry::new(key, pool, PoolOwner::External, limits));
        let previous = {
            let mut pools = self.pools.write().await;
            pools.insert(key.to_string(), Arc::new(OnceCell::from(entry)))
        };

        if let Some(old) = previous.as_ref().and_then(|cell| cell.get()) {
            info!(pool_key = %key, "Replacing registered pool, closing previous handle");
            let old_pool = old.pool.clone();
            tokio::spawn(async move { old_pool.close().await });
        } else {
            info!(pool_key = %key, "Registered external pool");
        }
        Ok(())
    }

    pub async fn has_pool(&self, key: &str) -> bool {
        let pools = self.pools.read().await;
        pools.get(key).is_some_and(|cell| cell.initialized())
    }

    /// Handle for an already-registered pool. Never creates one.
    pub async fn get_existing_pool(&self, key: &str) -> DbResult<DbPool> {
        let pools = self.pools.read().await;
        let entry = pools
            .get(key)
            .and_then(|cell| cell.get())
            .ok_or_else(|| DbError::pool_not_found(key))?;
        entry.touch();
        Ok(entry.pool.clone())
    }

    /// Count a waiter when the pool has no free connection.
    ///
    /// Rejects once the queue is full. The returned guard must live until the
    /// acquire finishes.
    fn admit<'a>(&self, entry: &'a PoolEntry) -> DbResult<Option<PendingGuard<'a>>> {
        if !entry.pool.is_saturated() {
            return Ok(None);
        }

        let waiting = entry.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(&entry.pending);
        if waiting >= entry.queue_limit {
            warn!(
                pool_key = %entry.key,
                pending = waiting,
                queue_limit = entry.queue_limit,
                "Connection queue full, rejecting request"
            );
            let kind = ErrorKind::ConnectionLimitExceeded;
            return Err(DbError::connection(
                kind,
                format!(
                    "{} callers already waiting for a connection (queue limit {})",
                    waiting, entry.queue_limit
                ),
                kind.suggestion(),
            )
            .with_context(&entry.key, "acquire"));
        }

        self.governor
            .note_pressure(&entry.key, waiting + 1, entry.queue_limit);
        Ok(Some(guard))
    }

    /// Check out one connection from the pool under `key`.
    pub async fn acquire(&self, key: &str) -> DbResult<TrackedConnection> {
        let entry = self.get_entry(key, None).await?;
        let conn = {
            let _waiting = self.admit(&entry)?;
            entry
                .pool
                .acquire()
                .await
                .map_err(|e| e.with_context(key, "acquire"))?
        };
        entry.touch();
        Ok(TrackedConnection { conn, entry })
    }

    async fn begin_tracked(&self, key: &str) -> DbResult<DbTransaction> {
        let entry = self.get_entry(key, None).await?;
        let tx = {
            let _waiting = self.admit(&entry)?;
            entry.pool.begin().await?
        };
        entry.touch();
        Ok(tx)
    }

    /// Run `work` in a transaction on the pool under `key`.
    ///
    /// Deadlocks and lost connections replay the whole unit of work up to
    /// `retries` times (the configured policy when `None`) with exponential
    /// backoff. Other errors are returned after rollback.
    pub async fn transaction<T>(
        &self,
        key: &str,
        work: impl AsyncFnMut(&mut DbTransaction) -> DbResult<T>,
        retries: Option<u32>,
    ) -> DbResult<T> {
        let max_retries = retries.unwrap_or(self.config.retry.max_retries);
        run_transaction(
            key,
            &self.config.retry,
            max_retries,
            async || self.begin_tracked(key).await,
            work,
        )
        .await
    }

    /// Probe `url` with a throwaway connection. Never errors and never
    /// touches the registry.
    pub async fn test_connection(&self, url: &str) -> ConnectionTestResult {
        let timeout = Duration::from_secs(self.config.pool_options.acquire_timeout_or_default());
        let url = PoolOptions::from_url(url)
            .map(|(stripped, _)| stripped)
            .unwrap_or_else(|_| url.to_string());
        crate::db::pool::test_connection(&url, timeout).await
    }

    /// Close and forget the pool under `key`. Returns whether one was registered.
    pub async fn close_pool(&self, key: &str) -> bool {
        let removed = {
            let mut pools = self.pools.write().await;
            pools.remove(key)
        };

        match removed.as_ref().and_then(|cell| cell.get()) {
            Some(entry) => {
                info!(pool_key = %key, "Closing pool");
                entry.pool.close().await;
                true
            }
            None => false,
        }
    }

    /// Stop the background loops and close every pool except protected ones.
    ///
    /// Returns the closed keys.
    pub async fn close_all_pools(&self) -> Vec<String> {
        self.stop();

        let to_close: Vec<(String, PoolCell)> = {
            let mut pools = self.pools.write().await;
            let keys: Vec<String> = pools
                .keys()
                .filter(|key| !self.config.is_protected(key))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| pools.remove(&key).map(|cell| (key, cell)))
                .collect()
        };

        let mut closed = Vec::with_capacity(to_close.len());
        for (key, cell) in to_close {
            if let Some(entry) = cell.get() {
                info!(pool_key = %key, "Closing pool");
                entry.pool.close().await;
                closed.push(key);
            }
        }
        closed
    }

    /// Stop the background loops and close every pool, protected ones included.
    pub async fn shutdown(&self) {
        self.stop();

        let drained: Vec<(String, PoolCell)> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };

        for (key, cell) in drained {
            if let Some(entry) = cell.get() {
                info!(pool_key = %key, "Closing pool");
                entry.pool.close().await;
            }
        }
        self.bootstrapper.close().await;
        info!("Connection manager shut down");
    }

    /// Snapshot of every initialised entry.
    pub(crate) async fn entries(&self) -> Vec<Arc<PoolEntry>> {
        let pools = self.pools.read().await;
        pools
            .values()
            .filter_map(|cell| cell.get().map(Arc::clone))
            .collect()
    }

    pub async fn pool_stats(&self, key: &str) -> Option<PoolStats> {
        let pools = self.pools.read().await;
        pools.get(key).and_then(|cell| cell.get()).map(|e| e.stats())
    }

    pub async fn all_pool_stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools.read().await;
        pools
            .iter()
            .filter_map(|(key, cell)| cell.get().map(|e| (key.clone(), e.stats())))
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("control_plane_key", &self.config.control_plane_key)
            .field("pools_created", &self.pools_created())
            .field("high_load", &self.governor.is_high_load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir) -> ManagerConfig {
        let base = format!("sqlite://{}", dir.path().display());
        let mut config = ManagerConfig::new(format!("{}/control.db", base)).with_tenant_base_url(base);
        config.bootstrap_retry_delay = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_get_pool_derives_sqlite_file_from_base_url() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();

        let pool = manager.get_pool("reports", None).await.unwrap();
        pool.probe().await.unwrap();
        assert!(dir.path().join("reports.db").exists());

        let stats = manager.pool_stats("reports").await.unwrap();
        assert_eq!(stats.owner, PoolOwner::Managed);
        assert_eq!(stats.connection_limit, 1);
        assert_eq!(stats.health, HealthStatus::Healthy);
        assert!(stats.total_connections >= 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_pool_rejects_unsafe_key_without_url() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();

        let err = manager.get_pool("../etc", None).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert!(!manager.has_pool("../etc").await);
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_no_cell() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();

        for i in 0..100 {
            assert!(manager.get_pool(&format!("bad key {i}"), None).await.is_err());
        }
        assert!(manager.get_pool("tenant_ghost", None).await.is_err());
        assert!(manager.pools.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reclaimer_sweeps_orphaned_cells() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();
        manager.get_pool("reports", None).await.unwrap();

        let in_flight = manager.cell_for("pending").await;
        drop(manager.cell_for("orphan").await);
        assert_eq!(manager.pools.read().await.len(), 3);

        assert!(manager.reclaim_idle_pools().await.is_empty());
        let pools = manager.pools.read().await;
        assert!(pools.contains_key("reports"));
        assert!(pools.contains_key("pending"));
        assert!(!pools.contains_key("orphan"));
        drop(pools);
        drop(in_flight);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_pool_rejects_control_plane_key() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();
        let key = manager.config().control_plane_key.clone();
        manager.get_pool(&key, None).await.unwrap();

        let other = DbPool::SQLite(sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        let err = manager
            .register_pool(&key, other.clone(), PoolLimits::for_pool(&other))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));

        let stats = manager.pool_stats(&key).await.unwrap();
        assert_eq!(stats.owner, PoolOwner::ControlPlane);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_existing_pool_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();

        let err = manager.get_existing_pool("missing").await.unwrap_err();
        assert!(matches!(err, DbError::PoolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_control_plane_key_registers_bootstrapper_pool() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();
        let key = manager.config().control_plane_key.clone();
        assert_eq!(key, "control");

        manager.get_pool(&key, None).await.unwrap();
        let stats = manager.pool_stats(&key).await.unwrap();
        assert_eq!(stats.owner, PoolOwner::ControlPlane);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_pool_is_rebuilt_on_next_get() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::new(sqlite_config(&dir)).unwrap();

        let first = manager.get_pool("reports", None).await.unwrap();
        first.close().await;
        let second = manager.get_pool("reports", None).await.unwrap();
        assert!(!second.is_closed());
        assert_eq!(manager.pools_created(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_thresholds() {
        let dir = TempDir::new().unwrap();
        let mut config = sqlite_config(&dir);
        config.degraded_threshold = 6;
        assert!(ConnectionManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_record_failure_and_recovery() {
        let entry = PoolEntry::new(
            "k",
            // Lazy pool: never connects in this test
            DbPool::SQLite(sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap()),
            PoolOwner::Managed,
            PoolLimits {
                connection_limit: 1,
                queue_limit: 10,
                connections_opened: Arc::new(AtomicU64::new(0)),
            },
        );
        let err = DbError::connection(ErrorKind::ConnectionLost, "gone", "retry");

        for _ in 0..3 {
            entry.record_failure(&err, 2, 5);
        }
        assert_eq!(entry.health(), HealthStatus::Degraded);
        assert!(entry.stats().last_error.is_some());

        assert_eq!(entry.record_success(2, 5), HealthStatus::Healthy);
        assert_eq!(entry.consecutive_errors(), 2);

        for _ in 0..4 {
            entry.record_failure(&err, 2, 5);
        }
        assert_eq!(entry.health(), HealthStatus::Critical);
    }
}
