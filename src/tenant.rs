//! Tenant pool provisioning.
//!
//! Tenant pools are not created by the registry on demand: their credentials
//! live in the control-plane `tenants` table and must be resolved, validated
//! and only then turned into a pool. [`TenantProvisioner`] does that and
//! registers the result under `tenant_<code>`, where the registry protects it
//! from idle reclamation.

use crate::db::{ConnectionManager, DbPool, PoolLimits, PoolSettings};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{QueryParam, TenantDescriptor};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Looks up where a tenant's database lives.
pub trait CredentialsResolver: Send + Sync {
    fn resolve(&self, code: &str) -> impl Future<Output = DbResult<TenantDescriptor>> + Send;
}

/// Resolves tenants from the control-plane `tenants` table.
#[derive(Debug, Clone)]
pub struct ControlPlaneResolver {
    manager: Arc<ConnectionManager>,
}

impl ControlPlaneResolver {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

impl CredentialsResolver for ControlPlaneResolver {
    async fn resolve(&self, code: &str) -> DbResult<TenantDescriptor> {
        let bootstrapper = self.manager.bootstrapper();
        let sql = format!(
            "SELECT code, db_type, host, port, database_name, username, password \
             FROM tenants WHERE code = {} AND status = 'active'",
            bootstrapper.db_type().placeholder(1)
        );
        let rows = bootstrapper.query(&sql, &[QueryParam::from(code)]).await?;
        let row = rows.first().ok_or_else(|| {
            DbError::pool_not_found(self.manager.config().tenant_key(code))
        })?;
        TenantDescriptor::from_row(row)
    }
}

/// Tenant codes become part of pool keys and log fields.
pub fn validate_tenant_code(code: &str) -> DbResult<()> {
    let valid = !code.is_empty()
        && code.len() <= 64
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid tenant code '{}': use 1-64 letters, digits, '_' or '-'",
            code
        )))
    }
}

/// Builds, validates and registers tenant pools.
///
/// Provisioning is serialised per process so two callers asking for the same
/// new tenant build one pool.
pub struct TenantProvisioner<R> {
    manager: Arc<ConnectionManager>,
    resolver: R,
    provisioning: TokioMutex<()>,
    connection_limit: Option<u32>,
}

impl<R: CredentialsResolver> TenantProvisioner<R> {
    pub fn new(manager: Arc<ConnectionManager>, resolver: R) -> Self {
        Self {
            manager,
            resolver,
            provisioning: TokioMutex::new(()),
            connection_limit: None,
        }
    }

    /// Requested connection limit for tenant pools, before load throttling.
    pub fn with_connection_limit(mut self, limit: u32) -> Self {
        self.connection_limit = Some(limit);
        self
    }

    async fn registered(&self, key: &str) -> Option<DbPool> {
        self.manager
            .get_existing_pool(key)
            .await
            .ok()
            .filter(|pool| !pool.is_closed())
    }

    /// Pool for tenant `code`, provisioning it on first use.
    pub async fn pool_for(&self, code: &str) -> DbResult<DbPool> {
        validate_tenant_code(code)?;
        let key = self.manager.config().tenant_key(code);
        if let Some(pool) = self.registered(&key).await {
            return Ok(pool);
        }

        let _guard = self.provisioning.lock().await;
        // Double-check after acquiring the provisioning lock
        if let Some(pool) = self.registered(&key).await {
            debug!(tenant = %code, "Tenant provisioned concurrently");
            return Ok(pool);
        }

        let descriptor = self
            .resolver
            .resolve(code)
            .await
            .map_err(|e| e.with_context(&key, "resolve tenant"))?;
        let url = descriptor.connection_url()?;

        let check = self.manager.test_connection(&url).await;
        if !check.success {
            let kind = check.kind.unwrap_or(ErrorKind::Unknown);
            warn!(
                tenant = %code,
                kind = %kind,
                "Tenant database failed validation"
            );
            return Err(DbError::connection(
                kind,
                format!(
                    "Tenant '{}' database is not reachable: {}",
                    code,
                    check.message.unwrap_or_default()
                ),
                kind.suggestion(),
            )
            .with_context(&key, "provision tenant"));
        }

        let options = &self.manager.config().pool_options;
        let db_type = descriptor.db_type;
        let requested = self
            .connection_limit
            .unwrap_or_else(|| options.max_connections_or_default(db_type.is_sqlite()));
        let connection_limit = self.manager.governor().effective_limit(requested);
        let counter = Arc::new(AtomicU64::new(0));
        let settings = PoolSettings::from_options(options, db_type)
            .with_max_connections(connection_limit)
            .with_counter(Arc::clone(&counter));
        let pool = DbPool::connect(&url, &settings)
            .await
            .map_err(|e| e.with_context(&key, "provision tenant"))?;

        let limits = PoolLimits {
            connection_limit: pool.max_connections(),
            queue_limit: options.queue_limit_or_default(),
            connections_opened: counter,
        };
        if let Err(e) = self.manager.register_pool(&key, pool.clone(), limits).await {
            pool.close().await;
            return Err(e);
        }
        info!(
            tenant = %code,
            pool_key = %key,
            db_type = %db_type,
            connection_limit,
            "Provisioned tenant pool"
        );
        Ok(pool)
    }

    /// Close a tenant's pool. Returns whether one was registered.
    pub async fn release(&self, code: &str) -> bool {
        let key = self.manager.config().tenant_key(code);
        self.manager.close_pool(&key).await
    }
}

impl<R> std::fmt::Debug for TenantProvisioner<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantProvisioner")
            .field("connection_limit", &self.connection_limit)
            .finish_non_exhaustive()
    }
}
