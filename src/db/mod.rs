//! Database layer.
//!
//! - Dialect-specific pools, connections and transactions
//! - Control-plane schema bootstrap
//! - Pool registry with load governing, health monitoring and idle reclamation
//! - Transactional execution with retry of transient failures
//! - Database dispatch macros for reducing code duplication

pub mod bootstrap;
pub mod governor;
#[macro_use]
pub mod macros;
pub mod monitor;
pub mod params;
pub mod pool;
pub mod registry;
pub mod schema;
pub mod transaction;
pub mod types;

pub use bootstrap::{BootstrapReport, SchemaBootstrapper, TableStatus};
pub use governor::LoadGovernor;
pub use pool::{DbConnection, DbPool, PoolSettings, database_url_for, server_url, test_connection};
pub use registry::{ConnectionManager, PoolEntry, PoolLimits, PoolRequest, TrackedConnection};
pub use schema::{ForeignKeyDefinition, OnDelete, SchemaDefinition, TableDefinition};
pub use transaction::DbTransaction;
