//! Data models for the tenant connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod stats;
pub mod tenant;

// Re-export commonly used types
pub use connection::{ConnectionTestResult, DatabaseType};
pub use query::{JsonRow, QueryParam, WriteResult};
pub use stats::{HealthReport, HealthStatus, PoolOwner, PoolStats};
pub use tenant::TenantDescriptor;
