//! Tenant DB Pool Library
//!
//! Connection lifecycle management for multi-tenant services: one shared
//! control-plane database plus any number of per-tenant databases (SQLite,
//! PostgreSQL, MySQL), each behind a health-checked, load-governed pool.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod tenant;

pub use config::{Config, ManagerConfig};
pub use db::{ConnectionManager, SchemaBootstrapper};
pub use error::{DbError, DbResult, ErrorKind};
