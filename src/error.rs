//! Error types for the tenant connection manager.
//!
//! Driver errors are classified exactly once, when a `sqlx::Error` is converted
//! into a [`DbError`]. Everything downstream (retry loops, health accounting,
//! connection diagnostics) matches on [`ErrorKind`] and never re-parses the raw
//! driver message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class of a database error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Server or pool refused another connection ("too many connections").
    ConnectionLimitExceeded,
    /// Deadlock, lock-wait timeout or serialization failure.
    Deadlock,
    /// An established connection dropped mid-flight.
    ConnectionLost,
    /// Host unreachable, connection refused, TLS failure.
    NetworkUnreachable,
    /// Credentials rejected.
    AuthDenied,
    /// Target database does not exist.
    UnknownDatabase,
    /// Table, index or constraint already exists.
    SchemaConflict,
    Unknown,
}

impl ErrorKind {
    /// Human-readable cause, suitable for surfacing to an operator.
    pub fn describe(self) -> &'static str {
        match self {
            Self::ConnectionLimitExceeded => "The database server has too many open connections",
            Self::Deadlock => "The operation was aborted by a lock conflict",
            Self::ConnectionLost => "The connection to the database server was lost",
            Self::NetworkUnreachable => "The database host could not be reached",
            Self::AuthDenied => "Access denied: the username or password is incorrect",
            Self::UnknownDatabase => "The database does not exist on the server",
            Self::SchemaConflict => "The schema object already exists",
            Self::Unknown => "Unexpected database error",
        }
    }

    /// Operator-facing remediation hint.
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::ConnectionLimitExceeded => {
                "Reduce pool sizes or raise the server's max_connections"
            }
            Self::Deadlock => "Retry the unit of work; it must be safe to re-execute",
            Self::ConnectionLost => "Check database server status; the pool will reconnect",
            Self::NetworkUnreachable => "Check that the host and port are correct and reachable",
            Self::AuthDenied => "Verify the username and password",
            Self::UnknownDatabase => "Verify the database name exists on the server",
            Self::SchemaConflict => "The object already exists and can be left in place",
            Self::Unknown => "Check the SQL statement and server logs",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectionLimitExceeded => "connection_limit_exceeded",
            Self::Deadlock => "deadlock",
            Self::ConnectionLost => "connection_lost",
            Self::NetworkUnreachable => "network_unreachable",
            Self::AuthDenied => "auth_denied",
            Self::UnknownDatabase => "unknown_database",
            Self::SchemaConflict => "schema_conflict",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        kind: ErrorKind,
        message: String,
        suggestion: String,
    },

    #[error("Database error: {message}")]
    Database {
        kind: ErrorKind,
        message: String,
        /// SQLSTATE or driver error number, e.g. "40P01" or "1213"
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("No pool registered for '{key}'")]
    PoolNotFound { key: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Fatal: the control-plane database could not be reached.
    #[error("Bootstrap failed after {attempts} attempt(s): {message}")]
    Bootstrap {
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },

    #[error("{operation} on '{key}' failed: {source}")]
    Operation {
        key: String,
        operation: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(
        kind: ErrorKind,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        kind: ErrorKind,
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            kind,
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn pool_not_found(key: impl Into<String>) -> Self {
        Self::PoolNotFound { key: key.into() }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn bootstrap(attempts: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Bootstrap {
            attempts,
            kind,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Tag this error with the pool key and operation it came from.
    ///
    /// Already-tagged errors are returned unchanged so context is never nested.
    pub fn with_context(self, key: impl Into<String>, operation: impl Into<String>) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                key: key.into(),
                operation: operation.into(),
                source: Box::new(other),
            },
        }
    }

    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { kind, .. } | Self::Database { kind, .. } => *kind,
            Self::Bootstrap { kind, .. } => *kind,
            Self::Operation { source, .. } => source.kind(),
            _ => ErrorKind::Unknown,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Operation { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Whether a transactional unit of work failing with this error may be replayed.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, Self::Bootstrap { .. }) {
            return false;
        }
        matches!(self.kind(), ErrorKind::Deadlock | ErrorKind::ConnectionLost)
    }
}

/// Classify a driver error into an [`ErrorKind`].
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db_err) => {
            if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                if let Some(kind) = classify_mysql_number(mysql.number()) {
                    return kind;
                }
            }
            classify_code(db_err.code().as_deref(), db_err.message())
        }
        sqlx::Error::PoolTimedOut => ErrorKind::ConnectionLimitExceeded,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => ErrorKind::ConnectionLost,
        sqlx::Error::Io(io_err) => classify_io(io_err.kind()),
        sqlx::Error::Tls(_) => ErrorKind::NetworkUnreachable,
        sqlx::Error::Protocol(msg) => classify_message(msg),
        _ => ErrorKind::Unknown,
    }
}

/// MySQL server error numbers.
pub fn classify_mysql_number(number: u16) -> Option<ErrorKind> {
    match number {
        1040 | 1203 => Some(ErrorKind::ConnectionLimitExceeded),
        1205 | 1213 => Some(ErrorKind::Deadlock),
        1044 | 1045 | 1698 => Some(ErrorKind::AuthDenied),
        1049 => Some(ErrorKind::UnknownDatabase),
        1007 | 1022 | 1050 | 1061 | 1826 => Some(ErrorKind::SchemaConflict),
        2006 | 2013 => Some(ErrorKind::ConnectionLost),
        _ => None,
    }
}

/// PostgreSQL SQLSTATE codes and SQLite (extended) result codes.
pub fn classify_code(code: Option<&str>, message: &str) -> ErrorKind {
    let by_code = match code {
        Some("53300") => Some(ErrorKind::ConnectionLimitExceeded),
        Some("40P01" | "55P03" | "40001") => Some(ErrorKind::Deadlock),
        Some("28P01" | "28000") => Some(ErrorKind::AuthDenied),
        Some("3D000") => Some(ErrorKind::UnknownDatabase),
        Some("42P04" | "42P06" | "42P07" | "42710") => Some(ErrorKind::SchemaConflict),
        Some("08000" | "08003" | "08006" | "57P01") => Some(ErrorKind::ConnectionLost),
        Some("08001") => Some(ErrorKind::NetworkUnreachable),
        // SQLITE_BUSY / SQLITE_LOCKED and their extended variants
        Some("5" | "6" | "261" | "262" | "517" | "773") => Some(ErrorKind::Deadlock),
        Some("14") => Some(ErrorKind::UnknownDatabase),
        _ => None,
    };
    by_code.unwrap_or_else(|| classify_message(message))
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("too many connections") {
        ErrorKind::ConnectionLimitExceeded
    } else if lower.contains("deadlock")
        || lower.contains("lock wait timeout")
        || lower.contains("database is locked")
    {
        ErrorKind::Deadlock
    } else if lower.contains("gone away") || lower.contains("connection lost") {
        ErrorKind::ConnectionLost
    } else if lower.contains("access denied") || lower.contains("authentication failed") {
        ErrorKind::AuthDenied
    } else if lower.contains("unknown database") || lower.contains("does not exist") {
        ErrorKind::UnknownDatabase
    } else if lower.contains("already exists") || lower.contains("duplicate") {
        ErrorKind::SchemaConflict
    } else {
        ErrorKind::Unknown
    }
}

fn classify_io(kind: std::io::ErrorKind) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match kind {
        Io::ConnectionRefused
        | Io::HostUnreachable
        | Io::NetworkUnreachable
        | Io::AddrNotAvailable
        | Io::TimedOut => ErrorKind::NetworkUnreachable,
        Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::BrokenPipe
        | Io::UnexpectedEof
        | Io::NotConnected => ErrorKind::ConnectionLost,
        _ => ErrorKind::Unknown,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let kind = classify(&err);
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                kind,
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = match db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                    Some(mysql) => Some(mysql.number().to_string()),
                    None => db_err.code().map(|c| c.to_string()),
                };
                DbError::database(kind, db_err.message(), code, kind.suggestion())
            }
            sqlx::Error::RowNotFound => DbError::database(
                kind,
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                kind,
                "Timed out waiting for a pooled connection",
                kind.suggestion(),
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection(kind, "Connection pool is closed", kind.suggestion())
            }
            sqlx::Error::Io(io_err) => {
                DbError::connection(kind, format!("I/O error: {}", io_err), kind.suggestion())
            }
            sqlx::Error::Tls(tls_err) => DbError::connection(
                kind,
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                kind,
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => {
                DbError::connection(kind, "Database worker crashed", kind.suggestion())
            }
            other => DbError::internal(format!("Unknown database error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
