//! Dialect dispatch macros for reducing code duplication.
//!
//! Every backend has its own query, row and result types, so the same
//! statement must be spelled out once per dialect. These macros expand to
//! that per-dialect code for any sqlx executor (pool, pooled connection or
//! open transaction) while keeping call sites linear.

/// Fetch every row of a bound statement as a JSON map.
///
/// ```ignore
/// let rows = fetch_json!(params::mysql_query, &pool, sql, params)?;
/// ```
macro_rules! fetch_json {
    ($bind:path, $executor:expr, $sql:expr, $params:expr) => {{
        use $crate::db::types::RowToJson as _;
        $bind($sql, $params)
            .fetch_all($executor)
            .await
            .map(|rows| {
                rows.iter()
                    .map(|row| row.to_json_map())
                    .collect::<Vec<$crate::models::JsonRow>>()
            })
            .map_err($crate::error::DbError::from)
    }};
}

/// Execute a bound statement and return the dialect's query result.
macro_rules! execute_bound {
    ($bind:path, $executor:expr, $sql:expr, $params:expr) => {
        $bind($sql, $params)
            .execute($executor)
            .await
            .map_err($crate::error::DbError::from)
    };
}

/// Fetch the first column of the first row as a nullable integer.
macro_rules! fetch_i64 {
    ($bind:path, $executor:expr, $sql:expr, $params:expr) => {{
        use sqlx::Row as _;
        match $bind($sql, $params).fetch_optional($executor).await {
            Ok(Some(row)) => row
                .try_get::<Option<i64>, _>(0)
                .map_err($crate::error::DbError::from),
            Ok(None) => Ok(None),
            Err(e) => Err($crate::error::DbError::from(e)),
        }
    }};
}

pub(crate) use {execute_bound, fetch_i64, fetch_json};
