//! Control-plane schema definition.
//!
//! Table bodies are written in the column-type subset shared by MySQL,
//! PostgreSQL and SQLite. Foreign keys are kept separate so they can be added
//! with `ALTER TABLE` after every table exists; SQLite cannot alter
//! constraints, so for SQLite they are declared inline at creation instead.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;

/// Current control-plane schema version, recorded in `schema_version`.
pub const CONTROL_PLANE_SCHEMA_VERSION: i64 = 1;

/// A table and the column list used to create it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    /// Column and key definitions, without the surrounding parentheses.
    pub body: String,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// `CREATE TABLE` statement for the dialect.
    ///
    /// `inline_keys` are appended as table constraints (used for SQLite).
    pub fn create_sql(&self, db_type: DatabaseType, inline_keys: &[&ForeignKeyDefinition]) -> String {
        let mut body = self.body.trim().to_string();
        for fk in inline_keys {
            body.push_str(",\n    ");
            body.push_str(&fk.constraint_clause());
        }
        let suffix = match db_type {
            DatabaseType::MySQL => " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
            DatabaseType::PostgreSQL | DatabaseType::SQLite => "",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n){}",
            self.name, body, suffix
        )
    }
}

/// Referential action for a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
}

impl OnDelete {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDefinition {
    pub name: String,
    pub table: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub on_delete: OnDelete,
}

impl ForeignKeyDefinition {
    pub fn new(
        name: &str,
        table: &str,
        column: &str,
        references: (&str, &str),
        on_delete: OnDelete,
    ) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            references_table: references.0.to_string(),
            references_column: references.1.to_string(),
            on_delete,
        }
    }

    fn constraint_clause(&self) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
            self.name,
            self.column,
            self.references_table,
            self.references_column,
            self.on_delete.as_sql()
        )
    }

    /// `ALTER TABLE ... ADD CONSTRAINT` statement (MySQL and PostgreSQL).
    pub fn add_sql(&self) -> String {
        format!("ALTER TABLE {} ADD {}", self.table, self.constraint_clause())
    }
}

/// Versioned set of tables and the foreign keys between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDefinition {
    pub version: i64,
    /// Tables in creation order.
    pub tables: Vec<TableDefinition>,
    /// Foreign keys in the order they are added.
    pub foreign_keys: Vec<ForeignKeyDefinition>,
}

impl SchemaDefinition {
    /// The built-in control-plane schema.
    pub fn control_plane() -> Self {
        let tables = vec![
            TableDefinition::new(
                "schema_version",
                "version INTEGER NOT NULL PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP",
            ),
            TableDefinition::new(
                "workspaces",
                "id VARCHAR(36) NOT NULL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP",
            ),
            TableDefinition::new(
                "users",
                "id VARCHAR(36) NOT NULL PRIMARY KEY,
    email VARCHAR(255) NOT NULL UNIQUE,
    display_name VARCHAR(255),
    password_hash VARCHAR(255),
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP",
            ),
            TableDefinition::new(
                "workspace_members",
                "workspace_id VARCHAR(36) NOT NULL,
    user_id VARCHAR(36) NOT NULL,
    role VARCHAR(32) NOT NULL DEFAULT 'member',
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (workspace_id, user_id)",
            ),
            TableDefinition::new(
                "tenants",
                "code VARCHAR(64) NOT NULL PRIMARY KEY,
    workspace_id VARCHAR(36),
    db_type VARCHAR(16) NOT NULL DEFAULT 'mysql',
    host VARCHAR(255) NOT NULL DEFAULT '',
    port INTEGER,
    database_name VARCHAR(255) NOT NULL,
    username VARCHAR(255),
    password VARCHAR(255),
    status VARCHAR(16) NOT NULL DEFAULT 'active',
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP",
            ),
        ];

        let foreign_keys = vec![
            ForeignKeyDefinition::new(
                "fk_members_workspace",
                "workspace_members",
                "workspace_id",
                ("workspaces", "id"),
                OnDelete::Cascade,
            ),
            ForeignKeyDefinition::new(
                "fk_members_user",
                "workspace_members",
                "user_id",
                ("users", "id"),
                OnDelete::Cascade,
            ),
            ForeignKeyDefinition::new(
                "fk_tenants_workspace",
                "tenants",
                "workspace_id",
                ("workspaces", "id"),
                OnDelete::Cascade,
            ),
        ];

        Self {
            version: CONTROL_PLANE_SCHEMA_VERSION,
            tables,
            foreign_keys,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Foreign keys declared on `table`.
    pub fn foreign_keys_for(&self, table: &str) -> Vec<&ForeignKeyDefinition> {
        self.foreign_keys.iter().filter(|fk| fk.table == table).collect()
    }

    /// Check identifiers and that every foreign key points at a defined table
    /// created before the referencing one.
    pub fn validate(&self) -> DbResult<()> {
        for table in &self.tables {
            validate_identifier(&table.name)?;
        }
        for fk in &self.foreign_keys {
            for ident in [&fk.name, &fk.column, &fk.references_column] {
                validate_identifier(ident)?;
            }
            let position = |name: &str| self.tables.iter().position(|t| t.name == name);
            match (position(&fk.table), position(&fk.references_table)) {
                (Some(from), Some(to)) if to <= from => {}
                (Some(_), Some(_)) => {
                    return Err(DbError::schema(
                        format!("{} references a table created after it", fk.name),
                        fk.name.clone(),
                    ));
                }
                _ => {
                    return Err(DbError::schema(
                        format!("{} references an undefined table", fk.name),
                        fk.name.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Reject anything but `[A-Za-z0-9_]` in identifiers spliced into SQL.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(DbError::invalid_input(format!(
            "Identifier '{}' must be 1-64 characters",
            name
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::invalid_input(format!(
            "Identifier '{}' may only contain letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

/// Dialect-specific metadata queries used by the bootstrapper.
pub(crate) mod introspect {
    use crate::models::DatabaseType;

    /// `COUNT(*)` of tables named by the single bound parameter.
    pub fn table_exists(db_type: DatabaseType) -> &'static str {
        match db_type {
            DatabaseType::MySQL => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
            }
            DatabaseType::PostgreSQL => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            DatabaseType::SQLite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?"
            }
        }
    }

    /// `COUNT(*)` of matching foreign keys.
    ///
    /// MySQL and PostgreSQL bind (table, constraint name). SQLite does not keep
    /// constraint names, so it binds (table, column, referenced table).
    pub fn foreign_key_exists(db_type: DatabaseType) -> &'static str {
        match db_type {
            DatabaseType::MySQL => {
                "SELECT COUNT(*) FROM information_schema.TABLE_CONSTRAINTS \
                 WHERE CONSTRAINT_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 AND CONSTRAINT_NAME = ? AND CONSTRAINT_TYPE = 'FOREIGN KEY'"
            }
            DatabaseType::PostgreSQL => {
                "SELECT COUNT(*) FROM information_schema.table_constraints \
                 WHERE constraint_schema = current_schema() AND table_name = $1 \
                 AND constraint_name = $2 AND constraint_type = 'FOREIGN KEY'"
            }
            DatabaseType::SQLite => {
                "SELECT COUNT(*) FROM pragma_foreign_key_list(?) \
                 WHERE \"from\" = ? AND \"table\" = ?"
            }
        }
    }

    /// `COUNT(*)` of databases named by the single bound parameter.
    pub fn database_exists(db_type: DatabaseType) -> Option<&'static str> {
        match db_type {
            DatabaseType::MySQL => Some(
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?",
            ),
            DatabaseType::PostgreSQL => {
                Some("SELECT COUNT(*) FROM pg_database WHERE datname = $1")
            }
            DatabaseType::SQLite => None,
        }
    }

    pub fn create_database(db_type: DatabaseType, name: &str) -> Option<String> {
        match db_type {
            DatabaseType::MySQL => Some(format!(
                "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                name
            )),
            DatabaseType::PostgreSQL => {
                Some(format!("CREATE DATABASE \"{}\" ENCODING 'UTF8'", name))
            }
            DatabaseType::SQLite => None,
        }
    }
}
