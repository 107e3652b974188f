//! Database backend abstraction
//!
//! This module provides the narrow SQL surface the load engine needs:
//! - catalog reads and DDL against the LIVE databases it instruments
//! - persistence of its own state (permission windows, cache progress)
//!
//! Concrete backends:
//! - DuckDB: embedded engine state store for the CLI and tests
//! - PostgreSQL: live tables and server-side engine state

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub mod schema;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDBBackend;

#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresBackend;

pub use schema::{DatabaseSchema, initialize_schema};

use crate::error::ErrorKind;

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Transaction failed
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransientIo
    }
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&QueryRow> {
        self.rows.first()
    }
}

/// Read a text cell. Numbers and booleans are rendered; NULL is `None`.
pub fn row_str(row: &QueryRow, column: &str) -> Option<String> {
    match row.get(column)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read a boolean cell the way catalogs spell them: `true`, non-zero
/// numbers, `'Y'`, `'YES'`, `'1'`, `'true'`.
pub fn row_bool(row: &QueryRow, column: &str) -> bool {
    match row.get(column) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(serde_json::Value::String(s)) => {
            matches!(s.trim().to_uppercase().as_str(), "Y" | "YES" | "1" | "TRUE" | "T")
        }
        _ => false,
    }
}

/// Read an integer cell. Numeric strings are accepted.
pub fn row_i64(row: &QueryRow, column: &str) -> Option<i64> {
    match row.get(column)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

static RE_STATEMENT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*/\*\s*([A-Za-z0-9_]+)\s*\*/").expect("valid label regex"));

/// Prefix a statement with a label comment so backends and logs can tell
/// catalog reads and DDL apart without parsing SQL.
pub fn labelled(label: &str, sql: &str) -> String {
    format!("/* {label} */ {sql}")
}

/// Extract the label written by [`labelled`], if any
pub fn statement_label(sql: &str) -> Option<&str> {
    RE_STATEMENT_LABEL
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// A parameterised catalog query
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    pub sql: String,
    pub params: Vec<serde_json::Value>,
}

impl CatalogQuery {
    pub fn new(label: &str, sql: impl AsRef<str>, params: Vec<serde_json::Value>) -> Self {
        Self {
            sql: labelled(label, sql.as_ref()),
            params,
        }
    }

    pub fn label(&self) -> Option<&str> {
        statement_label(&self.sql)
    }
}

/// Relational database dialects the engine recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDialect {
    /// PostgreSQL, used as the generic SQL dialect
    #[default]
    Postgres,
    SqlServer,
    MySql,
    Oracle,
    DuckDB,
    Sqlite,
}

impl DatabaseDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseDialect::Postgres => "postgres",
            DatabaseDialect::SqlServer => "sqlserver",
            DatabaseDialect::MySql => "mysql",
            DatabaseDialect::Oracle => "oracle",
            DatabaseDialect::DuckDB => "duckdb",
            DatabaseDialect::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for DatabaseDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "generic" => Ok(DatabaseDialect::Postgres),
            "sqlserver" | "mssql" => Ok(DatabaseDialect::SqlServer),
            "mysql" | "mariadb" => Ok(DatabaseDialect::MySql),
            "oracle" => Ok(DatabaseDialect::Oracle),
            "duckdb" => Ok(DatabaseDialect::DuckDB),
            "sqlite" => Ok(DatabaseDialect::Sqlite),
            _ => Err(format!(
                "Unknown database dialect: {}. Use postgres, sqlserver, mysql, oracle, duckdb or sqlite.",
                s
            )),
        }
    }
}

impl std::fmt::Display for DatabaseDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database backend trait for catalog reads, DDL and engine state
///
/// Parameters are JSON values; each backend binds them with its native
/// types (strings, 64-bit integers, doubles, booleans, NULL).
#[async_trait(?Send)]
pub trait DatabaseBackend: Send + Sync {
    /// Execute a SQL query and return results
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult>;

    /// Execute a parameterized SQL query
    ///
    /// # Arguments
    /// * `sql` - SQL query with parameter placeholders ($1, $2, etc.)
    /// * `params` - Parameter values as JSON
    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<QueryResult>;

    /// Execute a single statement and return the number of affected rows
    async fn execute_statement(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<u64>;

    /// Execute multiple SQL statements
    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()>;

    /// Execute statements in order inside one transaction
    ///
    /// Either all of them take effect or none do, to the extent the
    /// underlying engine rolls back DDL.
    async fn execute_in_transaction(&self, statements: &[String]) -> DatabaseResult<()>;

    /// Check if database is healthy and accessible
    async fn health_check(&self) -> DatabaseResult<bool>;

    /// Get the database backend type name
    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_dialect_from_str() {
        assert_eq!(
            DatabaseDialect::from_str("postgresql").unwrap(),
            DatabaseDialect::Postgres
        );
        assert_eq!(
            DatabaseDialect::from_str("MSSQL").unwrap(),
            DatabaseDialect::SqlServer
        );
        assert_eq!(
            DatabaseDialect::from_str("oracle").unwrap(),
            DatabaseDialect::Oracle
        );
        assert!(DatabaseDialect::from_str("db2").is_err());
    }

    #[test]
    fn test_statement_label_round_trip() {
        let sql = labelled("trigger_status", "SELECT 1");
        assert_eq!(sql, "/* trigger_status */ SELECT 1");
        assert_eq!(statement_label(&sql), Some("trigger_status"));
        assert_eq!(statement_label("SELECT 1"), None);
    }

    #[test]
    fn test_row_helpers() {
        let row = serde_json::json!({
            "name": "id",
            "pk": 1,
            "flag": "Y",
            "other": false,
            "count": "42",
            "missing": null
        });
        assert_eq!(row_str(&row, "name").as_deref(), Some("id"));
        assert_eq!(row_str(&row, "pk").as_deref(), Some("1"));
        assert_eq!(row_str(&row, "missing"), None);
        assert!(row_bool(&row, "pk"));
        assert!(row_bool(&row, "flag"));
        assert!(!row_bool(&row, "other"));
        assert!(!row_bool(&row, "absent"));
        assert_eq!(row_i64(&row, "count"), Some(42));
    }

    #[test]
    fn test_every_database_error_is_transient() {
        for err in [
            DatabaseError::ConnectionFailed("refused".into()),
            DatabaseError::QueryFailed("syntax".into()),
            DatabaseError::MigrationFailed("v2".into()),
            DatabaseError::TransactionFailed("rollback".into()),
            DatabaseError::SerializationError("blob".into()),
        ] {
            assert_eq!(err.kind(), ErrorKind::TransientIo, "{err}");
            assert!(err.kind().is_retryable());
        }
    }

    #[test]
    fn test_query_result_empty() {
        let result = QueryResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
        assert!(result.first().is_none());
    }
}
