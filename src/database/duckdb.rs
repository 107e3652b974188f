//! DuckDB database backend implementation
//!
//! Embedded store for the engine's own state (permission windows and their
//! locks, cache progress). A single connection sits behind a mutex, so every
//! statement, including the lock compare-and-set, is serialised in-process;
//! DuckDB's optimistic concurrency covers other processes sharing the file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::{DatabaseBackend, DatabaseError, DatabaseResult, QueryResult, statement_label};

/// DuckDB database backend
pub struct DuckDBBackend {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// DuckDB connection (wrapped in Mutex for thread safety)
    connection: Mutex<duckdb::Connection>,
}

impl DuckDBBackend {
    /// Open (or create) a file-based database
    pub fn new(db_path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory DuckDB backend
    ///
    /// Useful for testing or throwaway schedulers where persistence is not needed.
    pub fn in_memory() -> DatabaseResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            DatabaseError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    fn lock(&self) -> DatabaseResult<MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| DatabaseError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    /// Bind JSON parameters with their natural DuckDB types
    fn bind_params(params: &[serde_json::Value]) -> Vec<duckdb::types::Value> {
        use duckdb::types::Value;

        params
            .iter()
            .map(|p| match p {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Bool(b) => Value::Boolean(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::BigInt(i),
                    None => Value::Double(n.as_f64().unwrap_or_default()),
                },
                serde_json::Value::String(s) => Value::Text(s.clone()),
                other => Value::Text(other.to_string()),
            })
            .collect()
    }

    /// Convert a DuckDB row to a JSON value
    fn row_to_json(row: &duckdb::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => Self::value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            map.insert(col_name.clone(), value);
        }

        serde_json::Value::Object(map)
    }

    /// Convert a DuckDB ValueRef to a JSON value
    fn value_ref_to_json(value: duckdb::types::ValueRef) -> serde_json::Value {
        use duckdb::types::ValueRef;

        match value {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Boolean(b) => serde_json::Value::Bool(b),
            ValueRef::TinyInt(i) => i.into(),
            ValueRef::SmallInt(i) => i.into(),
            ValueRef::Int(i) => i.into(),
            ValueRef::BigInt(i) => i.into(),
            // i128 may not fit in a JSON number
            ValueRef::HugeInt(i) => serde_json::Value::String(i.to_string()),
            ValueRef::UTinyInt(i) => i.into(),
            ValueRef::USmallInt(i) => i.into(),
            ValueRef::UInt(i) => i.into(),
            ValueRef::UBigInt(i) => i.into(),
            ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Double(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            ValueRef::Blob(bytes) => {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
            // Temporal and nested values are not part of the engine schema
            other => serde_json::Value::String(format!("{:?}", other)),
        }
    }

    fn run_query(&self, sql: &str, params: &[serde_json::Value]) -> DatabaseResult<QueryResult> {
        let start = Instant::now();
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;

        let values = Self::bind_params(params);

        // In DuckDB 1.4+, we need to execute the query first, then get columns
        let mut result_rows = stmt
            .query(duckdb::params_from_iter(values.iter()))
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| DatabaseError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            rows.push(Self::row_to_json(row, &columns));
        }

        let elapsed = start.elapsed().as_millis() as u64;
        tracing::debug!(
            backend = "duckdb",
            label = statement_label(sql).unwrap_or("query"),
            rows = rows.len(),
            elapsed_ms = elapsed,
            "query executed"
        );

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: elapsed,
        })
    }
}

#[async_trait(?Send)]
impl DatabaseBackend for DuckDBBackend {
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        self.run_query(sql, &[])
    }

    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<QueryResult> {
        self.run_query(sql, params)
    }

    async fn execute_statement(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<u64> {
        let conn = self.lock()?;
        let values = Self::bind_params(params);

        let affected = conn
            .execute(sql, duckdb::params_from_iter(values.iter()))
            .map_err(|e| DatabaseError::QueryFailed(format!("Execute failed: {}", e)))?;

        tracing::debug!(
            backend = "duckdb",
            label = statement_label(sql).unwrap_or("statement"),
            affected,
            "statement executed"
        );
        Ok(affected as u64)
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn execute_in_transaction(&self, statements: &[String]) -> DatabaseResult<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        for statement in statements {
            // Dropping `tx` on error rolls the transaction back
            tx.execute_batch(statement).map_err(|e| {
                DatabaseError::TransactionFailed(format!(
                    "{} failed: {}",
                    statement_label(statement).unwrap_or("statement"),
                    e
                ))
            })?;
        }

        tx.commit()
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        let result = self.run_query("SELECT 1 AS ok", &[])?;
        Ok(!result.is_empty())
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }
}
