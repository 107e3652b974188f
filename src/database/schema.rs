//! Database schema definitions for the engine's own state
//!
//! Provides SQL schema definitions that work with both DuckDB and PostgreSQL.
//! Timestamps are stored as epoch milliseconds so lock comparisons stay a
//! plain integer compare on every backend.

use super::{DatabaseBackend, DatabaseError, DatabaseResult};

/// Schema version for migrations
pub const SCHEMA_VERSION: i64 = 1;

/// Database schema helper
pub struct DatabaseSchema;

impl DatabaseSchema {
    /// Get the schema creation SQL
    ///
    /// This SQL is compatible with both DuckDB and PostgreSQL.
    pub fn create_tables_sql() -> &'static str {
        r#"
-- Applied schema versions
CREATE TABLE IF NOT EXISTS schema_version (
    version BIGINT PRIMARY KEY
);

-- Permission windows and their persisted lock
CREATE TABLE IF NOT EXISTS permission_windows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    periods TEXT NOT NULL,
    locked_because_running BOOLEAN NOT NULL DEFAULT FALSE,
    lock_held_by TEXT,
    locked_at_ms BIGINT,
    heartbeat_at_ms BIGINT
);

-- Recurring cache fetch jobs
CREATE TABLE IF NOT EXISTS cache_progress (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    permission_window_id TEXT,
    cache_fill_progress_ms BIGINT,
    chunk_period_secs BIGINT NOT NULL,
    cache_lag_period TEXT,
    run_interval_secs BIGINT,
    last_run_at_ms BIGINT,
    last_run_succeeded BOOLEAN
);
"#
    }
}

/// Create the engine tables if they don't exist and record the schema version
pub async fn initialize_schema(backend: &dyn DatabaseBackend) -> DatabaseResult<()> {
    backend
        .execute_batch(DatabaseSchema::create_tables_sql())
        .await
        .map_err(|e| DatabaseError::MigrationFailed(format!("Failed to create tables: {}", e)))?;

    backend
        .execute_statement(
            "INSERT INTO schema_version (version) VALUES ($1) ON CONFLICT (version) DO NOTHING",
            &[serde_json::json!(SCHEMA_VERSION)],
        )
        .await
        .map_err(|e| {
            DatabaseError::MigrationFailed(format!("Failed to record schema version: {}", e))
        })?;

    tracing::debug!(version = SCHEMA_VERSION, "engine schema initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declares_lock_columns() {
        let sql = DatabaseSchema::create_tables_sql();
        assert!(sql.contains("permission_windows"));
        assert!(sql.contains("lock_held_by TEXT"));
        assert!(sql.contains("locked_because_running BOOLEAN"));
        assert!(sql.contains("cache_progress"));
    }

    #[cfg(feature = "duckdb-backend")]
    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let backend = crate::database::DuckDBBackend::in_memory().unwrap();
        initialize_schema(&backend).await.unwrap();
        initialize_schema(&backend).await.unwrap();

        let result = backend
            .execute_query("SELECT version FROM schema_version")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 1);
    }
}
