//! PostgreSQL database backend implementation
//!
//! Used both as the generic SQL dialect for live tables (catalog reads and
//! trigger DDL) and as a server-side store for permission windows and cache
//! progress shared by several engine processes.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};

use super::{DatabaseBackend, DatabaseError, DatabaseResult, QueryResult, statement_label};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL database backend
pub struct PostgresBackend {
    /// Connection string
    connection_string: String,
    /// PostgreSQL client (wrapped for async access)
    client: Arc<Mutex<tokio_postgres::Client>>,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend
    ///
    /// # Arguments
    /// * `connection_string` - PostgreSQL connection string
    pub async fn new(connection_string: &str) -> DatabaseResult<Self> {
        let (client, connection) =
            tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Failed to connect to PostgreSQL: {}",
                        e
                    ))
                })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        let backend = Self {
            connection_string: connection_string.to_string(),
            client: Arc::new(Mutex::new(client)),
        };
        tracing::debug!(connection = %backend.connection_string_masked(), "connected to PostgreSQL");
        Ok(backend)
    }

    /// Get the connection string (masked for security)
    pub fn connection_string_masked(&self) -> String {
        mask_password(&self.connection_string)
    }

    /// Convert JSON parameters to the types the server inferred for each
    /// placeholder. NULL binds as a typed `None`.
    fn bind_params(params: &[serde_json::Value], types: &[Type]) -> DatabaseResult<Vec<BoxedParam>> {
        if params.len() != types.len() {
            return Err(DatabaseError::QueryFailed(format!(
                "Statement expects {} parameters, got {}",
                types.len(),
                params.len()
            )));
        }

        params
            .iter()
            .zip(types)
            .map(|(value, ty)| Self::bind_param(value, ty))
            .collect()
    }

    fn bind_param(value: &serde_json::Value, ty: &Type) -> DatabaseResult<BoxedParam> {
        use serde_json::Value;

        let mismatch = || {
            DatabaseError::SerializationError(format!("Cannot bind {} as {}", value, ty.name()))
        };

        let boxed: BoxedParam = match *ty {
            Type::BOOL => match value {
                Value::Null => Box::new(None::<bool>),
                Value::Bool(b) => Box::new(Some(*b)),
                _ => return Err(mismatch()),
            },
            Type::INT8 => match value {
                Value::Null => Box::new(None::<i64>),
                Value::Number(n) => Box::new(Some(n.as_i64().ok_or_else(mismatch)?)),
                _ => return Err(mismatch()),
            },
            Type::INT4 => match value {
                Value::Null => Box::new(None::<i32>),
                Value::Number(n) => {
                    let v = n.as_i64().and_then(|v| i32::try_from(v).ok());
                    Box::new(Some(v.ok_or_else(mismatch)?))
                }
                _ => return Err(mismatch()),
            },
            Type::FLOAT8 => match value {
                Value::Null => Box::new(None::<f64>),
                Value::Number(n) => Box::new(Some(n.as_f64().ok_or_else(mismatch)?)),
                _ => return Err(mismatch()),
            },
            _ => match value {
                Value::Null => Box::new(None::<String>),
                Value::String(s) => Box::new(Some(s.clone())),
                other => Box::new(Some(other.to_string())),
            },
        };
        Ok(boxed)
    }

    /// Convert a PostgreSQL row to a JSON value
    fn row_to_json(row: &tokio_postgres::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            let value = Self::get_column_value(row, i);
            map.insert(col_name.clone(), value);
        }

        serde_json::Value::Object(map)
    }

    /// Get a column value as JSON
    fn get_column_value(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
        // Try different types
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v.map(Into::into).unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v.map(Into::into).unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i16>>(idx) {
            return v.map(Into::into).unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v
                .map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
        }

        serde_json::Value::Null
    }

    async fn run_query(&self, sql: &str, params: &[serde_json::Value]) -> DatabaseResult<QueryResult> {
        let start = std::time::Instant::now();
        let client = self.client.lock().await;

        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;
        let bound = Self::bind_params(params, stmt.params())?;
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let rows = client
            .query(&stmt, &param_refs)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Query failed: {}", e)))?;

        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let json_rows: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| Self::row_to_json(row, &columns))
            .collect();

        let elapsed = start.elapsed().as_millis() as u64;
        tracing::debug!(
            backend = "postgres",
            label = statement_label(sql).unwrap_or("query"),
            rows = json_rows.len(),
            elapsed_ms = elapsed,
            "query executed"
        );

        Ok(QueryResult {
            columns,
            rows: json_rows,
            rows_affected: None,
            execution_time_ms: elapsed,
        })
    }
}

/// Replace the password component of a `user:password@host` connection string
pub fn mask_password(connection_string: &str) -> String {
    if let Some(at_pos) = connection_string.find('@')
        && let Some(colon_pos) = connection_string[..at_pos].rfind(':')
        && !connection_string[colon_pos + 1..].starts_with("//")
    {
        let prefix = &connection_string[..colon_pos + 1];
        let suffix = &connection_string[at_pos..];
        return format!("{}****{}", prefix, suffix);
    }
    connection_string.to_string()
}

#[async_trait(?Send)]
impl DatabaseBackend for PostgresBackend {
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        self.run_query(sql, &[]).await
    }

    async fn execute_query_params(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<QueryResult> {
        self.run_query(sql, params).await
    }

    async fn execute_statement(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> DatabaseResult<u64> {
        let client = self.client.lock().await;

        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Prepare failed: {}", e)))?;
        let bound = Self::bind_params(params, stmt.params())?;
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let affected = client
            .execute(&stmt, &param_refs)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Execute failed: {}", e)))?;

        tracing::debug!(
            backend = "postgres",
            label = statement_label(sql).unwrap_or("statement"),
            affected,
            "statement executed"
        );
        Ok(affected)
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Batch execute failed: {}", e)))
    }

    async fn execute_in_transaction(&self, statements: &[String]) -> DatabaseResult<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Begin failed: {}", e)))?;

        for statement in statements {
            // The transaction rolls back when dropped uncommitted
            tx.batch_execute(statement).await.map_err(|e| {
                DatabaseError::TransactionFailed(format!(
                    "{} failed: {}",
                    statement_label(statement).unwrap_or("statement"),
                    e
                ))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("Commit failed: {}", e)))
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        let result = self.execute_query("SELECT 1 as healthy").await?;
        Ok(!result.rows.is_empty())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
