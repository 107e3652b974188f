//! Audit triggers on LIVE tables
//!
//! Every LIVE table under load management carries an AFTER UPDATE/DELETE
//! trigger that copies the pre-image of each changed row into an append-only
//! archive table. This module creates, inspects, synchronises and drops those
//! triggers on each supported dialect.
//!
//! The work is split across two traits:
//! - [`TriggerSql`] is the per-dialect plumbing: catalog queries, how their
//!   rows are read, and the DDL to emit. It never touches a connection.
//! - [`TriggerImplementer`] is the capability set callers use. Its provided
//!   methods drive a [`DatabaseBackend`] with the SQL a dialect produces, so
//!   adding a dialect means adding a variant, not branching here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub mod archive;
pub mod factory;
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod sqlserver;

pub use archive::{ArchiveColumn, AuditColumnTypes, body_fingerprint, normalize_body};
pub use factory::create_trigger_implementer;
pub use mysql::MySqlTriggerImplementer;
pub use oracle::OracleTriggerImplementer;
pub use postgres::PostgresTriggerImplementer;
pub use sqlserver::SqlServerTriggerImplementer;

use crate::checks::{CheckEvent, CheckNotifier};
use crate::database::{
    CatalogQuery, DatabaseBackend, DatabaseDialect, DatabaseError, QueryResult, labelled, row_bool,
    row_str,
};
use crate::error::ErrorKind;
use crate::stages::{DatabaseNamer, NamingError, NamingResult, Stage};

/// Shared handle to a backend, as held by every dialect implementer
pub type SharedBackend = Arc<dyn DatabaseBackend>;

/// Lifecycle state of a table's audit trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerStatus {
    Missing,
    Disabled,
    Enabled,
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerStatus::Missing => write!(f, "Missing"),
            TriggerStatus::Disabled => write!(f, "Disabled"),
            TriggerStatus::Enabled => write!(f, "Enabled"),
        }
    }
}

/// The LIVE table a trigger implementer works on, with the derived names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTarget {
    /// Schema (or owner / database for MySQL); the session default when absent
    pub schema: Option<String>,
    pub table: String,
    pub archive_table: String,
    pub trigger_name: String,
}

impl TriggerTarget {
    /// Derive the archive table from the namer's Archive convention and the
    /// trigger name as `<table>_OnUpdate`
    pub fn new(
        schema: Option<String>,
        table: impl Into<String>,
        namer: &dyn DatabaseNamer,
    ) -> NamingResult<Self> {
        let table = table.into();
        Ok(Self {
            schema,
            archive_table: namer.table_name(&table, Stage::Archive)?,
            trigger_name: format!("{table}_OnUpdate"),
            table,
        })
    }
}

/// A column read from the dialect's catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredColumn {
    pub name: String,
    /// Type as the catalog spells it, including length/precision
    pub data_type: String,
    pub is_primary_key: bool,
}

impl DiscoveredColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_primary_key: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_primary_key,
        }
    }
}

/// Outcome of a successful [`TriggerImplementer::synchronize`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: TriggerStatus,
    pub column_count: usize,
    /// sha256 hex of the normalised trigger body
    pub body_fingerprint: String,
}

/// Errors raised by trigger operations
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Table {table} has no primary key")]
    NoPrimaryKey { table: String },

    #[error("Table {table} does not exist")]
    TableNotFound { table: String },

    #[error("Cannot {action} trigger {trigger} while it is {from}")]
    InvalidTransition {
        trigger: String,
        from: TriggerStatus,
        action: &'static str,
    },

    #[error("Trigger {trigger} does not exist")]
    TriggerMissing { trigger: String },

    #[error("Archive table {archive} does not exist")]
    ArchiveMissing { archive: String },

    #[error("Table {table} has a column named {column}, which is reserved for the archive")]
    AuditColumnCollision { table: String, column: String },

    #[error("{operation} is not supported on {dialect}")]
    UnsupportedOperation {
        dialect: DatabaseDialect,
        operation: &'static str,
    },

    #[error("Dialect {0} has no trigger implementer")]
    UnsupportedDialect(DatabaseDialect),

    #[error("Trigger {trigger} body differs from the body generated for the current columns\nexpected:\n{expected}\nactual:\n{actual}")]
    TriggerBodyMismatch {
        trigger: String,
        expected: String,
        actual: String,
    },

    #[error("Archive table {archive} is missing columns: {}", missing.join(", "))]
    ArchiveSchemaDrift { archive: String, missing: Vec<String> },

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TriggerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TriggerError::UnsupportedDialect(_) => ErrorKind::Configuration,
            TriggerError::Naming(e) => e.kind(),
            TriggerError::NoPrimaryKey { .. }
            | TriggerError::TableNotFound { .. }
            | TriggerError::InvalidTransition { .. }
            | TriggerError::TriggerMissing { .. }
            | TriggerError::ArchiveMissing { .. }
            | TriggerError::AuditColumnCollision { .. }
            | TriggerError::UnsupportedOperation { .. } => ErrorKind::Precondition,
            TriggerError::TriggerBodyMismatch { .. } | TriggerError::ArchiveSchemaDrift { .. } => {
                ErrorKind::Drift
            }
            TriggerError::Database(e) => e.kind(),
        }
    }
}

pub type TriggerResult<T> = Result<T, TriggerError>;

/// Per-dialect SQL for one [`TriggerTarget`]
///
/// Catalog queries take the schema (possibly NULL) first and the object
/// name last.
pub trait TriggerSql {
    fn dialect(&self) -> DatabaseDialect;

    fn target(&self) -> &TriggerTarget;

    /// Whether DDL issued inside a transaction is rolled back with it
    fn supports_transactional_ddl(&self) -> bool;

    fn quote_ident(&self, ident: &str) -> String;

    /// Schema-qualified, quoted object name
    fn qualified(&self, name: &str) -> String {
        match &self.target().schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(name)),
            None => self.quote_ident(name),
        }
    }

    fn audit_column_types(&self) -> AuditColumnTypes;

    /// Columns of `table` in ordinal order. Rows expose `column_name`,
    /// `data_type` and `is_primary_key`.
    fn columns_query(&self, table: &str) -> CatalogQuery;

    fn status_query(&self) -> CatalogQuery;

    fn parse_status(&self, result: &QueryResult) -> TriggerStatus;

    fn body_query(&self) -> CatalogQuery;

    /// Reassemble the deployed body from the catalog rows, `None` when absent
    fn parse_body(&self, result: &QueryResult) -> Option<String>;

    /// The body the catalog should report for a trigger created over `columns`
    fn expected_body(&self, columns: &[DiscoveredColumn]) -> String;

    /// Statements creating the trigger (and any helper objects), in order
    fn create_trigger_sql(&self, columns: &[DiscoveredColumn]) -> Vec<String>;

    /// Statements removing the trigger (and any helper objects), in order
    fn drop_trigger_sql(&self) -> Vec<String>;

    /// `None` when the dialect cannot toggle a trigger in place
    fn enable_trigger_sql(&self) -> Option<String>;

    fn disable_trigger_sql(&self) -> Option<String>;

    fn add_archive_column_sql(&self, column: &ArchiveColumn) -> String;

    fn create_archive_sql(&self, columns: &[DiscoveredColumn]) -> String {
        let definitions = archive::archive_columns(columns, &self.audit_column_types())
            .iter()
            .map(|c| format!("{} {}", self.quote_ident(&c.name), c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        labelled(
            "create_archive_table",
            &format!(
                "CREATE TABLE {} ({})",
                self.qualified(&self.target().archive_table),
                definitions
            ),
        )
    }

    fn drop_archive_sql(&self) -> String {
        labelled(
            "drop_archive_table",
            &format!("DROP TABLE {}", self.qualified(&self.target().archive_table)),
        )
    }

    /// Schema parameter shared by every catalog query
    fn schema_param(&self) -> serde_json::Value {
        match &self.target().schema {
            Some(schema) => serde_json::Value::String(schema.clone()),
            None => serde_json::Value::Null,
        }
    }

    /// Turn `columns_query` rows into columns
    fn parse_columns(&self, result: &QueryResult) -> Vec<DiscoveredColumn> {
        result
            .rows
            .iter()
            .filter_map(|row| {
                Some(DiscoveredColumn {
                    name: row_str(row, "column_name")?,
                    data_type: row_str(row, "data_type").unwrap_or_default(),
                    is_primary_key: row_bool(row, "is_primary_key"),
                })
            })
            .collect()
    }
}

/// Audit-trigger lifecycle for one LIVE table
///
/// `Missing → Enabled` (create), `Enabled ⇄ Disabled` (disable/enable),
/// `Enabled | Disabled → Missing` (drop). Preconditions are checked before any
/// statement that mutates the database.
#[async_trait(?Send)]
pub trait TriggerImplementer: TriggerSql {
    fn backend(&self) -> &dyn DatabaseBackend;

    /// Columns of `table`; empty when the table does not exist
    async fn discover_columns(&self, table: &str) -> TriggerResult<Vec<DiscoveredColumn>> {
        let query = self.columns_query(table);
        let result = self
            .backend()
            .execute_query_params(&query.sql, &query.params)
            .await?;
        Ok(self.parse_columns(&result))
    }

    async fn table_exists(&self, table: &str) -> TriggerResult<bool> {
        Ok(!self.discover_columns(table).await?.is_empty())
    }

    /// Current status; a trigger that does not exist is `Missing`, not an error
    async fn get_trigger_status(&self) -> TriggerResult<TriggerStatus> {
        let query = self.status_query();
        let result = self
            .backend()
            .execute_query_params(&query.sql, &query.params)
            .await?;
        Ok(self.parse_status(&result))
    }

    /// Source text of the deployed trigger as the catalog reports it
    async fn get_trigger_body(&self) -> TriggerResult<Option<String>> {
        let query = self.body_query();
        let result = self
            .backend()
            .execute_query_params(&query.sql, &query.params)
            .await?;
        Ok(self.parse_body(&result))
    }

    /// Create the archive table (if absent) and the trigger
    async fn create_trigger(&self, notifier: &dyn CheckNotifier) -> TriggerResult<()> {
        let target = self.target();

        let columns = self.discover_columns(&target.table).await?;
        if columns.is_empty() {
            notifier.on_check(CheckEvent::fail(format!("Table {} not found", target.table)));
            return Err(TriggerError::TableNotFound {
                table: target.table.clone(),
            });
        }

        let primary_keys: Vec<&str> = columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect();
        if primary_keys.is_empty() {
            notifier.on_check(CheckEvent::fail(format!(
                "Table {} has no primary key",
                target.table
            )));
            return Err(TriggerError::NoPrimaryKey {
                table: target.table.clone(),
            });
        }
        notifier.on_check(CheckEvent::success(format!(
            "Primary key found on {}: {}",
            target.table,
            primary_keys.join(", ")
        )));

        if let Some(column) = archive::audit_column_collision(&columns) {
            notifier.on_check(CheckEvent::fail(format!(
                "Column {} clashes with an archive audit column",
                column
            )));
            return Err(TriggerError::AuditColumnCollision {
                table: target.table.clone(),
                column: column.to_string(),
            });
        }

        let status = self.get_trigger_status().await?;
        if status != TriggerStatus::Missing {
            notifier.on_check(CheckEvent::fail(format!(
                "Trigger {} is already {}",
                target.trigger_name, status
            )));
            return Err(TriggerError::InvalidTransition {
                trigger: target.trigger_name.clone(),
                from: status,
                action: "create",
            });
        }

        let archive_columns = self.discover_columns(&target.archive_table).await?;
        let archive_exists = !archive_columns.is_empty();
        if archive_exists {
            let missing = archive::missing_archive_columns(&columns, &archive_columns);
            if !missing.is_empty() {
                notifier.on_check(CheckEvent::fail(format!(
                    "Archive table {} is missing columns: {}",
                    target.archive_table,
                    missing.join(", ")
                )));
                return Err(TriggerError::ArchiveSchemaDrift {
                    archive: target.archive_table.clone(),
                    missing,
                });
            }
            notifier.on_check(CheckEvent::success(format!(
                "Archive table {} already exists",
                target.archive_table
            )));
        }

        let mut statements = Vec::new();
        if !archive_exists {
            statements.push(self.create_archive_sql(&columns));
        }
        statements.extend(self.create_trigger_sql(&columns));

        match self.backend().execute_in_transaction(&statements).await {
            Ok(()) => {
                notifier.on_check(CheckEvent::success(format!(
                    "Created trigger {} archiving into {}",
                    target.trigger_name, target.archive_table
                )));
                tracing::info!(
                    dialect = %self.dialect(),
                    table = %target.table,
                    trigger = %target.trigger_name,
                    archive_created = !archive_exists,
                    "audit trigger created"
                );
                Ok(())
            }
            Err(e) => {
                notifier.on_check(CheckEvent::fail(format!(
                    "Creating trigger {} failed: {}",
                    target.trigger_name, e
                )));
                if !self.supports_transactional_ddl() {
                    self.compensate_failed_create(!archive_exists).await;
                }
                Err(e.into())
            }
        }
    }

    /// Undo what a failed create left behind on dialects whose DDL commits
    /// implicitly. Failures are logged, the original error is what the caller sees.
    async fn compensate_failed_create(&self, drop_archive: bool) {
        let target = self.target();

        let trigger_present = !matches!(
            self.get_trigger_status().await,
            Ok(TriggerStatus::Missing)
        );
        if trigger_present {
            for statement in self.drop_trigger_sql() {
                if let Err(e) = self.backend().execute_statement(&statement, &[]).await {
                    tracing::warn!(
                        trigger = %target.trigger_name,
                        error = %e,
                        "compensation: failed to drop partial trigger"
                    );
                }
            }
        }

        if drop_archive
            && let Err(e) = self
                .backend()
                .execute_statement(&self.drop_archive_sql(), &[])
                .await
        {
            tracing::warn!(
                archive = %target.archive_table,
                error = %e,
                "compensation: failed to drop archive table"
            );
        }
    }

    /// Remove the trigger. The archive table and its rows are kept.
    async fn drop_trigger(&self) -> TriggerResult<()> {
        let target = self.target();
        let status = self.get_trigger_status().await?;
        if status == TriggerStatus::Missing {
            return Err(TriggerError::InvalidTransition {
                trigger: target.trigger_name.clone(),
                from: status,
                action: "drop",
            });
        }

        self.backend()
            .execute_in_transaction(&self.drop_trigger_sql())
            .await?;
        tracing::info!(table = %target.table, trigger = %target.trigger_name, "audit trigger dropped");
        Ok(())
    }

    async fn enable_trigger(&self) -> TriggerResult<()> {
        let target = self.target();
        let status = self.get_trigger_status().await?;
        if status != TriggerStatus::Disabled {
            return Err(TriggerError::InvalidTransition {
                trigger: target.trigger_name.clone(),
                from: status,
                action: "enable",
            });
        }

        let sql = self
            .enable_trigger_sql()
            .ok_or(TriggerError::UnsupportedOperation {
                dialect: self.dialect(),
                operation: "enable trigger",
            })?;
        self.backend().execute_statement(&sql, &[]).await?;
        tracing::info!(trigger = %target.trigger_name, "audit trigger enabled");
        Ok(())
    }

    async fn disable_trigger(&self) -> TriggerResult<()> {
        let target = self.target();
        let status = self.get_trigger_status().await?;
        if status != TriggerStatus::Enabled {
            return Err(TriggerError::InvalidTransition {
                trigger: target.trigger_name.clone(),
                from: status,
                action: "disable",
            });
        }

        let sql = self
            .disable_trigger_sql()
            .ok_or(TriggerError::UnsupportedOperation {
                dialect: self.dialect(),
                operation: "disable trigger",
            })?;
        self.backend().execute_statement(&sql, &[]).await?;
        tracing::info!(trigger = %target.trigger_name, "audit trigger disabled");
        Ok(())
    }

    /// Check the deployed trigger and archive against the live table's
    /// current columns. Drift is reported, never repaired.
    async fn synchronize(&self) -> TriggerResult<SyncReport> {
        let target = self.target();

        let status = self.get_trigger_status().await?;
        if status == TriggerStatus::Missing {
            return Err(TriggerError::TriggerMissing {
                trigger: target.trigger_name.clone(),
            });
        }

        let columns = self.discover_columns(&target.table).await?;
        if columns.is_empty() {
            return Err(TriggerError::TableNotFound {
                table: target.table.clone(),
            });
        }

        let expected = self.expected_body(&columns);
        let actual = self.get_trigger_body().await?.unwrap_or_default();
        if normalize_body(&expected) != normalize_body(&actual) {
            tracing::warn!(trigger = %target.trigger_name, "trigger body drift detected");
            return Err(TriggerError::TriggerBodyMismatch {
                trigger: target.trigger_name.clone(),
                expected,
                actual,
            });
        }

        let archive_columns = self.discover_columns(&target.archive_table).await?;
        if archive_columns.is_empty() {
            return Err(TriggerError::ArchiveMissing {
                archive: target.archive_table.clone(),
            });
        }
        let missing = archive::missing_archive_columns(&columns, &archive_columns);
        if !missing.is_empty() {
            return Err(TriggerError::ArchiveSchemaDrift {
                archive: target.archive_table.clone(),
                missing,
            });
        }

        Ok(SyncReport {
            status,
            column_count: columns.len(),
            body_fingerprint: body_fingerprint(&expected),
        })
    }

    /// Drop (when present), widen the archive with any missing columns, then
    /// create again. Meant to be called by an operator after a drift report.
    async fn recreate_trigger(&self, notifier: &dyn CheckNotifier) -> TriggerResult<()> {
        let target = self.target();

        if self.get_trigger_status().await? != TriggerStatus::Missing {
            self.drop_trigger().await?;
            notifier.on_check(CheckEvent::success(format!(
                "Dropped trigger {}",
                target.trigger_name
            )));
        }

        let columns = self.discover_columns(&target.table).await?;
        let archive_columns = self.discover_columns(&target.archive_table).await?;
        if !columns.is_empty() && !archive_columns.is_empty() {
            let additions: Vec<String> =
                archive::missing_archive_column_defs(&columns, &archive_columns, &self.audit_column_types())
                    .iter()
                    .map(|c| self.add_archive_column_sql(c))
                    .collect();
            if !additions.is_empty() {
                self.backend().execute_in_transaction(&additions).await?;
                notifier.on_check(CheckEvent::success(format!(
                    "Added {} column(s) to {}",
                    additions.len(),
                    target.archive_table
                )));
            }
        }

        self.create_trigger(notifier).await
    }
}
