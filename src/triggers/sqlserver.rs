//! SQL Server audit trigger
//!
//! A single statement-level AFTER UPDATE, DELETE trigger copies the `deleted`
//! pseudo-table into the archive. `sys.sql_modules.definition` returns the
//! whole CREATE statement, so the expected body is the full statement.

use async_trait::async_trait;

use super::archive::{self, ArchiveColumn, AuditColumnTypes};
use super::{
    DiscoveredColumn, SharedBackend, TriggerImplementer, TriggerSql, TriggerStatus, TriggerTarget,
};
use crate::database::{
    CatalogQuery, DatabaseBackend, DatabaseDialect, QueryResult, labelled, row_bool, row_str,
};

const SCHEMA_FILTER: &str = "COALESCE(@P1, SCHEMA_NAME())";

pub struct SqlServerTriggerImplementer {
    backend: SharedBackend,
    target: TriggerTarget,
}

impl SqlServerTriggerImplementer {
    pub fn new(backend: SharedBackend, target: TriggerTarget) -> Self {
        Self { backend, target }
    }
}

impl TriggerSql for SqlServerTriggerImplementer {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::SqlServer
    }

    fn target(&self) -> &TriggerTarget {
        &self.target
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn audit_column_types(&self) -> AuditColumnTypes {
        AuditColumnTypes {
            timestamp: "DATETIME2",
            user: "NVARCHAR(128)",
            status: "CHAR(1)",
        }
    }

    fn columns_query(&self, table: &str) -> CatalogQuery {
        CatalogQuery::new(
            "table_columns",
            format!(
                "SELECT c.name AS column_name, \
                 CASE \
                   WHEN ty.name IN ('varchar', 'char', 'varbinary', 'binary') \
                     THEN ty.name + '(' + CASE WHEN c.max_length = -1 THEN 'max' ELSE CAST(c.max_length AS VARCHAR(10)) END + ')' \
                   WHEN ty.name IN ('nvarchar', 'nchar') \
                     THEN ty.name + '(' + CASE WHEN c.max_length = -1 THEN 'max' ELSE CAST(c.max_length / 2 AS VARCHAR(10)) END + ')' \
                   WHEN ty.name IN ('decimal', 'numeric') \
                     THEN ty.name + '(' + CAST(c.precision AS VARCHAR(10)) + ',' + CAST(c.scale AS VARCHAR(10)) + ')' \
                   ELSE ty.name \
                 END AS data_type, \
                 CAST(CASE WHEN EXISTS ( \
                   SELECT 1 FROM sys.index_columns ic \
                   JOIN sys.indexes i ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
                   WHERE i.is_primary_key = 1 AND ic.object_id = c.object_id AND ic.column_id = c.column_id \
                 ) THEN 1 ELSE 0 END AS INT) AS is_primary_key \
                 FROM sys.columns c \
                 JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                 JOIN sys.tables t ON t.object_id = c.object_id \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id \
                 WHERE s.name = {SCHEMA_FILTER} AND t.name = @P2 \
                 ORDER BY c.column_id"
            ),
            vec![self.schema_param(), table.into()],
        )
    }

    fn status_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_status",
            format!(
                "SELECT CAST(tr.is_disabled AS INT) AS is_disabled \
                 FROM sys.triggers tr \
                 JOIN sys.tables t ON t.object_id = tr.parent_id \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id \
                 WHERE s.name = {SCHEMA_FILTER} AND tr.name = @P2"
            ),
            vec![self.schema_param(), self.target.trigger_name.clone().into()],
        )
    }

    fn parse_status(&self, result: &QueryResult) -> TriggerStatus {
        match result.first() {
            None => TriggerStatus::Missing,
            Some(row) if row_bool(row, "is_disabled") => TriggerStatus::Disabled,
            Some(_) => TriggerStatus::Enabled,
        }
    }

    fn body_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_body",
            format!(
                "SELECT m.definition AS body \
                 FROM sys.sql_modules m \
                 JOIN sys.triggers tr ON tr.object_id = m.object_id \
                 JOIN sys.tables t ON t.object_id = tr.parent_id \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id \
                 WHERE s.name = {SCHEMA_FILTER} AND tr.name = @P2"
            ),
            vec![self.schema_param(), self.target.trigger_name.clone().into()],
        )
    }

    fn parse_body(&self, result: &QueryResult) -> Option<String> {
        result.first().and_then(|row| row_str(row, "body"))
    }

    fn expected_body(&self, columns: &[DiscoveredColumn]) -> String {
        let pre_image = archive::insert_values(columns, |c| format!("d.{}", self.quote_ident(c)));
        labelled(
            "create_trigger",
            &format!(
                "CREATE TRIGGER {trigger} ON {table}\n\
                 AFTER UPDATE, DELETE\n\
                 AS\n\
                 BEGIN\n\
                 \x20 SET NOCOUNT ON;\n\
                 \x20 DECLARE @status CHAR(1) = CASE WHEN EXISTS (SELECT 1 FROM inserted) THEN '{updated}' ELSE '{deleted}' END;\n\
                 \x20 INSERT INTO {archive} ({columns})\n\
                 \x20 SELECT {pre_image}, SYSDATETIME(), SUSER_SNAME(), @status FROM deleted d;\n\
                 END",
                trigger = self.qualified(&self.target.trigger_name),
                table = self.qualified(&self.target.table),
                archive = self.qualified(&self.target.archive_table),
                columns = archive::insert_column_list(columns, |c| self.quote_ident(c)),
                updated = archive::STATUS_UPDATED,
                deleted = archive::STATUS_DELETED,
            ),
        )
    }

    fn create_trigger_sql(&self, columns: &[DiscoveredColumn]) -> Vec<String> {
        vec![self.expected_body(columns)]
    }

    fn drop_trigger_sql(&self) -> Vec<String> {
        vec![labelled(
            "drop_trigger",
            &format!(
                "DROP TRIGGER IF EXISTS {}",
                self.qualified(&self.target.trigger_name)
            ),
        )]
    }

    fn enable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "enable_trigger",
            &format!(
                "ENABLE TRIGGER {} ON {}",
                self.qualified(&self.target.trigger_name),
                self.qualified(&self.target.table)
            ),
        ))
    }

    fn disable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "disable_trigger",
            &format!(
                "DISABLE TRIGGER {} ON {}",
                self.qualified(&self.target.trigger_name),
                self.qualified(&self.target.table)
            ),
        ))
    }

    fn add_archive_column_sql(&self, column: &ArchiveColumn) -> String {
        labelled(
            "alter_archive_table",
            &format!(
                "ALTER TABLE {} ADD {} {}",
                self.qualified(&self.target.archive_table),
                self.quote_ident(&column.name),
                column.data_type
            ),
        )
    }
}

#[async_trait(?Send)]
impl TriggerImplementer for SqlServerTriggerImplementer {
    fn backend(&self) -> &dyn DatabaseBackend {
        self.backend.as_ref()
    }
}
