//! PostgreSQL audit trigger (the generic SQL dialect)
//!
//! The archiving logic lives in a plpgsql function `<table>_OnUpdate_fn`; the
//! row trigger only calls it. The deployed body read back for comparison is
//! the function's `prosrc`.

use async_trait::async_trait;

use super::archive::{self, ArchiveColumn, AuditColumnTypes};
use super::{
    DiscoveredColumn, SharedBackend, TriggerImplementer, TriggerSql, TriggerStatus, TriggerTarget,
};
use crate::database::{CatalogQuery, DatabaseBackend, DatabaseDialect, QueryResult, labelled, row_str};

const BODY_DELIMITER: &str = "$body$";

pub struct PostgresTriggerImplementer {
    backend: SharedBackend,
    target: TriggerTarget,
}

impl PostgresTriggerImplementer {
    pub fn new(backend: SharedBackend, target: TriggerTarget) -> Self {
        Self { backend, target }
    }

    fn function_name(&self) -> String {
        format!("{}_fn", self.target.trigger_name)
    }

    fn schema_filter(&self) -> &'static str {
        "COALESCE($1, current_schema()::text)"
    }

    fn insert_statement(&self, columns: &[DiscoveredColumn], status: &str) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({}, now(), session_user, '{}');",
            self.qualified(&self.target.archive_table),
            archive::insert_column_list(columns, |c| self.quote_ident(c)),
            archive::insert_values(columns, |c| format!("OLD.{}", self.quote_ident(c))),
            status
        )
    }
}

impl TriggerSql for PostgresTriggerImplementer {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Postgres
    }

    fn target(&self) -> &TriggerTarget {
        &self.target
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn audit_column_types(&self) -> AuditColumnTypes {
        AuditColumnTypes {
            timestamp: "timestamp",
            user: "varchar(128)",
            status: "char(1)",
        }
    }

    fn columns_query(&self, table: &str) -> CatalogQuery {
        CatalogQuery::new(
            "table_columns",
            format!(
                "SELECT a.attname::text AS column_name, \
                 format_type(a.atttypid, a.atttypmod) AS data_type, \
                 EXISTS (SELECT 1 FROM pg_index i WHERE i.indrelid = c.oid AND i.indisprimary \
                 AND a.attnum = ANY(i.indkey)) AS is_primary_key \
                 FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE a.attnum > 0 AND NOT a.attisdropped \
                 AND n.nspname::text = {} AND c.relname::text = $2 \
                 ORDER BY a.attnum",
                self.schema_filter()
            ),
            vec![self.schema_param(), table.into()],
        )
    }

    fn status_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_status",
            format!(
                "SELECT t.tgenabled::text AS enabled \
                 FROM pg_trigger t \
                 JOIN pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE NOT t.tgisinternal AND n.nspname::text = {} AND t.tgname::text = $2",
                self.schema_filter()
            ),
            vec![self.schema_param(), self.target.trigger_name.clone().into()],
        )
    }

    fn parse_status(&self, result: &QueryResult) -> TriggerStatus {
        match result.first().and_then(|row| row_str(row, "enabled")) {
            None => TriggerStatus::Missing,
            Some(flag) if flag == "D" => TriggerStatus::Disabled,
            Some(_) => TriggerStatus::Enabled,
        }
    }

    fn body_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_body",
            format!(
                "SELECT p.prosrc AS body \
                 FROM pg_proc p \
                 JOIN pg_namespace n ON n.oid = p.pronamespace \
                 WHERE n.nspname::text = {} AND p.proname::text = $2",
                self.schema_filter()
            ),
            vec![self.schema_param(), self.function_name().into()],
        )
    }

    fn parse_body(&self, result: &QueryResult) -> Option<String> {
        result.first().and_then(|row| row_str(row, "body"))
    }

    fn expected_body(&self, columns: &[DiscoveredColumn]) -> String {
        format!(
            "\nBEGIN\n  IF TG_OP = 'UPDATE' THEN\n    {}\n  ELSE\n    {}\n  END IF;\n  RETURN NULL;\nEND;\n",
            self.insert_statement(columns, archive::STATUS_UPDATED),
            self.insert_statement(columns, archive::STATUS_DELETED)
        )
    }

    fn create_trigger_sql(&self, columns: &[DiscoveredColumn]) -> Vec<String> {
        let function = self.qualified(&self.function_name());
        vec![
            labelled(
                "create_trigger_function",
                &format!(
                    "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS {BODY_DELIMITER}{}{BODY_DELIMITER} LANGUAGE plpgsql",
                    self.expected_body(columns)
                ),
            ),
            labelled(
                "create_trigger",
                &format!(
                    "CREATE TRIGGER {} AFTER UPDATE OR DELETE ON {} FOR EACH ROW EXECUTE FUNCTION {function}()",
                    self.quote_ident(&self.target.trigger_name),
                    self.qualified(&self.target.table)
                ),
            ),
        ]
    }

    fn drop_trigger_sql(&self) -> Vec<String> {
        vec![
            labelled(
                "drop_trigger",
                &format!(
                    "DROP TRIGGER IF EXISTS {} ON {}",
                    self.quote_ident(&self.target.trigger_name),
                    self.qualified(&self.target.table)
                ),
            ),
            labelled(
                "drop_trigger_function",
                &format!(
                    "DROP FUNCTION IF EXISTS {}()",
                    self.qualified(&self.function_name())
                ),
            ),
        ]
    }

    fn enable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "enable_trigger",
            &format!(
                "ALTER TABLE {} ENABLE TRIGGER {}",
                self.qualified(&self.target.table),
                self.quote_ident(&self.target.trigger_name)
            ),
        ))
    }

    fn disable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "disable_trigger",
            &format!(
                "ALTER TABLE {} DISABLE TRIGGER {}",
                self.qualified(&self.target.table),
                self.quote_ident(&self.target.trigger_name)
            ),
        ))
    }

    fn add_archive_column_sql(&self, column: &ArchiveColumn) -> String {
        labelled(
            "alter_archive_table",
            &format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                self.qualified(&self.target.archive_table),
                self.quote_ident(&column.name),
                column.data_type
            ),
        )
    }
}

#[async_trait(?Send)]
impl TriggerImplementer for PostgresTriggerImplementer {
    fn backend(&self) -> &dyn DatabaseBackend {
        self.backend.as_ref()
    }
}
