//! Oracle audit trigger
//!
//! One row trigger branches on `UPDATING` to write 'U' or 'D'. The deployed
//! body is read back from `ALL_SOURCE` line by line instead of
//! `ALL_TRIGGERS.TRIGGER_BODY`: the latter is a LONG column that drivers
//! truncate at their default fetch size. Oracle DDL commits implicitly.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::archive::{self, ArchiveColumn, AuditColumnTypes};
use super::{
    DiscoveredColumn, SharedBackend, TriggerImplementer, TriggerSql, TriggerStatus, TriggerTarget,
};
use crate::database::{CatalogQuery, DatabaseBackend, DatabaseDialect, QueryResult, labelled, row_str};

const SCHEMA_FILTER: &str = "COALESCE(:1, SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA'))";

static RE_BODY_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBEGIN\b").expect("valid body start regex"));

pub struct OracleTriggerImplementer {
    backend: SharedBackend,
    target: TriggerTarget,
}

impl OracleTriggerImplementer {
    pub fn new(backend: SharedBackend, target: TriggerTarget) -> Self {
        Self { backend, target }
    }

    fn insert_statement(&self, columns: &[DiscoveredColumn], status: &str) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({}, SYSTIMESTAMP, USER, '{}');",
            self.qualified(&self.target.archive_table),
            archive::insert_column_list(columns, |c| self.quote_ident(c)),
            archive::insert_values(columns, |c| format!(":OLD.{}", self.quote_ident(c))),
            status
        )
    }
}

/// The PL/SQL block of a trigger's source: everything from the first BEGIN
pub fn trigger_block(source: &str) -> Option<&str> {
    RE_BODY_START.find(source).map(|m| &source[m.start()..])
}

impl TriggerSql for OracleTriggerImplementer {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::Oracle
    }

    fn target(&self) -> &TriggerTarget {
        &self.target
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn audit_column_types(&self) -> AuditColumnTypes {
        AuditColumnTypes {
            timestamp: "TIMESTAMP",
            user: "VARCHAR2(128)",
            status: "CHAR(1)",
        }
    }

    fn columns_query(&self, table: &str) -> CatalogQuery {
        CatalogQuery::new(
            "table_columns",
            format!(
                "SELECT c.COLUMN_NAME AS column_name, \
                 CASE \
                   WHEN c.DATA_TYPE IN ('VARCHAR2', 'NVARCHAR2', 'CHAR', 'NCHAR') \
                     THEN c.DATA_TYPE || '(' || c.CHAR_LENGTH || ')' \
                   WHEN c.DATA_TYPE = 'RAW' THEN 'RAW(' || c.DATA_LENGTH || ')' \
                   WHEN c.DATA_TYPE = 'NUMBER' AND c.DATA_PRECISION IS NOT NULL \
                     THEN 'NUMBER(' || c.DATA_PRECISION || ',' || NVL(c.DATA_SCALE, 0) || ')' \
                   ELSE c.DATA_TYPE \
                 END AS data_type, \
                 CASE WHEN EXISTS ( \
                   SELECT 1 FROM ALL_CONSTRAINTS k \
                   JOIN ALL_CONS_COLUMNS kc ON kc.OWNER = k.OWNER AND kc.CONSTRAINT_NAME = k.CONSTRAINT_NAME \
                   WHERE k.CONSTRAINT_TYPE = 'P' AND k.OWNER = c.OWNER \
                   AND k.TABLE_NAME = c.TABLE_NAME AND kc.COLUMN_NAME = c.COLUMN_NAME \
                 ) THEN 1 ELSE 0 END AS is_primary_key \
                 FROM ALL_TAB_COLUMNS c \
                 WHERE c.OWNER = {SCHEMA_FILTER} AND c.TABLE_NAME = :2 \
                 ORDER BY c.COLUMN_ID"
            ),
            vec![self.schema_param(), table.into()],
        )
    }

    fn status_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_status",
            format!(
                "SELECT STATUS AS status FROM ALL_TRIGGERS \
                 WHERE OWNER = {SCHEMA_FILTER} AND TRIGGER_NAME = :2"
            ),
            vec![self.schema_param(), self.target.trigger_name.clone().into()],
        )
    }

    fn parse_status(&self, result: &QueryResult) -> TriggerStatus {
        match result.first().and_then(|row| row_str(row, "status")) {
            None => TriggerStatus::Missing,
            Some(status) if status.eq_ignore_ascii_case("ENABLED") => TriggerStatus::Enabled,
            Some(_) => TriggerStatus::Disabled,
        }
    }

    fn body_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_source_lines",
            format!(
                "SELECT TEXT AS text FROM ALL_SOURCE \
                 WHERE OWNER = {SCHEMA_FILTER} AND TYPE = 'TRIGGER' AND NAME = :2 \
                 ORDER BY LINE"
            ),
            vec![self.schema_param(), self.target.trigger_name.clone().into()],
        )
    }

    fn parse_body(&self, result: &QueryResult) -> Option<String> {
        if result.is_empty() {
            return None;
        }
        // ALL_SOURCE lines keep their own line terminators
        let source: String = result
            .rows
            .iter()
            .filter_map(|row| row_str(row, "text"))
            .collect();
        Some(trigger_block(&source).unwrap_or(&source).to_string())
    }

    fn expected_body(&self, columns: &[DiscoveredColumn]) -> String {
        format!(
            "BEGIN\n  IF UPDATING THEN\n    {}\n  ELSE\n    {}\n  END IF;\nEND;",
            self.insert_statement(columns, archive::STATUS_UPDATED),
            self.insert_statement(columns, archive::STATUS_DELETED)
        )
    }

    fn create_trigger_sql(&self, columns: &[DiscoveredColumn]) -> Vec<String> {
        vec![labelled(
            "create_trigger",
            &format!(
                "CREATE TRIGGER {}\nAFTER UPDATE OR DELETE ON {}\nFOR EACH ROW\n{}",
                self.qualified(&self.target.trigger_name),
                self.qualified(&self.target.table),
                self.expected_body(columns)
            ),
        )]
    }

    fn drop_trigger_sql(&self) -> Vec<String> {
        vec![labelled(
            "drop_trigger",
            &format!("DROP TRIGGER {}", self.qualified(&self.target.trigger_name)),
        )]
    }

    fn enable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "enable_trigger",
            &format!(
                "ALTER TRIGGER {} ENABLE",
                self.qualified(&self.target.trigger_name)
            ),
        ))
    }

    fn disable_trigger_sql(&self) -> Option<String> {
        Some(labelled(
            "disable_trigger",
            &format!(
                "ALTER TRIGGER {} DISABLE",
                self.qualified(&self.target.trigger_name)
            ),
        ))
    }

    fn add_archive_column_sql(&self, column: &ArchiveColumn) -> String {
        labelled(
            "alter_archive_table",
            &format!(
                "ALTER TABLE {} ADD ({} {})",
                self.qualified(&self.target.archive_table),
                self.quote_ident(&column.name),
                column.data_type
            ),
        )
    }
}

#[async_trait(?Send)]
impl TriggerImplementer for OracleTriggerImplementer {
    fn backend(&self) -> &dyn DatabaseBackend {
        self.backend.as_ref()
    }
}
