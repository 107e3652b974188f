//! MySQL / MariaDB audit triggers
//!
//! MySQL triggers fire on one event only, so a table gets two:
//! `<table>_OnUpdate` and `<table>_OnDelete`. The pair is Enabled only when
//! both exist. MySQL cannot disable a trigger in place and its DDL commits
//! implicitly, so a failed create is compensated rather than rolled back.

use async_trait::async_trait;

use super::archive::{self, ArchiveColumn, AuditColumnTypes};
use super::{
    DiscoveredColumn, SharedBackend, TriggerError, TriggerImplementer, TriggerResult, TriggerSql,
    TriggerStatus, TriggerTarget,
};
use crate::database::{
    CatalogQuery, DatabaseBackend, DatabaseDialect, QueryResult, labelled, row_str,
};

const SCHEMA_FILTER: &str = "COALESCE(?, DATABASE())";

pub struct MySqlTriggerImplementer {
    backend: SharedBackend,
    target: TriggerTarget,
}

impl MySqlTriggerImplementer {
    pub fn new(backend: SharedBackend, target: TriggerTarget) -> Self {
        Self { backend, target }
    }

    /// The AFTER DELETE companion of the `_OnUpdate` trigger
    pub fn delete_trigger_name(&self) -> String {
        format!("{}_OnDelete", self.target.table)
    }

    /// Both trigger names, in the order the catalog sorts them
    fn trigger_names(&self) -> [String; 2] {
        let mut names = [self.delete_trigger_name(), self.target.trigger_name.clone()];
        names.sort();
        names
    }

    fn action_statement(&self, columns: &[DiscoveredColumn], status: &str) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({}, NOW(6), CURRENT_USER(), '{}')",
            self.qualified(&self.target.archive_table),
            archive::insert_column_list(columns, |c| self.quote_ident(c)),
            archive::insert_values(columns, |c| format!("OLD.{}", self.quote_ident(c))),
            status
        )
    }

    fn create_statement(&self, trigger: &str, event: &str, action: String) -> String {
        labelled(
            "create_trigger",
            &format!(
                "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW {}",
                self.qualified(trigger),
                event,
                self.qualified(&self.target.table),
                action
            ),
        )
    }

    fn catalog_trigger_names(&self, result: &QueryResult) -> Vec<String> {
        let wanted = self.trigger_names();
        result
            .rows
            .iter()
            .filter_map(|row| row_str(row, "trigger_name"))
            .filter(|name| wanted.contains(name))
            .collect()
    }
}

impl TriggerSql for MySqlTriggerImplementer {
    fn dialect(&self) -> DatabaseDialect {
        DatabaseDialect::MySql
    }

    fn target(&self) -> &TriggerTarget {
        &self.target
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn audit_column_types(&self) -> AuditColumnTypes {
        AuditColumnTypes {
            timestamp: "DATETIME(6)",
            user: "VARCHAR(128)",
            status: "CHAR(1)",
        }
    }

    fn columns_query(&self, table: &str) -> CatalogQuery {
        CatalogQuery::new(
            "table_columns",
            format!(
                "SELECT COLUMN_NAME AS column_name, COLUMN_TYPE AS data_type, \
                 CASE WHEN COLUMN_KEY = 'PRI' THEN 1 ELSE 0 END AS is_primary_key \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = {SCHEMA_FILTER} AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION"
            ),
            vec![self.schema_param(), table.into()],
        )
    }

    fn status_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_status",
            format!(
                "SELECT TRIGGER_NAME AS trigger_name \
                 FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = {SCHEMA_FILTER} AND EVENT_OBJECT_TABLE = ?"
            ),
            vec![self.schema_param(), self.target.table.clone().into()],
        )
    }

    fn parse_status(&self, result: &QueryResult) -> TriggerStatus {
        match self.catalog_trigger_names(result).len() {
            0 => TriggerStatus::Missing,
            2 => TriggerStatus::Enabled,
            _ => {
                // Half a pair: not usable, but must be dropped before re-creating
                tracing::warn!(
                    table = %self.target.table,
                    "only one of the two audit triggers exists"
                );
                TriggerStatus::Disabled
            }
        }
    }

    fn body_query(&self) -> CatalogQuery {
        CatalogQuery::new(
            "trigger_body",
            format!(
                "SELECT TRIGGER_NAME AS trigger_name, ACTION_STATEMENT AS body \
                 FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = {SCHEMA_FILTER} AND EVENT_OBJECT_TABLE = ? \
                 ORDER BY TRIGGER_NAME"
            ),
            vec![self.schema_param(), self.target.table.clone().into()],
        )
    }

    fn parse_body(&self, result: &QueryResult) -> Option<String> {
        let wanted = self.trigger_names();
        let mut bodies: Vec<(String, String)> = result
            .rows
            .iter()
            .filter_map(|row| Some((row_str(row, "trigger_name")?, row_str(row, "body")?)))
            .filter(|(name, _)| wanted.contains(name))
            .collect();
        if bodies.is_empty() {
            return None;
        }
        bodies.sort();
        Some(
            bodies
                .into_iter()
                .map(|(_, body)| body)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn expected_body(&self, columns: &[DiscoveredColumn]) -> String {
        // `_OnDelete` sorts before `_OnUpdate`
        format!(
            "{}\n{}",
            self.action_statement(columns, archive::STATUS_DELETED),
            self.action_statement(columns, archive::STATUS_UPDATED)
        )
    }

    fn create_trigger_sql(&self, columns: &[DiscoveredColumn]) -> Vec<String> {
        vec![
            self.create_statement(
                &self.target.trigger_name,
                "UPDATE",
                self.action_statement(columns, archive::STATUS_UPDATED),
            ),
            self.create_statement(
                &self.delete_trigger_name(),
                "DELETE",
                self.action_statement(columns, archive::STATUS_DELETED),
            ),
        ]
    }

    fn drop_trigger_sql(&self) -> Vec<String> {
        [self.target.trigger_name.clone(), self.delete_trigger_name()]
            .iter()
            .map(|name| {
                labelled(
                    "drop_trigger",
                    &format!("DROP TRIGGER IF EXISTS {}", self.qualified(name)),
                )
            })
            .collect()
    }

    fn enable_trigger_sql(&self) -> Option<String> {
        None
    }

    fn disable_trigger_sql(&self) -> Option<String> {
        None
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
impl TriggerImplementer for MySqlTriggerImplementer {
    fn backend(&self) -> &dyn DatabaseBackend {
        self.backend.as_ref()
    }

    async fn enable_trigger(&self) -> TriggerResult<()> {
        Err(TriggerError::UnsupportedOperation {
            dialect: DatabaseDialect::MySql,
            operation: "enable trigger",
        })
    }

    async fn disable_trigger(&self) -> TriggerResult<()> {
        Err(TriggerError::UnsupportedOperation {
            dialect: DatabaseDialect::MySql,
            operation: "disable trigger",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::ConventionNamer;
    use crate::triggers::test_support::NoBackend;
    use serde_json::json;
    use sqlparser::dialect::MySqlDialect;
    use sqlparser::parser::Parser;
    use std::sync::Arc;

    fn implementer() -> MySqlTriggerImplementer {
        let target =
            TriggerTarget::new(Some("live".into()), "Patients", &ConventionNamer::default()).unwrap();
        MySqlTriggerImplementer::new(Arc::new(NoBackend), target)
    }

    fn columns() -> Vec<DiscoveredColumn> {
        vec![
            DiscoveredColumn::new("id", "int(11)", true),
            DiscoveredColumn::new("name", "varchar(50)", false),
        ]
    }

    #[test]
    fn test_archive_ddl_parses() {
        let sql = implementer().create_archive_sql(&columns());
        assert!(sql.contains("CREATE TABLE `live`.`Patients_Archive`"));
        assert!(sql.contains("`validTo` DATETIME(6)"));
        Parser::parse_sql(&MySqlDialect {}, &sql).unwrap();
    }

    #[test]
    fn test_two_triggers_created() {
        let statements = implementer().create_trigger_sql(&columns());
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("`Patients_OnUpdate` AFTER UPDATE"));
        assert!(statements[0].ends_with("'U')"));
        assert!(statements[1].contains("`Patients_OnDelete` AFTER DELETE"));
        assert!(statements[1].ends_with("'D')"));
    }

    #[test]
    fn test_status_requires_both_triggers() {
        let imp = implementer();
        let both = QueryResult::new(
            vec![],
            vec![
                json!({"trigger_name": "Patients_OnUpdate"}),
                json!({"trigger_name": "Patients_OnDelete"}),
                json!({"trigger_name": "Patients_Other"}),
            ],
        );
        assert_eq!(imp.parse_status(&both), TriggerStatus::Enabled);

        let half = QueryResult::new(vec![], vec![json!({"trigger_name": "Patients_OnUpdate"})]);
        assert_eq!(imp.parse_status(&half), TriggerStatus::Disabled);
        assert_eq!(imp.parse_status(&QueryResult::empty()), TriggerStatus::Missing);
    }

    #[test]
    fn test_body_joins_action_statements_in_name_order() {
        let imp = implementer();
        let result = QueryResult::new(
            vec![],
            vec![
                json!({"trigger_name": "Patients_OnUpdate", "body": "update-body"}),
                json!({"trigger_name": "Patients_OnDelete", "body": "delete-body"}),
            ],
        );
        assert_eq!(imp.parse_body(&result).unwrap(), "delete-body\nupdate-body");
    }

    #[tokio::test]
    async fn test_disable_is_unsupported() {
        let err = implementer().disable_trigger().await.unwrap_err();
        assert!(matches!(err, TriggerError::UnsupportedOperation { .. }));
    }
}
