//! Generated archive DDL parses in the dialect it targets

mod common;

use common::FakeCatalog;
use data_load_engine::triggers::TriggerSql;
use data_load_engine::{
    ConventionNamer, DatabaseBackend, DatabaseDialect, DiscoveredColumn, TriggerImplementer,
    TriggerTarget, create_trigger_implementer,
};
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::sync::Arc;

fn implementer(dialect: DatabaseDialect, schema: Option<&str>) -> Box<dyn TriggerImplementer> {
    let backend: Arc<dyn DatabaseBackend> = Arc::new(FakeCatalog::new(dialect));
    let target =
        TriggerTarget::new(schema.map(str::to_string), "Visits", &ConventionNamer::default())
            .unwrap();
    create_trigger_implementer(dialect, backend, target).unwrap()
}

/// Parse a single CREATE TABLE and return its name and column names
fn parse_create(parser_dialect: &dyn Dialect, sql: &str) -> (String, Vec<String>) {
    let statements = Parser::parse_sql(parser_dialect, sql).unwrap();
    assert_eq!(statements.len(), 1, "{sql}");
    match &statements[0] {
        Statement::CreateTable(create) => (
            create.name.to_string(),
            create.columns.iter().map(|c| c.name.value.clone()).collect(),
        ),
        other => panic!("expected CREATE TABLE, got {other}"),
    }
}

#[test]
fn test_postgres_archive_ddl() {
    let columns = vec![
        DiscoveredColumn::new("id", "integer", true),
        DiscoveredColumn::new("seen_at", "timestamp without time zone", false),
    ];
    let sql = implementer(DatabaseDialect::Postgres, Some("clinic")).create_archive_sql(&columns);
    let (name, parsed) = parse_create(&PostgreSqlDialect {}, &sql);
    assert_eq!(name, "\"clinic\".\"Visits_Archive\"");
    assert_eq!(
        parsed,
        ["id", "seen_at", "validFrom", "validTo", "updatedByUser", "status"]
    );
}

#[test]
fn test_sqlserver_archive_ddl() {
    let columns = vec![
        DiscoveredColumn::new("VisitId", "int", true),
        DiscoveredColumn::new("Notes", "nvarchar(400)", false),
        DiscoveredColumn::new("validFrom", "datetime2", false),
    ];
    let sql = implementer(DatabaseDialect::SqlServer, Some("dbo")).create_archive_sql(&columns);
    let (name, parsed) = parse_create(&MsSqlDialect {}, &sql);
    assert_eq!(name, "[dbo].[Visits_Archive]");
    // The live validFrom is kept in place, not repeated
    assert_eq!(
        parsed,
        ["VisitId", "Notes", "validFrom", "validTo", "updatedByUser", "status"]
    );
}

#[test]
fn test_mysql_archive_ddl() {
    let columns = vec![
        DiscoveredColumn::new("id", "int(11)", true),
        DiscoveredColumn::new("ward", "varchar(20)", false),
    ];
    let sql = implementer(DatabaseDialect::MySql, None).create_archive_sql(&columns);
    let (name, parsed) = parse_create(&MySqlDialect {}, &sql);
    assert_eq!(name, "`Visits_Archive`");
    assert_eq!(parsed.len(), 6);
    assert_eq!(parsed.last().map(String::as_str), Some("status"));
}

#[test]
fn test_drop_archive_ddl_parses() {
    for (dialect, parser) in [
        (DatabaseDialect::Postgres, &PostgreSqlDialect {} as &dyn Dialect),
        (DatabaseDialect::SqlServer, &MsSqlDialect {}),
        (DatabaseDialect::MySql, &MySqlDialect {}),
    ] {
        let sql = implementer(dialect, None).drop_archive_sql();
        let statements = Parser::parse_sql(parser, &sql).unwrap();
        assert!(matches!(statements[0], Statement::Drop { .. }), "{sql}");
    }
}
