//! Shared fixtures for integration tests
//!
//! `FakeCatalog` is a [`DatabaseBackend`] that keeps tables, triggers and
//! plpgsql functions in memory. It interprets the labelled statements the
//! trigger implementers emit and answers their catalog queries with rows
//! shaped the way each dialect's catalog returns them.

#![allow(dead_code)]

use async_trait::async_trait;
use data_load_engine::database::{DatabaseResult, statement_label};
use data_load_engine::{DatabaseBackend, DatabaseDialect, DatabaseError, QueryResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;

static RE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?:(?:"[^"]*"|\[[^\]]*\]|`[^`]*`)\.)?(?:"([^"]*)"|\[([^\]]*)\]|`([^`]*)`)"#,
    )
    .unwrap()
});

#[derive(Debug, Clone)]
pub struct FakeColumn {
    pub name: String,
    pub data_type: String,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone)]
struct FakeTrigger {
    table: String,
    /// The CREATE statement as executed
    source: String,
    enabled: bool,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    tables: BTreeMap<String, Vec<FakeColumn>>,
    triggers: BTreeMap<String, FakeTrigger>,
    functions: BTreeMap<String, String>,
    archived_rows: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct State {
    catalog: Catalog,
    executed: Vec<String>,
    /// Label to fail and how many more matching statements pass first
    fail_on: Option<(String, usize)>,
}

pub struct FakeCatalog {
    dialect: DatabaseDialect,
    state: Mutex<State>,
}

fn strip_label(sql: &str) -> &str {
    let trimmed = sql.trim_start();
    match trimmed.strip_prefix("/*").and_then(|rest| rest.split_once("*/")) {
        Some((_, rest)) => rest.trim_start(),
        None => trimmed,
    }
}

/// Unquoted last part of the (possibly schema-qualified) name starting `s`
fn leading_name(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    let caps = RE_NAME.captures(s)?;
    let name = (1..=3).find_map(|i| caps.get(i))?.as_str().to_string();
    Some((name, &s[caps.get(0)?.end()..]))
}

fn name_after<'a>(sql: &'a str, keyword: &str) -> Option<(String, &'a str)> {
    let at = sql.find(keyword)?;
    leading_name(&sql[at + keyword.len()..])
}

fn split_top_level(defs: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in defs.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&defs[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&defs[start..]);
    parts
}

fn column_def(def: &str) -> Option<FakeColumn> {
    let (name, rest) = leading_name(def)?;
    Some(FakeColumn {
        name,
        data_type: rest.trim().to_string(),
        is_primary_key: false,
    })
}

fn failed(message: String) -> DatabaseError {
    DatabaseError::QueryFailed(message)
}

fn quoted_forms(name: &str) -> [String; 3] {
    [
        format!("\"{name}\""),
        format!("[{name}]"),
        format!("`{name}`"),
    ]
}

impl FakeCatalog {
    pub fn new(dialect: DatabaseDialect) -> Self {
        Self {
            dialect,
            state: Mutex::new(State::default()),
        }
    }

    pub fn dialect(&self) -> DatabaseDialect {
        self.dialect
    }

    fn transactional(&self) -> bool {
        matches!(
            self.dialect,
            DatabaseDialect::Postgres | DatabaseDialect::SqlServer
        )
    }

    pub fn create_table(&self, name: &str, columns: &[(&str, &str, bool)]) {
        let columns = columns
            .iter()
            .map(|(name, data_type, pk)| FakeColumn {
                name: name.to_string(),
                data_type: data_type.to_string(),
                is_primary_key: *pk,
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .catalog
            .tables
            .insert(name.to_string(), columns);
    }

    /// ALTER TABLE behind the engine's back
    pub fn add_column(&self, table: &str, name: &str, data_type: &str) {
        let mut state = self.state.lock().unwrap();
        let columns = state.catalog.tables.get_mut(table).unwrap();
        columns.push(FakeColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_primary_key: false,
        });
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().unwrap().catalog.tables.contains_key(name)
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .tables
            .get(table)
            .map(|cols| cols.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn trigger_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .triggers
            .keys()
            .cloned()
            .collect()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .functions
            .keys()
            .cloned()
            .collect()
    }

    /// An UPDATE on `table`; enabled triggers copy one pre-image into `archive`
    pub fn update_row(&self, table: &str, archive: &str) {
        let mut state = self.state.lock().unwrap();
        let fires = state
            .catalog
            .triggers
            .values()
            .any(|t| t.table == table && t.enabled);
        if fires && state.catalog.tables.contains_key(archive) {
            *state
                .catalog
                .archived_rows
                .entry(archive.to_string())
                .or_default() += 1;
        }
    }

    pub fn archive_row_count(&self, archive: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .catalog
            .archived_rows
            .get(archive)
            .copied()
            .unwrap_or(0)
    }

    /// Fail the `nth` (1-based) statement labelled `label` from now on
    pub fn fail_on(&self, label: &str, nth: usize) {
        self.state.lock().unwrap().fail_on = Some((label.to_string(), nth.max(1) - 1));
    }

    /// Labels of everything executed so far, catalog reads included
    pub fn executed_labels(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().executed.clear();
    }

    fn record(&self, state: &mut State, sql: &str) -> DatabaseResult<()> {
        let label = statement_label(sql).unwrap_or("unlabelled").to_string();
        state.executed.push(label.clone());
        if let Some((target, remaining)) = state.fail_on.as_mut()
            && *target == label
        {
            if *remaining == 0 {
                state.fail_on = None;
                return Err(failed(format!("injected failure on {label}")));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn query(&self, sql: &str, params: &[Value]) -> DatabaseResult<QueryResult> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, sql)?;
        let catalog = &state.catalog;
        let last = params.last().and_then(Value::as_str).unwrap_or_default();

        let rows: Vec<Value> = match statement_label(sql) {
            Some("table_columns") => catalog
                .tables
                .get(last)
                .map(|cols| {
                    cols.iter()
                        .map(|c| {
                            json!({
                                "column_name": c.name,
                                "data_type": c.data_type,
                                "is_primary_key": c.is_primary_key,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Some("trigger_status") => self.status_rows(catalog, last),
            Some("trigger_body") => self.body_rows(catalog, last),
            Some("trigger_source_lines") => catalog
                .triggers
                .get(last)
                .and_then(|t| t.source.split_once("CREATE ").map(|(_, rest)| rest))
                .map(|source| {
                    source
                        .split_inclusive('\n')
                        .map(|line| json!({ "text": line }))
                        .collect()
                })
                .unwrap_or_default(),
            other => return Err(failed(format!("unexpected query {other:?}"))),
        };
        let columns = rows
            .first()
            .and_then(Value::as_object)
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        Ok(QueryResult::new(columns, rows))
    }

    fn status_rows(&self, catalog: &Catalog, key: &str) -> Vec<Value> {
        if self.dialect == DatabaseDialect::MySql {
            return catalog
                .triggers
                .iter()
                .filter(|(_, t)| t.table == key)
                .map(|(name, _)| json!({ "trigger_name": name }))
                .collect();
        }
        let Some(trigger) = catalog.triggers.get(key) else {
            return Vec::new();
        };
        let row = match self.dialect {
            DatabaseDialect::Postgres => {
                json!({ "enabled": if trigger.enabled { "O" } else { "D" } })
            }
            DatabaseDialect::SqlServer => json!({ "is_disabled": i32::from(!trigger.enabled) }),
            _ => json!({ "status": if trigger.enabled { "ENABLED" } else { "DISABLED" } }),
        };
        vec![row]
    }

    fn body_rows(&self, catalog: &Catalog, key: &str) -> Vec<Value> {
        match self.dialect {
            DatabaseDialect::Postgres => catalog
                .functions
                .get(key)
                .map(|body| vec![json!({ "body": body })])
                .unwrap_or_default(),
            DatabaseDialect::MySql => catalog
                .triggers
                .iter()
                .filter(|(_, t)| t.table == key)
                .filter_map(|(name, t)| {
                    let (_, action) = t.source.split_once("FOR EACH ROW ")?;
                    Some(json!({ "trigger_name": name, "body": action }))
                })
                .collect(),
            _ => catalog
                .triggers
                .get(key)
                .map(|t| vec![json!({ "body": t.source })])
                .unwrap_or_default(),
        }
    }

    fn apply(&self, catalog: &mut Catalog, sql: &str) -> DatabaseResult<()> {
        let body = strip_label(sql);
        match statement_label(sql) {
            Some("create_archive_table") => {
                let (name, rest) = name_after(body, "CREATE TABLE ")
                    .ok_or_else(|| failed(format!("bad CREATE TABLE: {sql}")))?;
                if catalog.tables.contains_key(&name) {
                    return Err(failed(format!("table {name} already exists")));
                }
                let rest = rest.trim();
                let defs = rest
                    .strip_prefix('(')
                    .and_then(|r| r.rfind(')').map(|end| &r[..end]))
                    .ok_or_else(|| failed(format!("bad column list: {sql}")))?;
                let columns = split_top_level(defs)
                    .into_iter()
                    .filter_map(column_def)
                    .collect();
                catalog.tables.insert(name, columns);
            }
            Some("alter_archive_table") => {
                let (name, rest) = name_after(body, "ALTER TABLE ")
                    .ok_or_else(|| failed(format!("bad ALTER TABLE: {sql}")))?;
                let def = rest.trim().strip_prefix("ADD").unwrap_or(rest).trim();
                let def = def.strip_prefix("COLUMN").unwrap_or(def).trim();
                let def = def
                    .strip_prefix('(')
                    .and_then(|d| d.strip_suffix(')'))
                    .unwrap_or(def);
                let column =
                    column_def(def).ok_or_else(|| failed(format!("bad column: {sql}")))?;
                catalog
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| failed(format!("table {name} does not exist")))?
                    .push(column);
            }
            Some("drop_archive_table") => {
                let (name, _) = name_after(body, "DROP TABLE ")
                    .ok_or_else(|| failed(format!("bad DROP TABLE: {sql}")))?;
                catalog
                    .tables
                    .remove(&name)
                    .ok_or_else(|| failed(format!("table {name} does not exist")))?;
                catalog.archived_rows.remove(&name);
            }
            Some("create_trigger_function") => {
                let (name, _) = name_after(body, "FUNCTION ")
                    .ok_or_else(|| failed(format!("bad CREATE FUNCTION: {sql}")))?;
                let source = body
                    .split("$body$")
                    .nth(1)
                    .ok_or_else(|| failed(format!("function without body: {sql}")))?;
                catalog.functions.insert(name, source.to_string());
            }
            Some("drop_trigger_function") => {
                let (name, _) = name_after(body, "IF EXISTS ")
                    .ok_or_else(|| failed(format!("bad DROP FUNCTION: {sql}")))?;
                catalog.functions.remove(&name);
            }
            Some("create_trigger") => {
                let (name, _) = name_after(body, "CREATE TRIGGER ")
                    .ok_or_else(|| failed(format!("bad CREATE TRIGGER: {sql}")))?;
                let (table, _) = name_after(body, " ON ")
                    .ok_or_else(|| failed(format!("trigger without table: {sql}")))?;
                if !catalog.tables.contains_key(&table) {
                    return Err(failed(format!("table {table} does not exist")));
                }
                if catalog.triggers.contains_key(&name) {
                    return Err(failed(format!("trigger {name} already exists")));
                }
                catalog.triggers.insert(
                    name,
                    FakeTrigger {
                        table,
                        source: sql.to_string(),
                        enabled: true,
                    },
                );
            }
            Some("drop_trigger") => match self.named_trigger(catalog, body) {
                Some(name) => {
                    catalog.triggers.remove(&name);
                }
                None if body.contains("IF EXISTS") => {}
                None => return Err(failed(format!("trigger does not exist: {sql}"))),
            },
            Some(label @ ("enable_trigger" | "disable_trigger")) => {
                let name = self
                    .named_trigger(catalog, body)
                    .ok_or_else(|| failed(format!("trigger does not exist: {sql}")))?;
                if let Some(trigger) = catalog.triggers.get_mut(&name) {
                    trigger.enabled = label == "enable_trigger";
                }
            }
            other => return Err(failed(format!("unexpected statement {other:?}: {sql}"))),
        }
        Ok(())
    }

    fn named_trigger(&self, catalog: &Catalog, sql: &str) -> Option<String> {
        catalog
            .triggers
            .keys()
            .find(|name| quoted_forms(name).iter().any(|q| sql.contains(q.as_str())))
            .cloned()
    }

    fn statement(&self, sql: &str) -> DatabaseResult<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, sql)?;
        self.apply(&mut state.catalog, sql)
    }
}

#[async_trait(?Send)]
impl DatabaseBackend for FakeCatalog {
    async fn execute_query(&self, sql: &str) -> DatabaseResult<QueryResult> {
        self.query(sql, &[])
    }

    async fn execute_query_params(&self, sql: &str, params: &[Value]) -> DatabaseResult<QueryResult> {
        self.query(sql, params)
    }

    async fn execute_statement(&self, sql: &str, _params: &[Value]) -> DatabaseResult<u64> {
        self.statement(sql)?;
        Ok(1)
    }

    async fn execute_batch(&self, sql: &str) -> DatabaseResult<()> {
        self.statement(sql)
    }

    async fn execute_in_transaction(&self, statements: &[String]) -> DatabaseResult<()> {
        let mut state = self.state.lock().unwrap();
        let snapshot = state.catalog.clone();
        for sql in statements {
            let result = match self.record(&mut state, sql) {
                Ok(()) => self.apply(&mut state.catalog, sql),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if self.transactional() {
                    state.catalog = snapshot;
                }
                return Err(DatabaseError::TransactionFailed(e.to_string()));
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &'static str {
        "fake"
    }
}
