//! Dialect dispatch for trigger implementers

use super::{
    MySqlTriggerImplementer, OracleTriggerImplementer, PostgresTriggerImplementer, SharedBackend,
    SqlServerTriggerImplementer, TriggerError, TriggerImplementer, TriggerResult, TriggerTarget,
};
use crate::database::DatabaseDialect;

/// Build the trigger implementer for `dialect`
///
/// DuckDB and SQLite are known dialects that the engine uses for its own
/// state, but they carry no audit triggers.
pub fn create_trigger_implementer(
    dialect: DatabaseDialect,
    backend: SharedBackend,
    target: TriggerTarget,
) -> TriggerResult<Box<dyn TriggerImplementer>> {
    match dialect {
        DatabaseDialect::Postgres => Ok(Box::new(PostgresTriggerImplementer::new(backend, target))),
        DatabaseDialect::SqlServer => {
            Ok(Box::new(SqlServerTriggerImplementer::new(backend, target)))
        }
        DatabaseDialect::MySql => Ok(Box::new(MySqlTriggerImplementer::new(backend, target))),
        DatabaseDialect::Oracle => Ok(Box::new(OracleTriggerImplementer::new(backend, target))),
        DatabaseDialect::DuckDB | DatabaseDialect::Sqlite => {
            Err(TriggerError::UnsupportedDialect(dialect))
        }
    }
}
