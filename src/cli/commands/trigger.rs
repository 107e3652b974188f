//! Audit trigger commands against a live PostgreSQL database

use std::path::PathBuf;
use std::sync::Arc;

use crate::checks::{CheckNotifier, CollectingNotifier};
use crate::cli::commands::{load_config, report_checks, runtime};
use crate::cli::error::CliError;
use crate::database::{DatabaseDialect, PostgresBackend};
use crate::stages::ConventionNamer;
use crate::triggers::{TriggerImplementer, TriggerSql, TriggerTarget, create_trigger_implementer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Status,
    Create,
    Drop,
    Sync,
    Enable,
    Disable,
    Recreate,
}

#[derive(Debug, Clone)]
pub struct TriggerArgs {
    pub action: TriggerAction,
    pub table: String,
    /// Overrides the configured schema
    pub schema: Option<String>,
    pub connection_string: Option<String>,
    pub config_dir: PathBuf,
}

async fn run_action(
    implementer: &dyn TriggerImplementer,
    action: TriggerAction,
    notifier: &dyn CheckNotifier,
) -> Result<(), CliError> {
    let target = implementer.target();
    match action {
        TriggerAction::Status => {
            let status = implementer.get_trigger_status().await?;
            println!("{}: {}", target.trigger_name, status);
        }
        TriggerAction::Create => {
            implementer.create_trigger(notifier).await?;
            println!("Created {} and {}", target.trigger_name, target.archive_table);
        }
        TriggerAction::Drop => {
            implementer.drop_trigger().await?;
            println!("Dropped {} ({} kept)", target.trigger_name, target.archive_table);
        }
        TriggerAction::Sync => {
            let report = implementer.synchronize().await?;
            println!(
                "{} is in sync ({}, {} columns, body {})",
                target.trigger_name, report.status, report.column_count, report.body_fingerprint
            );
        }
        TriggerAction::Enable => {
            implementer.enable_trigger().await?;
            println!("Enabled {}", target.trigger_name);
        }
        TriggerAction::Disable => {
            implementer.disable_trigger().await?;
            println!("Disabled {}", target.trigger_name);
        }
        TriggerAction::Recreate => {
            implementer.recreate_trigger(notifier).await?;
            println!("Recreated {}", target.trigger_name);
        }
    }
    Ok(())
}

pub fn handle_trigger(args: &TriggerArgs) -> Result<(), CliError> {
    let config = load_config(&args.config_dir)?;
    if config.database.dialect != DatabaseDialect::Postgres {
        return Err(CliError::InvalidArgument(format!(
            "No native driver for {}; only postgres is supported from the command line",
            config.database.dialect
        )));
    }
    let connection_string = args
        .connection_string
        .clone()
        .or(config.database.connection_string.clone())
        .ok_or_else(|| {
            CliError::InvalidArgument("PostgreSQL connection string not configured".to_string())
        })?;
    let schema = args.schema.clone().or(config.database.schema.clone());
    let namer = ConventionNamer::new(config.naming.to_convention());
    let target = TriggerTarget::new(schema, &args.table, &namer)?;

    runtime()?.block_on(async {
        let backend = PostgresBackend::new(&connection_string)
            .await
            .map_err(|e| CliError::DatabaseError(e.to_string()))?;
        tracing::info!(connection = %backend.connection_string_masked(), "connected");

        let implementer =
            create_trigger_implementer(config.database.dialect, Arc::new(backend), target)?;
        let notifier = CollectingNotifier::new();
        let result = run_action(implementer.as_ref(), args.action, &notifier).await;
        report_checks(&notifier, result)
    })
}
