//! Stage name resolution command

use std::path::PathBuf;

use crate::cli::commands::load_config;
use crate::cli::error::CliError;
use crate::stages::{ConventionNamer, DatabaseNamer, Stage};

/// Names command arguments
#[derive(Debug, Clone)]
pub struct NamesArgs {
    /// Live database name of the load
    pub root: String,
    pub stage: String,
    pub table: Option<String>,
    pub config_dir: PathBuf,
}

/// Render the physical names for one stage, one per line
pub fn resolve_names(namer: &dyn DatabaseNamer, args: &NamesArgs) -> Result<String, CliError> {
    let stage: Stage = args.stage.parse()?;
    match &args.table {
        Some(table) => {
            let staged = namer.staged_name(&args.root, table, stage)?;
            Ok(format!(
                "database: {}\ntable:    {}\nqualified: {}",
                staged.database, staged.table, staged
            ))
        }
        None => {
            let database_stage = if stage == Stage::Archive {
                Stage::Live
            } else {
                stage
            };
            Ok(format!(
                "database: {}",
                namer.database_name(&args.root, database_stage)?
            ))
        }
    }
}

pub fn handle_names(args: &NamesArgs) -> Result<(), CliError> {
    let config = load_config(&args.config_dir)?;
    let namer = ConventionNamer::new(config.naming.to_convention());
    println!("{}", resolve_names(&namer, args)?);
    Ok(())
}
