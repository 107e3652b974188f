//! Print the command line a load component would be launched with

use chrono::NaiveDate;

use crate::args::{DatabaseRef, LoadCommand, LoadOptions, ToCommandLine};
use crate::cli::error::CliError;
use crate::stages::Stage;

/// Args command arguments
#[derive(Debug, Clone, Default)]
pub struct ArgsArgs {
    pub check: bool,
    pub load_metadata: u64,
    pub iterative: bool,
    pub days_to_load: Option<u32>,
    pub stop_after: Option<String>,
    /// `yyyy-mm-dd`
    pub explicit_date: Option<String>,
    pub logging_database: Option<String>,
    pub logging_server: Option<String>,
}

impl ArgsArgs {
    pub fn to_load_options(&self) -> Result<LoadOptions, CliError> {
        let stop_after = self
            .stop_after
            .as_deref()
            .map(str::parse::<Stage>)
            .transpose()?;
        let explicit_date = self
            .explicit_date
            .as_deref()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .map_err(|e| CliError::InvalidArgument(format!("explicit date '{d}': {e}")))
            })
            .transpose()?;
        let logging_database = match (&self.logging_database, &self.logging_server) {
            (Some(name), Some(server)) => Some(DatabaseRef::new(name, server)),
            (None, None) => None,
            _ => {
                return Err(CliError::InvalidArgument(
                    "--logging-database and --logging-server go together".to_string(),
                ));
            }
        };

        Ok(LoadOptions {
            command: if self.check {
                LoadCommand::Check
            } else {
                LoadCommand::Run
            },
            load_metadata: self.load_metadata,
            iterative: self.iterative,
            days_to_load: self.days_to_load,
            stop_after,
            explicit_date,
            logging_database,
        })
    }
}

pub fn handle_args(args: &ArgsArgs) -> Result<(), CliError> {
    let command_line = args.to_load_options()?.to_command_line()?;
    println!("{}", command_line);
    Ok(())
}
