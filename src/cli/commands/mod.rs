//! CLI command implementations

pub mod args;
pub mod names;

#[cfg(feature = "duckdb-backend")]
pub mod window;

#[cfg(feature = "postgres-backend")]
pub mod trigger;

use std::path::Path;

use crate::checks::{CheckResult, CollectingNotifier};
use crate::cli::error::CliError;
use crate::config::EngineConfig;

/// Load `.data-load.toml` from `dir`, with environment overrides applied
pub fn load_config(dir: &Path) -> Result<EngineConfig, CliError> {
    Ok(EngineConfig::load(dir)?)
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))
}

/// Print collected check events, then settle the command's outcome
///
/// An error from the command itself wins over the failed-check count.
pub fn report_checks(
    notifier: &CollectingNotifier,
    result: Result<(), CliError>,
) -> Result<(), CliError> {
    let events = notifier.events();
    for event in &events {
        let marker = match event.result {
            CheckResult::Success => "ok",
            CheckResult::Warning => "warn",
            CheckResult::Fail => "FAIL",
        };
        println!("[{marker}] {}", event.message);
    }
    result?;
    let failures = events
        .iter()
        .filter(|e| e.result == CheckResult::Fail)
        .count();
    if failures > 0 {
        return Err(CliError::ChecksFailed(failures));
    }
    Ok(())
}
