//! CLI-specific error types

use thiserror::Error;

use crate::args::ArgumentError;
use crate::cache::SchedulerError;
use crate::config::ConfigError;
use crate::stages::NamingError;
use crate::triggers::TriggerError;
use crate::windows::WindowError;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),

    /// One or more checks reported a failure
    #[error("{0} check(s) failed")]
    ChecksFailed(usize),
}
