//! Crate-level error taxonomy
//!
//! Every module owns its own `thiserror` enum. Each of them reports an
//! [`ErrorKind`] so callers can decide between surfacing, backing off and
//! retrying without matching on individual variants.

use thiserror::Error;

use crate::args::ArgumentError;
use crate::cache::SchedulerError;
use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::stages::NamingError;
use crate::triggers::TriggerError;
use crate::windows::WindowError;

/// Broad classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad argument name/value, unknown stage or convention, unsupported dialect.
    /// Never retried automatically.
    Configuration,
    /// The requested transition is not valid for the current state. Raised
    /// before any mutation; retry after fixing the precondition.
    Precondition,
    /// Deployed trigger or archive schema diverges from what the live table
    /// requires. Never auto-resolved.
    Drift,
    /// Lock contention or admission refusal. Back off and retry admission.
    Concurrency,
    /// Catalog or store I/O failure. Retry with the same precondition checks.
    TransientIo,
}

impl ErrorKind {
    /// Whether a caller may retry the same operation unchanged
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Concurrency | ErrorKind::TransientIo)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Precondition => write!(f, "precondition"),
            ErrorKind::Drift => write!(f, "drift"),
            ErrorKind::Concurrency => write!(f, "concurrency"),
            ErrorKind::TransientIo => write!(f, "transient-io"),
        }
    }
}

/// Any error raised by this crate
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Naming(e) => e.kind(),
            Error::Database(e) => e.kind(),
            Error::Trigger(e) => e.kind(),
            Error::Window(e) => e.kind(),
            Error::Scheduler(e) => e.kind(),
            Error::Argument(e) => e.kind(),
            Error::Config(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
