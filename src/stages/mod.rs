//! Load stages and the naming convention that maps them to physical names
//!
//! Incoming data moves through a fixed sequence of "bubbles":
//! RAW → STAGING → LIVE, with an ARCHIVE side-channel next to LIVE.
//! Each stage lives in its own database (Archive shares Live's) and each
//! table carries a stage suffix.
//!
//! | Stage   | Database suffix | Table suffix |
//! |---------|-----------------|--------------|
//! | Raw     | `_RAW`          | (none)       |
//! | Staging | `_STAGING`      | `_STAGING`   |
//! | Live    | (none)          | (none)       |
//! | Archive | (Live database) | `_Archive`   |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::ErrorKind;

/// One step of the data-load pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Raw,
    Staging,
    Live,
    Archive,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 4] = [Stage::Raw, Stage::Staging, Stage::Live, Stage::Archive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "Raw",
            Stage::Staging => "Staging",
            Stage::Live => "Live",
            Stage::Archive => "Archive",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(Stage::Raw),
            "staging" => Ok(Stage::Staging),
            "live" => Ok(Stage::Live),
            "archive" => Ok(Stage::Archive),
            _ => Err(NamingError::UnknownStageName(s.to_string())),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while resolving stage names
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NamingError {
    /// The stage has no database of its own
    #[error("Stage {0} has no database name transform")]
    InvalidStage(Stage),

    /// The naming convention has no table suffix registered for the stage
    #[error("No table naming convention registered for stage {0}")]
    UnknownConvention(Stage),

    #[error("Unknown stage: {0}. Use raw, staging, live or archive.")]
    UnknownStageName(String),
}

impl NamingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

pub type NamingResult<T> = Result<T, NamingError>;

/// Immutable stage → suffix tables
///
/// Built once at startup (usually from [`crate::config::NamingSection`]) and
/// handed to a [`ConventionNamer`]. The builder methods consume `self`, so a
/// convention that has been shared can no longer change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConvention {
    table_suffixes: BTreeMap<Stage, String>,
    database_suffixes: BTreeMap<Stage, String>,
}

impl NamingConvention {
    /// The standard convention
    pub fn standard() -> Self {
        Self::empty()
            .with_table_suffix(Stage::Raw, "")
            .with_table_suffix(Stage::Staging, "_STAGING")
            .with_table_suffix(Stage::Live, "")
            .with_table_suffix(Stage::Archive, "_Archive")
            .with_database_suffix(Stage::Raw, "_RAW")
            .with_database_suffix(Stage::Staging, "_STAGING")
            .with_database_suffix(Stage::Live, "")
    }

    /// A convention with nothing registered
    pub fn empty() -> Self {
        Self {
            table_suffixes: BTreeMap::new(),
            database_suffixes: BTreeMap::new(),
        }
    }

    pub fn with_table_suffix(mut self, stage: Stage, suffix: impl Into<String>) -> Self {
        self.table_suffixes.insert(stage, suffix.into());
        self
    }

    pub fn without_table_suffix(mut self, stage: Stage) -> Self {
        self.table_suffixes.remove(&stage);
        self
    }

    /// Register a database suffix. Archive is ignored: it always shares the
    /// Live database.
    pub fn with_database_suffix(mut self, stage: Stage, suffix: impl Into<String>) -> Self {
        if stage != Stage::Archive {
            self.database_suffixes.insert(stage, suffix.into());
        }
        self
    }

    pub fn table_suffix(&self, stage: Stage) -> Option<&str> {
        self.table_suffixes.get(&stage).map(String::as_str)
    }

    pub fn database_suffix(&self, stage: Stage) -> Option<&str> {
        self.database_suffixes.get(&stage).map(String::as_str)
    }
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self::standard()
    }
}

/// Database and table name for one stage of one logical table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedName {
    pub stage: Stage,
    pub database: String,
    pub table: String,
}

impl std::fmt::Display for StagedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Maps logical names to per-stage physical names
///
/// Implementations must be pure: the same input always yields the same
/// output and nothing is touched on the way.
pub trait DatabaseNamer: Send + Sync {
    /// Database holding `stage`'s copy of a load whose live database is `root_name`
    fn database_name(&self, root_name: &str, stage: Stage) -> NamingResult<String>;

    /// Physical name of `table_name` in `stage`
    fn table_name(&self, table_name: &str, stage: Stage) -> NamingResult<String>;

    /// Both names at once. Archive tables resolve in the Live database.
    fn staged_name(&self, root_name: &str, table_name: &str, stage: Stage) -> NamingResult<StagedName> {
        let database_stage = if stage == Stage::Archive {
            Stage::Live
        } else {
            stage
        };
        Ok(StagedName {
            stage,
            database: self.database_name(root_name, database_stage)?,
            table: self.table_name(table_name, stage)?,
        })
    }
}

/// [`DatabaseNamer`] driven by a [`NamingConvention`]
#[derive(Debug, Clone, Default)]
pub struct ConventionNamer {
    convention: NamingConvention,
}

impl ConventionNamer {
    pub fn new(convention: NamingConvention) -> Self {
        Self { convention }
    }

    pub fn convention(&self) -> &NamingConvention {
        &self.convention
    }
}

impl DatabaseNamer for ConventionNamer {
    fn database_name(&self, root_name: &str, stage: Stage) -> NamingResult<String> {
        let suffix = self
            .convention
            .database_suffix(stage)
            .ok_or(NamingError::InvalidStage(stage))?;
        Ok(format!("{root_name}{suffix}"))
    }

    fn table_name(&self, table_name: &str, stage: Stage) -> NamingResult<String> {
        let suffix = self
            .convention
            .table_suffix(stage)
            .ok_or(NamingError::UnknownConvention(stage))?;
        Ok(format!("{table_name}{suffix}"))
    }
}
