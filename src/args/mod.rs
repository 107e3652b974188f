//! Command line marshaling for out-of-process load components
//!
//! Typed settings are rendered as `-kebab-case-name=value` tokens:
//!
//! | Value              | Rendering                                    |
//! |--------------------|----------------------------------------------|
//! | `true` / `false`   | `-name` / omitted                            |
//! | enum               | `-name=VariantName`                          |
//! | text with spaces   | `-name="has space"`                          |
//! | date / date-time   | `-name="2024-01-31"` / `"2024-01-31 13:45:00"` |
//! | path               | `-name="/absolute/path"`                     |
//! | database           | `-database-name=db -database-server=host`    |

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::database::DatabaseDialect;
use crate::error::ErrorKind;
use crate::stages::Stage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Argument name '{0}' must be PascalCase")]
    InvalidName(String),

    #[error("Argument '{0}' has no value")]
    MissingValue(String),

    #[error("Argument '{name}' path cannot be made absolute: {reason}")]
    InvalidPath { name: String, reason: String },
}

impl ArgumentError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

pub type ArgumentResult<T> = Result<T, ArgumentError>;

/// A database a load component should connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRef {
    pub name: String,
    pub server: String,
}

impl DatabaseRef {
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
        }
    }
}

/// A typed argument value
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    /// Textual name of an enumerated value
    Enum(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Path(PathBuf),
    Database(DatabaseRef),
}

impl ArgValue {
    fn is_missing(&self) -> bool {
        match self {
            ArgValue::Null => true,
            ArgValue::Text(s) => s.is_empty(),
            ArgValue::Path(p) => p.as_os_str().is_empty(),
            _ => false,
        }
    }
}

macro_rules! arg_value_from {
    ($variant:ident: $($ty:ty => $conv:expr),+ $(,)?) => {
        $(impl From<$ty> for ArgValue {
            fn from(value: $ty) -> Self {
                ArgValue::$variant($conv(value))
            }
        })+
    };
}

arg_value_from!(Bool: bool => |v| v);
arg_value_from!(Int:
    i32 => i64::from,
    u32 => i64::from,
    i64 => |v| v,
);
arg_value_from!(UInt: u64 => |v| v);
arg_value_from!(Float: f64 => |v| v);
arg_value_from!(Text:
    &str => str::to_string,
    String => |v| v,
    Uuid => |v: Uuid| v.to_string(),
);
arg_value_from!(Date: NaiveDate => |v| v);
arg_value_from!(DateTime:
    NaiveDateTime => |v| v,
    DateTime<Utc> => |v: DateTime<Utc>| v.naive_utc(),
);
arg_value_from!(Path:
    &Path => Path::to_path_buf,
    PathBuf => |v| v,
);
arg_value_from!(Enum:
    Stage => |v: Stage| v.as_str().to_string(),
    DatabaseDialect => |v: DatabaseDialect| format!("{v:?}"),
    LoadCommand => |v: LoadCommand| format!("{v:?}"),
);
arg_value_from!(Database: DatabaseRef => |v| v);

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

/// `TestTLAArg` → `test-tla-arg`
///
/// A new word starts at an uppercase letter that follows a lowercase letter
/// or digit, or that ends an uppercase run followed by a lowercase letter.
pub fn to_kebab_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            continue;
        }
        if c.is_uppercase() && i > 0 && !out.ends_with('-') {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower)
            {
                out.push('-');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

fn render_datetime(value: &NaiveDateTime) -> String {
    if value.time() == NaiveTime::MIN {
        value.format("%Y-%m-%d").to_string()
    } else {
        value.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// The tokens for one argument; empty for a false flag
fn arg_tokens(name: &str, value: ArgValue) -> ArgumentResult<Vec<String>> {
    if !name.chars().next().is_some_and(char::is_uppercase) {
        return Err(ArgumentError::InvalidName(name.to_string()));
    }
    if value.is_missing() {
        return Err(ArgumentError::MissingValue(name.to_string()));
    }
    let flag = format!("-{}", to_kebab_case(name));

    let rendered = match value {
        ArgValue::Null => return Err(ArgumentError::MissingValue(name.to_string())),
        ArgValue::Bool(true) => return Ok(vec![flag]),
        ArgValue::Bool(false) => return Ok(Vec::new()),
        ArgValue::Database(db) => {
            return Ok(vec![
                format!("-database-name={}", db.name),
                format!("-database-server={}", db.server),
            ]);
        }
        ArgValue::Int(v) => v.to_string(),
        ArgValue::UInt(v) => v.to_string(),
        ArgValue::Float(v) => v.to_string(),
        ArgValue::Enum(v) => v,
        ArgValue::Text(v) if v.chars().any(|c| c.is_whitespace() || c == '"') => quote(&v),
        ArgValue::Text(v) => v,
        ArgValue::Date(d) => quote(&d.format("%Y-%m-%d").to_string()),
        ArgValue::DateTime(dt) => quote(&render_datetime(&dt)),
        ArgValue::Path(p) => {
            let absolute = std::path::absolute(&p).map_err(|e| ArgumentError::InvalidPath {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            quote(&absolute.to_string_lossy())
        }
    };
    Ok(vec![format!("{flag}={rendered}")])
}

/// Render one argument. A false flag renders as the empty string, which
/// callers leave out of the final command line.
pub fn to_arg_string(name: &str, value: impl Into<ArgValue>) -> ArgumentResult<String> {
    Ok(arg_tokens(name, value.into())?.join(" "))
}

/// An ordered list of command line tokens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bare token such as a sub-command verb
    pub fn positional(&mut self, token: impl Into<String>) -> &mut Self {
        self.tokens.push(token.into());
        self
    }

    pub fn arg(&mut self, name: &str, value: impl Into<ArgValue>) -> ArgumentResult<&mut Self> {
        self.tokens.extend(arg_tokens(name, value.into())?);
        Ok(self)
    }

    /// Like [`CommandLine::arg`], but `None` is skipped instead of rejected
    pub fn optional<T: Into<ArgValue>>(
        &mut self,
        name: &str,
        value: Option<T>,
    ) -> ArgumentResult<&mut Self> {
        match value {
            Some(v) => self.arg(name, v),
            None => Ok(self),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_args(self) -> Vec<String> {
        self.tokens
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

/// Settings that can be handed to a load component on its command line
pub trait ToCommandLine {
    fn to_command_line(&self) -> ArgumentResult<CommandLine>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadCommand {
    #[default]
    Run,
    Check,
}

impl LoadCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            LoadCommand::Run => "run",
            LoadCommand::Check => "check",
        }
    }
}

/// Options of a data load execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub command: LoadCommand,
    pub load_metadata: u64,
    pub iterative: bool,
    pub days_to_load: Option<u32>,
    pub stop_after: Option<Stage>,
    pub explicit_date: Option<NaiveDate>,
    pub logging_database: Option<DatabaseRef>,
}

impl ToCommandLine for LoadOptions {
    fn to_command_line(&self) -> ArgumentResult<CommandLine> {
        let mut cmd = CommandLine::new();
        cmd.positional(self.command.verb());
        cmd.arg("LoadMetadata", self.load_metadata)?
            .arg("Iterative", self.iterative)?
            .optional("DaysToLoad", self.days_to_load)?
            .optional("StopAfter", self.stop_after)?
            .optional("ExplicitDate", self.explicit_date)?
            .optional("Database", self.logging_database.clone())?;
        Ok(cmd)
    }
}

/// Options of a cache fetch execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub command: LoadCommand,
    pub cache_progress: Uuid,
    pub retry: bool,
    pub ignore_permission_window: bool,
}

impl ToCommandLine for CacheOptions {
    fn to_command_line(&self) -> ArgumentResult<CommandLine> {
        let mut cmd = CommandLine::new();
        cmd.positional(self.command.verb());
        cmd.arg("CacheProgress", self.cache_progress)?
            .arg("Retry", self.retry)?
            .arg("IgnorePermissionWindow", self.ignore_permission_window)?;
        Ok(cmd)
    }
}
