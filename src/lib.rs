//! Data Load Engine - staged migration and cache scheduling core
//!
//! Provides:
//! - Stage naming (RAW → STAGING → LIVE, plus ARCHIVE)
//! - Per-dialect audit triggers that copy row pre-images into archive tables
//! - Permission windows with a persisted, cross-process run lock
//! - A scheduler for recurring cache fetch jobs gated by those windows
//! - Command line marshaling for out-of-process load components

pub mod args;
pub mod cache;
pub mod checks;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod stages;
pub mod triggers;
pub mod windows;

pub use args::{
    ArgValue, ArgumentError, CacheOptions, CommandLine, DatabaseRef, LoadCommand, LoadOptions,
    ToCommandLine, to_arg_string, to_kebab_case,
};
pub use cache::{
    CacheLagPeriod, CacheProgress, CacheProgressStore, CacheScheduler, FetchRange,
    InMemoryCacheProgressStore, RunReport, SchedulerError, SqlCacheProgressStore,
};
pub use checks::{CheckEvent, CheckNotifier, CheckResult, CollectingNotifier, TracingNotifier};
pub use config::{ConfigError, EngineConfig};
pub use database::{DatabaseBackend, DatabaseDialect, DatabaseError, QueryResult};
pub use error::{Error, ErrorKind, Result};
pub use stages::{ConventionNamer, DatabaseNamer, NamingConvention, NamingError, Stage};
pub use triggers::{
    DiscoveredColumn, SyncReport, TriggerError, TriggerImplementer, TriggerStatus, TriggerTarget,
    create_trigger_implementer,
};
pub use windows::{
    HolderId, InMemoryWindowStore, LockPolicy, PermissionWindow, PermissionWindowPeriod,
    SqlWindowStore, WindowError, WindowLock, WindowStore,
};

#[cfg(feature = "duckdb-backend")]
pub use database::DuckDBBackend;
#[cfg(feature = "postgres-backend")]
pub use database::PostgresBackend;
