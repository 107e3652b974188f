//! Recurring cache fetch jobs and their scheduler
//!
//! A [`CacheProgress`] job pulls data from a source system in chunks,
//! remembering how far it has filled the cache. A job may be gated by one
//! permission window; the [`CacheScheduler`] enforces the window's periods
//! and its run lock around every execution.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod scheduler;
pub mod store;

pub use scheduler::{CacheScheduler, RunReport};
pub use store::{CacheProgressStore, InMemoryCacheProgressStore, SqlCacheProgressStore};

use crate::database::DatabaseError;
use crate::error::ErrorKind;
use crate::windows::WindowError;

/// Errors raised while scheduling or running cache jobs
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Cache job {0} not found")]
    JobNotFound(Uuid),

    #[error("Cache job '{job}' is not due yet")]
    NotDue { job: String },

    #[error("Cache job '{job}' is outside permission window '{window}'")]
    OutsideWindow { job: String, window: String },

    #[error("Permission window '{window}' is locked by {}", held_by.as_deref().unwrap_or("another run"))]
    WindowLocked {
        window: String,
        held_by: Option<String>,
    },

    #[error("Cache job '{job}' failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("Cache job '{job}' lost the lock on permission window '{window}' and was stopped")]
    LockLost { job: String, window: String },

    #[error("Cache job '{job}' panicked")]
    JobPanicked { job: String },

    #[error("Invalid cache lag period '{0}': expected <n>d or <n>m")]
    InvalidLagPeriod(String),

    #[error("Stored cache job {job} is unreadable: {reason}")]
    CorruptRecord { job: String, reason: String },

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::JobNotFound(_) | SchedulerError::NotDue { .. } => {
                ErrorKind::Precondition
            }
            SchedulerError::OutsideWindow { .. }
            | SchedulerError::WindowLocked { .. }
            | SchedulerError::LockLost { .. } => ErrorKind::Concurrency,
            SchedulerError::InvalidLagPeriod(_) => ErrorKind::Configuration,
            SchedulerError::JobFailed { .. }
            | SchedulerError::JobPanicked { .. }
            | SchedulerError::CorruptRecord { .. } => ErrorKind::TransientIo,
            SchedulerError::Window(e) => e.kind(),
            SchedulerError::Database(e) => e.kind(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// How far behind "now" the cache deliberately stays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CacheLagPeriod {
    Days(u32),
    Months(u32),
}

impl CacheLagPeriod {
    /// The newest instant the cache may be filled up to
    pub fn limit_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let limit = match self {
            CacheLagPeriod::Days(n) => now.checked_sub_signed(chrono::Duration::days(i64::from(*n))),
            CacheLagPeriod::Months(n) => now.checked_sub_months(Months::new(*n)),
        };
        limit.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl std::fmt::Display for CacheLagPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLagPeriod::Days(n) => write!(f, "{n}d"),
            CacheLagPeriod::Months(n) => write!(f, "{n}m"),
        }
    }
}

impl std::str::FromStr for CacheLagPeriod {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidLagPeriod(s.to_string());
        let s = s.trim();
        let unit = s.chars().last().ok_or_else(invalid)?;
        let count: u32 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        match unit {
            'd' | 'D' => Ok(CacheLagPeriod::Days(count)),
            'm' | 'M' => Ok(CacheLagPeriod::Months(count)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for CacheLagPeriod {
    type Error = SchedulerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheLagPeriod> for String {
    fn from(value: CacheLagPeriod) -> Self {
        value.to_string()
    }
}

/// Half-open interval of source data one run should fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A recurring cache fetch job and its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheProgress {
    pub id: Uuid,
    pub name: String,
    pub permission_window_id: Option<Uuid>,
    /// Source data before this instant is already cached
    pub cache_fill_progress: Option<DateTime<Utc>>,
    /// Amount of source time fetched per run
    pub chunk_period: Duration,
    pub cache_lag_period: Option<CacheLagPeriod>,
    /// Minimum time between runs; `None` runs whenever asked
    pub run_interval: Option<Duration>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_succeeded: Option<bool>,
}

impl CacheProgress {
    pub fn new(name: impl Into<String>, chunk_period: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            permission_window_id: None,
            cache_fill_progress: None,
            chunk_period,
            cache_lag_period: None,
            run_interval: None,
            last_run_at: None,
            last_run_succeeded: None,
        }
    }

    pub fn with_fill_progress(mut self, progress: DateTime<Utc>) -> Self {
        self.cache_fill_progress = Some(progress);
        self
    }

    pub fn with_lag(mut self, lag: CacheLagPeriod) -> Self {
        self.cache_lag_period = Some(lag);
        self
    }

    pub fn with_run_interval(mut self, interval: Duration) -> Self {
        self.run_interval = Some(interval);
        self
    }

    /// The job's own cadence, ignoring any permission window
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let (Some(interval), Some(last)) = (self.run_interval, self.last_run_at) else {
            return true;
        };
        match chrono::Duration::from_std(interval)
            .ok()
            .and_then(|i| last.checked_add_signed(i))
        {
            Some(next) => next <= now,
            None => false,
        }
    }

    /// The next chunk to fetch, clipped to the lag limit. `None` when the
    /// cache is already filled up to the limit or has no starting point.
    pub fn next_fetch_range(&self, now: DateTime<Utc>) -> Option<FetchRange> {
        let start = self.cache_fill_progress?;
        let limit = self
            .cache_lag_period
            .map_or(now, |lag| lag.limit_for(now));
        if start >= limit {
            return None;
        }
        let chunk_end = chrono::Duration::from_std(self.chunk_period)
            .ok()
            .and_then(|chunk| start.checked_add_signed(chunk))
            .unwrap_or(limit);
        Some(FetchRange {
            start,
            end: chunk_end.min(limit),
        })
    }
}
