//! Permission windows and their run lock
//!
//! A permission window says when recurring cache jobs may touch a source
//! system, and carries a persisted lock so that only one run at a time
//! executes inside it, even across processes. Admission needs both: being
//! inside one of the window's periods, and holding the lock.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod store;

pub use store::{InMemoryWindowStore, SqlWindowStore, WindowStore};

use crate::database::DatabaseError;
use crate::error::ErrorKind;

/// Errors raised by permission window operations
#[derive(Debug, Error)]
pub enum WindowError {
    #[error("Permission window {0} not found")]
    NotFound(Uuid),

    #[error("Window {window} is not locked by {holder} (held by {})", current.as_deref().unwrap_or("nobody"))]
    NotLockHolder {
        window: Uuid,
        holder: String,
        current: Option<String>,
    },

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Stored window {window} is unreadable: {reason}")]
    CorruptRecord { window: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl WindowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WindowError::NotFound(_) => ErrorKind::Precondition,
            WindowError::NotLockHolder { .. } => ErrorKind::Concurrency,
            WindowError::InvalidPeriod(_) => ErrorKind::Configuration,
            WindowError::CorruptRecord { .. } => ErrorKind::TransientIo,
            WindowError::Database(e) => e.kind(),
        }
    }
}

pub type WindowResult<T> = Result<T, WindowError>;

/// Identity of a lock holder, usually one scheduler process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh identity for this process
    pub fn generate() -> Self {
        Self(format!("{}-{}", std::process::id(), Uuid::new_v4()))
    }

    /// A per-run identity under this holder; two runs never share a lock
    pub fn for_run(&self) -> Self {
        Self(format!("{}:{}", self.0, Uuid::new_v4()))
    }

    /// Whether `self` is `owner` or one of its runs
    pub fn belongs_to(&self, owner: &HolderId) -> bool {
        self.0
            .strip_prefix(owner.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HolderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One interval during which a window is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PermissionWindowPeriod {
    /// Every week on `day` from `start` (inclusive) to `end` (exclusive),
    /// in the caller's local time. `start > end` runs past midnight into
    /// the next day.
    Weekly {
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    /// A one-off interval, `start` inclusive and `end` exclusive
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl PermissionWindowPeriod {
    pub fn weekly(day: Weekday, start: NaiveTime, end: NaiveTime) -> WindowResult<Self> {
        if start == end {
            return Err(WindowError::InvalidPeriod(format!(
                "{day} {} starts and ends at the same time",
                start.format("%H:%M")
            )));
        }
        Ok(Self::Weekly { day, start, end })
    }

    pub fn absolute(start: DateTime<Utc>, end: DateTime<Utc>) -> WindowResult<Self> {
        if start >= end {
            return Err(WindowError::InvalidPeriod(format!(
                "{} is not before {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self::Absolute { start, end })
    }

    /// Whether `now` falls inside this period
    pub fn contains<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        match self {
            Self::Weekly { day, start, end } => {
                let weekday = now.weekday();
                let time = now.time();
                if start < end {
                    weekday == *day && *start <= time && time < *end
                } else {
                    (weekday == *day && time >= *start) || (weekday == day.succ() && time < *end)
                }
            }
            Self::Absolute { start, end } => {
                let now = now.with_timezone(&Utc);
                *start <= now && now < *end
            }
        }
    }
}

impl std::fmt::Display for PermissionWindowPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weekly { day, start, end } => {
                write!(f, "{} {}-{}", day, start.format("%H:%M"), end.format("%H:%M"))
            }
            Self::Absolute { start, end } => write!(f, "{}/{}", start.to_rfc3339(), end.to_rfc3339()),
        }
    }
}

impl std::str::FromStr for PermissionWindowPeriod {
    type Err = WindowError;

    /// `Mon 09:00-17:00` or `<rfc3339>/<rfc3339>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| WindowError::InvalidPeriod(format!("{s}: {reason}"));

        if let Some((start, end)) = s.split_once('/') {
            let parse = |v: &str| {
                DateTime::parse_from_rfc3339(v.trim())
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| invalid(&e.to_string()))
            };
            return Self::absolute(parse(start)?, parse(end)?);
        }

        let (day, times) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| invalid("expected '<day> HH:MM-HH:MM'"))?;
        let day: Weekday = day.parse().map_err(|_| invalid("unknown day"))?;
        let (start, end) = times
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid("expected HH:MM-HH:MM"))?;
        let parse = |v: &str| {
            NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|e| invalid(&e.to_string()))
        };
        Self::weekly(day, parse(start)?, parse(end)?)
    }
}

/// When a held lock may be taken over by another holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Heartbeat age after which the lock counts as abandoned. `None` means
    /// never; only [`WindowStore::force_release`] frees it then.
    pub ttl: Option<Duration>,
}

impl LockPolicy {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    pub fn never_expire() -> Self {
        Self { ttl: None }
    }

    /// Longest heartbeat interval that keeps a live holder's lock fresh
    pub fn max_heartbeat_interval(&self) -> Option<Duration> {
        self.ttl.map(|ttl| ttl / 3)
    }

    /// `interval` shortened to at most a third of the TTL
    pub fn bounded_heartbeat(&self, interval: Duration) -> Duration {
        match self.max_heartbeat_interval() {
            Some(max) => interval.min(max),
            None => interval,
        }
    }

    /// Heartbeats at or before this instant are stale
    pub fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        now.checked_sub_signed(ttl)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(15 * 60))
    }
}

/// Persisted run lock of a window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLock {
    pub locked_because_running: bool,
    pub lock_held_by: Option<HolderId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl WindowLock {
    pub fn is_held_by(&self, holder: &HolderId) -> bool {
        self.locked_because_running && self.lock_held_by.as_ref() == Some(holder)
    }

    /// Locked, but the holder stopped heartbeating longer ago than the policy allows
    pub fn is_stale(&self, policy: &LockPolicy, now: DateTime<Utc>) -> bool {
        match (self.locked_because_running, policy.stale_before(now), self.heartbeat_at) {
            (true, Some(cutoff), Some(heartbeat)) => heartbeat < cutoff,
            _ => false,
        }
    }

    /// Whether `holder` could acquire the lock now
    pub fn available_to(&self, holder: &HolderId, policy: &LockPolicy, now: DateTime<Utc>) -> bool {
        !self.locked_because_running || self.is_held_by(holder) || self.is_stale(policy, now)
    }
}

/// A named set of periods plus its run lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionWindow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub periods: Vec<PermissionWindowPeriod>,
    #[serde(default)]
    pub lock: WindowLock,
}

impl PermissionWindow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            periods: Vec::new(),
            lock: WindowLock::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_period(mut self, period: PermissionWindowPeriod) -> Self {
        self.periods.push(period);
        self
    }

    /// Time membership only, lock state is not consulted. A window without
    /// periods is always open.
    pub fn is_within_window<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.periods.is_empty() || self.periods.iter().any(|p| p.contains(now))
    }

    /// Inside a period and the lock is available to `holder`
    pub fn admits(&self, holder: &HolderId, policy: &LockPolicy, now: DateTime<Utc>) -> bool {
        self.is_within_window(&now) && self.lock.available_to(holder, policy, now)
    }
}
