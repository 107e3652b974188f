//! Persistence of cache jobs

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::{CacheLagPeriod, CacheProgress, SchedulerError, SchedulerResult};
use crate::database::{DatabaseBackend, QueryRow, row_bool, row_i64, row_str};

#[async_trait(?Send)]
pub trait CacheProgressStore {
    async fn load(&self, id: Uuid) -> SchedulerResult<CacheProgress>;

    /// Insert or replace the whole job record
    async fn save(&self, job: &CacheProgress) -> SchedulerResult<()>;

    async fn list(&self) -> SchedulerResult<Vec<CacheProgress>>;
}

#[async_trait(?Send)]
impl<S: CacheProgressStore + ?Sized> CacheProgressStore for Arc<S> {
    async fn load(&self, id: Uuid) -> SchedulerResult<CacheProgress> {
        (**self).load(id).await
    }

    async fn save(&self, job: &CacheProgress) -> SchedulerResult<()> {
        (**self).save(job).await
    }

    async fn list(&self) -> SchedulerResult<Vec<CacheProgress>> {
        (**self).list().await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCacheProgressStore {
    jobs: Mutex<HashMap<Uuid, CacheProgress>>,
}

impl InMemoryCacheProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl CacheProgressStore for InMemoryCacheProgressStore {
    async fn load(&self, id: Uuid) -> SchedulerResult<CacheProgress> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&id).cloned().ok_or(SchedulerError::JobNotFound(id))
    }

    async fn save(&self, job: &CacheProgress) -> SchedulerResult<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list(&self) -> SchedulerResult<Vec<CacheProgress>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

const SELECT_JOBS: &str = "SELECT id, name, permission_window_id, cache_fill_progress_ms, \
     chunk_period_secs, cache_lag_period, run_interval_secs, last_run_at_ms, last_run_succeeded \
     FROM cache_progress";

/// Store backed by the engine's `cache_progress` table
pub struct SqlCacheProgressStore {
    backend: Arc<dyn DatabaseBackend>,
}

impl SqlCacheProgressStore {
    pub fn new(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self { backend }
    }

    fn job_from_row(row: &QueryRow) -> SchedulerResult<CacheProgress> {
        let raw_id = row_str(row, "id").unwrap_or_default();
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            job: raw_id.clone(),
            reason,
        };
        let id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(e.to_string()))?;
        let permission_window_id = row_str(row, "permission_window_id")
            .map(|w| Uuid::parse_str(&w))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let cache_lag_period = row_str(row, "cache_lag_period")
            .map(|lag| lag.parse::<CacheLagPeriod>())
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let millis = |column: &str| row_i64(row, column).and_then(DateTime::from_timestamp_millis);
        let secs = |column: &str| {
            row_i64(row, column)
                .and_then(|s| u64::try_from(s).ok())
                .map(Duration::from_secs)
        };

        Ok(CacheProgress {
            id,
            name: row_str(row, "name").unwrap_or_default(),
            permission_window_id,
            cache_fill_progress: millis("cache_fill_progress_ms"),
            chunk_period: secs("chunk_period_secs").unwrap_or_default(),
            cache_lag_period,
            run_interval: secs("run_interval_secs"),
            last_run_at: millis("last_run_at_ms"),
            last_run_succeeded: row
                .get("last_run_succeeded")
                .filter(|v| !v.is_null())
                .map(|_| row_bool(row, "last_run_succeeded")),
        })
    }
}

fn opt<T: serde::Serialize>(value: Option<T>) -> Value {
    value.map_or(Value::Null, |v| json!(v))
}

#[async_trait(?Send)]
impl CacheProgressStore for SqlCacheProgressStore {
    async fn load(&self, id: Uuid) -> SchedulerResult<CacheProgress> {
        let result = self
            .backend
            .execute_query_params(
                &format!("{SELECT_JOBS} WHERE id = $1"),
                &[json!(id.to_string())],
            )
            .await?;
        match result.first() {
            Some(row) => Self::job_from_row(row),
            None => Err(SchedulerError::JobNotFound(id)),
        }
    }

    async fn save(&self, job: &CacheProgress) -> SchedulerResult<()> {
        let secs = |d: Duration| i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        self.backend
            .execute_statement(
                "INSERT INTO cache_progress (id, name, permission_window_id, \
                 cache_fill_progress_ms, chunk_period_secs, cache_lag_period, \
                 run_interval_secs, last_run_at_ms, last_run_succeeded) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
                 permission_window_id = EXCLUDED.permission_window_id, \
                 cache_fill_progress_ms = EXCLUDED.cache_fill_progress_ms, \
                 chunk_period_secs = EXCLUDED.chunk_period_secs, \
                 cache_lag_period = EXCLUDED.cache_lag_period, \
                 run_interval_secs = EXCLUDED.run_interval_secs, \
                 last_run_at_ms = EXCLUDED.last_run_at_ms, \
                 last_run_succeeded = EXCLUDED.last_run_succeeded",
                &[
                    json!(job.id.to_string()),
                    json!(job.name),
                    opt(job.permission_window_id.map(|w| w.to_string())),
                    opt(job.cache_fill_progress.map(|t| t.timestamp_millis())),
                    json!(secs(job.chunk_period)),
                    opt(job.cache_lag_period.map(|l| l.to_string())),
                    opt(job.run_interval.map(secs)),
                    opt(job.last_run_at.map(|t| t.timestamp_millis())),
                    opt(job.last_run_succeeded),
                ],
            )
            .await?;
        tracing::debug!(job = %job.id, name = %job.name, "cache job saved");
        Ok(())
    }

    async fn list(&self) -> SchedulerResult<Vec<CacheProgress>> {
        let result = self
            .backend
            .execute_query(&format!("{SELECT_JOBS} ORDER BY name"))
            .await?;
        result.rows.iter().map(Self::job_from_row).collect()
    }
}
