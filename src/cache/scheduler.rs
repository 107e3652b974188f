//! Admission control and execution of cache jobs
//!
//! A run of a windowed job goes: due check, period check, lock acquire,
//! body on its own task with a heartbeat on the lock, release, record.
//! The release happens on every path once the lock was taken, including a
//! failed or panicking body.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::{CacheProgress, CacheProgressStore, FetchRange, SchedulerError, SchedulerResult};
use crate::config::SchedulerSection;
use crate::windows::{HolderId, PermissionWindow, WindowError, WindowStore};

/// Outcome of one successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: Uuid,
    pub window_id: Option<Uuid>,
    pub range: Option<FetchRange>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Fill progress after the run
    pub cache_fill_progress: Option<DateTime<Utc>>,
}

/// Runs cache jobs on behalf of one lock holder
///
/// Each windowed run takes the window lock under its own identity derived
/// from the scheduler's holder, so two runs from one scheduler exclude each
/// other like runs from different processes do.
pub struct CacheScheduler<W, J> {
    windows: W,
    jobs: J,
    holder: HolderId,
    heartbeat_interval: Duration,
}

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

impl<W: WindowStore, J: CacheProgressStore> CacheScheduler<W, J> {
    /// Heartbeats every minute, or more often when the store's lock TTL
    /// needs it
    pub fn new(windows: W, jobs: J, holder: HolderId) -> Self {
        let heartbeat_interval = windows
            .policy()
            .bounded_heartbeat(DEFAULT_HEARTBEAT)
            .max(MIN_HEARTBEAT);
        Self {
            windows,
            jobs,
            holder,
            heartbeat_interval,
        }
    }

    /// Holder identity and heartbeat interval from the `[scheduler]` section
    pub fn from_config(windows: W, jobs: J, config: &SchedulerSection) -> Self {
        Self::new(windows, jobs, config.holder())
            .with_heartbeat_interval(config.heartbeat_interval())
    }

    /// Set the heartbeat interval; it is shortened to a third of the store's
    /// lock TTL so a healthy run never looks stale
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        let bounded = self.windows.policy().bounded_heartbeat(interval);
        if bounded < interval {
            tracing::warn!(
                requested = ?interval,
                used = ?bounded,
                "heartbeat interval shortened to fit the lock TTL"
            );
        }
        self.heartbeat_interval = bounded.max(MIN_HEARTBEAT);
        self
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn windows(&self) -> &W {
        &self.windows
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    /// Whether `job` would be admitted at `now`: due on its own cadence and,
    /// if windowed, inside a period with the lock free.
    pub async fn should_run(&self, job: &CacheProgress, now: DateTime<Utc>) -> SchedulerResult<bool> {
        if !job.is_due(now) {
            return Ok(false);
        }
        let Some(window_id) = job.permission_window_id else {
            return Ok(true);
        };
        let window = self.windows.load(window_id).await?;
        Ok(window.admits(&self.holder, self.windows.policy(), now))
    }

    /// Run `job` now
    pub async fn run<F, Fut>(&self, job: &mut CacheProgress, body: F) -> SchedulerResult<RunReport>
    where
        F: FnOnce(CacheProgress, Option<FetchRange>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<DateTime<Utc>>>> + Send + 'static,
    {
        self.run_at(job, Utc::now(), body).await
    }

    /// Run `job` as of `now`
    ///
    /// `body` receives a copy of the job and the range to fetch, and returns
    /// the new fill progress if it advanced it. The job's bookkeeping is
    /// persisted whether the body succeeds or not. If the window lock is lost
    /// mid-run the body is aborted and the run fails with `LockLost`.
    pub async fn run_at<F, Fut>(
        &self,
        job: &mut CacheProgress,
        now: DateTime<Utc>,
        body: F,
    ) -> SchedulerResult<RunReport>
    where
        F: FnOnce(CacheProgress, Option<FetchRange>) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<DateTime<Utc>>>> + Send + 'static,
    {
        if !job.is_due(now) {
            return Err(SchedulerError::NotDue {
                job: job.name.clone(),
            });
        }
        let run_holder = self.holder.for_run();
        let window = match job.permission_window_id {
            Some(window_id) => Some(self.admit(job, window_id, &run_holder, now).await?),
            None => None,
        };
        let window_id = window.as_ref().map(|w| w.id);

        let range = job.next_fetch_range(now);
        tracing::info!(job = %job.name, holder = %run_holder, ?range, "cache job started");
        let mut handle = tokio::spawn(body(job.clone(), range));

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        // None when the lock was lost and the body aborted
        let joined = loop {
            tokio::select! {
                joined = &mut handle => break Some(joined),
                _ = heartbeat.tick(), if window_id.is_some() => {
                    let Some(id) = window_id else { continue };
                    match self.windows.heartbeat(id, &run_holder, Utc::now()).await {
                        Ok(()) => {}
                        Err(e @ WindowError::NotLockHolder { .. }) => {
                            tracing::error!(window = %id, holder = %run_holder, error = %e, "window lock lost, stopping cache job");
                            handle.abort();
                            let _ = (&mut handle).await;
                            break None;
                        }
                        Err(e) => {
                            tracing::warn!(window = %id, error = %e, "window heartbeat failed");
                        }
                    }
                }
            }
        };

        let release = match window_id {
            Some(id) if joined.is_some() => {
                self.windows.release(id, &run_holder).await.map_err(|e| {
                    tracing::error!(window = %id, holder = %run_holder, error = %e, "window release failed");
                    e
                })
            }
            _ => Ok(()),
        };

        let outcome = match joined {
            None => Err(SchedulerError::LockLost {
                job: job.name.clone(),
                window: window.as_ref().map(|w| w.name.clone()).unwrap_or_default(),
            }),
            Some(Ok(Ok(progress))) => Ok(progress),
            Some(Ok(Err(e))) => Err(SchedulerError::JobFailed {
                job: job.name.clone(),
                message: format!("{e:#}"),
            }),
            Some(Err(e)) if e.is_panic() => Err(SchedulerError::JobPanicked {
                job: job.name.clone(),
            }),
            Some(Err(e)) => Err(SchedulerError::JobFailed {
                job: job.name.clone(),
                message: e.to_string(),
            }),
        };

        job.last_run_at = Some(now);
        job.last_run_succeeded = Some(outcome.is_ok());
        if let Ok(Some(progress)) = &outcome {
            job.cache_fill_progress = Some(*progress);
        }
        self.jobs.save(job).await?;

        match &outcome {
            Ok(_) => tracing::info!(job = %job.name, "cache job finished"),
            Err(e) => tracing::warn!(job = %job.name, error = %e, "cache job failed"),
        }
        outcome?;
        release?;

        Ok(RunReport {
            job_id: job.id,
            window_id,
            range,
            started_at: now,
            finished_at: Utc::now(),
            cache_fill_progress: job.cache_fill_progress,
        })
    }

    /// Period check then lock acquisition for a windowed job
    async fn admit(
        &self,
        job: &CacheProgress,
        window_id: Uuid,
        run_holder: &HolderId,
        now: DateTime<Utc>,
    ) -> SchedulerResult<PermissionWindow> {
        let window = self.windows.load(window_id).await?;
        if !window.is_within_window(&now) {
            return Err(SchedulerError::OutsideWindow {
                job: job.name.clone(),
                window: window.name.clone(),
            });
        }
        if !self.windows.try_acquire(window_id, run_holder, now).await? {
            let held_by = self
                .windows
                .load(window_id)
                .await
                .ok()
                .and_then(|w| w.lock.lock_held_by)
                .map(|h| h.to_string());
            return Err(SchedulerError::WindowLocked {
                window: window.name.clone(),
                held_by,
            });
        }
        Ok(window)
    }

    /// Gate `job` by `window_id`; the window must exist
    pub async fn link(&self, job: &mut CacheProgress, window_id: Uuid) -> SchedulerResult<()> {
        let window = self.windows.load(window_id).await?;
        job.permission_window_id = Some(window.id);
        self.jobs.save(job).await?;
        tracing::info!(job = %job.name, window = %window.name, "cache job linked to window");
        Ok(())
    }

    /// Clear the window reference and persist the job. The window, its lock
    /// and its other jobs are left as they are.
    pub async fn unlink(&self, job: &mut CacheProgress) -> SchedulerResult<()> {
        let Some(previous) = job.permission_window_id.take() else {
            return Ok(());
        };
        self.jobs.save(job).await?;
        tracing::info!(job = %job.name, window = %previous, "cache job unlinked from window");
        Ok(())
    }

    pub async fn jobs_for_window(&self, window_id: Uuid) -> SchedulerResult<Vec<CacheProgress>> {
        Ok(self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|job| job.permission_window_id == Some(window_id))
            .collect())
    }
}
