//! Persistence of permission windows and their lock
//!
//! Lock transitions are single compare-and-set operations: the in-memory
//! store does them under one mutex guard, the SQL store as one conditional
//! UPDATE whose affected row count decides the outcome. Neither reads the
//! lock and then writes it in a separate step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{
    HolderId, LockPolicy, PermissionWindow, PermissionWindowPeriod, WindowError, WindowLock,
    WindowResult,
};
use crate::database::{DatabaseBackend, QueryRow, row_bool, row_i64, row_str};

/// Storage for permission windows and the atomic lock primitive
#[async_trait(?Send)]
pub trait WindowStore {
    /// Staleness policy applied by `try_acquire`
    fn policy(&self) -> &LockPolicy;

    async fn load(&self, id: Uuid) -> WindowResult<PermissionWindow>;

    /// Insert or update the window definition. Lock state is never written here.
    async fn save(&self, window: &PermissionWindow) -> WindowResult<()>;

    async fn list(&self) -> WindowResult<Vec<PermissionWindow>>;

    /// Take the lock for `holder` if it is free, already held by `holder`, or
    /// stale under the store's policy. Returns false without side effects
    /// otherwise.
    async fn try_acquire(&self, id: Uuid, holder: &HolderId, now: DateTime<Utc>)
    -> WindowResult<bool>;

    /// Free the lock. Fails with [`WindowError::NotLockHolder`] unless
    /// `holder` holds it.
    async fn release(&self, id: Uuid, holder: &HolderId) -> WindowResult<()>;

    /// Refresh the heartbeat of a lock `holder` holds
    async fn heartbeat(&self, id: Uuid, holder: &HolderId, now: DateTime<Utc>) -> WindowResult<()>;

    /// Operator override: free the lock whoever holds it, returning the
    /// previous holder
    async fn force_release(&self, id: Uuid) -> WindowResult<Option<HolderId>>;
}

#[async_trait(?Send)]
impl<S: WindowStore + ?Sized> WindowStore for Arc<S> {
    fn policy(&self) -> &LockPolicy {
        (**self).policy()
    }

    async fn load(&self, id: Uuid) -> WindowResult<PermissionWindow> {
        (**self).load(id).await
    }

    async fn save(&self, window: &PermissionWindow) -> WindowResult<()> {
        (**self).save(window).await
    }

    async fn list(&self) -> WindowResult<Vec<PermissionWindow>> {
        (**self).list().await
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &HolderId,
        now: DateTime<Utc>,
    ) -> WindowResult<bool> {
        (**self).try_acquire(id, holder, now).await
    }

    async fn release(&self, id: Uuid, holder: &HolderId) -> WindowResult<()> {
        (**self).release(id, holder).await
    }

    async fn heartbeat(&self, id: Uuid, holder: &HolderId, now: DateTime<Utc>) -> WindowResult<()> {
        (**self).heartbeat(id, holder, now).await
    }

    async fn force_release(&self, id: Uuid) -> WindowResult<Option<HolderId>> {
        (**self).force_release(id).await
    }
}

fn not_holder(id: Uuid, holder: &HolderId, lock: &WindowLock) -> WindowError {
    WindowError::NotLockHolder {
        window: id,
        holder: holder.to_string(),
        current: lock
            .lock_held_by
            .as_ref()
            .filter(|_| lock.locked_because_running)
            .map(|h| h.to_string()),
    }
}

/// Process-local store, for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<Uuid, PermissionWindow>>,
    policy: LockPolicy,
}

impl InMemoryWindowStore {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn with_windows<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, PermissionWindow>) -> T) -> T {
        // A poisoned map is still consistent: every mutation is a single assignment
        let mut guard = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait(?Send)]
impl WindowStore for InMemoryWindowStore {
    fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    async fn load(&self, id: Uuid) -> WindowResult<PermissionWindow> {
        self.with_windows(|w| w.get(&id).cloned())
            .ok_or(WindowError::NotFound(id))
    }

    async fn save(&self, window: &PermissionWindow) -> WindowResult<()> {
        self.with_windows(|w| match w.get_mut(&window.id) {
            Some(existing) => {
                existing.name = window.name.clone();
                existing.description = window.description.clone();
                existing.periods = window.periods.clone();
            }
            None => {
                let mut fresh = window.clone();
                fresh.lock = WindowLock::default();
                w.insert(window.id, fresh);
            }
        });
        Ok(())
    }

    async fn list(&self) -> WindowResult<Vec<PermissionWindow>> {
        let mut windows: Vec<_> = self.with_windows(|w| w.values().cloned().collect());
        windows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(windows)
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &HolderId,
        now: DateTime<Utc>,
    ) -> WindowResult<bool> {
        let policy = self.policy;
        self.with_windows(|w| {
            let window = w.get_mut(&id).ok_or(WindowError::NotFound(id))?;
            let lock = &mut window.lock;
            if !lock.available_to(holder, &policy, now) {
                return Ok(false);
            }
            if lock.is_stale(&policy, now) && !lock.is_held_by(holder) {
                tracing::warn!(
                    window = %id,
                    previous = ?lock.lock_held_by.as_ref().map(|h| h.as_str()),
                    holder = %holder,
                    "taking over stale window lock"
                );
            }
            if !lock.is_held_by(holder) {
                lock.locked_at = Some(now);
            }
            lock.locked_because_running = true;
            lock.lock_held_by = Some(holder.clone());
            lock.heartbeat_at = Some(now);
            Ok(true)
        })
    }

    async fn release(&self, id: Uuid, holder: &HolderId) -> WindowResult<()> {
        self.with_windows(|w| {
            let window = w.get_mut(&id).ok_or(WindowError::NotFound(id))?;
            if !window.lock.is_held_by(holder) {
                return Err(not_holder(id, holder, &window.lock));
            }
            window.lock = WindowLock::default();
            Ok(())
        })
    }

    async fn heartbeat(&self, id: Uuid, holder: &HolderId, now: DateTime<Utc>) -> WindowResult<()> {
        self.with_windows(|w| {
            let window = w.get_mut(&id).ok_or(WindowError::NotFound(id))?;
            if !window.lock.is_held_by(holder) {
                return Err(not_holder(id, holder, &window.lock));
            }
            window.lock.heartbeat_at = Some(now);
            Ok(())
        })
    }

    async fn force_release(&self, id: Uuid) -> WindowResult<Option<HolderId>> {
        let previous = self.with_windows(|w| {
            let window = w.get_mut(&id).ok_or(WindowError::NotFound(id))?;
            let previous = window.lock.lock_held_by.take();
            window.lock = WindowLock::default();
            Ok::<_, WindowError>(previous)
        })?;
        tracing::warn!(window = %id, previous = ?previous, "window lock force-released");
        Ok(previous)
    }
}

const SELECT_WINDOWS: &str = "SELECT id, name, description, periods, locked_because_running, \
     lock_held_by, locked_at_ms, heartbeat_at_ms FROM permission_windows";

/// Store backed by the engine's `permission_windows` table, safe across
/// processes sharing one database
pub struct SqlWindowStore {
    backend: Arc<dyn DatabaseBackend>,
    policy: LockPolicy,
}

impl SqlWindowStore {
    /// The schema must already be initialised on `backend`
    pub fn new(backend: Arc<dyn DatabaseBackend>, policy: LockPolicy) -> Self {
        Self { backend, policy }
    }

    fn window_from_row(row: &QueryRow) -> WindowResult<PermissionWindow> {
        let raw_id = row_str(row, "id").unwrap_or_default();
        let corrupt = |reason: String| WindowError::CorruptRecord {
            window: raw_id.clone(),
            reason,
        };
        let id = Uuid::parse_str(&raw_id).map_err(|e| corrupt(e.to_string()))?;
        let periods: Vec<PermissionWindowPeriod> =
            serde_json::from_str(&row_str(row, "periods").unwrap_or_else(|| "[]".into()))
                .map_err(|e| corrupt(e.to_string()))?;
        let millis = |column: &str| row_i64(row, column).and_then(DateTime::from_timestamp_millis);

        Ok(PermissionWindow {
            id,
            name: row_str(row, "name").unwrap_or_default(),
            description: row_str(row, "description"),
            periods,
            lock: WindowLock {
                locked_because_running: row_bool(row, "locked_because_running"),
                lock_held_by: row_str(row, "lock_held_by").map(HolderId::new),
                locked_at: millis("locked_at_ms"),
                heartbeat_at: millis("heartbeat_at_ms"),
            },
        })
    }

    /// Explain a zero-row lock update: missing window or someone else's lock
    async fn lock_conflict(&self, id: Uuid, holder: &HolderId) -> WindowError {
        match self.load(id).await {
            Ok(window) => not_holder(id, holder, &window.lock),
            Err(e) => e,
        }
    }
}

#[async_trait(?Send)]
impl WindowStore for SqlWindowStore {
    fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    async fn load(&self, id: Uuid) -> WindowResult<PermissionWindow> {
        let result = self
            .backend
            .execute_query_params(
                &format!("{SELECT_WINDOWS} WHERE id = $1"),
                &[json!(id.to_string())],
            )
            .await?;
        match result.first() {
            Some(row) => Self::window_from_row(row),
            None => Err(WindowError::NotFound(id)),
        }
    }

    async fn save(&self, window: &PermissionWindow) -> WindowResult<()> {
        let periods = serde_json::to_string(&window.periods).map_err(|e| {
            WindowError::CorruptRecord {
                window: window.id.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.backend
            .execute_statement(
                "INSERT INTO permission_windows (id, name, description, periods) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
                 description = EXCLUDED.description, periods = EXCLUDED.periods",
                &[
                    json!(window.id.to_string()),
                    json!(window.name),
                    window.description.as_ref().map_or(Value::Null, |d| json!(d)),
                    json!(periods),
                ],
            )
            .await?;
        tracing::debug!(window = %window.id, name = %window.name, "permission window saved");
        Ok(())
    }

    async fn list(&self) -> WindowResult<Vec<PermissionWindow>> {
        let result = self
            .backend
            .execute_query(&format!("{SELECT_WINDOWS} ORDER BY name"))
            .await?;
        result.rows.iter().map(Self::window_from_row).collect()
    }

    async fn try_acquire(
        &self,
        id: Uuid,
        holder: &HolderId,
        now: DateTime<Utc>,
    ) -> WindowResult<bool> {
        // Read first only to report what was replaced; the UPDATE decides
        let before = self.load(id).await?.lock;
        let stale_before = self
            .policy
            .stale_before(now)
            .map_or(i64::MIN, |t| t.timestamp_millis());

        let affected = self
            .backend
            .execute_statement(
                "UPDATE permission_windows SET \
                 locked_because_running = TRUE, \
                 lock_held_by = $1, \
                 locked_at_ms = CASE WHEN locked_because_running AND lock_held_by = $1 \
                   THEN locked_at_ms ELSE $2 END, \
                 heartbeat_at_ms = $2 \
                 WHERE id = $3 AND (locked_because_running = FALSE \
                   OR lock_held_by = $1 OR heartbeat_at_ms < $4)",
                &[
                    json!(holder.as_str()),
                    json!(now.timestamp_millis()),
                    json!(id.to_string()),
                    json!(stale_before),
                ],
            )
            .await?;

        if affected == 0 {
            tracing::debug!(window = %id, holder = %holder, "window lock busy");
            return Ok(false);
        }
        if before.locked_because_running && !before.is_held_by(holder) {
            tracing::warn!(
                window = %id,
                previous = ?before.lock_held_by.as_ref().map(|h| h.as_str()),
                holder = %holder,
                "taking over stale window lock"
            );
        }
        tracing::debug!(window = %id, holder = %holder, "window lock acquired");
        Ok(true)
    }

    async fn release(&self, id: Uuid, holder: &HolderId) -> WindowResult<()> {
        let affected = self
            .backend
            .execute_statement(
                "UPDATE permission_windows SET locked_because_running = FALSE, \
                 lock_held_by = NULL, locked_at_ms = NULL, heartbeat_at_ms = NULL \
                 WHERE id = $1 AND locked_because_running = TRUE AND lock_held_by = $2",
                &[json!(id.to_string()), json!(holder.as_str())],
            )
            .await?;
        if affected == 0 {
            return Err(self.lock_conflict(id, holder).await);
        }
        tracing::debug!(window = %id, holder = %holder, "window lock released");
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, holder: &HolderId, now: DateTime<Utc>) -> WindowResult<()> {
        let affected = self
            .backend
            .execute_statement(
                "UPDATE permission_windows SET heartbeat_at_ms = $1 \
                 WHERE id = $2 AND locked_because_running = TRUE AND lock_held_by = $3",
                &[
                    json!(now.timestamp_millis()),
                    json!(id.to_string()),
                    json!(holder.as_str()),
                ],
            )
            .await?;
        if affected == 0 {
            return Err(self.lock_conflict(id, holder).await);
        }
        Ok(())
    }

    async fn force_release(&self, id: Uuid) -> WindowResult<Option<HolderId>> {
        let previous = self.load(id).await?.lock.lock_held_by;
        self.backend
            .execute_statement(
                "UPDATE permission_windows SET locked_because_running = FALSE, \
                 lock_held_by = NULL, locked_at_ms = NULL, heartbeat_at_ms = NULL \
                 WHERE id = $1",
                &[json!(id.to_string())],
            )
            .await?;
        tracing::warn!(window = %id, previous = ?previous, "window lock force-released");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn seeded(store: &dyn WindowStore) -> Uuid {
        let window = PermissionWindow::new("Nightly")
            .with_period("Mon 22:00-06:00".parse().unwrap());
        store.save(&window).await.unwrap();
        window.id
    }

    #[tokio::test]
    async fn test_in_memory_acquire_is_exclusive_and_reentrant() {
        let store = InMemoryWindowStore::new(LockPolicy::never_expire());
        let id = seeded(&store).await;
        let a = HolderId::new("a");
        let b = HolderId::new("b");
        let now = at("2024-01-01T23:00:00Z");

        assert!(store.try_acquire(id, &a, now).await.unwrap());
        assert!(!store.try_acquire(id, &b, now).await.unwrap());
        assert!(store.try_acquire(id, &a, now).await.unwrap());

        let lock = store.load(id).await.unwrap().lock;
        assert_eq!(lock.lock_held_by, Some(a.clone()));
        assert_eq!(lock.locked_at, Some(now));
    }

    #[tokio::test]
    async fn test_in_memory_release_by_non_holder_leaves_lock() {
        let store = InMemoryWindowStore::new(LockPolicy::never_expire());
        let id = seeded(&store).await;
        let a = HolderId::new("a");
        store.try_acquire(id, &a, Utc::now()).await.unwrap();

        let err = store.release(id, &HolderId::new("b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Concurrency);
        assert!(store.load(id).await.unwrap().lock.is_held_by(&a));

        store.release(id, &a).await.unwrap();
        assert!(!store.load(id).await.unwrap().lock.locked_because_running);
    }

    #[tokio::test]
    async fn test_save_does_not_touch_lock() {
        let store = InMemoryWindowStore::new(LockPolicy::never_expire());
        let id = seeded(&store).await;
        let a = HolderId::new("a");
        store.try_acquire(id, &a, Utc::now()).await.unwrap();

        let mut edited = store.load(id).await.unwrap();
        edited.name = "Weekend".into();
        edited.lock = WindowLock::default();
        store.save(&edited).await.unwrap();

        let stored = store.load(id).await.unwrap();
        assert_eq!(stored.name, "Weekend");
        assert!(stored.lock.is_held_by(&a));
    }

    #[tokio::test]
    async fn test_unknown_window() {
        let store = InMemoryWindowStore::new(LockPolicy::default());
        let id = Uuid::new_v4();
        let err = store.try_acquire(id, &HolderId::new("a"), Utc::now()).await.unwrap_err();
        assert!(matches!(err, WindowError::NotFound(w) if w == id));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_in_memory_stale_takeover_and_force_release() {
        let store = InMemoryWindowStore::new(LockPolicy::with_ttl(Duration::from_secs(60)));
        let id = seeded(&store).await;
        let crashed = HolderId::new("crashed");
        let next = HolderId::new("next");
        let t0 = at("2024-01-01T22:00:00Z");

        store.try_acquire(id, &crashed, t0).await.unwrap();
        assert!(!store.try_acquire(id, &next, at("2024-01-01T22:00:59Z")).await.unwrap());
        assert!(store.try_acquire(id, &next, at("2024-01-01T22:01:01Z")).await.unwrap());
        assert!(store.release(id, &crashed).await.is_err());

        let previous = store.force_release(id).await.unwrap();
        assert_eq!(previous, Some(next));
    }

    #[cfg(feature = "duckdb-backend")]
    mod sql {
        use super::*;
        use crate::database::{DuckDBBackend, initialize_schema};

        async fn store(policy: LockPolicy) -> SqlWindowStore {
            let backend = Arc::new(DuckDBBackend::in_memory().unwrap());
            initialize_schema(backend.as_ref()).await.unwrap();
            SqlWindowStore::new(backend, policy)
        }

        #[tokio::test]
        async fn test_sql_window_round_trip() {
            let store = store(LockPolicy::never_expire()).await;
            let window = PermissionWindow::new("Office")
                .with_description("weekday daytime")
                .with_period("Mon 09:00-17:00".parse().unwrap())
                .with_period("2024-01-01T00:00:00Z/2024-01-02T00:00:00Z".parse().unwrap());
            store.save(&window).await.unwrap();

            let loaded = store.load(window.id).await.unwrap();
            assert_eq!(loaded, window);
            assert_eq!(store.list().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_sql_cas_acquire_and_guarded_release() {
            let store = store(LockPolicy::never_expire()).await;
            let id = seeded(&store).await;
            let a = HolderId::new("a");
            let b = HolderId::new("b");
            let t0 = at("2024-01-01T22:00:00Z");
            let t1 = at("2024-01-01T22:05:00Z");

            assert!(store.try_acquire(id, &a, t0).await.unwrap());
            assert!(!store.try_acquire(id, &b, t1).await.unwrap());
            // Re-entrant acquire keeps the original lock time
            assert!(store.try_acquire(id, &a, t1).await.unwrap());
            let lock = store.load(id).await.unwrap().lock;
            assert_eq!(lock.locked_at, Some(t0));
            assert_eq!(lock.heartbeat_at, Some(t1));

            let err = store.release(id, &b).await.unwrap_err();
            assert!(matches!(
                err,
                WindowError::NotLockHolder { current: Some(ref c), .. } if c == "a"
            ));
            store.heartbeat(id, &a, t1).await.unwrap();
            store.release(id, &a).await.unwrap();
            assert!(store.try_acquire(id, &b, t1).await.unwrap());
        }

        #[tokio::test]
        async fn test_sql_stale_lock_reclaimed_after_ttl() {
            let store = store(LockPolicy::with_ttl(Duration::from_secs(300))).await;
            let id = seeded(&store).await;
            let crashed = HolderId::new("crashed");
            let next = HolderId::new("next");

            store.try_acquire(id, &crashed, at("2024-01-01T22:00:00Z")).await.unwrap();
            assert!(!store.try_acquire(id, &next, at("2024-01-01T22:04:00Z")).await.unwrap());
            assert!(store.try_acquire(id, &next, at("2024-01-01T22:06:00Z")).await.unwrap());
            let err = store
                .heartbeat(id, &crashed, at("2024-01-01T22:06:30Z"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Concurrency);
        }

        #[tokio::test]
        async fn test_sql_missing_window() {
            let store = store(LockPolicy::default()).await;
            let id = Uuid::new_v4();
            assert!(matches!(
                store.release(id, &HolderId::new("a")).await,
                Err(WindowError::NotFound(_))
            ));
            assert!(matches!(
                store.try_acquire(id, &HolderId::new("a"), Utc::now()).await,
                Err(WindowError::NotFound(_))
            ));
        }
    }
}
