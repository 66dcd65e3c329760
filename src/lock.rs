use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::current_unix_millis;
use crate::error::{Result, UpdateError};
use crate::store::{AppLockClaim, Store};
use crate::worker::new_task_id;

/// Lock rows in sqlite, shared with every process using the same database.
#[derive(Clone, Debug)]
struct SharedLocks {
    store: Store,
    owner: Arc<str>,
    stale_after: Duration,
}

/// Non-blocking single-flight gate keyed by application id.
///
/// A second acquisition while the key is held fails immediately with
/// [`UpdateError::Busy`]; callers are expected to retry later. A registry
/// built with [`LockRegistry::shared`] also excludes other processes on the
/// same database.
#[derive(Clone, Default)]
pub struct LockRegistry {
    holders: Arc<Mutex<HashMap<i64, String>>>,
    shared: Option<SharedLocks>,
}

impl LockRegistry {
    /// Process-local registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows older than `stale_after` are considered abandoned and may be taken over.
    pub fn shared(store: Store, stale_after: Duration) -> Self {
        let owner = format!("{}-{}", std::process::id(), new_task_id());
        Self {
            holders: Arc::default(),
            shared: Some(SharedLocks {
                store,
                owner: owner.into(),
                stale_after,
            }),
        }
    }

    fn lock_holders(&self) -> MutexGuard<'_, HashMap<i64, String>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check and insert happen under one mutex acquisition, then one
    /// conditional insert claims the shared row.
    pub async fn try_acquire(&self, app_id: i64, holder: &str) -> Result<LockGuard> {
        {
            let mut holders = self.lock_holders();
            if let Some(existing) = holders.get(&app_id) {
                debug!(app_id, holder = %existing, "app-lock-busy");
                return Err(UpdateError::Busy(app_id));
            }
            holders.insert(app_id, holder.to_string());
        }
        let mut guard = LockGuard {
            holders: Arc::clone(&self.holders),
            app_id,
            holder: holder.to_string(),
            shared: None,
        };

        if let Some(shared) = &self.shared {
            let token = new_task_id();
            let now = current_unix_millis();
            let claim = AppLockClaim {
                app_id,
                owner: &shared.owner,
                token: &token,
                holder,
                acquired_at: now,
            };
            let stale_before = now - shared.stale_after.as_millis() as i64;
            if !shared.store.try_claim_app_lock(&claim, stale_before).await? {
                debug!(app_id, holder, "app-lock-busy in another process");
                return Err(UpdateError::Busy(app_id));
            }
            guard.shared = Some(SharedRelease {
                store: shared.store.clone(),
                token,
            });
        }
        Ok(guard)
    }

    #[cfg(test)]
    pub fn is_locked(&self, app_id: i64) -> bool {
        self.lock_holders().contains_key(&app_id)
    }

    /// Current holder, from this process or any other sharing the database.
    pub async fn holder(&self, app_id: i64) -> Option<String> {
        if let Some(holder) = self.lock_holders().get(&app_id).cloned() {
            return Some(holder);
        }
        let shared = self.shared.as_ref()?;
        shared.store.app_lock_holder(app_id).await.ok().flatten()
    }

    /// Drops every shared row this registry still owns. Called before the
    /// process exits so a short-lived command never leaves a row behind.
    pub async fn release_owned(&self) -> Result<u64> {
        match &self.shared {
            Some(shared) => shared.store.release_app_locks_owned_by(&shared.owner).await,
            None => Ok(0),
        }
    }
}

#[derive(Debug)]
struct SharedRelease {
    store: Store,
    token: String,
}

/// Releases the entry on drop, including during unwinding.
#[derive(Debug)]
pub struct LockGuard {
    holders: Arc<Mutex<HashMap<i64, String>>>,
    app_id: i64,
    holder: String,
    shared: Option<SharedRelease>,
}

impl LockGuard {
    pub fn app_id(&self) -> i64 {
        self.app_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Releases the shared row before returning.
    pub async fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            if let Err(err) = shared.store.release_app_lock(self.app_id, &shared.token).await {
                warn!(app_id = self.app_id, error = %err, "app-lock-release-failed");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        {
            let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());
            if holders.get(&self.app_id) == Some(&self.holder) {
                holders.remove(&self.app_id);
            }
        }
        let Some(shared) = self.shared.take() else {
            return;
        };
        let app_id = self.app_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = shared.store.release_app_lock(app_id, &shared.token).await {
                        warn!(app_id, error = %err, "app-lock-release-failed");
                    }
                });
            }
            // The row is reclaimed by this owner, by release_owned or once stale.
            Err(_) => debug!(app_id, "app-lock-release deferred no runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tokio::sync::Barrier;

    async fn shared_pair() -> (Store, LockRegistry, LockRegistry) {
        let store = Store::in_memory().await.unwrap();
        let daemon = LockRegistry::shared(store.clone(), Duration::from_secs(60));
        let cli = LockRegistry::shared(store.clone(), Duration::from_secs(60));
        (store, daemon, cli)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn second_acquire_is_busy_until_release() {
        let locks = LockRegistry::new();
        let guard = locks.try_acquire(1, "task-a").await.unwrap();
        assert_eq!(locks.holder(1).await.as_deref(), Some("task-a"));

        let err = locks.try_acquire(1, "task-b").await.unwrap_err();
        assert_eq!(err.code(), "busy");
        // Other keys are independent.
        let other = locks.try_acquire(2, "task-b").await.unwrap();

        drop(guard);
        assert!(!locks.is_locked(1));
        assert!(locks.try_acquire(1, "task-c").await.is_ok());
        drop(other);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guard_is_released_on_panic() {
        let locks = LockRegistry::new();
        let cloned = locks.clone();
        let result = tokio::spawn(async move {
            let _guard = cloned.try_acquire(5, "panicking").await.unwrap();
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert!(!locks.is_locked(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_have_exactly_one_winner() {
        let locks = LockRegistry::new();
        let tasks = 8;
        let barrier = Arc::new(Barrier::new(tasks));
        let handles: Vec<_> = (0..tasks)
            .map(|i| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    // Keep the guard alive until every task has tried.
                    let guard = locks.try_acquire(9, &format!("t{i}")).await.ok();
                    barrier.wait().await;
                    guard.is_some()
                })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!locks.is_locked(9));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registries_on_one_database_exclude_each_other() {
        let (_store, daemon, cli) = shared_pair().await;
        let guard = daemon.try_acquire(1, "auto-rollback").await.unwrap();

        let err = cli.try_acquire(1, "manual-update").await.unwrap_err();
        assert_eq!(err.code(), "busy");
        assert!(!cli.is_locked(1));
        assert_eq!(cli.holder(1).await.as_deref(), Some("auto-rollback"));

        guard.release().await;
        let guard = cli.try_acquire(1, "manual-update").await.unwrap();
        assert_eq!(daemon.holder(1).await.as_deref(), Some("manual-update"));
        guard.release().await;
        assert!(daemon.holder(1).await.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reacquire_in_same_process_survives_pending_release() {
        let (_store, daemon, cli) = shared_pair().await;
        drop(daemon.try_acquire(3, "first").await.unwrap());
        let second = daemon.try_acquire(3, "second").await.unwrap();
        // Let the release spawned by the first guard run.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cli.holder(3).await.as_deref(), Some("second"));
        assert!(cli.try_acquire(3, "manual").await.is_err());
        second.release().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_rows_from_dead_processes_are_taken_over() {
        let (store, _daemon, cli) = shared_pair().await;
        let claim = AppLockClaim {
            app_id: 7,
            owner: "crashed",
            token: "t",
            holder: "update",
            acquired_at: 0,
        };
        assert!(store.try_claim_app_lock(&claim, 0).await.unwrap());

        let guard = cli.try_acquire(7, "manual-update").await.unwrap();
        assert_eq!(guard.holder(), "manual-update");
        guard.release().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_owned_clears_rows_left_without_a_runtime() {
        let (_store, daemon, cli) = shared_pair().await;
        let guard = daemon.try_acquire(8, "update").await.unwrap();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!daemon.is_locked(8));
        assert!(cli.try_acquire(8, "manual").await.is_err());

        assert_eq!(daemon.release_owned().await.unwrap(), 1);
        assert!(cli.try_acquire(8, "manual").await.is_ok());
    }
}
