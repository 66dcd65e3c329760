use std::fs::{self, File};
use std::path::Path;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::warn;

use crate::error::{Result, UpdateError};
use crate::model::{Application, UpdateHistoryRecord, UpdateState};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const APP_COLUMNS: &str = "id, name, container_id, checksum, download_url, local_path, \
     credential_ref, basic_auth_username, basic_auth_password, version, latest_update_at, \
     auto_restart, check_checksum, schedule_restart, restart_at, schedule_update, update_at, \
     endpoint, auto_rollback, reload_command";

const HISTORY_COLUMNS: &str = "id, app_id, updated_at, checksum, state, backup_path, keep";

/// Persistence for applications and their update history.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if !trimmed.starts_with("sqlite:") {
            return Err(UpdateError::Configuration(format!(
                "unsupported database url: {trimmed} (only sqlite is supported)"
            )));
        }
        ensure_sqlite_storage(trimmed)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(trimmed)
            .await?;
        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database, migrated.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await.map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    /// Monotonically increasing identifier shared by all entities.
    pub async fn next_id(&self) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE id_sequence SET next_id = next_id + 1 WHERE name = 'global' RETURNING next_id",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("next_id"))
    }

    pub async fn get_app(&self, id: i64) -> Result<Option<Application>> {
        let row = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(app_from_row))
    }

    pub async fn require_app(&self, id: i64) -> Result<Application> {
        self.get_app(id)
            .await?
            .ok_or_else(|| UpdateError::app_not_found(id))
    }

    pub async fn list_apps(&self) -> Result<Vec<Application>> {
        let rows = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(app_from_row).collect())
    }

    /// Upserts by id.
    pub async fn save_app(&self, app: &Application) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO apps ({APP_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               name = excluded.name, \
               container_id = excluded.container_id, \
               checksum = excluded.checksum, \
               download_url = excluded.download_url, \
               local_path = excluded.local_path, \
               credential_ref = excluded.credential_ref, \
               basic_auth_username = excluded.basic_auth_username, \
               basic_auth_password = excluded.basic_auth_password, \
               version = excluded.version, \
               latest_update_at = excluded.latest_update_at, \
               auto_restart = excluded.auto_restart, \
               check_checksum = excluded.check_checksum, \
               schedule_restart = excluded.schedule_restart, \
               restart_at = excluded.restart_at, \
               schedule_update = excluded.schedule_update, \
               update_at = excluded.update_at, \
               endpoint = excluded.endpoint, \
               auto_rollback = excluded.auto_rollback, \
               reload_command = excluded.reload_command"
        ))
        .bind(app.id)
        .bind(&app.name)
        .bind(&app.container_id)
        .bind(&app.checksum)
        .bind(&app.download_url)
        .bind(&app.local_path)
        .bind(&app.credential_ref)
        .bind(&app.basic_auth_username)
        .bind(&app.basic_auth_password)
        .bind(&app.version)
        .bind(app.latest_update_at)
        .bind(app.auto_restart)
        .bind(app.check_checksum)
        .bind(app.schedule_restart)
        .bind(&app.restart_at)
        .bind(app.schedule_update)
        .bind(&app.update_at)
        .bind(&app.endpoint)
        .bind(app.auto_rollback)
        .bind(&app.reload_command)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_app(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_history(&self, id: i64) -> Result<Option<UpdateHistoryRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM update_history WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(history_from_row).transpose()
    }

    /// Newest first; ties broken by id.
    pub async fn list_history_by_app(&self, app_id: i64) -> Result<Vec<UpdateHistoryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM update_history WHERE app_id = ? \
             ORDER BY updated_at DESC, id DESC"
        ))
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    pub async fn list_history_by_state(
        &self,
        state: UpdateState,
    ) -> Result<Vec<UpdateHistoryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM update_history WHERE state = ? ORDER BY id"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    pub async fn save_history(&self, record: &UpdateHistoryRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO update_history ({HISTORY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               app_id = excluded.app_id, \
               updated_at = excluded.updated_at, \
               checksum = excluded.checksum, \
               state = excluded.state, \
               backup_path = excluded.backup_path, \
               keep = excluded.keep"
        ))
        .bind(record.id)
        .bind(record.app_id)
        .bind(record.updated_at)
        .bind(&record.checksum)
        .bind(record.state.as_str())
        .bind(&record.backup_path)
        .bind(record.keep)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_history(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM update_history WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Moves a record to `to` only while it is still in `from`. Returns false
    /// when the record was deleted or already settled.
    pub async fn transition_history(
        &self,
        id: i64,
        from: UpdateState,
        to: UpdateState,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE update_history SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Claims the shared lock row for an app. A row left behind by the same
    /// owner, or acquired before `stale_before`, is taken over.
    pub async fn try_claim_app_lock(
        &self,
        claim: &AppLockClaim<'_>,
        stale_before: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO app_locks (app_id, owner, token, holder, acquired_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(app_id) DO UPDATE SET \
               owner = excluded.owner, \
               token = excluded.token, \
               holder = excluded.holder, \
               acquired_at = excluded.acquired_at \
             WHERE app_locks.owner = excluded.owner OR app_locks.acquired_at < ?",
        )
        .bind(claim.app_id)
        .bind(claim.owner)
        .bind(claim.token)
        .bind(claim.holder)
        .bind(claim.acquired_at)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn release_app_lock(&self, app_id: i64, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_locks WHERE app_id = ? AND token = ?")
            .bind(app_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn release_app_locks_owned_by(&self, owner: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM app_locks WHERE owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn app_lock_holder(&self, app_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT holder FROM app_locks WHERE app_id = ?")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("holder")))
    }
}

/// One row of the `app_locks` table.
#[derive(Debug)]
pub struct AppLockClaim<'a> {
    pub app_id: i64,
    pub owner: &'a str,
    pub token: &'a str,
    pub holder: &'a str,
    pub acquired_at: i64,
}

fn app_from_row(row: &SqliteRow) -> Application {
    Application {
        id: row.get("id"),
        name: row.get("name"),
        container_id: row.get("container_id"),
        checksum: row.get("checksum"),
        download_url: row.get("download_url"),
        local_path: row.get("local_path"),
        credential_ref: row.get("credential_ref"),
        basic_auth_username: row.get("basic_auth_username"),
        basic_auth_password: row.get("basic_auth_password"),
        version: row.get("version"),
        latest_update_at: row.get("latest_update_at"),
        auto_restart: row.get("auto_restart"),
        check_checksum: row.get("check_checksum"),
        schedule_restart: row.get("schedule_restart"),
        restart_at: row.get("restart_at"),
        schedule_update: row.get("schedule_update"),
        update_at: row.get("update_at"),
        endpoint: row.get("endpoint"),
        auto_rollback: row.get("auto_rollback"),
        reload_command: row.get("reload_command"),
    }
}

fn history_from_row(row: &SqliteRow) -> Result<UpdateHistoryRecord> {
    let raw_state: String = row.get("state");
    let state = UpdateState::from_db(&raw_state)
        .ok_or_else(|| UpdateError::InvalidState(format!("unknown history state {raw_state}")))?;
    Ok(UpdateHistoryRecord {
        id: row.get("id"),
        app_id: row.get("app_id"),
        updated_at: row.get("updated_at"),
        checksum: row.get("checksum"),
        state,
        backup_path: row.get("backup_path"),
        keep: row.get("keep"),
    })
}

/// Creates the parent directory and the database file so sqlite can open it.
fn ensure_sqlite_storage(conn: &str) -> Result<()> {
    let Some(raw) = conn.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let raw = raw.split('?').next().unwrap_or(raw);
    if raw.is_empty() || raw.starts_with(':') {
        return Ok(());
    }
    let path = Path::new(raw);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            warn!(path = %parent.display(), error = %err, "db-dir-create-failed");
            err
        })?;
    }
    if !path.exists() {
        File::create(path).map_err(|err| {
            warn!(path = %path.display(), error = %err, "db-file-create-failed");
            err
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_app(id: i64) -> Application {
        Application {
            id,
            name: format!("app-{id}"),
            container_id: Some("c1".into()),
            download_url: Some("http://example.invalid/app.jar".into()),
            local_path: Some("/tmp/app.jar".into()),
            auto_restart: true,
            check_checksum: Some(true),
            auto_rollback: None,
            ..Default::default()
        }
    }

    fn record(id: i64, app_id: i64, updated_at: i64, state: UpdateState) -> UpdateHistoryRecord {
        UpdateHistoryRecord {
            id,
            app_id,
            updated_at,
            checksum: format!("{id:032x}"),
            state,
            backup_path: None,
            keep: false,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transition_only_moves_records_still_in_the_source_state() {
        let store = Store::in_memory().await.unwrap();
        store
            .save_history(&record(1, 9, 100, UpdateState::Checking))
            .await
            .unwrap();

        assert!(store
            .transition_history(1, UpdateState::Checking, UpdateState::Success)
            .await
            .unwrap());
        assert!(!store
            .transition_history(1, UpdateState::Checking, UpdateState::Fail)
            .await
            .unwrap());
        assert_eq!(
            store.get_history(1).await.unwrap().unwrap().state,
            UpdateState::Success
        );

        assert!(!store
            .transition_history(2, UpdateState::Checking, UpdateState::Success)
            .await
            .unwrap());
        assert!(store.get_history(2).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn app_lock_claims_respect_owner_and_staleness() {
        let store = Store::in_memory().await.unwrap();
        let claim = |owner: &'static str, token: &'static str, acquired_at: i64| AppLockClaim {
            app_id: 4,
            owner,
            token,
            holder: token,
            acquired_at,
        };

        assert!(store.try_claim_app_lock(&claim("daemon", "t1", 1_000), 0).await.unwrap());
        assert!(!store.try_claim_app_lock(&claim("cli", "t2", 1_500), 500).await.unwrap());
        assert_eq!(store.app_lock_holder(4).await.unwrap().as_deref(), Some("t1"));

        // Same owner re-claims its own leftover row.
        assert!(store.try_claim_app_lock(&claim("daemon", "t3", 1_600), 500).await.unwrap());
        // Older than the stale cutoff: anyone may take it.
        assert!(store.try_claim_app_lock(&claim("cli", "t4", 9_000), 2_000).await.unwrap());
        assert_eq!(store.app_lock_holder(4).await.unwrap().as_deref(), Some("t4"));

        store.release_app_lock(4, "t3").await.unwrap();
        assert!(store.app_lock_holder(4).await.unwrap().is_some());
        assert_eq!(store.release_app_locks_owned_by("cli").await.unwrap(), 1);
        assert!(store.app_lock_holder(4).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ids_are_monotonic() {
        let store = Store::in_memory().await.unwrap();
        let a = store.next_id().await.unwrap();
        let b = store.next_id().await.unwrap();
        let c = store.next_id().await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn app_upsert_round_trips_all_fields() {
        let store = Store::in_memory().await.unwrap();
        let mut app = sample_app(1);
        store.save_app(&app).await.unwrap();
        assert_eq!(store.get_app(1).await.unwrap(), Some(app.clone()));

        app.checksum = Some("abc".into());
        app.auto_rollback = Some(false);
        app.latest_update_at = Some(42);
        store.save_app(&app).await.unwrap();
        assert_eq!(store.list_apps().await.unwrap(), vec![app]);

        assert!(store.delete_app(1).await.unwrap());
        assert!(!store.delete_app(1).await.unwrap());
        assert_eq!(
            store.require_app(1).await.unwrap_err().code(),
            "not-found"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn history_is_listed_newest_first() {
        let store = Store::in_memory().await.unwrap();
        store
            .save_history(&record(1, 7, 100, UpdateState::Success))
            .await
            .unwrap();
        store
            .save_history(&record(2, 7, 300, UpdateState::Checking))
            .await
            .unwrap();
        store
            .save_history(&record(3, 7, 300, UpdateState::Fail))
            .await
            .unwrap();
        store
            .save_history(&record(4, 8, 500, UpdateState::Checking))
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .list_history_by_app(7)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let checking: Vec<i64> = store
            .list_history_by_state(UpdateState::Checking)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(checking, vec![2, 4]);

        let mut updated = record(2, 7, 300, UpdateState::Success);
        updated.keep = true;
        store.save_history(&updated).await.unwrap();
        assert_eq!(store.get_history(2).await.unwrap(), Some(updated));
    }

    #[test]
    fn storage_is_created_for_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/state.db");
        ensure_sqlite_storage(&format!("sqlite://{}", db.display())).unwrap();
        assert!(db.is_file());
        ensure_sqlite_storage("sqlite::memory:").unwrap();
    }
}
