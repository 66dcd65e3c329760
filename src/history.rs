use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::checksum::{ChecksumCache, file_md5};
use crate::current_unix_millis;
use crate::error::{Result, UpdateError};
use crate::events::AppEventListener;
use crate::fetch::Artifact;
use crate::model::{Application, HistoryView, UpdateHistoryRecord, UpdateState};
use crate::store::Store;

/// Keeps update history records and their backup files.
#[derive(Clone)]
pub struct HistoryService {
    store: Store,
    backup_dir: PathBuf,
    cache: ChecksumCache,
}

impl HistoryService {
    pub fn new(store: Store, backup_dir: impl Into<PathBuf>, cache: ChecksumCache) -> Self {
        Self {
            store,
            backup_dir: backup_dir.into(),
            cache,
        }
    }

    pub async fn list_history(&self, app_id: i64) -> Result<Vec<HistoryView>> {
        let records = self.store.list_history_by_app(app_id).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let backup_exists = record.backup_exists();
            let rollback_eligible = backup_exists && self.rollback_eligible(&record).await;
            out.push(HistoryView {
                record,
                backup_exists,
                rollback_eligible,
            });
        }
        Ok(out)
    }

    /// Only confirmed records may be exempted from pruning.
    pub async fn set_keep(&self, history_id: i64, keep: bool) -> Result<UpdateHistoryRecord> {
        let mut record = self
            .store
            .get_history(history_id)
            .await?
            .ok_or_else(|| UpdateError::history_not_found(history_id))?;
        if record.state != UpdateState::Success {
            return Err(UpdateError::InvalidState(format!(
                "history record {history_id} is {}; only success records can be kept",
                record.state.as_str()
            )));
        }
        record.keep = keep;
        self.store.save_history(&record).await?;
        Ok(record)
    }

    /// Backup present and still hashing to the recorded checksum.
    pub async fn rollback_eligible(&self, record: &UpdateHistoryRecord) -> bool {
        let Some(path) = record.backup_path.clone() else {
            return false;
        };
        let cache = self.cache.clone();
        let expected = record.checksum.clone();
        tokio::task::spawn_blocking(move || cache.matches(Path::new(&path), &expected))
            .await
            .unwrap_or(false)
    }

    /// Most recent eligible `Success` record, by update time.
    pub async fn latest_eligible_success(
        &self,
        app_id: i64,
    ) -> Result<Option<UpdateHistoryRecord>> {
        for record in self.store.list_history_by_app(app_id).await? {
            if record.state == UpdateState::Success && self.rollback_eligible(&record).await {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Settles a `Checking` record. Returns false when a newer update already
    /// superseded it.
    pub async fn mark(&self, record: &UpdateHistoryRecord, state: UpdateState) -> Result<bool> {
        self.store
            .transition_history(record.id, UpdateState::Checking, state)
            .await
    }

    /// Drops every `Fail` record and `Success` records beyond `retention`,
    /// newest first; kept records are exempt. Returns the number removed.
    pub async fn prune(&self, app_id: i64, retention: usize) -> Result<usize> {
        let mut remaining = retention;
        let mut removed = 0;
        for record in self.store.list_history_by_app(app_id).await? {
            if record.keep {
                continue;
            }
            let drop_it = match record.state {
                UpdateState::Fail => true,
                UpdateState::Success if remaining > 0 => {
                    remaining -= 1;
                    false
                }
                UpdateState::Success => true,
                UpdateState::Checking => false,
            };
            if drop_it {
                self.delete_record(&record).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(app_id, removed, retention, "history-pruned");
        }
        Ok(removed)
    }

    async fn delete_record(&self, record: &UpdateHistoryRecord) -> Result<()> {
        self.store.delete_history(record.id).await?;
        self.remove_backup(record);
        Ok(())
    }

    fn remove_backup(&self, record: &UpdateHistoryRecord) {
        let Some(path) = record.backup_path.as_deref().filter(|p| !p.trim().is_empty()) else {
            return;
        };
        let path = Path::new(path);
        self.cache.invalidate(path);
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                history_id = record.id,
                path = %path.display(),
                error = %err,
                "backup-remove-failed"
            ),
        }
    }

    fn app_backup_dir(&self, app: &Application) -> PathBuf {
        self.backup_dir.join(sanitize_dir_name(&app.name, app.id))
    }

    /// Snapshot of the deployed artifact, or of the archive payload when given.
    /// Failures are logged and yield `None`.
    async fn backup(&self, app: &Application, artifact: Option<&Artifact>) -> Option<String> {
        let dir = self.app_backup_dir(app);
        let (file_name, source) = match artifact {
            Some(artifact) => (
                artifact.file_name.clone(),
                BackupSource::Bytes(artifact.bytes.clone()),
            ),
            None => {
                let Some(local) = app.local_path.as_deref() else {
                    warn!(app_id = app.id, app = %app.name, "backup-skipped no local path");
                    return None;
                };
                let local = PathBuf::from(local);
                if !local.is_file() {
                    warn!(
                        app_id = app.id,
                        app = %app.name,
                        path = %local.display(),
                        "backup-skipped local artifact missing or not a file"
                    );
                    return None;
                }
                (app.artifact_name(), BackupSource::File(local))
            }
        };

        let result = tokio::task::spawn_blocking(move || write_backup(&dir, &file_name, source))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        match result {
            Ok(path) => {
                info!(app_id = app.id, app = %app.name, path = %path.display(), "backup-created");
                Some(path.to_string_lossy().into_owned())
            }
            Err(err) => {
                warn!(app_id = app.id, app = %app.name, error = %err, "backup-failed");
                None
            }
        }
    }
}

enum BackupSource {
    File(PathBuf),
    Bytes(std::sync::Arc<Vec<u8>>),
}

fn write_backup(dir: &Path, file_name: &str, source: BackupSource) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let mut stamp = current_unix_millis();
    let mut target = dir.join(format!("{file_name}.{stamp}"));
    while target.exists() {
        stamp += 1;
        target = dir.join(format!("{file_name}.{stamp}"));
    }
    match source {
        BackupSource::File(path) => {
            fs::copy(&path, &target)?;
            if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
                fs::OpenOptions::new()
                    .write(true)
                    .open(&target)?
                    .set_modified(modified)?;
            }
        }
        BackupSource::Bytes(bytes) => fs::write(&target, bytes.as_slice())?,
    }
    Ok(target)
}

fn sanitize_dir_name(name: &str, fallback_id: i64) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("app-{fallback_id}")
    } else {
        cleaned
    }
}

#[async_trait]
impl AppEventListener for HistoryService {
    /// Takes a baseline backup the first time an app is updated.
    async fn on_before_update(&self, app_id: i64) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        if !self.store.list_history_by_app(app_id).await?.is_empty() {
            return Ok(());
        }
        info!(app_id, app = %app.name, "history-empty taking baseline backup");
        let Some(backup_path) = self.backup(&app, None).await else {
            return Ok(());
        };
        let checksum = {
            let path = PathBuf::from(&backup_path);
            tokio::task::spawn_blocking(move || file_md5(&path))
                .await
                .map_err(io::Error::other)??
        };
        let record = UpdateHistoryRecord {
            id: self.store.next_id().await?,
            app_id,
            updated_at: app.latest_update_at.unwrap_or_else(current_unix_millis),
            checksum,
            state: UpdateState::Success,
            backup_path: Some(backup_path),
            keep: false,
        };
        self.store.save_history(&record).await
    }

    /// Supersedes pending records with a fresh `Checking` checkpoint.
    async fn on_updated(
        &self,
        app_id: i64,
        updated_at: i64,
        artifact: Option<&Artifact>,
    ) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        for record in self.store.list_history_by_app(app_id).await? {
            if record.state == UpdateState::Checking {
                self.delete_record(&record).await?;
            }
        }
        let checksum = match artifact {
            Some(artifact) => artifact.checksum.clone(),
            None => app.checksum.clone().unwrap_or_default(),
        };
        let backup_path = self.backup(&app, artifact).await;
        let record = UpdateHistoryRecord {
            id: self.store.next_id().await?,
            app_id,
            updated_at,
            checksum,
            state: UpdateState::Checking,
            backup_path,
            keep: false,
        };
        self.store.save_history(&record).await?;
        info!(app_id, app = %app.name, history_id = record.id, "history-checking-recorded");
        Ok(())
    }

    async fn on_deleted(&self, app_id: i64) -> Result<()> {
        for record in self.store.list_history_by_app(app_id).await? {
            self.delete_record(&record).await?;
        }
        Ok(())
    }
}
