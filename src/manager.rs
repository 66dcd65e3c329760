use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::apply::{Applier, ArtifactKind};
use crate::checksum::file_md5;
use crate::container::{ContainerRuntime, ContainerSummary, LogOptions, same_container};
use crate::current_unix_millis;
use crate::error::{Result, UpdateError};
use crate::events::{AppEvent, EventBus};
use crate::fetch::{Artifact, ArtifactFetcher};
use crate::history::HistoryService;
use crate::lock::{LockGuard, LockRegistry};
use crate::model::{Application, UpdateHistoryRecord};
use crate::store::Store;
use crate::worker::{TaskHandle, WorkerPool, new_task_id};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Remote checksum matched the deployed one.
    Skipped,
    Updated { checksum: String, updated_at: i64 },
}

/// Coordinates updates, rollbacks and registry changes for applications.
#[derive(Clone)]
pub struct AppManager {
    store: Store,
    locks: LockRegistry,
    fetcher: Arc<ArtifactFetcher>,
    applier: Applier,
    events: EventBus,
    history: HistoryService,
    pool: WorkerPool,
    endpoint: Option<String>,
}

impl AppManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        locks: LockRegistry,
        fetcher: Arc<ArtifactFetcher>,
        applier: Applier,
        events: EventBus,
        history: HistoryService,
        pool: WorkerPool,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            store,
            locks,
            fetcher,
            applier,
            events,
            history,
            pool,
            endpoint,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.applier.runtime()
    }

    // ---- registry ----

    /// Lists apps, filling in unknown checksums from the deployed files.
    pub async fn list_apps(&self) -> Result<Vec<Application>> {
        let mut apps = self.store.list_apps().await?;
        for app in apps.iter_mut().filter(|a| a.checksum.is_none()) {
            if let Some(checksum) = local_checksum(app).await {
                app.checksum = Some(checksum);
                self.store.save_app(app).await?;
            }
        }
        Ok(apps)
    }

    pub async fn get_app(&self, app_id: i64) -> Result<Application> {
        self.store.require_app(app_id).await
    }

    /// Apps whose bound container currently exists.
    pub async fn apps_with_containers(&self) -> Result<Vec<Application>> {
        let containers = self.applier.runtime().list_containers().await?;
        let apps = self.store.list_apps().await?;
        Ok(apps
            .into_iter()
            .filter(|app| {
                app.bound_container()
                    .is_some_and(|id| container_exists(&containers, id))
            })
            .collect())
    }

    /// Inserts a new app (id `0` or unknown) or updates the editable fields of
    /// an existing one.
    pub async fn save_app(&self, edit: Application) -> Result<Application> {
        if edit.name.trim().is_empty() {
            return Err(UpdateError::Configuration("app name is required".into()));
        }
        let existing = if edit.id > 0 {
            self.store.get_app(edit.id).await?
        } else {
            None
        };
        let app = match existing {
            Some(mut stored) => {
                stored.merge_user_fields(edit);
                stored
            }
            None => {
                let mut created = edit;
                if created.id <= 0 {
                    created.id = self.store.next_id().await?;
                }
                created.latest_update_at = None;
                if created.checksum.is_none() {
                    created.checksum = local_checksum(&created).await;
                }
                created
            }
        };
        self.store.save_app(&app).await?;
        info!(app_id = app.id, app = %app.name, "app-saved");
        Ok(app)
    }

    /// Refused while an update or rollback holds the app.
    pub async fn delete_app(&self, app_id: i64) -> Result<()> {
        let guard = self
            .locks
            .try_acquire(app_id, &format!("delete-{}", new_task_id()))
            .await?;
        let result = self.delete_locked(app_id).await;
        guard.release().await;
        result
    }

    async fn delete_locked(&self, app_id: i64) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        self.store.delete_app(app_id).await?;
        self.events.publish(&AppEvent::Deleted { app_id }).await;
        info!(app_id, app = %app.name, "app-deleted");
        Ok(())
    }

    // ---- container passthrough ----

    pub async fn start(&self, app_id: i64) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        if let Some(container) = app.bound_container() {
            self.applier.runtime().start(container).await?;
            info!(app_id, app = %app.name, "container-started");
        }
        Ok(())
    }

    pub async fn stop(&self, app_id: i64) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        if let Some(container) = app.bound_container() {
            self.applier.runtime().stop(container).await?;
            info!(app_id, app = %app.name, "container-stopped");
        }
        Ok(())
    }

    pub async fn restart(&self, app_id: i64) -> Result<()> {
        let app = self.store.require_app(app_id).await?;
        if let Some(container) = app.bound_container() {
            self.applier.runtime().restart(container).await?;
            info!(app_id, app = %app.name, "container-restarted");
        }
        Ok(())
    }

    pub async fn logs(&self, app_id: i64, options: &LogOptions) -> Result<Vec<String>> {
        let app = self.store.require_app(app_id).await?;
        let container = app
            .bound_container()
            .ok_or_else(|| UpdateError::NotFound(format!("container for app {app_id}")))?;
        Ok(self.applier.runtime().logs(container, options).await?)
    }

    // ---- update ----

    /// Validates, takes the app lock and runs the update in the worker pool.
    pub async fn update(&self, app_id: i64, auto_skip: bool) -> Result<TaskHandle> {
        let app = self.store.require_app(app_id).await?;
        require_update_targets(&app)?;
        let task_id = new_task_id();
        let guard = match self.locks.try_acquire(app_id, &task_id).await {
            Ok(guard) => guard,
            Err(err) => {
                let holder = self.locks.holder(app_id).await;
                warn!(app_id, holder = ?holder, "update-rejected busy");
                return Err(err);
            }
        };
        let this = self.clone();
        Ok(self.pool.submit("update", app_id, task_id, async move {
            let result = this.run_update(&guard, auto_skip).await;
            guard.release().await;
            result.map(|_| ())
        }))
    }

    async fn run_update(&self, guard: &LockGuard, auto_skip: bool) -> Result<UpdateOutcome> {
        let app_id = guard.app_id();
        let app = self.store.require_app(app_id).await?;
        require_update_targets(&app)?;

        let remote = self.fetcher.remote_checksum(&app).await;
        if auto_skip {
            if let (Some(remote), Some(current)) = (remote.as_deref(), app.checksum.as_deref()) {
                if remote.eq_ignore_ascii_case(current) {
                    info!(app_id, app = %app.name, checksum = %remote, "update-skipped unchanged");
                    return Ok(UpdateOutcome::Skipped);
                }
            }
        }

        info!(app_id, app = %app.name, task_id = guard.holder(), "update-start");
        self.events.publish(&AppEvent::BeforeUpdate { app_id }).await;
        let artifact = self.fetcher.fetch_verified(&app, remote.as_deref()).await?;
        self.deploy(app, artifact).await
    }

    /// Deploys an uploaded payload; blocks until done.
    pub async fn update_from_upload(
        &self,
        app_id: i64,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<UpdateOutcome> {
        let app = self.store.require_app(app_id).await?;
        require_local_path(&app)?;
        let guard = self.locks.try_acquire(app_id, &new_task_id()).await?;
        info!(app_id, app = %app.name, file = %file_name, "upload-update-start");
        self.events.publish(&AppEvent::BeforeUpdate { app_id }).await;
        let result = match self.store.require_app(app_id).await {
            Ok(app) => self.deploy(app, Artifact::new(bytes, file_name)).await,
            Err(err) => Err(err),
        };
        guard.release().await;
        result
    }

    async fn deploy(&self, mut app: Application, artifact: Artifact) -> Result<UpdateOutcome> {
        let dest = require_local_path(&app)?;
        self.applier.stop_before_update(&app).await;
        self.applier
            .stage(artifact.bytes.clone(), &artifact.file_name, &dest)
            .await?;

        let updated_at = current_unix_millis();
        app.checksum = Some(artifact.checksum.clone());
        app.latest_update_at = Some(updated_at);
        if self.endpoint.is_some() {
            app.endpoint = self.endpoint.clone();
        }
        self.store.save_app(&app).await?;
        info!(app_id = app.id, app = %app.name, checksum = %artifact.checksum, "update-staged");

        let restarted = if app.auto_restart {
            self.applier.lifecycle(&app).await
        } else {
            Ok(())
        };
        if let Err(err) = &restarted {
            warn!(app_id = app.id, app = %app.name, error = %err, "update-restart-failed");
        }

        let archive = ArtifactKind::from_name(&artifact.file_name).is_archive();
        self.events
            .publish(&AppEvent::Updated {
                app_id: app.id,
                updated_at,
                artifact: archive.then(|| artifact.clone()),
            })
            .await;
        restarted?;
        info!(app_id = app.id, app = %app.name, "update-finish");
        Ok(UpdateOutcome::Updated {
            checksum: artifact.checksum,
            updated_at,
        })
    }

    // ---- rollback ----

    /// Takes the app lock, validates the target record and restores it in the
    /// worker pool.
    pub async fn rollback(&self, app_id: i64, history_id: i64) -> Result<TaskHandle> {
        let task_id = new_task_id();
        let guard = self.locks.try_acquire(app_id, &task_id).await?;
        let (app, record) = self.rollback_target(app_id, history_id).await?;
        let this = self.clone();
        Ok(self.pool.submit("rollback", app_id, task_id, async move {
            let result = this.run_rollback(app, record).await;
            guard.release().await;
            result
        }))
    }

    async fn rollback_target(
        &self,
        app_id: i64,
        history_id: i64,
    ) -> Result<(Application, UpdateHistoryRecord)> {
        let app = self.store.require_app(app_id).await?;
        require_local_path(&app)?;
        let record = self
            .store
            .get_history(history_id)
            .await?
            .filter(|r| r.app_id == app_id)
            .ok_or_else(|| UpdateError::history_not_found(history_id))?;
        if !self.history.rollback_eligible(&record).await {
            return Err(UpdateError::RollbackIneligible(history_id));
        }
        Ok((app, record))
    }

    async fn run_rollback(
        &self,
        mut app: Application,
        record: UpdateHistoryRecord,
    ) -> Result<()> {
        let dest = require_local_path(&app)?;
        let backup = record
            .backup_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or(UpdateError::RollbackIneligible(record.id))?;
        info!(app_id = app.id, app = %app.name, history_id = record.id, "rollback-start");

        self.applier.stop_before_rollback(&app).await;
        self.applier.restore(&backup, &dest).await?;

        app.checksum = Some(record.checksum.clone());
        app.latest_update_at = Some(current_unix_millis());
        self.store.save_app(&app).await?;

        // Always restart after a rollback.
        self.applier.lifecycle(&app).await?;
        info!(app_id = app.id, app = %app.name, history_id = record.id, "rollback-finish");
        Ok(())
    }
}

fn container_exists(containers: &[ContainerSummary], id: &str) -> bool {
    containers.iter().any(|c| same_container(&c.id, id))
}

fn require_local_path(app: &Application) -> Result<PathBuf> {
    app.local_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            UpdateError::Configuration(format!("app {} has no deployment path", app.name))
        })
}

fn require_update_targets(app: &Application) -> Result<()> {
    let has_url = app
        .download_url
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    if !has_url {
        return Err(UpdateError::Configuration(format!(
            "app {} has no download url",
            app.name
        )));
    }
    require_local_path(app).map(|_| ())
}

/// Digest of the deployed file; `None` when absent or a directory.
pub async fn local_checksum(app: &Application) -> Option<String> {
    let path = PathBuf::from(app.local_path.as_deref()?.trim());
    tokio::task::spawn_blocking(move || {
        if Path::new(&path).is_file() {
            file_md5(&path).ok()
        } else {
            None
        }
    })
    .await
    .ok()
    .flatten()
}
