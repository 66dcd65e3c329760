use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::container::{ContainerRuntime, same_container};
use crate::error::{Result, UpdateError};
use crate::model::Application;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Raw,
    Tar,
    TarGz,
    Zip,
}

impl ArtifactKind {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::TarGz
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else if lower.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Raw
        }
    }

    /// Backups are named `<artifact>.<millis>`; the suffix is ignored.
    pub fn from_backup_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.rsplit_once('.') {
            Some((stem, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
                Self::from_name(stem)
            }
            _ => Self::from_name(&name),
        }
    }

    pub fn is_archive(self) -> bool {
        self != Self::Raw
    }
}

/// Stages artifacts on disk and drives the container lifecycle around it.
#[derive(Clone)]
pub struct Applier {
    runtime: Arc<dyn ContainerRuntime>,
    self_container_id: Option<String>,
    reload_settle: Duration,
}

impl Applier {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        self_container_id: Option<String>,
        reload_settle: Duration,
    ) -> Self {
        Self {
            runtime,
            self_container_id,
            reload_settle,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Whether the app's container hosts this process.
    pub fn is_self(&self, app: &Application) -> bool {
        match (app.bound_container(), self.self_container_id.as_deref()) {
            (Some(bound), Some(own)) => same_container(bound, own),
            _ => false,
        }
    }

    /// Best-effort stop ahead of staging an update.
    pub async fn stop_before_update(&self, app: &Application) {
        if !app.auto_restart || app.reload_command().is_some() {
            return;
        }
        self.stop_best_effort(app).await;
    }

    /// Best-effort stop ahead of restoring a backup.
    pub async fn stop_before_rollback(&self, app: &Application) {
        if app.reload_command().is_some() {
            return;
        }
        self.stop_best_effort(app).await;
    }

    async fn stop_best_effort(&self, app: &Application) {
        let Some(container) = app.bound_container() else {
            return;
        };
        if self.is_self(app) {
            info!(app_id = app.id, app = %app.name, "stop-skipped self-container");
            return;
        }
        match self.runtime.stop(container).await {
            Ok(()) => info!(app_id = app.id, app = %app.name, "container-stopped"),
            Err(err) => warn!(app_id = app.id, app = %app.name, error = %err, "stop-failed ignored"),
        }
    }

    /// Writes the payload to `dest`: archives extract into the directory, raw
    /// payloads replace the file.
    pub async fn stage(&self, bytes: Arc<Vec<u8>>, file_name: &str, dest: &Path) -> Result<()> {
        let kind = ArtifactKind::from_name(file_name);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || stage_bytes(kind, &bytes, &dest))
            .await
            .map_err(|err| UpdateError::Io(io::Error::other(err)))?
    }

    /// Copies a backup back into place, extracting archive backups.
    pub async fn restore(&self, backup: &Path, dest: &Path) -> Result<()> {
        let backup = backup.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || restore_backup(&backup, &dest))
            .await
            .map_err(|err| UpdateError::Io(io::Error::other(err)))?
    }

    /// Runs the reload command inside the container, or restarts it.
    pub async fn lifecycle(&self, app: &Application) -> Result<()> {
        let Some(container) = app.bound_container() else {
            info!(app_id = app.id, app = %app.name, "lifecycle-skipped unbound");
            return Ok(());
        };
        match app.reload_command() {
            Some(command) => self.reload(app, container, command).await,
            None => {
                self.runtime.restart(container).await?;
                info!(app_id = app.id, app = %app.name, "container-restarted");
                Ok(())
            }
        }
    }

    async fn reload(&self, app: &Application, container: &str, command: &str) -> Result<()> {
        let mut session = self.runtime.open_exec(container).await?;
        let sent = session.send(format!("{command}\n").as_bytes()).await;
        if sent.is_ok() {
            tokio::time::sleep(self.reload_settle).await;
            info!(
                app_id = app.id,
                app = %app.name,
                output = %session.output().trim(),
                "reload-command-finished"
            );
        }
        let closed = session.close().await;
        sent?;
        if let Err(err) = closed {
            warn!(app_id = app.id, app = %app.name, error = %err, "exec-close-failed");
        }
        Ok(())
    }
}

fn stage_bytes(kind: ArtifactKind, bytes: &[u8], dest: &Path) -> Result<()> {
    match kind {
        ArtifactKind::Raw => write_file(dest, &mut Cursor::new(bytes)).map_err(UpdateError::from),
        ArtifactKind::Tar => extract_tar(Cursor::new(bytes), dest),
        ArtifactKind::TarGz => extract_tar(GzDecoder::new(Cursor::new(bytes)), dest),
        ArtifactKind::Zip => extract_zip(bytes, dest),
    }
}

fn restore_backup(backup: &Path, dest: &Path) -> Result<()> {
    let kind = ArtifactKind::from_backup_path(backup);
    if kind.is_archive() {
        let bytes = fs::read(backup)?;
        return stage_bytes(kind, &bytes, dest);
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(backup, dest)?;
    // fs::copy carries permissions; keep the modification time too.
    if let Ok(modified) = fs::metadata(backup).and_then(|m| m.modified()) {
        let file = OpenOptions::new().write(true).open(dest)?;
        file.set_modified(modified)?;
    }
    Ok(())
}

fn write_file(path: &Path, reader: &mut dyn Read) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    io::copy(reader, &mut file)?;
    Ok(())
}

/// Drops root and `..` components so entries stay inside the target.
fn enclosed(target: &Path, entry: &Path) -> Option<PathBuf> {
    let mut out = target.to_path_buf();
    let mut pushed = false;
    for component in entry.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    pushed.then_some(out)
}

fn extract_tar<R: Read>(reader: R, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| UpdateError::Archive(format!("invalid tar: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| UpdateError::Archive(format!("tar entry: {e}")))?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() || !(entry_type.is_file() || entry_type == tar::EntryType::Continuous) {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| UpdateError::Archive(format!("tar entry path: {e}")))?
            .into_owned();
        let Some(outpath) = enclosed(target, &path) else {
            warn!(entry = %path.display(), "tar-entry-skipped unsafe path");
            continue;
        };
        write_file(&outpath, &mut entry)?;
    }
    Ok(())
}

fn extract_zip(bytes: &[u8], target: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(outpath) = file.enclosed_name().map(|p| target.join(p)) else {
            warn!(entry = %file.name(), "zip-entry-skipped unsafe path");
            continue;
        };
        write_file(&outpath, &mut file)?;
    }
    Ok(())
}
