use std::path::Path;

use serde::{Deserialize, Serialize};

/// One deployable unit bound to a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub container_id: Option<String>,
    pub checksum: Option<String>,
    pub download_url: Option<String>,
    pub local_path: Option<String>,
    pub credential_ref: Option<String>,
    /// Inline credentials; take precedence over `credential_ref` when both parts are set.
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    pub version: Option<String>,
    /// Unix millis of the last successful update or rollback.
    pub latest_update_at: Option<i64>,
    pub auto_restart: bool,
    /// Unset enforces; only an explicit `Some(false)` accepts artifacts that
    /// differ from the published checksum.
    pub check_checksum: Option<bool>,
    pub schedule_restart: bool,
    pub restart_at: Option<String>,
    pub schedule_update: bool,
    pub update_at: Option<String>,
    pub endpoint: Option<String>,
    pub auto_rollback: Option<bool>,
    pub reload_command: Option<String>,
}

impl Application {
    pub fn bound_container(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn reload_command(&self) -> Option<&str> {
        self.reload_command
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }

    /// Name used for the artifact on disk and in backups.
    pub fn artifact_name(&self) -> String {
        self.local_path
            .as_deref()
            .and_then(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string())
    }

    pub fn enforces_checksum(&self) -> bool {
        self.check_checksum != Some(false)
    }

    pub fn wants_rollback(&self) -> bool {
        self.auto_rollback != Some(false)
    }

    /// Carries over the fields owned by the update machinery.
    pub fn merge_user_fields(&mut self, edit: Application) {
        let Application {
            name,
            container_id,
            download_url,
            local_path,
            credential_ref,
            basic_auth_username,
            basic_auth_password,
            version,
            auto_restart,
            check_checksum,
            schedule_restart,
            restart_at,
            schedule_update,
            update_at,
            auto_rollback,
            reload_command,
            ..
        } = edit;
        self.name = name;
        self.container_id = container_id;
        self.download_url = download_url;
        self.local_path = local_path;
        self.credential_ref = credential_ref;
        self.basic_auth_username = basic_auth_username;
        self.basic_auth_password = basic_auth_password;
        self.version = version;
        self.auto_restart = auto_restart;
        self.check_checksum = check_checksum;
        self.schedule_restart = schedule_restart;
        self.restart_at = restart_at;
        self.schedule_update = schedule_update;
        self.update_at = update_at;
        self.auto_rollback = auto_rollback;
        self.reload_command = reload_command;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Checking,
    Success,
    Fail,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "checking" => Some(Self::Checking),
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHistoryRecord {
    pub id: i64,
    pub app_id: i64,
    /// Unix millis of the update this record guards.
    pub updated_at: i64,
    pub checksum: String,
    pub state: UpdateState,
    pub backup_path: Option<String>,
    pub keep: bool,
}

impl UpdateHistoryRecord {
    pub fn backup_exists(&self) -> bool {
        self.backup_path
            .as_deref()
            .map(|p| Path::new(p).is_file())
            .unwrap_or(false)
    }
}

/// History record plus the derived properties shown to callers.
#[derive(Clone, Debug, Serialize)]
pub struct HistoryView {
    #[serde(flatten)]
    pub record: UpdateHistoryRecord,
    pub backup_exists: bool,
    pub rollback_eligible: bool,
}
