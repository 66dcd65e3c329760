use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::UpdateError;

pub const DEFAULT_DB_PATH: &str = "data/harbor-updater.db";
const DEFAULT_BACKUP_DIR: &str = "/backups";
const DEFAULT_CONTAINER_CLI: &str = "docker";
const DEFAULT_CREDENTIALS_FILE: &str = "/etc/harbor/credentials.json";
const DEFAULT_DEPLOYMENT_BASE_DIR: &str = "/app/home/";
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 600; // 10 minutes
const DEFAULT_SUCCESS_GRACE_SECS: u64 = 300; // 5 minutes
const DEFAULT_FAILURE_GRACE_SECS: u64 = 600; // 10 minutes
const DEFAULT_HISTORY_RETENTION: u64 = 3;
const DEFAULT_WORKER_POOL_SIZE: u64 = 4;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RELOAD_SETTLE_SECS: u64 = 5;
const DEFAULT_CHECKSUM_CACHE_TTL_SECS: u64 = 86_400; // 24 hours
const LOCK_STALE_MARGIN: Duration = Duration::from_secs(60);

// Environment variable names (external interface).
pub const ENV_DB_URL: &str = "HARBOR_DB_URL";
pub const ENV_BACKUP_DIR: &str = "HARBOR_BACKUP_DIR";
pub const ENV_ENDPOINT: &str = "HARBOR_ENDPOINT";
pub const ENV_SELF_CONTAINER_ID: &str = "HARBOR_SELF_CONTAINER_ID";
pub const ENV_CONTAINER_CLI: &str = "HARBOR_CONTAINER_CLI";
pub const ENV_CREDENTIALS_FILE: &str = "HARBOR_CREDENTIALS_FILE";
pub const ENV_DEPLOYMENT_BASE_DIR: &str = "HARBOR_DEPLOYMENT_BASE_DIR";
pub const ENV_DOWNLOAD_URL_PREFIX: &str = "HARBOR_DOWNLOAD_URL_PREFIX";
pub const ENV_APP_TEMPLATES: &str = "HARBOR_APP_TEMPLATES";
pub const ENV_AUTO_REGISTER_ON_STARTUP: &str = "HARBOR_AUTO_REGISTER_ON_STARTUP";
pub const ENV_AUTO_REGISTER_INTERVAL_SECS: &str = "HARBOR_AUTO_REGISTER_INTERVAL_SECS";
pub const ENV_HEALTH_INTERVAL_SECS: &str = "HARBOR_HEALTH_INTERVAL_SECS";
pub const ENV_SCHEDULE_INTERVAL_SECS: &str = "HARBOR_SCHEDULE_INTERVAL_SECS";
pub const ENV_SUCCESS_GRACE_SECS: &str = "HARBOR_SUCCESS_GRACE_SECS";
pub const ENV_FAILURE_GRACE_SECS: &str = "HARBOR_FAILURE_GRACE_SECS";
pub const ENV_HISTORY_RETENTION: &str = "HARBOR_HISTORY_RETENTION";
pub const ENV_WORKER_POOL_SIZE: &str = "HARBOR_WORKER_POOL_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "HARBOR_CONNECT_TIMEOUT_MS";
pub const ENV_DOWNLOAD_TIMEOUT_SECS: &str = "HARBOR_DOWNLOAD_TIMEOUT_SECS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "HARBOR_PROBE_TIMEOUT_MS";
pub const ENV_RELOAD_SETTLE_SECS: &str = "HARBOR_RELOAD_SETTLE_SECS";
pub const ENV_CHECKSUM_CACHE_TTL_SECS: &str = "HARBOR_CHECKSUM_CACHE_TTL_SECS";
pub const ENV_INSECURE_TLS: &str = "HARBOR_INSECURE_TLS";

/// Grace windows and retention used by the health sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Continuous uptime required before an update is confirmed.
    pub success_grace: Duration,
    /// Age after which an unconfirmed update is declared failed.
    pub failure_grace: Duration,
    pub retention: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            success_grace: Duration::from_secs(DEFAULT_SUCCESS_GRACE_SECS),
            failure_grace: Duration::from_secs(DEFAULT_FAILURE_GRACE_SECS),
            retention: DEFAULT_HISTORY_RETENTION as usize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub download: Duration,
    pub probe: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            download: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            probe: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub db_url: String,
    pub backup_dir: PathBuf,
    pub endpoint: Option<String>,
    pub self_container_id: Option<String>,
    pub container_cli: String,
    pub credentials_file: PathBuf,
    pub deployment_base_dir: PathBuf,
    pub download_url_prefix: String,
    pub app_templates: Option<PathBuf>,
    pub auto_register_on_startup: bool,
    pub auto_register_interval: Option<Duration>,
    pub health_interval: Duration,
    pub schedule_interval: Duration,
    pub health: HealthPolicy,
    pub worker_pool_size: usize,
    pub http: HttpTimeouts,
    pub insecure_tls: bool,
    pub reload_settle: Duration,
    pub checksum_cache_ttl: Duration,
}

impl Settings {
    pub fn load() -> Result<Self, UpdateError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, UpdateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let num = |key: &str, default: u64| -> Result<u64, UpdateError> {
            match get(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| UpdateError::Configuration(format!("invalid {key}"))),
                None => Ok(default),
            }
        };
        let flag = |key: &str| {
            get(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        let health = HealthPolicy {
            success_grace: Duration::from_secs(num(
                ENV_SUCCESS_GRACE_SECS,
                DEFAULT_SUCCESS_GRACE_SECS,
            )?),
            failure_grace: Duration::from_secs(num(
                ENV_FAILURE_GRACE_SECS,
                DEFAULT_FAILURE_GRACE_SECS,
            )?),
            retention: num(ENV_HISTORY_RETENTION, DEFAULT_HISTORY_RETENTION)? as usize,
        };
        if health.failure_grace < health.success_grace {
            return Err(UpdateError::Configuration(format!(
                "{ENV_FAILURE_GRACE_SECS} must not be shorter than {ENV_SUCCESS_GRACE_SECS}"
            )));
        }

        let auto_register_interval = match num(ENV_AUTO_REGISTER_INTERVAL_SECS, 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Settings {
            db_url: get(ENV_DB_URL).unwrap_or_else(|| format!("sqlite://{DEFAULT_DB_PATH}")),
            backup_dir: PathBuf::from(
                get(ENV_BACKUP_DIR).unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string()),
            ),
            endpoint: get(ENV_ENDPOINT),
            self_container_id: get(ENV_SELF_CONTAINER_ID),
            container_cli: get(ENV_CONTAINER_CLI)
                .unwrap_or_else(|| DEFAULT_CONTAINER_CLI.to_string()),
            credentials_file: PathBuf::from(
                get(ENV_CREDENTIALS_FILE).unwrap_or_else(|| DEFAULT_CREDENTIALS_FILE.to_string()),
            ),
            deployment_base_dir: PathBuf::from(
                get(ENV_DEPLOYMENT_BASE_DIR)
                    .unwrap_or_else(|| DEFAULT_DEPLOYMENT_BASE_DIR.to_string()),
            ),
            download_url_prefix: get(ENV_DOWNLOAD_URL_PREFIX).unwrap_or_default(),
            app_templates: get(ENV_APP_TEMPLATES).map(PathBuf::from),
            auto_register_on_startup: flag(ENV_AUTO_REGISTER_ON_STARTUP),
            auto_register_interval,
            health_interval: Duration::from_secs(
                num(ENV_HEALTH_INTERVAL_SECS, DEFAULT_HEALTH_INTERVAL_SECS)?.max(1),
            ),
            schedule_interval: Duration::from_secs(
                num(ENV_SCHEDULE_INTERVAL_SECS, DEFAULT_SCHEDULE_INTERVAL_SECS)?.max(1),
            ),
            health,
            worker_pool_size: num(ENV_WORKER_POOL_SIZE, DEFAULT_WORKER_POOL_SIZE)?.max(1) as usize,
            http: HttpTimeouts {
                connect: Duration::from_millis(num(
                    ENV_CONNECT_TIMEOUT_MS,
                    DEFAULT_CONNECT_TIMEOUT_MS,
                )?),
                download: Duration::from_secs(num(
                    ENV_DOWNLOAD_TIMEOUT_SECS,
                    DEFAULT_DOWNLOAD_TIMEOUT_SECS,
                )?),
                probe: Duration::from_millis(num(ENV_PROBE_TIMEOUT_MS, DEFAULT_PROBE_TIMEOUT_MS)?),
            },
            insecure_tls: flag(ENV_INSECURE_TLS),
            reload_settle: Duration::from_secs(num(
                ENV_RELOAD_SETTLE_SECS,
                DEFAULT_RELOAD_SETTLE_SECS,
            )?),
            checksum_cache_ttl: Duration::from_secs(num(
                ENV_CHECKSUM_CACHE_TTL_SECS,
                DEFAULT_CHECKSUM_CACHE_TTL_SECS,
            )?),
        })
    }

    /// Age after which a shared app lock is treated as abandoned by a dead process.
    pub fn lock_stale_after(&self) -> Duration {
        self.http.download + self.reload_settle + LOCK_STALE_MARGIN
    }
}
