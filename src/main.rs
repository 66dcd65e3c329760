mod apply;
mod checksum;
mod config;
mod container;
mod credentials;
mod discovery;
mod error;
mod events;
mod fetch;
mod health;
mod history;
mod lock;
mod manager;
mod model;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;
mod worker;

use std::env;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::apply::Applier;
use crate::checksum::ChecksumCache;
use crate::config::Settings;
use crate::container::{ContainerRuntime, DockerCliRuntime, LogOptions, detect_self_container_id};
use crate::credentials::FileCredentialStore;
use crate::discovery::Discovery;
use crate::error::{Result, UpdateError};
use crate::events::EventBus;
use crate::fetch::ArtifactFetcher;
use crate::health::HealthChecker;
use crate::history::HistoryService;
use crate::lock::LockRegistry;
use crate::manager::{AppManager, UpdateOutcome};
use crate::model::Application;
use crate::scheduler::{SchedulerPlan, run_scheduler};
use crate::store::Store;
use crate::worker::WorkerPool;

const LOG_TAG: &str = "harbor-updater";

pub fn current_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("HARBOR_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| LOG_TAG.into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "version" | "v" => {
            println!("{}", release_tag());
            std::process::exit(0);
        }
        "help" | "h" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {}
    }

    let cli = match parse_cli(&command, &remaining) {
        Ok(cli) => cli,
        Err(CliUsage::UnknownCommand) => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
        Err(CliUsage::Invalid(message)) => {
            eprintln!("{command}: {message}");
            std::process::exit(2);
        }
    };

    init_logging();
    match block_on(run_cli(cli)) {
        Ok(Some(output)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
            );
            std::process::exit(0);
        }
        Ok(None) => std::process::exit(0),
        Err(err) => {
            eprintln!("{command} failed: [{}] {err}", err.code());
            std::process::exit(1);
        }
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command> [options]\n");
    eprintln!("Commands:");
    eprintln!("  scheduler [--max-iterations N]   Run health checks, schedules and discovery");
    eprintln!("  apps list                        List registered applications");
    eprintln!("  apps add <json|@file>            Register or edit an application");
    eprintln!("  apps remove <id>                 Delete an application and its history");
    eprintln!("  update <id> [--auto-skip]        Download and deploy the latest artifact");
    eprintln!("  upload <id> <file>               Deploy a local file as the artifact");
    eprintln!("  rollback <id> <history-id>       Restore a backed-up artifact");
    eprintln!("  history <id>                     Show update history");
    eprintln!("  keep <history-id> true|false     Exempt a record from pruning");
    eprintln!("  start|stop|restart <id>          Control the bound container");
    eprintln!("  logs <id> [--tail N]             Print container logs");
    eprintln!("  health-check                     Run one health sweep");
    eprintln!("  register                         Run one auto-registration pass");
    eprintln!("  version                          Print the release tag");
    eprintln!("  help                             Show this message");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn block_on<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("failed to start async runtime: {err}");
            std::process::exit(1);
        });
    runtime.block_on(future)
}

#[derive(Debug, PartialEq, Eq)]
enum CliUsage {
    UnknownCommand,
    Invalid(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Cli {
    Scheduler { max_iterations: Option<u64> },
    AppsList,
    AppsAdd(String),
    AppsRemove(i64),
    Update { app_id: i64, auto_skip: bool },
    Upload { app_id: i64, file: PathBuf },
    Rollback { app_id: i64, history_id: i64 },
    History(i64),
    Keep { history_id: i64, keep: bool },
    Start(i64),
    Stop(i64),
    Restart(i64),
    Logs { app_id: i64, tail: Option<u64> },
    HealthCheck,
    Register,
}

fn parse_cli(command: &str, args: &[String]) -> std::result::Result<Cli, CliUsage> {
    let id_at = |idx: usize, what: &str| -> std::result::Result<i64, CliUsage> {
        let raw = args
            .get(idx)
            .ok_or_else(|| CliUsage::Invalid(format!("missing {what}")))?;
        raw.parse::<i64>()
            .map_err(|_| CliUsage::Invalid(format!("invalid {what}: {raw}")))
    };

    let cli = match command {
        "scheduler" => {
            let mut max_iterations = None;
            let mut idx = 0;
            while idx < args.len() {
                match args[idx].as_str() {
                    "--max-iterations" => {
                        idx += 1;
                        let raw = args.get(idx).map(String::as_str).unwrap_or_default();
                        max_iterations = Some(raw.parse::<u64>().map_err(|_| {
                            CliUsage::Invalid(format!("invalid max-iterations: {raw}"))
                        })?);
                    }
                    other => {
                        return Err(CliUsage::Invalid(format!(
                            "unknown scheduler option: {other}"
                        )));
                    }
                }
                idx += 1;
            }
            Cli::Scheduler { max_iterations }
        }
        "apps" => match args.first().map(String::as_str) {
            Some("list") | None => Cli::AppsList,
            Some("add") => Cli::AppsAdd(
                args.get(1)
                    .cloned()
                    .ok_or_else(|| CliUsage::Invalid("missing app json".into()))?,
            ),
            Some("remove") | Some("rm") => Cli::AppsRemove(id_at(1, "app id")?),
            Some(other) => {
                return Err(CliUsage::Invalid(format!("unknown apps subcommand: {other}")));
            }
        },
        "update" => Cli::Update {
            app_id: id_at(0, "app id")?,
            auto_skip: args.iter().skip(1).any(|a| a == "--auto-skip"),
        },
        "upload" => Cli::Upload {
            app_id: id_at(0, "app id")?,
            file: args
                .get(1)
                .map(PathBuf::from)
                .ok_or_else(|| CliUsage::Invalid("missing file".into()))?,
        },
        "rollback" => Cli::Rollback {
            app_id: id_at(0, "app id")?,
            history_id: id_at(1, "history id")?,
        },
        "history" => Cli::History(id_at(0, "app id")?),
        "keep" => Cli::Keep {
            history_id: id_at(0, "history id")?,
            keep: match args.get(1).map(String::as_str) {
                Some("true") | None => true,
                Some("false") => false,
                Some(other) => {
                    return Err(CliUsage::Invalid(format!("expected true|false, got {other}")));
                }
            },
        },
        "start" => Cli::Start(id_at(0, "app id")?),
        "stop" => Cli::Stop(id_at(0, "app id")?),
        "restart" => Cli::Restart(id_at(0, "app id")?),
        "logs" => {
            let app_id = id_at(0, "app id")?;
            let mut tail = None;
            if let Some(pos) = args.iter().position(|a| a == "--tail") {
                let raw = args.get(pos + 1).map(String::as_str).unwrap_or_default();
                tail = Some(
                    raw.parse::<u64>()
                        .map_err(|_| CliUsage::Invalid(format!("invalid tail: {raw}")))?,
                );
            }
            Cli::Logs { app_id, tail }
        }
        "health-check" => Cli::HealthCheck,
        "register" => Cli::Register,
        _ => return Err(CliUsage::UnknownCommand),
    };
    Ok(cli)
}

/// Fully wired services for one process.
struct AppContext {
    settings: Settings,
    manager: AppManager,
    health: HealthChecker,
    discovery: Option<Discovery>,
}

async fn build_context(settings: Settings) -> Result<AppContext> {
    let store = Store::connect(&settings.db_url).await?;
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerCliRuntime::new(settings.container_cli.clone()));

    let self_container_id = settings
        .self_container_id
        .clone()
        .or_else(detect_self_container_id);
    let endpoint = match settings.endpoint.clone() {
        Some(endpoint) => Some(endpoint),
        None => match runtime.daemon_id().await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "endpoint-detect-failed running without endpoint");
                None
            }
        },
    };
    info!(
        endpoint = ?endpoint,
        self_container = ?self_container_id,
        db = %settings.db_url,
        "context-ready"
    );

    let cache = ChecksumCache::new(settings.checksum_cache_ttl);
    let history = HistoryService::new(store.clone(), settings.backup_dir.clone(), cache);
    let events = EventBus::new();
    events.subscribe(Arc::new(history.clone()));
    let fetcher = ArtifactFetcher::new(
        &settings.http,
        settings.insecure_tls,
        Arc::new(FileCredentialStore::new(settings.credentials_file.clone())),
    )?;
    let applier = Applier::new(runtime, self_container_id, settings.reload_settle);
    let locks = LockRegistry::shared(store.clone(), settings.lock_stale_after());
    let manager = AppManager::new(
        store,
        locks,
        Arc::new(fetcher),
        applier,
        events,
        history,
        WorkerPool::new(settings.worker_pool_size),
        endpoint,
    );
    let health = HealthChecker::new(manager.clone(), settings.health.clone());
    let discovery = match &settings.app_templates {
        Some(path) => Some(Discovery::load(
            path,
            settings.deployment_base_dir.clone(),
            settings.download_url_prefix.clone(),
        )?),
        None => None,
    };
    if let Some(discovery) = &discovery {
        info!(templates = discovery.template_count(), "app-templates-loaded");
    }

    Ok(AppContext {
        settings,
        manager,
        health,
        discovery,
    })
}

async fn run_cli(cli: Cli) -> Result<Option<Value>> {
    let settings = Settings::load()?;
    let ctx = build_context(settings).await?;
    let locks = ctx.manager.locks().clone();
    let output = dispatch(ctx, cli).await;
    match locks.release_owned().await {
        Ok(0) => {}
        Ok(released) => info!(released, "app-locks-released"),
        Err(err) => warn!(code = err.code(), error = %err, "app-locks-release-failed"),
    }
    output
}

async fn dispatch(ctx: AppContext, cli: Cli) -> Result<Option<Value>> {
    let manager = &ctx.manager;

    let output = match cli {
        Cli::Scheduler { max_iterations } => {
            let plan = SchedulerPlan {
                health_interval: ctx.settings.health_interval,
                schedule_interval: ctx.settings.schedule_interval,
                discovery_interval: ctx.settings.auto_register_interval,
                discover_on_startup: ctx.settings.auto_register_on_startup,
            };
            run_scheduler(
                ctx.manager.clone(),
                ctx.health.clone(),
                ctx.discovery,
                plan,
                max_iterations,
            )
            .await?;
            None
        }
        Cli::AppsList => Some(json!(manager.list_apps().await?)),
        Cli::AppsAdd(raw) => {
            let raw = match raw.strip_prefix('@') {
                Some(path) => fs::read_to_string(path)?,
                None => raw,
            };
            let app: Application = serde_json::from_str(&raw)
                .map_err(|err| UpdateError::Configuration(format!("invalid app json: {err}")))?;
            Some(json!(manager.save_app(app).await?))
        }
        Cli::AppsRemove(app_id) => {
            manager.delete_app(app_id).await?;
            Some(json!({ "deleted": app_id }))
        }
        Cli::Update { app_id, auto_skip } => {
            let handle = manager.update(app_id, auto_skip).await?;
            let task_id = handle.task_id.clone();
            handle.wait().await?;
            let app = manager.get_app(app_id).await?;
            Some(json!({
                "task_id": task_id,
                "app_id": app_id,
                "checksum": app.checksum,
                "latest_update_at": app.latest_update_at,
            }))
        }
        Cli::Upload { app_id, file } => {
            let bytes = fs::read(&file)?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            Some(match manager.update_from_upload(app_id, bytes, &file_name).await? {
                UpdateOutcome::Skipped => json!({ "app_id": app_id, "status": "skipped" }),
                UpdateOutcome::Updated {
                    checksum,
                    updated_at,
                } => json!({
                    "app_id": app_id,
                    "status": "updated",
                    "checksum": checksum,
                    "updated_at": updated_at,
                }),
            })
        }
        Cli::Rollback { app_id, history_id } => {
            let handle = manager.rollback(app_id, history_id).await?;
            let task_id = handle.task_id.clone();
            handle.wait().await?;
            Some(json!({ "task_id": task_id, "app_id": app_id, "history_id": history_id }))
        }
        Cli::History(app_id) => {
            manager.get_app(app_id).await?;
            Some(json!(manager.history().list_history(app_id).await?))
        }
        Cli::Keep { history_id, keep } => {
            Some(json!(manager.history().set_keep(history_id, keep).await?))
        }
        Cli::Start(app_id) => {
            manager.start(app_id).await?;
            Some(json!({ "app_id": app_id, "action": "start" }))
        }
        Cli::Stop(app_id) => {
            manager.stop(app_id).await?;
            Some(json!({ "app_id": app_id, "action": "stop" }))
        }
        Cli::Restart(app_id) => {
            manager.restart(app_id).await?;
            Some(json!({ "app_id": app_id, "action": "restart" }))
        }
        Cli::Logs { app_id, tail } => {
            let options = LogOptions {
                tail,
                ..Default::default()
            };
            for line in manager.logs(app_id, &options).await? {
                println!("{line}");
            }
            None
        }
        Cli::HealthCheck => {
            let report = ctx.health.sweep().await?;
            let rollbacks = report.rollbacks.len();
            for handle in report.rollbacks {
                if let Err(err) = handle.wait().await {
                    warn!(code = err.code(), error = %err, "auto-rollback-failed");
                }
            }
            Some(json!({
                "succeeded": report.succeeded,
                "failed": report.failed,
                "pending": report.pending,
                "skipped": report.skipped,
                "rollbacks": rollbacks,
            }))
        }
        Cli::Register => {
            let discovery = ctx.discovery.as_ref().ok_or_else(|| {
                UpdateError::Configuration(format!("{} is not set", config::ENV_APP_TEMPLATES))
            })?;
            Some(json!(discovery.register(manager).await?))
        }
    };
    Ok(output)
}
