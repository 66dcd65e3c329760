use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::container::same_container;
use crate::credentials::DEFAULT_CREDENTIAL_REF;
use crate::error::{Result, UpdateError};
use crate::manager::AppManager;
use crate::model::Application;

fn enabled() -> bool {
    true
}

/// Blueprint for registering apps found running in matching containers.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    pub name: String,
    pub file_name: String,
    pub match_container_names: Vec<String>,
    #[serde(default)]
    pub reload_command: Option<String>,
    #[serde(default = "enabled")]
    pub check_md5: bool,
    #[serde(default = "enabled")]
    pub restart_after_update: bool,
    #[serde(default = "enabled")]
    pub rollback_if_update_fail: bool,
    #[serde(default)]
    pub auto_update_at: Option<String>,
    #[serde(default)]
    pub auto_restart_at: Option<String>,
}

struct CompiledTemplate {
    template: AppTemplate,
    patterns: Vec<Regex>,
}

impl CompiledTemplate {
    fn matches(&self, container_name: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(container_name))
    }
}

/// Registers apps for containers matching a template.
pub struct Discovery {
    templates: Vec<CompiledTemplate>,
    deployment_base_dir: PathBuf,
    download_url_prefix: String,
}

impl Discovery {
    /// Container name patterns must match the whole name.
    pub fn new(
        templates: Vec<AppTemplate>,
        deployment_base_dir: impl Into<PathBuf>,
        download_url_prefix: impl Into<String>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(templates.len());
        for template in templates {
            let patterns = template
                .match_container_names
                .iter()
                .map(|raw| {
                    Regex::new(&format!("^(?:{raw})$")).map_err(|err| {
                        UpdateError::Configuration(format!(
                            "invalid container pattern {raw:?} in template {}: {err}",
                            template.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            compiled.push(CompiledTemplate { template, patterns });
        }
        Ok(Self {
            templates: compiled,
            deployment_base_dir: deployment_base_dir.into(),
            download_url_prefix: download_url_prefix.into(),
        })
    }

    /// Reads a JSON array of templates.
    pub fn load(
        path: &Path,
        deployment_base_dir: impl Into<PathBuf>,
        download_url_prefix: impl Into<String>,
    ) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            UpdateError::Configuration(format!(
                "failed to read app templates {}: {err}",
                path.display()
            ))
        })?;
        let templates: Vec<AppTemplate> = serde_json::from_str(&raw).map_err(|err| {
            UpdateError::Configuration(format!(
                "invalid app templates {}: {err}",
                path.display()
            ))
        })?;
        Self::new(templates, deployment_base_dir, download_url_prefix)
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// One discovery pass; returns the apps it registered.
    pub async fn register(&self, manager: &AppManager) -> Result<Vec<Application>> {
        let containers = manager.runtime().list_containers().await?;
        let mut bound: Vec<String> = manager
            .store()
            .list_apps()
            .await?
            .iter()
            .filter_map(|app| app.bound_container().map(str::to_string))
            .collect();
        let mut registered = Vec::new();

        for container in containers {
            let names: Vec<&str> = container
                .names
                .iter()
                .map(|n| n.trim_start_matches('/'))
                .collect();
            let Some(compiled) = self
                .templates
                .iter()
                .find(|t| names.iter().any(|n| t.matches(n)))
            else {
                continue;
            };
            if bound.iter().any(|id| same_container(id, &container.id)) {
                continue;
            }

            let app = self.app_from_template(&compiled.template, &container.id);
            match manager.save_app(app).await {
                Ok(app) => {
                    info!(
                        app_id = app.id,
                        app = %app.name,
                        container = %container.id,
                        "app-auto-registered"
                    );
                    bound.push(container.id.clone());
                    registered.push(app);
                }
                Err(err) => warn!(
                    container = %container.id,
                    template = %compiled.template.name,
                    error = %err,
                    "app-auto-register-failed"
                ),
            }
        }
        Ok(registered)
    }

    fn app_from_template(&self, template: &AppTemplate, container_id: &str) -> Application {
        let local_path = self.deployment_base_dir.join(&template.file_name);
        let restart_at = non_blank(&template.auto_restart_at);
        let update_at = non_blank(&template.auto_update_at);
        Application {
            name: template.name.clone(),
            container_id: Some(container_id.to_string()),
            download_url: Some(format!("{}{}", self.download_url_prefix, template.file_name)),
            local_path: Some(local_path.to_string_lossy().into_owned()),
            credential_ref: Some(DEFAULT_CREDENTIAL_REF.to_string()),
            auto_restart: template.restart_after_update,
            check_checksum: Some(template.check_md5),
            schedule_restart: restart_at.is_some(),
            restart_at,
            schedule_update: update_at.is_some(),
            update_at,
            auto_rollback: Some(template.rollback_if_update_fail),
            reload_command: non_blank(&template.reload_command),
            ..Default::default()
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
