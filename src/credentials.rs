use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, UpdateError};
use crate::model::Application;

pub const DEFAULT_CREDENTIAL_REF: &str = "default";

#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Lookup of download credentials by opaque reference.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<BasicCredentials>;
}

/// Credentials read from a JSON document of the form
/// `{"credentials": {"<ref>": {"auth": "<base64 user:pass>"} | {"username", "password"}}}`.
///
/// The file is re-read on every lookup so edits apply without a restart.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> HashMap<String, BasicCredentials> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(v) => v,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "credentials-read-failed");
                }
                return HashMap::new();
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(json) => parse_credentials(&json),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "credentials-parse-failed");
                HashMap::new()
            }
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn resolve(&self, reference: &str) -> Option<BasicCredentials> {
        self.load().remove(reference)
    }
}

/// Fixed in-memory credentials.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialStore {
    entries: HashMap<String, BasicCredentials>,
}

impl StaticCredentialStore {
    pub fn with(mut self, reference: &str, username: &str, password: &str) -> Self {
        self.entries.insert(
            reference.to_string(),
            BasicCredentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn resolve(&self, reference: &str) -> Option<BasicCredentials> {
        self.entries.get(reference).cloned()
    }
}

fn parse_credentials(json: &Value) -> HashMap<String, BasicCredentials> {
    let mut out = HashMap::new();
    let Some(entries) = json.get("credentials").and_then(|v| v.as_object()) else {
        return out;
    };

    for (reference, entry) in entries {
        let Some(obj) = entry.as_object() else {
            continue;
        };

        if let Some(auth) = obj.get("auth").and_then(|v| v.as_str()).map(str::trim) {
            let decoded = BASE64_STANDARD
                .decode(auth.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some((user, pass)) = decoded.as_deref().and_then(|s| s.split_once(':')) {
                if !user.is_empty() {
                    out.insert(
                        reference.clone(),
                        BasicCredentials {
                            username: user.to_string(),
                            password: pass.to_string(),
                        },
                    );
                    continue;
                }
            }
        }

        let username = obj.get("username").and_then(|v| v.as_str()).map(str::trim);
        let password = obj.get("password").and_then(|v| v.as_str());
        if let (Some(user), Some(pass)) = (username, password) {
            if !user.is_empty() {
                out.insert(
                    reference.clone(),
                    BasicCredentials {
                        username: user.to_string(),
                        password: pass.to_string(),
                    },
                );
            }
        }
    }

    out
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Picks the credentials used to download an application's artifact.
///
/// Inline username/password win. Otherwise the app's reference is resolved,
/// falling back to the `default` reference. A named reference that does not
/// resolve is a configuration error; a missing `default` means anonymous access.
pub fn credentials_for(
    app: &Application,
    store: &dyn CredentialStore,
) -> Result<Option<BasicCredentials>> {
    if let (Some(username), Some(password)) = (
        non_blank(app.basic_auth_username.as_deref()),
        non_blank(app.basic_auth_password.as_deref()),
    ) {
        return Ok(Some(BasicCredentials {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }

    match non_blank(app.credential_ref.as_deref()) {
        Some(reference) if reference != DEFAULT_CREDENTIAL_REF => {
            store.resolve(reference).map(Some).ok_or_else(|| {
                UpdateError::Configuration(format!(
                    "credential reference {reference} for app {} does not resolve",
                    app.name
                ))
            })
        }
        _ => Ok(store.resolve(DEFAULT_CREDENTIAL_REF)),
    }
}
