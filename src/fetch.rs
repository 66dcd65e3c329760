use std::sync::Arc;

use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::checksum::{md5_hex, parse_remote_checksum};
use crate::config::HttpTimeouts;
use crate::credentials::{CredentialStore, credentials_for};
use crate::error::{Result, UpdateError};
use crate::model::Application;

/// Downloaded (or uploaded) artifact payload.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub bytes: Arc<Vec<u8>>,
    /// Selects the staging strategy by extension.
    pub file_name: String,
    pub checksum: String,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        let checksum = md5_hex(&bytes);
        Self {
            bytes: Arc::new(bytes),
            file_name: file_name.into(),
            checksum,
        }
    }
}

/// Last path segment of a download URL, ignoring query and fragment.
pub fn file_name_from_url(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| raw.rsplit('/').next().unwrap_or(raw).to_string())
}

pub fn checksum_url(download_url: &str) -> String {
    format!("{download_url}.md5")
}

pub struct ArtifactFetcher {
    download: Client,
    probe: Client,
    credentials: Arc<dyn CredentialStore>,
}

impl ArtifactFetcher {
    pub fn new(
        timeouts: &HttpTimeouts,
        insecure_tls: bool,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let build = |read_timeout| {
            Client::builder()
                .connect_timeout(timeouts.connect)
                .timeout(read_timeout)
                .danger_accept_invalid_certs(insecure_tls)
                .build()
                .map_err(|err| UpdateError::Configuration(format!("http client: {err}")))
        };
        Ok(Self {
            download: build(timeouts.download)?,
            probe: build(timeouts.probe)?,
            credentials,
        })
    }

    fn authorize(&self, app: &Application, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match credentials_for(app, self.credentials.as_ref())? {
            Some(creds) => request.basic_auth(creds.username, Some(creds.password)),
            None => request,
        })
    }

    /// Probes `<url>.md5`. Every failure degrades to `None`.
    pub async fn remote_checksum(&self, app: &Application) -> Option<String> {
        let download_url = app.download_url.as_deref()?;
        let url = checksum_url(download_url);
        let request = match self.authorize(app, self.probe.get(&url)) {
            Ok(r) => r,
            Err(err) => {
                warn!(app = %app.name, error = %err, "checksum-probe-skipped");
                return None;
            }
        };
        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => {
                debug!(app = %app.name, url = %url, error = %err, "checksum-probe-failed");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(app = %app.name, url = %url, status = %response.status(), "checksum-probe-status");
            return None;
        }
        let body = response.text().await.ok()?;
        parse_remote_checksum(&body)
    }

    pub async fn download(&self, app: &Application) -> Result<Artifact> {
        let url = app
            .download_url
            .as_deref()
            .ok_or_else(|| UpdateError::Configuration(format!("app {} has no download url", app.name)))?;
        info!(app = %app.name, url = %url, "download-start");
        let response = self
            .authorize(app, self.download.get(url))?
            .send()
            .await
            .map_err(|err| UpdateError::Download(describe_reqwest_error(&err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Download(describe_status(url, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| UpdateError::Download(describe_reqwest_error(&err)))?;
        let artifact = Artifact::new(bytes.to_vec(), file_name_from_url(url));
        info!(
            app = %app.name,
            bytes = artifact.bytes.len(),
            checksum = %artifact.checksum,
            "download-finish"
        );
        Ok(artifact)
    }

    /// Downloads and applies the checksum policy.
    pub async fn fetch_verified(
        &self,
        app: &Application,
        remote: Option<&str>,
    ) -> Result<Artifact> {
        let artifact = self.download(app).await?;
        verify(app, remote, &artifact.checksum)?;
        Ok(artifact)
    }
}

/// Rejects only when enforcement is on and a published checksum disagrees.
pub fn verify(app: &Application, remote: Option<&str>, local: &str) -> Result<()> {
    if !app.enforces_checksum() {
        return Ok(());
    }
    match remote {
        Some(remote) if !remote.eq_ignore_ascii_case(local) => Err(UpdateError::Verification {
            remote: remote.to_string(),
            local: local.to_string(),
        }),
        Some(_) => Ok(()),
        None => {
            debug!(app = %app.name, "checksum-verify-skipped remote unknown");
            Ok(())
        }
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return format!("timeout: {err}");
    }
    err.to_string()
}

fn describe_status(url: &str, status: StatusCode) -> String {
    format!("{url} responded {status}")
}
