use std::fs;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

const EXEC_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("{command} exited with {exit}: {stderr}")]
    CommandFailed {
        command: String,
        exit: String,
        stderr: String,
    },
    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },
    #[error("unexpected runtime output: {0}")]
    Parse(String),
    #[error("exec session error: {0}")]
    Exec(String),
}

impl RuntimeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::CommandFailed { .. } => "command-failed",
            Self::Spawn { .. } => "spawn-failed",
            Self::Parse(_) => "parse-error",
            Self::Exec(_) => "exec-error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names without the leading `/`.
    pub names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    /// Unix millis; `None` when the container never started.
    pub started_at: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub tail: Option<u64>,
    /// Unix seconds.
    pub since: Option<i64>,
    pub timestamps: bool,
}

/// Interactive byte stream into a running container.
#[async_trait]
pub trait ExecSession: Send {
    async fn send(&mut self, input: &[u8]) -> Result<(), RuntimeError>;
    /// Combined stdout/stderr collected so far.
    fn output(&self) -> String;
    async fn close(&mut self) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
    async fn restart(&self, id: &str) -> Result<(), RuntimeError>;
    async fn logs(&self, id: &str, options: &LogOptions) -> Result<Vec<String>, RuntimeError>;
    async fn daemon_id(&self) -> Result<String, RuntimeError>;
    async fn open_exec(&self, id: &str) -> Result<Box<dyn ExecSession>, RuntimeError>;
}

/// Container ids are compared by prefix so short and full ids match.
pub fn same_container(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(b) || b.starts_with(a)
}

/// Extracts the 64-hex container id from `/proc/self/cgroup` content.
pub fn parse_cgroup_container_id(content: &str) -> Option<String> {
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| Regex::new(r"[0-9a-f]{64}").unwrap());
    content
        .lines()
        .filter(|line| line.contains("docker") || line.contains("libpod"))
        .find_map(|line| re.find(line).map(|m| m.as_str().to_string()))
}

pub fn detect_self_container_id() -> Option<String> {
    fs::read_to_string("/proc/self/cgroup")
        .ok()
        .and_then(|content| parse_cgroup_container_id(&content))
}

/// Runtime backed by the `docker` (or `podman`) command line client.
#[derive(Clone, Debug)]
pub struct DockerCliRuntime {
    program: String,
}

impl DockerCliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|err| RuntimeError::Spawn {
                command: self.describe(args),
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_container(&stderr) {
            let id = args.last().copied().unwrap_or_default();
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Err(RuntimeError::CommandFailed {
            command: self.describe(args),
            exit: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr,
        })
    }

    async fn run_stdout(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.run(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let stdout = self
            .run_stdout(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"])
            .await?;
        parse_container_list(&stdout)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let stdout = self
            .run_stdout(&["inspect", "--type", "container", "--format", "{{json .State}}", id])
            .await?;
        parse_container_state(&stdout)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", id]).await.map(|_| ())
    }

    async fn restart(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["restart", id]).await.map(|_| ())
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<Vec<String>, RuntimeError> {
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = options.tail {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        if let Some(since) = options.since {
            args.push("--since".into());
            args.push(since.to_string());
        }
        if options.timestamps {
            args.push("--timestamps".into());
        }
        args.push(id.to_string());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&refs).await?;
        // The CLI forwards the container's stderr stream on its own stderr.
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        Ok(lines)
    }

    async fn daemon_id(&self) -> Result<String, RuntimeError> {
        let stdout = self.run_stdout(&["info", "--format", "{{.ID}}"]).await?;
        let id = stdout.trim();
        if id.is_empty() || id == "<no value>" {
            return Err(RuntimeError::Parse("daemon id unavailable".into()));
        }
        Ok(id.to_string())
    }

    async fn open_exec(&self, id: &str) -> Result<Box<dyn ExecSession>, RuntimeError> {
        let args = ["exec", "-i", id, "sh"];
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RuntimeError::Spawn {
                command: self.describe(&args),
                message: err.to_string(),
            })?;

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let mut collectors = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            collectors.push(spawn_collector(stdout, buffer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            collectors.push(spawn_collector(stderr, buffer.clone()));
        }
        let stdin = child.stdin.take();

        Ok(Box::new(CliExecSession {
            child,
            stdin,
            buffer,
            collectors,
        }))
    }
}

fn spawn_collector<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}

struct CliExecSession {
    child: Child,
    stdin: Option<ChildStdin>,
    buffer: Arc<Mutex<Vec<u8>>>,
    collectors: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ExecSession for CliExecSession {
    async fn send(&mut self, input: &[u8]) -> Result<(), RuntimeError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RuntimeError::Exec("session closed".into()))?;
        stdin
            .write_all(input)
            .await
            .map_err(|err| RuntimeError::Exec(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| RuntimeError::Exec(err.to_string()))
    }

    fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        // EOF on stdin ends the shell.
        drop(self.stdin.take());
        match tokio::time::timeout(EXEC_CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(RuntimeError::Exec(err.to_string())),
            Err(_) => {
                self.child
                    .kill()
                    .await
                    .map_err(|err| RuntimeError::Exec(err.to_string()))?;
            }
        }
        for collector in self.collectors.drain(..) {
            let _ = collector.await;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "StartedAt", default)]
    started_at: Option<String>,
}

pub fn parse_container_state(raw: &str) -> Result<ContainerState, RuntimeError> {
    let state: RawState =
        serde_json::from_str(raw.trim()).map_err(|err| RuntimeError::Parse(err.to_string()))?;
    let started_at = state
        .started_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        // Never-started containers report year 1.
        .filter(|dt| dt.year() > 1970)
        .map(|dt| dt.timestamp_millis());
    Ok(ContainerState {
        running: state.running,
        started_at,
    })
}

/// Parses `ps --format '{{json .}}'` output. Docker emits `Names` as a comma
/// separated string, podman as an array.
pub fn parse_container_list(raw: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
    let mut containers = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: Value =
            serde_json::from_str(line).map_err(|err| RuntimeError::Parse(err.to_string()))?;
        let id = value
            .get("ID")
            .or_else(|| value.get("Id"))
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::Parse("container entry without id".into()))?
            .to_string();
        let names = match value.get("Names") {
            Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let names = names
            .into_iter()
            .map(|n: String| n.trim().trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect();
        containers.push(ContainerSummary { id, names });
    }
    Ok(containers)
}
