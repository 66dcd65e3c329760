//! Test doubles shared by unit tests.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::apply::Applier;
use crate::checksum::{ChecksumCache, md5_hex};
use crate::config::HttpTimeouts;
use crate::container::{
    ContainerRuntime, ContainerState, ContainerSummary, ExecSession, LogOptions, RuntimeError,
};
use crate::credentials::StaticCredentialStore;
use crate::events::EventBus;
use crate::fetch::ArtifactFetcher;
use crate::history::HistoryService;
use crate::lock::LockRegistry;
use crate::manager::AppManager;
use crate::model::Application;
use crate::store::Store;
use crate::worker::WorkerPool;

pub const TEST_ENDPOINT: &str = "node-a";

/// Fully wired manager over an in-memory store, a temp directory, a mock
/// runtime and a mock artifact server.
pub struct TestContext {
    pub dir: TempDir,
    pub store: Store,
    pub runtime: MockRuntime,
    pub server: MockServer,
    pub history: HistoryService,
    pub manager: AppManager,
}

impl TestContext {
    pub async fn new(self_container_id: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory().await.unwrap();
        let runtime = MockRuntime::new();
        let server = MockServer::start();
        let history = HistoryService::new(
            store.clone(),
            dir.path().join("backups"),
            ChecksumCache::new(Duration::from_secs(60)),
        );
        let events = EventBus::new();
        events.subscribe(Arc::new(history.clone()));
        let fetcher = ArtifactFetcher::new(
            &HttpTimeouts::default(),
            false,
            Arc::new(StaticCredentialStore::default()),
        )
        .unwrap();
        let applier = Applier::new(
            Arc::new(runtime.clone()),
            self_container_id.map(str::to_string),
            Duration::from_millis(1),
        );
        let manager = AppManager::new(
            store.clone(),
            LockRegistry::shared(store.clone(), Duration::from_secs(60)),
            Arc::new(fetcher),
            applier,
            events,
            history.clone(),
            WorkerPool::new(4),
            Some(TEST_ENDPOINT.to_string()),
        );
        Self {
            dir,
            store,
            runtime,
            server,
            history,
            manager,
        }
    }

    /// Registers an app deploying `<name>.jar`, bound to a running container `c-<name>`.
    pub async fn raw_app(&self, name: &str, deployed: &[u8], auto_restart: bool) -> Application {
        let local = self.dir.path().join("deploy").join(format!("{name}.jar"));
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, deployed).unwrap();
        let container = format!("c-{name}");
        self.runtime
            .add_container(&container, name, self.running_since(0));
        let app = Application {
            id: self.store.next_id().await.unwrap(),
            name: name.to_string(),
            container_id: Some(container),
            checksum: Some(md5_hex(deployed)),
            download_url: Some(self.server.url(&format!("/{name}.jar"))),
            local_path: Some(local.to_string_lossy().into_owned()),
            auto_restart,
            endpoint: Some(TEST_ENDPOINT.to_string()),
            ..Default::default()
        };
        self.store.save_app(&app).await.unwrap();
        app
    }

    /// Serves `bytes` at `path` with a matching `.md5` sidecar.
    pub fn publish_artifact(&self, path: &str, bytes: &[u8]) {
        self.server.route(path, 200, bytes.to_vec());
        self.server
            .route(&format!("{path}.md5"), 200, md5_hex(bytes).into_bytes());
    }

    pub fn local_path(&self, app: &Application) -> PathBuf {
        PathBuf::from(app.local_path.as_deref().unwrap())
    }

    pub fn running_since(&self, started_at: i64) -> ContainerState {
        ContainerState {
            running: true,
            started_at: Some(started_at),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
}

/// Minimal HTTP/1.1 server answering fixed routes; unknown paths get 404.
pub struct MockServer {
    addr: String,
    routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>> = Arc::default();
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();
        let routes_thread = routes.clone();
        let requests_thread = requests.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let raw = read_request(&mut stream);
                let (method, path, headers) = parse_request(&raw);
                requests_thread.lock().unwrap().push(RecordedRequest {
                    method,
                    path: path.clone(),
                    authorization: headers.get("authorization").cloned(),
                });
                let (status, body) = routes_thread
                    .lock()
                    .unwrap()
                    .get(&path)
                    .cloned()
                    .unwrap_or((404, b"not found".to_vec()));
                respond(&mut stream, status, &body);
            }
        });

        MockServer {
            addr,
            routes,
            requests,
        }
    }

    pub fn route(&self, path: &str, status: u16, body: Vec<u8>) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body));
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

fn parse_request(raw: &str) -> (String, String, HashMap<String, String>) {
    let mut lines = raw.split("\r\n");
    let first = lines.next().unwrap_or_default();
    let mut parts = first.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }
    (method, path, headers)
}

fn read_request(stream: &mut TcpStream) -> String {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        match stream.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 64 * 1024 {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn respond(stream: &mut TcpStream, status: u16, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status} OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
    Restart(String),
    Exec(String, String),
    Logs(String),
}

/// Container runtime double that records lifecycle calls.
#[derive(Clone, Default)]
pub struct MockRuntime {
    containers: Arc<Mutex<Vec<ContainerSummary>>>,
    states: Arc<Mutex<HashMap<String, ContainerState>>>,
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
    fail_stop: Arc<Mutex<bool>>,
    fail_send: Arc<Mutex<bool>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, id: &str, name: &str, state: ContainerState) {
        self.containers.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            names: vec![name.to_string()],
        });
        self.states.lock().unwrap().insert(id.to_string(), state);
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        self.states.lock().unwrap().insert(id.to_string(), state);
    }

    pub fn fail_stops(&self) {
        *self.fail_stop.lock().unwrap() = true;
    }

    /// Exec sessions opened afterwards reject input.
    pub fn fail_exec_sends(&self) {
        *self.fail_send.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn known(&self, id: &str) -> Result<(), RuntimeError> {
        if self.states.lock().unwrap().contains_key(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.states
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Start(id.to_string()));
        self.known(id)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop(id.to_string()));
        if *self.fail_stop.lock().unwrap() {
            return Err(RuntimeError::Exec("stop refused".into()));
        }
        self.known(id)
    }

    async fn restart(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Restart(id.to_string()));
        self.known(id)
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<Vec<String>, RuntimeError> {
        self.record(RuntimeCall::Logs(id.to_string()));
        self.known(id)?;
        let tail = options.tail.unwrap_or(2) as usize;
        Ok((0..tail).map(|i| format!("line {i}")).collect())
    }

    async fn daemon_id(&self) -> Result<String, RuntimeError> {
        Ok("mock-daemon".to_string())
    }

    async fn open_exec(&self, id: &str) -> Result<Box<dyn ExecSession>, RuntimeError> {
        self.known(id)?;
        Ok(Box::new(MockExecSession {
            container: id.to_string(),
            calls: self.calls.clone(),
            sent: Vec::new(),
            fail_send: *self.fail_send.lock().unwrap(),
        }))
    }
}

struct MockExecSession {
    container: String,
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
    sent: Vec<u8>,
    fail_send: bool,
}

#[async_trait]
impl ExecSession for MockExecSession {
    async fn send(&mut self, input: &[u8]) -> Result<(), RuntimeError> {
        if self.fail_send {
            return Err(RuntimeError::Exec("stdin closed".into()));
        }
        self.sent.extend_from_slice(input);
        Ok(())
    }

    fn output(&self) -> String {
        format!("ran: {}", String::from_utf8_lossy(&self.sent).trim())
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().push(RuntimeCall::Exec(
            self.container.clone(),
            String::from_utf8_lossy(&self.sent).into_owned(),
        ));
        Ok(())
    }
}
