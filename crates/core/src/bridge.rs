//! Node.js bridge to Playwright
//!
//! ```text
//! ┌──────────────────┐  commands (stdin)   ┌──────────────────┐
//! │  DriverBridge    │ ──────────────────► │  driver.js       │
//! │  (this module)   │ ◄────────────────── │  (Playwright)    │
//! └──────────────────┘  results, route     └──────────────────┘
//!          │            events (stdout)             │
//!   RouteRegistry::dispatch                     Browser
//! ```
//!
//! One long-lived `node` process per session. Every line is a JSON object.
//! Commands carry an `id` echoed by their result; intercepted requests
//! arrive as `route` events and are answered with `route_reply` from a
//! spawned task, so page requests never queue behind a pending command.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::{SessionConfig, Viewport};
use crate::error::{HarnessError, HarnessResult};
use crate::mock::{Dispatch, InterceptedRequest, RouteRegistry};
use crate::page::{
    ElementState, PageDriver, ProbeRequest, ProbeResponse, ScreenshotTarget, SelectChoice,
};

const DRIVER_SCRIPT: &str = include_str!("driver.js");

/// Slack added on top of a driver-side timeout before the bridge gives up
const CALL_SLACK: Duration = Duration::from_secs(5);
/// Ceiling for calls that carry no timeout of their own
const DEFAULT_CALL_LIMIT: Duration = Duration::from_secs(30);
const STDERR_TAIL: usize = 20;

#[derive(Debug, Deserialize)]
struct DriverFault {
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RouteEventRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body_b64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DriverEvent {
    Ready,
    Result {
        id: u64,
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<DriverFault>,
    },
    Route {
        route_id: u64,
        request: RouteEventRequest,
    },
    Console {
        page: u64,
        level: String,
        text: String,
    },
    PageError {
        page: u64,
        message: String,
    },
}

type Reply = Result<Value, DriverFault>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Launch parameters for one browser context
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub base_url: String,
    pub viewport: Viewport,
    pub intercept: bool,
}

/// A running driver process with one browser and one context
pub struct DriverBridge {
    child: Mutex<Option<Child>>,
    stdin: SharedStdin,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    console: Arc<Mutex<HashMap<u64, Vec<String>>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    _script_dir: TempDir,
}

impl DriverBridge {
    /// Spawn the driver and launch the browser. Any failure is a
    /// `SessionStart` error and leaves no process behind.
    pub async fn start(
        config: &SessionConfig,
        launch: &LaunchSpec,
        registry: Arc<RouteRegistry>,
    ) -> HarnessResult<Arc<Self>> {
        let start_err = |what: &str, e: &dyn std::fmt::Display| {
            HarnessError::SessionStart(format!("{}: {}", what, e))
        };

        let script_dir = tempfile::Builder::new()
            .prefix("pagewright-driver")
            .tempdir()
            .map_err(|e| start_err("cannot create driver directory", &e))?;
        let script = script_dir.path().join("driver.js");
        std::fs::write(&script, DRIVER_SCRIPT)
            .map_err(|e| start_err("cannot write driver script", &e))?;

        let mut cmd = Command::new(&config.node_binary);
        cmd.arg(&script)
            .env("NODE_PATH", node_path(config.node_path.as_deref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            start_err(
                &format!("failed to spawn {}", config.node_binary.display()),
                &e,
            )
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(HarnessError::SessionStart(
                "driver stdio was not captured".to_string(),
            ));
        };

        let bridge = Arc::new(Self {
            child: Mutex::new(Some(child)),
            stdin: Arc::new(tokio::sync::Mutex::new(Some(stdin))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            console: Arc::new(Mutex::new(HashMap::new())),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            _script_dir: script_dir,
        });

        bridge.spawn_stderr_forwarder(stderr);
        bridge.spawn_reader(stdout, registry);

        let launched = bridge
            .call(
                "launch",
                json!({
                    "browser": config.browser.as_str(),
                    "headless": config.headless,
                    "viewport": {"width": launch.viewport.width, "height": launch.viewport.height},
                    "base_url": launch.base_url,
                    "intercept": launch.intercept,
                }),
                config.launch_timeout(),
            )
            .await;

        match launched {
            Ok(info) => {
                debug!("Browser launched: {}", info);
                Ok(bridge)
            }
            Err(e) => {
                let tail = bridge.stderr_tail();
                bridge.kill();
                let detail = if tail.is_empty() {
                    e.to_string()
                } else {
                    format!("{}\n{}", e, tail.join("\n"))
                };
                Err(HarnessError::SessionStart(detail))
            }
        }
    }

    fn spawn_stderr_forwarder(&self, stderr: tokio::process::ChildStderr) {
        let tail = Arc::clone(&self.stderr_tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[driver] {}", line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    }

    fn spawn_reader(&self, stdout: tokio::process::ChildStdout, registry: Arc<RouteRegistry>) {
        let pending = Arc::clone(&self.pending);
        let closed = Arc::clone(&self.closed);
        let console = Arc::clone(&self.console);
        let stdin = Arc::clone(&self.stdin);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let event: DriverEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Unparseable driver output ({}): {}", e, line);
                        continue;
                    }
                };
                match event {
                    DriverEvent::Ready => trace!("driver ready"),
                    DriverEvent::Result {
                        id,
                        ok,
                        value,
                        error,
                    } => {
                        let reply = if ok {
                            Ok(value)
                        } else {
                            Err(error.unwrap_or(DriverFault {
                                kind: "driver".to_string(),
                                message: "unspecified driver error".to_string(),
                            }))
                        };
                        if let Some(tx) = pending.lock().remove(&id) {
                            let _ = tx.send(reply);
                        }
                    }
                    DriverEvent::Route { route_id, request } => {
                        let registry = Arc::clone(&registry);
                        let stdin = Arc::clone(&stdin);
                        tokio::spawn(async move {
                            let reply = route_reply(&registry, route_id, request);
                            if let Err(e) = write_line(&stdin, &reply).await {
                                debug!("route reply {} not delivered: {}", route_id, e);
                            }
                        });
                    }
                    DriverEvent::Console { page, level, text } => {
                        console
                            .lock()
                            .entry(page)
                            .or_default()
                            .push(format!("[{}] {}", level, text));
                    }
                    DriverEvent::PageError { page, message } => {
                        console
                            .lock()
                            .entry(page)
                            .or_default()
                            .push(format!("[pageerror] {}", message));
                    }
                }
            }

            closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every in-flight call with DriverClosed
            pending.lock().clear();
            debug!("driver stdout closed");
        });
    }

    /// Send one command and wait for its result
    async fn call(&self, op: &str, params: Value, limit: Duration) -> HarnessResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HarnessError::DriverClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut command = match params {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        command.insert("id".to_string(), json!(id));
        command.insert("op".to_string(), json!(op));

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = write_line(&self.stdin, &Value::Object(command)).await {
            self.pending.lock().remove(&id);
            debug!("driver write failed: {}", e);
            return Err(HarnessError::DriverClosed);
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(fault))) => Err(fault_to_error(op, fault)),
            Ok(Err(_)) => Err(HarnessError::DriverClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(HarnessError::Timeout {
                    what: format!("driver op {}", op),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    pub async fn new_page(self: &Arc<Self>) -> HarnessResult<BridgePage> {
        let value = self.call("new_page", json!({}), DEFAULT_CALL_LIMIT).await?;
        let page_id = value
            .as_u64()
            .ok_or_else(|| HarnessError::Driver(format!("bad page id {}", value)))?;
        Ok(BridgePage {
            bridge: Arc::clone(self),
            page_id,
        })
    }

    /// Close the browser and let the driver exit; kill it if it lingers
    pub async fn close(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.call("close", json!({}), Duration::from_secs(10)).await {
                warn!("Browser close failed: {}", e);
            }
        }
        // EOF on stdin ends the driver
        self.stdin.lock().await.take();

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!("driver exited: {}", status),
                _ => {
                    warn!("Driver did not exit, killing it");
                    let _ = child.start_kill();
                }
            }
        }
    }

    /// Immediate, synchronous teardown
    pub fn kill(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    fn console_for(&self, page: u64) -> Vec<String> {
        let console = self.console.lock();
        let mut lines: Vec<String> = console.get(&0).cloned().unwrap_or_default();
        lines.extend(console.get(&page).cloned().unwrap_or_default());
        lines
    }
}

impl Drop for DriverBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

fn node_path(configured: Option<&Path>) -> std::ffi::OsString {
    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(p) = configured {
        paths.push(p.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("node_modules"));
    }
    if let Some(existing) = std::env::var_os("NODE_PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_default()
}

async fn write_line(stdin: &SharedStdin, message: &Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    let mut guard = stdin.lock().await;
    let writer = guard.as_mut().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "driver stdin closed")
    })?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn route_reply(registry: &RouteRegistry, route_id: u64, request: RouteEventRequest) -> Value {
    let body = request
        .body_b64
        .as_deref()
        .and_then(|b| BASE64.decode(b).ok());
    let intercepted = InterceptedRequest {
        method: request.method,
        url: request.url,
        headers: request
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect(),
        body,
    };

    match registry.dispatch(&intercepted) {
        Ok(Dispatch::Fulfill(response)) => json!({
            "type": "route_reply",
            "route_id": route_id,
            "action": "fulfill",
            "status": response.status,
            "headers": response.headers,
            "body_b64": BASE64.encode(&response.body),
        }),
        Ok(Dispatch::PassThrough) => json!({
            "type": "route_reply",
            "route_id": route_id,
            "action": "continue",
        }),
        Err(e) => {
            debug!("aborting {}: {}", intercepted.url, e);
            json!({
                "type": "route_reply",
                "route_id": route_id,
                "action": "abort",
            })
        }
    }
}

fn fault_to_error(op: &str, fault: DriverFault) -> HarnessError {
    match fault.kind.as_str() {
        "timeout" => HarnessError::Timeout {
            what: format!("{}: {}", op, fault.message),
            timeout_ms: 0,
        },
        "not_found" => HarnessError::TargetNotFound {
            target: op.to_string(),
            reason: fault.message,
        },
        "navigation" => HarnessError::Navigation {
            url: String::new(),
            reason: fault.message,
        },
        "evaluation" => HarnessError::Evaluation(fault.message),
        _ => HarnessError::Driver(format!("{}: {}", op, fault.message)),
    }
}

/// One page of a [`DriverBridge`]
pub struct BridgePage {
    bridge: Arc<DriverBridge>,
    page_id: u64,
}

impl BridgePage {
    async fn call(&self, op: &str, mut params: Value, timeout: Option<Duration>) -> HarnessResult<Value> {
        if let Value::Object(map) = &mut params {
            map.insert("page".to_string(), json!(self.page_id));
            if let Some(t) = timeout {
                map.insert("timeout_ms".to_string(), json!(t.as_millis() as u64));
            }
        }
        let limit = timeout.map_or(DEFAULT_CALL_LIMIT, |t| t + CALL_SLACK);
        self.bridge.call(op, params, limit).await
    }
}

#[async_trait]
impl PageDriver for BridgePage {
    async fn goto(&self, url: &str, timeout: Duration) -> HarnessResult<()> {
        self.call("goto", json!({ "url": url }), Some(timeout))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                HarnessError::Navigation { reason, .. } => HarnessError::Navigation {
                    url: url.to_string(),
                    reason,
                },
                HarnessError::Timeout { .. } => HarnessError::Timeout {
                    what: format!("navigation to {}", url),
                    timeout_ms: timeout.as_millis() as u64,
                },
                other => other,
            })
    }

    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> HarnessResult<()> {
        self.call("fill", json!({ "selector": selector, "value": value }), Some(timeout))
            .await
            .map(|_| ())
            .map_err(|e| retarget(e, selector))
    }

    async fn click(&self, selector: &str, timeout: Duration) -> HarnessResult<()> {
        self.call("click", json!({ "selector": selector }), Some(timeout))
            .await
            .map(|_| ())
            .map_err(|e| retarget(e, selector))
    }

    async fn select_option(
        &self,
        selector: &str,
        choice: &SelectChoice,
        timeout: Duration,
    ) -> HarnessResult<()> {
        let params = match choice {
            SelectChoice::Label(label) => json!({ "selector": selector, "label": label }),
            SelectChoice::Value(value) => json!({ "selector": selector, "value": value }),
        };
        self.call("select_option", params, Some(timeout))
            .await
            .map(|_| ())
            .map_err(|e| retarget(e, selector))
    }

    async fn query(&self, selector: &str) -> HarnessResult<ElementState> {
        let value = self.call("query", json!({ "selector": selector }), None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn attribute(&self, selector: &str, name: &str) -> HarnessResult<Option<String>> {
        let value = self
            .call("attribute", json!({ "selector": selector, "name": name }), None)
            .await?;
        Ok(value.as_str().map(String::from))
    }

    async fn evaluate(&self, expression: &str) -> HarnessResult<Value> {
        self.call("evaluate", json!({ "expression": expression }), None)
            .await
    }

    async fn url(&self) -> HarnessResult<String> {
        let value = self.call("url", json!({}), None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self, target: &ScreenshotTarget, path: &Path) -> HarnessResult<()> {
        let params = match target {
            ScreenshotTarget::Page { full_page } => {
                json!({ "path": path, "full_page": full_page })
            }
            ScreenshotTarget::Element { selector } => {
                json!({ "path": path, "selector": selector })
            }
        };
        self.call("screenshot", params, None).await.map(|_| ())
    }

    async fn fetch(&self, request: &ProbeRequest) -> HarnessResult<ProbeResponse> {
        #[derive(Deserialize)]
        struct Raw {
            status: u16,
            #[serde(default)]
            headers: BTreeMap<String, String>,
            #[serde(default)]
            body_b64: String,
        }

        let value = self
            .call("fetch", json!({ "url": request.url, "method": request.method }), None)
            .await?;
        let raw: Raw = serde_json::from_value(value)?;
        let body = BASE64
            .decode(raw.body_b64.as_bytes())
            .map_err(|e| HarnessError::Driver(format!("bad fetch body: {}", e)))?;
        Ok(ProbeResponse {
            status: raw.status,
            headers: raw
                .headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            body,
        })
    }

    async fn console(&self) -> Vec<String> {
        self.bridge.console_for(self.page_id)
    }
}

fn retarget(err: HarnessError, selector: &str) -> HarnessError {
    match err {
        HarnessError::TargetNotFound { reason, .. } => HarnessError::TargetNotFound {
            target: selector.to_string(),
            reason,
        },
        other => other,
    }
}
