//! Auxiliary HTTP server: spawned before the browser, health checked, and
//! stopped when the session closes

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

const PORT_PLACEHOLDER: &str = "{port}";
const STOP_GRACE: Duration = Duration::from_millis(1500);

/// Configuration for spawning a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program and arguments; `{port}` is replaced with the chosen port
    pub command: Vec<String>,

    pub working_dir: Option<PathBuf>,

    /// Extra environment; values may use `{port}` too
    pub env: BTreeMap<String, String>,

    /// Port to listen on (None = find free port)
    pub port: Option<u16>,

    /// Path polled until it answers 2xx
    pub health_path: String,

    pub startup_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            port: None,
            health_path: "/".to_string(),
            startup_timeout_ms: 30_000,
        }
    }
}

/// Handle to a running server process
pub struct AuxServer {
    child: Option<Child>,
    base_url: String,
    port: u16,
}

impl AuxServer {
    pub async fn spawn(config: &ServerConfig) -> HarnessResult<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| HarnessError::Server("server command is empty".to_string()))?;

        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);
        let expand = |s: &str| s.replace(PORT_PLACEHOLDER, &port.to_string());

        info!("Spawning auxiliary server on port {}: {}", port, program);

        let mut cmd = Command::new(expand(program));
        cmd.args(args.iter().map(|a| expand(a)))
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, expand(value));
        }
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HarnessError::Server(format!("failed to spawn {}: {}", program, e)))?;

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!("[server] {}", line);
                }
            });
        }

        let mut server = AuxServer {
            child: Some(child),
            base_url,
            port,
        };

        let health_url = format!(
            "{}/{}",
            server.base_url,
            config.health_path.trim_start_matches('/')
        );
        if let Err(e) = server
            .wait_for_healthy(&health_url, Duration::from_millis(config.startup_timeout_ms))
            .await
        {
            server.stop().await;
            return Err(e);
        }

        info!("Server is healthy at {}", server.base_url);
        Ok(server)
    }

    async fn wait_for_healthy(&mut self, url: &str, timeout: Duration) -> HarnessResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout {
            attempts += 1;

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(HarnessError::Server(format!(
                        "server exited during startup ({})",
                        status
                    )));
                }
            }

            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!("Health check returned {}", resp.status()),
                Err(e) => {
                    // Connection refused is expected while the server starts
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(HarnessError::Server(format!(
            "health check on {} failed after {} attempts",
            url, attempts
        )))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// SIGTERM, a short grace period, then kill. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("Stopping auxiliary server (pid: {})", child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + STOP_GRACE;
                while Instant::now() < deadline {
                    if let Ok(Some(_)) = child.try_wait() {
                        return;
                    }
                    sleep(Duration::from_millis(50)).await;
                }
            }
        }

        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for AuxServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Auxiliary server dropped without stop, killing pid {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Find a free local port
pub fn find_free_port() -> HarnessResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
