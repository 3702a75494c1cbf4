//! Browser session lifecycle
//!
//! A session owns one driver process, one isolated browser context and an
//! optional auxiliary server. Release happens exactly once: through
//! [`ActiveSession::close`], or through `Drop` when the owning future is
//! cancelled.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use crate::bridge::{DriverBridge, LaunchSpec};
use crate::config::{SessionConfig, Viewport};
use crate::error::{HarnessError, HarnessResult};
use crate::mock::RouteRegistry;
use crate::page::PageDriver;
use crate::server::{AuxServer, ServerConfig};

/// Per-scenario session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    /// Scenario override; otherwise the server URL or the configured one
    pub base_url: Option<String>,
    pub viewport: Viewport,
}

/// Opens browser sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(
        &self,
        spec: &SessionSpec,
        registry: Arc<RouteRegistry>,
    ) -> HarnessResult<Box<dyn ActiveSession>>;
}

/// An open session
#[async_trait]
pub trait ActiveSession: Send + Sync {
    /// URL relative navigations resolve against
    fn base_url(&self) -> &str;

    async fn new_page(&self) -> HarnessResult<Box<dyn PageDriver>>;

    /// Release every resource. Later calls do nothing.
    async fn close(&self);
}

/// Open a session, run `f`, and close the session whether `f` returns,
/// fails, or panics. A panic is resumed after the session is closed.
pub async fn with_session<P, F, Fut, T>(
    provider: &P,
    spec: &SessionSpec,
    registry: Arc<RouteRegistry>,
    f: F,
) -> HarnessResult<T>
where
    P: SessionProvider + ?Sized,
    F: FnOnce(Arc<dyn ActiveSession>) -> Fut,
    Fut: Future<Output = T>,
{
    let session: Arc<dyn ActiveSession> = Arc::from(provider.open(spec, registry).await?);
    let result = AssertUnwindSafe(f(Arc::clone(&session))).catch_unwind().await;
    session.close().await;
    match result {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Playwright-backed session
pub struct BrowserSession {
    bridge: Arc<DriverBridge>,
    server: tokio::sync::Mutex<Option<AuxServer>>,
    base_url: String,
    released: AtomicBool,
}

#[async_trait]
impl ActiveSession for BrowserSession {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn new_page(&self) -> HarnessResult<Box<dyn PageDriver>> {
        let page = self.bridge.new_page().await?;
        Ok(Box::new(page))
    }

    async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing browser session");
        self.bridge.close().await;
        if let Some(mut server) = self.server.lock().await.take() {
            server.stop().await;
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            warn!("Browser session dropped without close, killing processes");
            self.bridge.kill();
            // AuxServer's own Drop kills the server process
        }
    }
}

/// Launches Playwright through Node.js
#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    config: SessionConfig,
    server: Option<ServerConfig>,
}

impl PlaywrightLauncher {
    pub fn new(config: SessionConfig, server: Option<ServerConfig>) -> Self {
        Self { config, server }
    }
}

#[async_trait]
impl SessionProvider for PlaywrightLauncher {
    async fn open(
        &self,
        spec: &SessionSpec,
        registry: Arc<RouteRegistry>,
    ) -> HarnessResult<Box<dyn ActiveSession>> {
        let server = match &self.server {
            Some(config) => Some(AuxServer::spawn(config).await.map_err(|e| {
                HarnessError::SessionStart(format!("auxiliary server: {}", e))
            })?),
            None => None,
        };

        let base_url = spec
            .base_url
            .clone()
            .or_else(|| server.as_ref().map(|s| s.base_url().to_string()))
            .unwrap_or_else(|| self.config.base_url.clone());

        let launch = LaunchSpec {
            base_url: base_url.clone(),
            viewport: spec.viewport,
            intercept: registry.intercepts(),
        };

        info!(
            "Launching {} (headless: {}) against {}",
            self.config.browser.as_str(),
            self.config.headless,
            base_url
        );

        let bridge = match DriverBridge::start(&self.config, &launch, registry).await {
            Ok(bridge) => bridge,
            Err(e) => {
                if let Some(mut server) = server {
                    server.stop().await;
                }
                return Err(e);
            }
        };

        Ok(Box::new(BrowserSession {
            bridge,
            server: tokio::sync::Mutex::new(server),
            base_url,
            released: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockMode;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_node_is_session_start() {
        let config = SessionConfig {
            node_binary: PathBuf::from("/nonexistent/node-binary"),
            ..SessionConfig::default()
        };
        let launcher = PlaywrightLauncher::new(config, None);
        let spec = SessionSpec {
            base_url: None,
            viewport: Viewport::default(),
        };
        let result = launcher
            .open(&spec, Arc::new(RouteRegistry::new(MockMode::Lenient)))
            .await;
        match result {
            Err(HarnessError::SessionStart(msg)) => assert!(msg.contains("failed to spawn")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("session should not open"),
        }
    }
}
