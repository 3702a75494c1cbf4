//! Harness configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::server::ServerConfig;
use crate::visual::VisualConfig;

/// Top-level configuration, usually read from `pagewright.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Browser session settings
    pub session: SessionConfig,

    /// Step and navigation timeouts
    pub timeouts: TimeoutConfig,

    /// Auxiliary server spawned per session (optional)
    pub server: Option<ServerConfig>,

    /// Visual baseline comparison (optional)
    pub visual: Option<VisualConfig>,

    /// Behaviour for requests no route matches
    pub mock_mode: MockMode,

    /// Directory of fixture files
    pub fixtures_dir: PathBuf,

    /// Directory of scenario YAML files
    pub scenarios_dir: PathBuf,

    /// Root directory for evidence and reports
    pub output_dir: PathBuf,

    /// Maximum number of scenarios run concurrently
    pub max_parallel: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            server: None,
            visual: None,
            mock_mode: MockMode::default(),
            fixtures_dir: PathBuf::from("fixtures"),
            scenarios_dir: PathBuf::from("scenarios"),
            output_dir: PathBuf::from("test-results"),
            max_parallel: 1,
        }
    }
}

impl HarnessConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> HarnessResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.max_parallel == 0 {
            return Err(HarnessError::Config("max_parallel must be at least 1".into()));
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(HarnessError::Config("poll_interval_ms must be positive".into()));
        }
        if self.session.viewport.width == 0 || self.session.viewport.height == 0 {
            return Err(HarnessError::Config("viewport dimensions must be positive".into()));
        }
        Ok(())
    }
}

/// How the registry treats requests with no matching route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Forward unmatched requests to the real network
    #[default]
    Lenient,
    /// Fail unmatched requests and the scenario that issued them
    Strict,
}

impl std::fmt::Display for MockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockMode::Lenient => write!(f, "lenient"),
            MockMode::Strict => write!(f, "strict"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Browser process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub browser: BrowserKind,

    pub headless: bool,

    pub viewport: Viewport,

    /// Base URL relative navigations resolve against. A running auxiliary
    /// server's URL takes precedence.
    pub base_url: String,

    /// Node.js binary that runs the driver script
    pub node_binary: PathBuf,

    /// Extra `NODE_PATH` entry so `require('playwright')` resolves
    pub node_path: Option<PathBuf>,

    /// Time allowed for the driver to start and the browser to launch
    pub launch_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            viewport: Viewport::default(),
            base_url: "http://127.0.0.1:8080".to_string(),
            node_binary: PathBuf::from("node"),
            node_path: None,
            launch_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default budget for a step without its own `timeout_ms`
    pub step_ms: u64,

    /// Budget for navigation steps without their own `timeout_ms`
    pub navigation_ms: u64,

    /// Delay between polling attempts
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_ms: 5_000,
            navigation_ms: 15_000,
            poll_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mock_mode, MockMode::Lenient);
        assert!(config.session.headless);
        assert!(config.server.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = HarnessConfig::from_toml(
            r#"
mock_mode = "strict"
max_parallel = 4

[session]
browser = "firefox"
headless = false
base_url = "http://localhost:8000"

[timeouts]
step_ms = 2000

[server]
command = ["python3", "-m", "http.server", "{port}"]
health_path = "/"
"#,
        )
        .unwrap();

        assert_eq!(config.mock_mode, MockMode::Strict);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.session.browser, BrowserKind::Firefox);
        assert!(!config.session.headless);
        assert_eq!(config.session.viewport, Viewport::default());
        assert_eq!(config.timeouts.step_ms, 2000);
        assert_eq!(config.timeouts.poll_interval_ms, 100);
        let server = config.server.unwrap();
        assert_eq!(server.command[0], "python3");
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = HarnessConfig::from_toml("max_parallel = 0").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
