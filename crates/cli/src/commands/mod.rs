//! CLI command implementations

pub mod check;
pub mod list;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::debug;

use pagewright_core::config::{BrowserKind, HarnessConfig, MockMode};
use pagewright_core::visual::VisualConfig;
use pagewright_core::{FixtureStore, ScenarioSet};

const DEFAULT_CONFIG: &str = "pagewright.toml";

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BrowserArg {
    Chromium,
    Firefox,
    Webkit,
}

impl From<BrowserArg> for BrowserKind {
    fn from(arg: BrowserArg) -> Self {
        match arg {
            BrowserArg::Chromium => BrowserKind::Chromium,
            BrowserArg::Firefox => BrowserKind::Firefox,
            BrowserArg::Webkit => BrowserKind::Webkit,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MockModeArg {
    Strict,
    Lenient,
}

impl From<MockModeArg> for MockMode {
    fn from(arg: MockModeArg) -> Self {
        match arg {
            MockModeArg::Strict => MockMode::Strict,
            MockModeArg::Lenient => MockMode::Lenient,
        }
    }
}

/// Options shared by every command. Flags override `pagewright.toml`.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Configuration file (defaults to ./pagewright.toml when present)
    #[arg(long, global = true, env = "PAGEWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Scenario directory
    #[arg(long, global = true)]
    pub scenarios: Option<PathBuf>,

    /// Fixture directory
    #[arg(long, global = true)]
    pub fixtures: Option<PathBuf>,

    /// Output directory for evidence and reports
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,

    /// Base URL for relative navigation
    #[arg(long, global = true, env = "PAGEWRIGHT_BASE_URL")]
    pub base_url: Option<String>,

    /// Show the browser window
    #[arg(long, global = true)]
    pub headed: bool,

    #[arg(long, global = true, value_enum)]
    pub browser: Option<BrowserArg>,

    /// Budget for steps without their own timeout_ms
    #[arg(long, global = true)]
    pub step_timeout_ms: Option<u64>,

    /// Behaviour for requests no route matches
    #[arg(long, global = true, value_enum)]
    pub mock_mode: Option<MockModeArg>,

    /// Scenarios run concurrently
    #[arg(long, short = 'j', global = true)]
    pub jobs: Option<usize>,

    /// Abort the whole run after this many seconds
    #[arg(long, global = true)]
    pub run_timeout_secs: Option<u64>,

    /// Write missing visual baselines from this run's screenshots
    #[arg(long, global = true)]
    pub update_baselines: bool,

    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,
}

impl GlobalArgs {
    /// Configuration file values with command-line overrides applied
    pub fn load_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG).is_file() => {
                HarnessConfig::load(Path::new(DEFAULT_CONFIG))
                    .with_context(|| format!("loading {}", DEFAULT_CONFIG))?
            }
            None => HarnessConfig::default(),
        };

        if let Some(dir) = &self.scenarios {
            config.scenarios_dir = dir.clone();
        }
        if let Some(dir) = &self.fixtures {
            config.fixtures_dir = dir.clone();
        }
        if let Some(dir) = &self.output {
            config.output_dir = dir.clone();
        }
        if let Some(url) = &self.base_url {
            config.session.base_url = url.clone();
        }
        if self.headed {
            config.session.headless = false;
        }
        if let Some(browser) = self.browser {
            config.session.browser = browser.into();
        }
        if let Some(ms) = self.step_timeout_ms {
            config.timeouts.step_ms = ms;
        }
        if let Some(mode) = self.mock_mode {
            config.mock_mode = mode.into();
        }
        if let Some(jobs) = self.jobs {
            config.max_parallel = jobs;
        }
        if self.update_baselines {
            config
                .visual
                .get_or_insert_with(VisualConfig::default)
                .update_baselines = true;
        }

        config.validate().context("invalid configuration")?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }
}

/// Fixtures from the configured directory; a missing directory is an
/// empty store
pub fn load_fixtures(config: &HarnessConfig) -> Result<FixtureStore> {
    if !config.fixtures_dir.exists() {
        debug!("No fixture directory at {}", config.fixtures_dir.display());
        return Ok(FixtureStore::empty());
    }
    FixtureStore::load(&config.fixtures_dir)
        .with_context(|| format!("loading fixtures from {}", config.fixtures_dir.display()))
}

pub fn load_scenarios(config: &HarnessConfig) -> Result<ScenarioSet> {
    ScenarioSet::load_all(&config.scenarios_dir)
        .with_context(|| format!("loading scenarios from {}", config.scenarios_dir.display()))
}
