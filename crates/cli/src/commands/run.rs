//! `pagewright run`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::{info, warn};

use pagewright_core::{PlaywrightLauncher, RunOptions, ScenarioRunner};

use super::{load_fixtures, load_scenarios, GlobalArgs};
use crate::output;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Scenario names (default: every runnable scenario)
    pub names: Vec<String>,

    /// Only run scenarios with this tag
    #[arg(long)]
    pub tag: Option<String>,
}

/// Returns the process exit code
pub async fn execute(args: RunArgs, global: &GlobalArgs) -> Result<i32> {
    let config = global.load_config()?;
    let fixtures = Arc::new(load_fixtures(&config)?);
    let scenarios = load_scenarios(&config)?.select(&args.names, args.tag.as_deref())?;

    if scenarios.is_empty() {
        output::print_warning("No scenarios selected.");
        return Ok(0);
    }
    info!(
        "Loaded {} fixture(s), running {} scenario(s) in {} mode",
        fixtures.len(),
        scenarios.len(),
        config.mock_mode
    );

    let launcher = PlaywrightLauncher::new(config.session.clone(), config.server.clone());
    let runner = ScenarioRunner::new(launcher, fixtures, RunOptions::from_config(&config))?;

    let suite = {
        let run = runner.run_all(&scenarios);
        tokio::pin!(run);
        let deadline = async {
            match global.run_timeout_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            suite = &mut run => suite,
            _ = deadline => {
                // Dropping the run future tears down every open session
                warn!("Run timeout reached, aborting");
                output::print_error("Run timed out.");
                return Ok(2);
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting");
                output::print_error("Interrupted.");
                return Ok(2);
            }
        }
    };

    let report_path = suite.write_json(&config.output_dir)?;
    output::print_suite(&suite);
    output::print_message(&format!("Report: {}", report_path.display()));

    if let Some(reason) = &suite.aborted {
        output::print_error(&format!("Harness failure: {}", reason));
    }
    Ok(suite.exit_code())
}
