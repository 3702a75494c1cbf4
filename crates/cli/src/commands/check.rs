//! `pagewright check`: everything a run would load, minus the browser

use anyhow::{Context, Result};
use tracing::debug;

use pagewright_core::RouteRegistry;

use super::{load_fixtures, load_scenarios, GlobalArgs};
use crate::output;

pub fn execute(global: &GlobalArgs) -> Result<()> {
    let config = global.load_config()?;
    let fixtures = load_fixtures(&config)?;
    let set = load_scenarios(&config)?;

    let mut routes = 0;
    for scenario in set.iter() {
        let resolved = set
            .resolve(&scenario.name)
            .with_context(|| format!("resolving scenario '{}'", scenario.name))?;
        let mode = resolved.mock_mode.unwrap_or(config.mock_mode);
        let registry = RouteRegistry::from_specs(&resolved.routes, &fixtures, mode)
            .with_context(|| format!("building routes for '{}'", resolved.name))?;
        debug!(
            "{}: {} step(s), {} route(s)",
            resolved.name,
            resolved.steps.len(),
            registry.routes().len()
        );
        routes += registry.routes().len();
    }

    output::print_success(&format!(
        "{} scenario(s), {} fixture(s), {} route(s) OK",
        set.len(),
        fixtures.len(),
        routes
    ));
    Ok(())
}
