//! `pagewright list`

use anyhow::Result;

use super::{load_scenarios, GlobalArgs};
use crate::output;

pub fn execute(global: &GlobalArgs) -> Result<()> {
    let config = global.load_config()?;
    let set = load_scenarios(&config)?;
    output::print_scenarios(set.iter());
    Ok(())
}
