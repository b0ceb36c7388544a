use anyhow::Result;

use crate::config::CliConfig;
use crate::output::{OutputFormat, json::print_json};

pub fn run(config: &CliConfig, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return print_json(config);
    }

    let rendered = toml::to_string_pretty(config)?;
    print!("{rendered}");
    Ok(())
}
