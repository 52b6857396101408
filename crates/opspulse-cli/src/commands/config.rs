//! `opspulse config` command implementation

use anyhow::Context;
use colored::Colorize;
use std::path::Path;

use crate::cli::ConfigFormat;
use crate::settings::AppConfig;

/// Execute the `opspulse config show` command
pub fn run_show(config_path: Option<&Path>, format: ConfigFormat) -> anyhow::Result<()> {
    let settings = AppConfig::load(config_path).context("Failed to load configuration")?;
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&settings)?,
        ConfigFormat::Json => serde_json::to_string_pretty(&settings)?,
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

/// Execute the `opspulse config validate` command
pub fn run_validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    let settings = AppConfig::load(config_path).context("Failed to load configuration")?;
    let problems = settings.problems();
    if problems.is_empty() {
        println!("{} Configuration is valid", "✓".green());
        return Ok(());
    }

    for problem in &problems {
        eprintln!("{} {}", "✗".red(), problem);
    }
    anyhow::bail!("{} configuration problem(s) found", problems.len())
}
