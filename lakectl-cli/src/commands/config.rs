use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lakectl_core::config::{global_config_path, local_config_path};
use lakectl_core::LakectlConfig;

use crate::output::{print_json, OutputFormat};

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration (files + environment)
    Show,
    /// Show config file paths and whether they exist
    Path,
}

pub fn run_config(args: ConfigArgs, format: OutputFormat) -> Result<()> {
    match args.command {
        ConfigCommands::Show => run_show(format),
        ConfigCommands::Path => run_path(),
    }
}

fn run_show(format: OutputFormat) -> Result<()> {
    let config = LakectlConfig::load();
    match format {
        OutputFormat::Json => print_json(&config),
        OutputFormat::Text => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

fn run_path() -> Result<()> {
    let mut paths = Vec::new();
    if let Some(global) = global_config_path() {
        paths.push(global);
    }
    paths.push(local_config_path());

    for path in paths {
        let marker = if path.exists() { "exists" } else { "missing" };
        println!("{} ({})", path.display(), marker);
    }
    Ok(())
}
