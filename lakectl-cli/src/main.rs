//! lakectl CLI - Lakebase access with per-connection rotating credentials
//!
//! This is the main entry point for the lakectl command-line tool, which provides:
//! - Database instance discovery and provisioning (`instances` subcommand)
//! - Table reads through a credential-rotating pool (`query` subcommand)
//! - The session state round trip (`app-state` subcommand)
//! - Configuration inspection (`config` subcommand)

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod output;
mod tracing_setup;

use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "lakectl",
    author,
    version,
    about = "Query Databricks Lakebase instances with rotating OAuth credentials",
    long_about = "Every pooled Postgres connection authenticates with a freshly minted \
                  database credential, so long-running pools outlive individual tokens."
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List or inspect database instances
    Instances(commands::instances::InstancesArgs),
    /// Read rows from a table (SELECT * ... LIMIT n)
    Query(commands::query::QueryArgs),
    /// Write a session key/value and read the session back
    AppState(commands::app_state::AppStateArgs),
    /// Inspect lakectl configuration (show, path)
    Config(commands::config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing, so `env = ...` arguments see values from .env
    lakectl_core::load_dotenv();
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug })?;

    match cli.command {
        Commands::Instances(args) => commands::run_instances(args, cli.format).await?,
        Commands::Query(args) => commands::run_query(args, cli.format).await?,
        Commands::AppState(args) => commands::run_app_state(args, cli.format).await?,
        Commands::Config(args) => commands::run_config(args, cli.format)?,
        Commands::Completions(args) => run_completions(args)?,
    }
    Ok(())
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());

    Ok(())
}
