//! Command implementations for lakectl CLI

pub mod app_state;
pub mod config;
pub mod instances;
pub mod query;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use lakectl_core::{LakectlConfig, PoolSlot, RotatingPool, WorkspaceClient};
use tracing::{debug, info};

// Re-export main dispatcher functions for flat access from main.rs
pub use app_state::run_app_state;
pub use config::run_config;
pub use instances::run_instances;
pub use query::run_query;

/// Which instance and database to open a pool against.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Lakebase database instance name
    #[arg(long, env = "LAKEBASE_INSTANCE")]
    pub instance: Option<String>,

    /// Database to connect to (default: databricks_postgres)
    #[arg(long, env = "LAKEBASE_DATABASE")]
    pub database: Option<String>,

    /// Postgres role (default: the workspace user name)
    #[arg(long, env = "LAKEBASE_USER")]
    pub user: Option<String>,
}

/// Workspace client from `[workspace].host` / `DATABRICKS_HOST` and `DATABRICKS_TOKEN`.
pub fn workspace_client(config: &LakectlConfig) -> Result<WorkspaceClient> {
    let host = config
        .workspace
        .host
        .as_deref()
        .context("No workspace host: set DATABRICKS_HOST or [workspace].host in lakectl.toml")?;
    let token = std::env::var("DATABRICKS_TOKEN").context("DATABRICKS_TOKEN is not set")?;
    Ok(WorkspaceClient::new(host, token)?)
}

/// Resolve the instance and role, then build a pool whose connections each
/// authenticate with a freshly minted credential.
pub async fn connect_pool(config: &LakectlConfig, args: &ConnectionArgs) -> Result<RotatingPool> {
    let client = workspace_client(config)?;

    let instance_name = args
        .instance
        .clone()
        .or_else(|| config.defaults.instance.clone())
        .context("No instance given: pass --instance or set LAKEBASE_INSTANCE")?;
    let database = args
        .database
        .clone()
        .unwrap_or_else(|| config.defaults.database.clone());

    let user = match args.user.clone().or_else(|| config.defaults.user.clone()) {
        Some(user) => user,
        None => {
            let me = client
                .current_user()
                .await
                .context("Failed to determine the workspace user")?;
            debug!(user = %me.user_name, "using workspace identity as postgres role");
            me.user_name
        }
    };

    let settings = config
        .resolve_pool_settings(&client, &instance_name, &user, &database)
        .await?;
    info!(instance = %instance_name, host = %settings.host, database = %database, "connecting");

    let slot: PoolSlot = PoolSlot::new();
    let pool = slot
        .acquire_pool(&settings, Arc::new(client))
        .await
        .with_context(|| format!("Failed to open a pool for {instance_name:?}"))?;
    Ok(pool)
}
