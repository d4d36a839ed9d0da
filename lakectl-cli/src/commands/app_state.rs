//! Session state round trip: ensure the table, upsert a value, read it back

use anyhow::{Context, Result};
use clap::Parser;
use lakectl_core::{AppStateRepo, LakectlConfig, QualifiedTable};
use uuid::Uuid;

use super::{connect_pool, ConnectionArgs};
use crate::output::{print_result, OutputFormat};

#[derive(Parser, Debug)]
pub struct AppStateArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Schema holding the state table (default: public)
    #[arg(long)]
    pub schema: Option<String>,

    /// State table name (default: app_state)
    #[arg(long)]
    pub table: Option<String>,

    /// Session to write under (default: a new random id)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Key to set
    #[arg(long, default_value = "feedback_message")]
    pub key: String,

    /// Value to store
    #[arg(long, default_value = "true")]
    pub value: String,
}

pub async fn run_app_state(args: AppStateArgs, format: OutputFormat) -> Result<()> {
    let config = LakectlConfig::load();
    let schema = args.schema.unwrap_or_else(|| config.defaults.schema.clone());
    let table_name = args.table.unwrap_or_else(|| config.defaults.table.clone());
    let table = QualifiedTable::new(&schema, &table_name)?;
    let session_id = args
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let pool = connect_pool(&config, &args.connection).await?;
    let repo = AppStateRepo::new(&pool, table);

    repo.upsert(&session_id, &args.key, &args.value)
        .await
        .with_context(|| format!("Failed to write state to {}", repo.table()))?;
    let result = repo
        .for_session(&session_id)
        .await
        .with_context(|| format!("Failed to read state from {}", repo.table()))?;

    print_result(&result, format)?;
    pool.close();
    Ok(())
}
