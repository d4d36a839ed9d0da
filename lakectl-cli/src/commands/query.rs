//! Read rows from a table through a rotating-credential pool

use anyhow::{Context, Result};
use clap::Parser;
use lakectl_core::{query_table, LakectlConfig, QualifiedTable};
use tracing::debug;

use super::{connect_pool, ConnectionArgs};
use crate::output::{print_result, OutputFormat};

#[derive(Parser, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Table to read, as `table` or `schema.table`
    #[arg(long)]
    pub table: String,

    /// Maximum number of rows to return (default: 10)
    #[arg(long)]
    pub limit: Option<i64>,
}

pub async fn run_query(args: QueryArgs, format: OutputFormat) -> Result<()> {
    let config = LakectlConfig::load();
    let table = QualifiedTable::parse(&args.table)?;
    let limit = args.limit.unwrap_or(config.defaults.limit);

    let pool = connect_pool(&config, &args.connection).await?;
    let result = query_table(&pool, &table, limit)
        .await
        .with_context(|| format!("Failed to read {table}"))?;
    debug!(rows = result.len(), status = ?pool.status(), "query finished");

    print_result(&result, format)?;
    pool.close();
    Ok(())
}
