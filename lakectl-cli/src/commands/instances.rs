//! Database instance discovery
//!
//! Commands: list, show, create

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lakectl_core::{provision, DatabaseInstance, LakectlConfig, ProvisionPlan, WorkspaceClient};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use super::workspace_client;
use crate::output::{print_json, render_table, OutputFormat};

#[derive(Parser, Debug)]
pub struct InstancesArgs {
    #[command(subcommand)]
    pub command: InstancesCommands,
}

#[derive(Subcommand, Debug)]
pub enum InstancesCommands {
    /// List database instances visible to the workspace token
    List,
    /// Show a single database instance
    Show {
        /// Instance name
        name: String,
    },
    /// Create an instance, a database catalog on it, and a synced demo table
    Create(CreateArgs),
}

#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Acknowledge that the created resources are billed to the workspace
    #[arg(long = "i-understand-costs")]
    pub i_understand_costs: bool,

    /// Instance name (default: <user id>-lakebase-demo)
    #[arg(long)]
    pub name: Option<String>,

    /// Instance capacity
    #[arg(long, default_value = "CU_1")]
    pub capacity: String,

    /// Number of nodes
    #[arg(long, default_value_t = 1)]
    pub node_count: u32,

    /// Enable readable secondaries
    #[arg(long)]
    pub enable_readable_secondaries: bool,

    /// Point-in-time restore window in days
    #[arg(long = "retention-days", default_value_t = 7)]
    pub retention_days: u32,

    /// Database created behind the catalog
    #[arg(long, default_value = "demo_database")]
    pub database: String,

    /// Catalog name (default: <user id>-pg-catalog)
    #[arg(long, env = "LAKEBASE_CATALOG_NAME")]
    pub catalog: Option<String>,

    /// Catalog holding the sync pipeline's storage
    #[arg(long, env = "SYNCED_TABLE_STORAGE_CATALOG")]
    pub storage_catalog: Option<String>,

    /// Schema holding the sync pipeline's storage
    #[arg(long, env = "SYNCED_TABLE_STORAGE_SCHEMA")]
    pub storage_schema: Option<String>,

    /// Minutes to wait for the instance to become available
    #[arg(long, default_value_t = 20)]
    pub wait_minutes: u64,
}

impl CreateArgs {
    /// What `create` would do, with unresolved names shown as their patterns.
    fn summary(&self) -> String {
        let instance = self.name.as_deref().unwrap_or("<user id>-lakebase-demo");
        let catalog = self.catalog.as_deref().unwrap_or("<user id>-pg-catalog");
        format!(
            "instance: {instance} ({}, {} node(s), {} day retention)\n\
             catalog:  {catalog} over database {}\n",
            self.capacity, self.node_count, self.retention_days, self.database
        )
    }

    fn apply(self, mut plan: ProvisionPlan) -> ProvisionPlan {
        if let Some(name) = self.name {
            plan.instance_name = name;
        }
        if let Some(catalog) = self.catalog {
            plan.catalog_name = catalog;
        }
        if let Some(storage_catalog) = self.storage_catalog {
            plan.storage_catalog = storage_catalog;
        }
        if let Some(storage_schema) = self.storage_schema {
            plan.storage_schema = storage_schema;
        }
        plan.capacity = self.capacity;
        plan.node_count = self.node_count;
        plan.enable_readable_secondaries = self.enable_readable_secondaries;
        plan.retention_window_in_days = self.retention_days;
        plan.database_name = self.database;
        plan.ready_timeout = std::time::Duration::from_secs(self.wait_minutes * 60);
        plan.acknowledge_costs(self.i_understand_costs)
    }
}

pub async fn run_instances(args: InstancesArgs, format: OutputFormat) -> Result<()> {
    let instances = match args.command {
        InstancesCommands::List => configured_client()?
            .list_database_instances()
            .await
            .context("Failed to list database instances")?,
        InstancesCommands::Show { name } => vec![configured_client()?
            .get_database_instance(&name)
            .await
            .with_context(|| format!("Failed to look up instance {name:?}"))?],
        InstancesCommands::Create(create) => return run_create(create, format).await,
    };

    match format {
        OutputFormat::Json => print_json(&instances),
        OutputFormat::Text => {
            let (columns, rows) = instance_table(&instances);
            print!("{}", render_table(&columns, &rows));
            Ok(())
        }
    }
}

fn configured_client() -> Result<WorkspaceClient> {
    workspace_client(&LakectlConfig::load())
}

async fn run_create(args: CreateArgs, format: OutputFormat) -> Result<()> {
    if !args.i_understand_costs {
        eprint!("{}", args.summary());
        eprintln!(
            "This creates a database instance, a catalog and a synced table, all billed to \
             the workspace. Re-run with --i-understand-costs to continue."
        );
        eprintln!("No resources were created.");
        return Ok(());
    }

    let client = configured_client()?;
    let me = client
        .current_user()
        .await
        .context("Failed to determine the workspace user")?;
    let plan = args.apply(ProvisionPlan::for_user(&me));
    info!(instance = %plan.instance_name, catalog = %plan.catalog_name, "provisioning");

    let resources = provision(&client, &plan)
        .await
        .with_context(|| format!("Failed to provision {:?}", plan.instance_name))?;

    match format {
        OutputFormat::Json => print_json(&resources),
        OutputFormat::Text => {
            let (columns, rows) = instance_table(std::slice::from_ref(&resources.instance));
            print!("{}", render_table(&columns, &rows));
            println!("catalog:      {}", resources.catalog.name);
            println!("synced table: {}", resources.synced_table);
            if let Some(pipeline) = &resources.pipeline_id {
                println!("pipeline:     {pipeline}");
            }
            Ok(())
        }
    }
}

fn instance_table(instances: &[DatabaseInstance]) -> (Vec<String>, Vec<Vec<JsonValue>>) {
    let columns = ["name", "state", "capacity", "pg_version", "read_write_dns"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let rows = instances
        .iter()
        .map(|i| {
            vec![
                json!(i.name),
                json!(i.state),
                json!(i.capacity),
                json!(i.pg_version),
                json!(i.read_write_dns),
            ]
        })
        .collect();
    (columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_render_as_null() {
        let instance = DatabaseInstance {
            name: "demo-instance".to_string(),
            state: Some("AVAILABLE".to_string()),
            ..Default::default()
        };

        let (columns, rows) = instance_table(&[instance]);
        assert_eq!(columns.len(), 5);
        assert_eq!(rows[0][0], json!("demo-instance"));
        assert_eq!(rows[0][1], json!("AVAILABLE"));
        assert_eq!(rows[0][4], JsonValue::Null);
    }

    #[test]
    fn test_create_summary_shows_name_patterns() {
        let args = CreateArgs::parse_from(["create", "--capacity", "CU_2"]);
        let summary = args.summary();
        assert!(summary.contains("<user id>-lakebase-demo (CU_2, 1 node(s), 7 day retention)"));
        assert!(summary.contains("<user id>-pg-catalog over database demo_database"));
    }

    #[test]
    fn test_create_flags_override_plan_defaults() {
        let args = CreateArgs {
            i_understand_costs: true,
            name: Some("orders-db".to_string()),
            capacity: "CU_4".to_string(),
            node_count: 2,
            enable_readable_secondaries: true,
            retention_days: 3,
            database: "orders".to_string(),
            catalog: None,
            storage_catalog: Some("main".to_string()),
            storage_schema: None,
            wait_minutes: 5,
        };

        let plan = args.apply(ProvisionPlan::for_owner("u42"));
        assert_eq!(plan.instance_name, "orders-db");
        assert_eq!(plan.catalog_name, "u42-pg-catalog");
        assert_eq!(plan.capacity, "CU_4");
        assert_eq!(plan.node_count, 2);
        assert!(plan.enable_readable_secondaries);
        assert_eq!(plan.retention_window_in_days, 3);
        assert_eq!(plan.database_name, "orders");
        assert_eq!(plan.storage_catalog, "main");
        assert_eq!(plan.storage_schema, "default_storage_schema");
        assert_eq!(plan.ready_timeout, std::time::Duration::from_secs(300));
        assert!(plan.costs_acknowledged);
    }
}
