//! Demo resource provisioning
//!
//! Creates a database instance and waits for it, registers a Unity Catalog
//! catalog over a database on it, then starts a synced table fed from a
//! Unity Catalog source table. All three bill the workspace, so
//! [`provision`] refuses to run until the plan acknowledges the costs.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::workspace::{
    CurrentUser, DatabaseCatalog, DatabaseInstance, NewDatabaseInstance, NewPipelineSpec,
    NewSyncedTable, SchedulingPolicy, SyncedTableSpec, WorkspaceClient,
};

pub const DEFAULT_CAPACITY: &str = "CU_1";
pub const DEFAULT_DATABASE: &str = "demo_database";
pub const DEFAULT_STORAGE_CATALOG: &str = "default_storage_catalog";
pub const DEFAULT_STORAGE_SCHEMA: &str = "default_storage_schema";
pub const DEFAULT_SOURCE_TABLE: &str = "samples.tpch.orders";

#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub instance_name: String,
    pub capacity: String,
    pub node_count: u32,
    pub enable_readable_secondaries: bool,
    pub retention_window_in_days: u32,
    /// Postgres database behind the catalog; created if missing.
    pub database_name: String,
    pub catalog_name: String,
    pub storage_catalog: String,
    pub storage_schema: String,
    pub source_table: String,
    pub primary_key_columns: Vec<String>,
    pub timeseries_key: Option<String>,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    pub costs_acknowledged: bool,
}

impl ProvisionPlan {
    /// Defaults with resource names prefixed by `owner`.
    pub fn for_owner(owner: &str) -> Self {
        Self {
            instance_name: format!("{owner}-lakebase-demo"),
            capacity: DEFAULT_CAPACITY.to_string(),
            node_count: 1,
            enable_readable_secondaries: false,
            retention_window_in_days: 7,
            database_name: DEFAULT_DATABASE.to_string(),
            catalog_name: format!("{owner}-pg-catalog"),
            storage_catalog: DEFAULT_STORAGE_CATALOG.to_string(),
            storage_schema: DEFAULT_STORAGE_SCHEMA.to_string(),
            source_table: DEFAULT_SOURCE_TABLE.to_string(),
            primary_key_columns: vec!["o_orderkey".to_string()],
            timeseries_key: Some("o_orderdate".to_string()),
            poll_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(20 * 60),
            costs_acknowledged: false,
        }
    }

    /// Owner prefix is the workspace user id, or the local part of the user
    /// name when the id is missing.
    pub fn for_user(user: &CurrentUser) -> Self {
        let owner = match &user.id {
            Some(id) => id.as_str(),
            None => user
                .user_name
                .split('@')
                .next()
                .unwrap_or(&user.user_name),
        };
        Self::for_owner(owner)
    }

    pub fn acknowledge_costs(mut self, acknowledged: bool) -> Self {
        self.costs_acknowledged = acknowledged;
        self
    }

    /// `<catalog>.public.<source leaf>_synced`
    pub fn synced_table_name(&self) -> String {
        let leaf = self
            .source_table
            .rsplit('.')
            .next()
            .unwrap_or(&self.source_table);
        format!("{}.public.{leaf}_synced", self.catalog_name)
    }

    fn validate(&self) -> Result<()> {
        if !self.costs_acknowledged {
            return Err(Error::CostsNotAcknowledged);
        }
        if self.node_count == 0 {
            return Err(Error::Config("node_count must be at least 1".to_string()));
        }
        if self.primary_key_columns.is_empty() {
            return Err(Error::Config(
                "a synced table needs at least one primary key column".to_string(),
            ));
        }
        for (field, value) in [
            ("instance name", &self.instance_name),
            ("catalog name", &self.catalog_name),
            ("database name", &self.database_name),
            ("source table", &self.source_table),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    fn instance_request(&self) -> NewDatabaseInstance {
        NewDatabaseInstance {
            name: self.instance_name.clone(),
            capacity: self.capacity.clone(),
            node_count: self.node_count,
            enable_readable_secondaries: self.enable_readable_secondaries,
            retention_window_in_days: self.retention_window_in_days,
        }
    }

    fn catalog_request(&self, instance_name: &str) -> DatabaseCatalog {
        DatabaseCatalog {
            name: self.catalog_name.clone(),
            database_instance_name: instance_name.to_string(),
            database_name: self.database_name.clone(),
            create_database_if_not_exists: true,
        }
    }

    fn synced_table_request(&self, catalog: &DatabaseCatalog) -> NewSyncedTable {
        NewSyncedTable {
            name: self.synced_table_name(),
            database_instance_name: catalog.database_instance_name.clone(),
            logical_database_name: catalog.database_name.clone(),
            spec: SyncedTableSpec {
                source_table_full_name: self.source_table.clone(),
                primary_key_columns: self.primary_key_columns.clone(),
                timeseries_key: self.timeseries_key.clone(),
                create_database_objects_if_missing: true,
                new_pipeline_spec: NewPipelineSpec {
                    storage_catalog: self.storage_catalog.clone(),
                    storage_schema: self.storage_schema.clone(),
                },
                scheduling_policy: SchedulingPolicy::Snapshot,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedResources {
    pub instance: DatabaseInstance,
    pub catalog: DatabaseCatalog,
    pub synced_table: String,
    pub pipeline_id: Option<String>,
}

/// Create the instance, wait for it, then the catalog, then the synced table.
///
/// Stops at the first failing step; anything created before it is left in
/// place.
#[instrument(skip_all, fields(instance = %plan.instance_name))]
pub async fn provision(client: &WorkspaceClient, plan: &ProvisionPlan) -> Result<ProvisionedResources> {
    plan.validate()?;

    info!(capacity = %plan.capacity, nodes = plan.node_count, "creating database instance");
    let created = client
        .create_database_instance(&plan.instance_request())
        .await
        .map_err(|source| Error::ProvisioningFailed {
            step: "create database instance",
            source,
        })?;

    let instance = client
        .wait_for_instance_available(&created.name, plan.poll_interval, plan.ready_timeout)
        .await
        .map_err(|source| Error::ProvisioningFailed {
            step: "wait for database instance",
            source,
        })?;
    info!(state = ?instance.state, "database instance available");

    let catalog = client
        .create_database_catalog(&plan.catalog_request(&instance.name))
        .await
        .map_err(|source| Error::ProvisioningFailed {
            step: "create database catalog",
            source,
        })?;
    info!(catalog = %catalog.name, database = %catalog.database_name, "created catalog");

    let synced = client
        .create_synced_database_table(&plan.synced_table_request(&catalog))
        .await
        .map_err(|source| Error::ProvisioningFailed {
            step: "create synced table",
            source,
        })?;
    let pipeline_id = synced.pipeline_id().map(str::to_string);
    info!(table = %synced.name, pipeline = ?pipeline_id, "created synced table");

    Ok(ProvisionedResources {
        instance,
        catalog,
        synced_table: synced.name,
        pipeline_id,
    })
}
