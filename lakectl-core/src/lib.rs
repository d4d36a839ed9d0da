//! Connection pooling for Databricks Lakebase with per-connection credentials
//!
//! Every physical Postgres connection authenticates with a token freshly
//! minted through the workspace API, so long-lived pools keep working after
//! individual tokens expire.

pub mod app_state;
pub mod config;
pub mod connector;
pub mod credential;
pub mod error;
pub mod pool;
pub mod provision;
pub mod query;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use app_state::{AppStateRecord, AppStateRepo};
pub use config::{load_dotenv, LakectlConfig};
pub use connector::{ConnectionFactory, Dialer, Endpoint, PgDialer, RotatingTokenFactory};
pub use credential::{CredentialIssuer, DatabaseCredential, InstanceResolver};
pub use error::{ConnectError, Error, Result};
pub use pool::{PoolSettings, PoolSizing, PoolSlot, PoolStatus, RotatingPool, ScopedConnection};
pub use provision::{provision, ProvisionPlan, ProvisionedResources};
pub use query::{execute, execute_on, query_table, QualifiedTable, QueryResult, SqlParam};
pub use workspace::{
    CurrentUser, DatabaseCatalog, DatabaseInstance, NewDatabaseInstance, NewSyncedTable,
    SyncedTable, WorkspaceClient, WorkspaceError,
};
