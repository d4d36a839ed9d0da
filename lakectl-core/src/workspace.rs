//! Databricks workspace REST client
//!
//! Covers the handful of endpoints the pool needs: credential issuance,
//! database instance lookup and listing, and the calling identity. The
//! create calls behind `lakectl instances create` live here too.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::credential::{CredentialIssuer, DatabaseCredential, InstanceResolver};

const CREDENTIALS_PATH: &str = "/api/2.0/database/credentials";
const INSTANCES_PATH: &str = "/api/2.0/database/instances";
const CURRENT_USER_PATH: &str = "/api/2.0/preview/scim/v2/Me";
const CATALOGS_PATH: &str = "/api/2.0/database/catalogs";
const SYNCED_TABLES_PATH: &str = "/api/2.0/database/synced_tables";

/// Instance state once it accepts connections.
pub const STATE_AVAILABLE: &str = "AVAILABLE";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("{0} is not set")]
    MissingEnv(&'static str),

    #[error("invalid workspace host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("workspace API returned {status}: {message}")]
    Api {
        status: u16,
        error_code: Option<String>,
        message: String,
    },

    #[error("database instance {0:?} has no read-write endpoint")]
    NoEndpoint(String),

    #[error("database instance {name:?} entered state {state} while waiting for AVAILABLE")]
    UnexpectedState { name: String, state: String },

    #[error("database instance {name:?} was not AVAILABLE after {waited:?}")]
    Timeout { name: String, waited: Duration },
}

/// A Lakebase database instance as reported by the workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseInstance {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub capacity: Option<String>,
    #[serde(default)]
    pub pg_version: Option<String>,
    #[serde(default)]
    pub read_write_dns: Option<String>,
    #[serde(default)]
    pub read_only_dns: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
}

impl DatabaseInstance {
    /// Host to connect to for writes, if the instance has been provisioned.
    pub fn read_write_host(&self) -> Option<&str> {
        self.read_write_dns.as_deref().filter(|dns| !dns.is_empty())
    }
}

/// Identity behind the workspace token.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "userName")]
    pub user_name: String,
}

/// Body of an instance create call.
#[derive(Debug, Clone, Serialize)]
pub struct NewDatabaseInstance {
    pub name: String,
    pub capacity: String,
    pub node_count: u32,
    pub enable_readable_secondaries: bool,
    pub retention_window_in_days: u32,
}

/// A Unity Catalog catalog backed by a Postgres database on an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseCatalog {
    pub name: String,
    pub database_instance_name: String,
    pub database_name: String,
    #[serde(default)]
    pub create_database_if_not_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingPolicy {
    Snapshot,
    Triggered,
    Continuous,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPipelineSpec {
    pub storage_catalog: String,
    pub storage_schema: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncedTableSpec {
    pub source_table_full_name: String,
    pub primary_key_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeseries_key: Option<String>,
    pub create_database_objects_if_missing: bool,
    pub new_pipeline_spec: NewPipelineSpec,
    pub scheduling_policy: SchedulingPolicy,
}

/// Body of a synced table create call.
#[derive(Debug, Clone, Serialize)]
pub struct NewSyncedTable {
    pub name: String,
    pub database_instance_name: String,
    pub logical_database_name: String,
    pub spec: SyncedTableSpec,
}

/// A synced table as reported back by the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncedTable {
    pub name: String,
    #[serde(default)]
    pub database_instance_name: Option<String>,
    #[serde(default)]
    pub logical_database_name: Option<String>,
    #[serde(default)]
    pub data_synchronization_status: Option<serde_json::Value>,
}

impl SyncedTable {
    /// Id of the pipeline feeding the table, once the workspace reports one.
    pub fn pipeline_id(&self) -> Option<&str> {
        self.data_synchronization_status
            .as_ref()?
            .get("pipeline_id")?
            .as_str()
    }
}

#[derive(Debug, Serialize)]
struct GenerateCredentialRequest<'a> {
    request_id: String,
    instance_names: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ListInstancesResponse {
    #[serde(default)]
    database_instances: Vec<DatabaseInstance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Token-authenticated client for a single workspace.
#[derive(Clone)]
pub struct WorkspaceClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl WorkspaceClient {
    /// Create a client for `host`. A bare hostname is treated as `https://`.
    pub fn new(host: &str, token: impl Into<String>) -> Result<Self, WorkspaceError> {
        let base_url = normalize_host(host)?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("lakectl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    /// Create a client from `DATABRICKS_HOST` and `DATABRICKS_TOKEN`.
    pub fn from_env() -> Result<Self, WorkspaceError> {
        let host =
            std::env::var("DATABRICKS_HOST").map_err(|_| WorkspaceError::MissingEnv("DATABRICKS_HOST"))?;
        let token = std::env::var("DATABRICKS_TOKEN")
            .map_err(|_| WorkspaceError::MissingEnv("DATABRICKS_TOKEN"))?;
        Self::new(&host, token)
    }

    pub fn host(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Mint a database credential scoped to `instance_names`.
    #[instrument(skip(self))]
    pub async fn generate_database_credential(
        &self,
        request_id: Uuid,
        instance_names: &[String],
    ) -> Result<DatabaseCredential, WorkspaceError> {
        let body = GenerateCredentialRequest {
            request_id: request_id.to_string(),
            instance_names,
        };
        let request = self.client.post(self.url(CREDENTIALS_PATH)?).json(&body);
        self.send(request).await
    }

    /// Look up a single instance by name.
    #[instrument(skip(self))]
    pub async fn get_database_instance(&self, name: &str) -> Result<DatabaseInstance, WorkspaceError> {
        let mut url = self.url(INSTANCES_PATH)?;
        url.path_segments_mut()
            .map_err(|_| WorkspaceError::InvalidHost {
                host: self.base_url.to_string(),
                reason: "cannot be a base URL".to_string(),
            })?
            .push(name);
        self.send(self.client.get(url)).await
    }

    /// List every instance visible to the caller, following pagination.
    #[instrument(skip(self))]
    pub async fn list_database_instances(&self) -> Result<Vec<DatabaseInstance>, WorkspaceError> {
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(self.url(INSTANCES_PATH)?);
            if let Some(token) = &page_token {
                request = request.query(&[("page_token", token.as_str())]);
            }

            let page: ListInstancesResponse = self.send(request).await?;
            debug!(count = page.database_instances.len(), "fetched instance page");
            instances.extend(page.database_instances);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(instances)
    }

    /// Identity the token belongs to; its user name doubles as the Postgres role.
    #[instrument(skip(self))]
    pub async fn current_user(&self) -> Result<CurrentUser, WorkspaceError> {
        self.send(self.client.get(self.url(CURRENT_USER_PATH)?)).await
    }

    #[instrument(skip(self, instance), fields(name = %instance.name))]
    pub async fn create_database_instance(
        &self,
        instance: &NewDatabaseInstance,
    ) -> Result<DatabaseInstance, WorkspaceError> {
        let request = self.client.post(self.url(INSTANCES_PATH)?).json(instance);
        self.send(request).await
    }

    /// Poll `name` until it is `AVAILABLE`.
    ///
    /// `STARTING`, `UPDATING` and a missing state keep polling; any other state
    /// ends the wait with [`WorkspaceError::UnexpectedState`].
    #[instrument(skip(self))]
    pub async fn wait_for_instance_available(
        &self,
        name: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<DatabaseInstance, WorkspaceError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let instance = self.get_database_instance(name).await?;
            match instance.state.as_deref() {
                Some(STATE_AVAILABLE) => return Ok(instance),
                None | Some("STARTING") | Some("UPDATING") => {}
                Some(other) => {
                    return Err(WorkspaceError::UnexpectedState {
                        name: name.to_string(),
                        state: other.to_string(),
                    })
                }
            }

            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(WorkspaceError::Timeout {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            debug!(state = ?instance.state, "instance not available yet");
            tokio::time::sleep(poll_interval).await;
        }
    }

    #[instrument(skip(self, catalog), fields(name = %catalog.name))]
    pub async fn create_database_catalog(
        &self,
        catalog: &DatabaseCatalog,
    ) -> Result<DatabaseCatalog, WorkspaceError> {
        let request = self.client.post(self.url(CATALOGS_PATH)?).json(catalog);
        self.send(request).await
    }

    #[instrument(skip(self, table), fields(name = %table.name))]
    pub async fn create_synced_database_table(
        &self,
        table: &NewSyncedTable,
    ) -> Result<SyncedTable, WorkspaceError> {
        let request = self.client.post(self.url(SYNCED_TABLES_PATH)?).json(table);
        self.send(request).await
    }

    fn url(&self, path: &str) -> Result<Url, WorkspaceError> {
        self.base_url
            .join(path)
            .map_err(|e| WorkspaceError::InvalidHost {
                host: self.base_url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, WorkspaceError> {
        let response = request.bearer_auth(&self.token).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, WorkspaceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let (error_code, message) = match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => (body.error_code, body.message.unwrap_or(text)),
        Err(_) => (None, text),
    };

    Err(WorkspaceError::Api {
        status: status.as_u16(),
        error_code,
        message,
    })
}

fn normalize_host(host: &str) -> Result<Url, WorkspaceError> {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(WorkspaceError::InvalidHost {
            host: host.to_string(),
            reason: "empty host".to_string(),
        });
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    Url::parse(&with_scheme).map_err(|e| WorkspaceError::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl CredentialIssuer for WorkspaceClient {
    async fn generate_credential(
        &self,
        request_id: Uuid,
        instance_names: &[String],
    ) -> Result<DatabaseCredential, WorkspaceError> {
        self.generate_database_credential(request_id, instance_names)
            .await
    }
}

#[async_trait]
impl InstanceResolver for WorkspaceClient {
    async fn resolve_instance(&self, name: &str) -> Result<DatabaseInstance, WorkspaceError> {
        let instance = self.get_database_instance(name).await?;
        if instance.read_write_host().is_none() {
            return Err(WorkspaceError::NoEndpoint(name.to_string()));
        }
        Ok(instance)
    }
}
