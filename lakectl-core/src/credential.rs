//! Short-lived database credentials
//!
//! Lakebase instances accept an OAuth token as the Postgres password. Tokens
//! are minted on demand for a set of instance names and expire after a fixed
//! window (about an hour). Nothing here caches them: the connector asks for a
//! new one every time it opens a physical connection.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::workspace::{DatabaseInstance, WorkspaceError};

/// Bearer token usable as a connection password.
#[derive(Clone, Deserialize)]
pub struct DatabaseCredential {
    token: String,
    /// Expiry as reported by the service. Informational only.
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl DatabaseCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expiration_time: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for DatabaseCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredential")
            .field("token", &"<redacted>")
            .field("expiration_time", &self.expiration_time)
            .finish()
    }
}

/// Mints credentials for database instances.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue a fresh credential.
    ///
    /// `request_id` must be unique per call; the service uses it for
    /// idempotency, so reusing one would hand back a previously issued token.
    async fn generate_credential(
        &self,
        request_id: Uuid,
        instance_names: &[String],
    ) -> Result<DatabaseCredential, WorkspaceError>;
}

/// Resolves an instance name to its connection details.
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn resolve_instance(&self, name: &str) -> Result<DatabaseInstance, WorkspaceError>;
}
