//! Error types for lakectl-core

use deadpool::managed::TimeoutType;
use thiserror::Error;

use crate::connector::DialError;
use crate::workspace::WorkspaceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection pool is not initialized")]
    PoolNotReady,

    #[error("failed to issue database credential: {0}")]
    CredentialIssuanceFailed(#[source] WorkspaceError),

    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] ConnectError),

    #[error("query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    #[error("instance lookup failed: {0}")]
    InstanceLookupFailed(#[source] WorkspaceError),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provisioning bills the workspace; acknowledge the costs to continue")]
    CostsNotAcknowledged,

    #[error("failed to {step}: {source}")]
    ProvisioningFailed {
        step: &'static str,
        #[source]
        source: WorkspaceError,
    },
}

/// Reasons a pooled connection could not be handed out.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("timed out waiting for a connection ({0:?})")]
    Timeout(TimeoutType),

    #[error("connection pool is closed")]
    Closed,

    #[error("{0}")]
    Pool(String),
}

impl Error {
    /// Whether the error came from the database rejecting the minted credential.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(ConnectError::Dial(DialError::AuthRejected(_)))
        )
    }
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::ConnectionFailed(err)
    }
}

impl From<DialError> for Error {
    fn from(err: DialError) -> Self {
        Error::ConnectionFailed(ConnectError::Dial(err))
    }
}
