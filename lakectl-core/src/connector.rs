//! Physical connection factories
//!
//! The pool only knows how to ask a [`ConnectionFactory`] for a new
//! connection. [`RotatingTokenFactory`] is the factory used for Lakebase:
//! every call mints a brand-new credential and dials with it as the password,
//! so no two physical connections ever share a token.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credential::{CredentialIssuer, DatabaseCredential};
use crate::{Error, Result};

/// Postgres port used when the instance doesn't advertise one.
pub const DEFAULT_PORT: u16 = 5432;

/// `application_name` reported to the server.
pub const APPLICATION_NAME: &str = "lakectl";

/// Network address and identity for one database on one instance.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub ssl_mode: PgSslMode,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            database: database.into(),
            user: user.into(),
            ssl_mode: PgSslMode::Require,
        }
    }

    /// Connect options for this endpoint, authenticated with `password`.
    pub fn connect_options(&self, password: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(password)
            .ssl_mode(self.ssl_mode)
            .application_name(APPLICATION_NAME)
    }
}

#[derive(Error, Debug)]
pub enum DialError {
    /// The server refused the credential (SQLSTATE class 28).
    #[error("authentication rejected: {0}")]
    AuthRejected(#[source] sqlx::Error),

    #[error(transparent)]
    Other(sqlx::Error),
}

impl DialError {
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if is_auth_failure(&err) {
            DialError::AuthRejected(err)
        } else {
            DialError::Other(err)
        }
    }
}

fn is_auth_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("28")),
        _ => false,
    }
}

/// Opens and health-checks physical connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn dial(&self, endpoint: &Endpoint, password: &str) -> std::result::Result<Self::Connection, DialError>;

    async fn ping(&self, conn: &mut Self::Connection) -> std::result::Result<(), DialError>;
}

/// Dials real Postgres connections through sqlx.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDialer;

#[async_trait]
impl Dialer for PgDialer {
    type Connection = PgConnection;

    async fn dial(&self, endpoint: &Endpoint, password: &str) -> std::result::Result<PgConnection, DialError> {
        PgConnection::connect_with(&endpoint.connect_options(password))
            .await
            .map_err(DialError::from_sqlx)
    }

    async fn ping(&self, conn: &mut PgConnection) -> std::result::Result<(), DialError> {
        conn.ping().await.map_err(DialError::from_sqlx)
    }
}

/// Source of new physical connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Name of the instance connections are built for.
    fn instance_name(&self) -> &str;

    /// Open a new physical connection.
    async fn open(&self) -> Result<Self::Connection>;

    /// Check an idle connection before handing it out again.
    async fn validate(&self, conn: &mut Self::Connection) -> Result<()>;
}

/// Connection factory that mints a fresh credential for every physical open.
pub struct RotatingTokenFactory<D: Dialer = PgDialer> {
    instance_name: String,
    endpoint: Endpoint,
    issuer: Arc<dyn CredentialIssuer>,
    dialer: D,
    retry_on_auth_failure: bool,
}

impl<D: Dialer> RotatingTokenFactory<D> {
    pub fn new(
        instance_name: impl Into<String>,
        endpoint: Endpoint,
        issuer: Arc<dyn CredentialIssuer>,
        dialer: D,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            endpoint,
            issuer,
            dialer,
            retry_on_auth_failure: true,
        }
    }

    /// Retry once with a newly minted credential when the server rejects one.
    pub fn retry_on_auth_failure(mut self, enabled: bool) -> Self {
        self.retry_on_auth_failure = enabled;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn mint(&self) -> Result<DatabaseCredential> {
        let request_id = Uuid::new_v4();
        debug!(instance = %self.instance_name, %request_id, "minting database credential");

        self.issuer
            .generate_credential(request_id, std::slice::from_ref(&self.instance_name))
            .await
            .map_err(Error::CredentialIssuanceFailed)
    }

    async fn dial_with_fresh_credential(&self) -> std::result::Result<D::Connection, DialErrorOrMint> {
        let credential = self.mint().await.map_err(DialErrorOrMint::Mint)?;
        debug!(
            instance = %self.instance_name,
            host = %self.endpoint.host,
            database = %self.endpoint.database,
            "opening physical connection"
        );
        self.dialer
            .dial(&self.endpoint, credential.token())
            .await
            .map_err(DialErrorOrMint::Dial)
    }
}

enum DialErrorOrMint {
    Mint(Error),
    Dial(DialError),
}

impl From<DialErrorOrMint> for Error {
    fn from(err: DialErrorOrMint) -> Self {
        match err {
            DialErrorOrMint::Mint(e) => e,
            DialErrorOrMint::Dial(e) => e.into(),
        }
    }
}

#[async_trait]
impl<D: Dialer> ConnectionFactory for RotatingTokenFactory<D> {
    type Connection = D::Connection;

    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn open(&self) -> Result<D::Connection> {
        match self.dial_with_fresh_credential().await {
            Ok(conn) => Ok(conn),
            Err(DialErrorOrMint::Dial(DialError::AuthRejected(cause))) if self.retry_on_auth_failure => {
                warn!(
                    instance = %self.instance_name,
                    error = %cause,
                    "credential rejected, retrying once with a fresh one"
                );
                Ok(self.dial_with_fresh_credential().await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn validate(&self, conn: &mut D::Connection) -> Result<()> {
        self.dialer.ping(conn).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDialer, RecordingIssuer};

    fn factory(issuer: Arc<RecordingIssuer>, dialer: FakeDialer) -> RotatingTokenFactory<FakeDialer> {
        RotatingTokenFactory::new(
            "demo-instance",
            Endpoint::new("db.example.com", "appdb", "svc"),
            issuer,
            dialer,
        )
    }

    #[test]
    fn endpoint_defaults_to_required_tls() {
        let endpoint = Endpoint::new("db.example.com", "appdb", "svc");
        assert_eq!(endpoint.port, 5432);
        assert!(matches!(endpoint.ssl_mode, PgSslMode::Require));
    }

    #[test]
    fn non_database_errors_are_not_auth_failures() {
        let err = DialError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DialError::Other(_)));
    }

    #[tokio::test]
    async fn open_mints_one_credential_per_connection() {
        let issuer = Arc::new(RecordingIssuer::default());
        let dialer = FakeDialer::default();
        let factory = factory(issuer.clone(), dialer.clone());

        let first = factory.open().await.unwrap();
        let second = factory.open().await.unwrap();

        assert_eq!(issuer.minted(), 2);
        assert_ne!(first.password, second.password);
        assert_eq!(dialer.passwords(), vec![first.password, second.password]);
        assert_eq!(issuer.instance_names(), vec!["demo-instance".to_string(); 2]);
    }

    #[tokio::test]
    async fn rejected_credential_is_retried_once_with_a_new_token() {
        let issuer = Arc::new(RecordingIssuer::default());
        let dialer = FakeDialer::default();
        dialer.reject_next(1);
        let factory = factory(issuer.clone(), dialer.clone());

        let conn = factory.open().await.unwrap();

        assert_eq!(issuer.minted(), 2);
        let passwords = dialer.passwords();
        assert_eq!(passwords.len(), 2);
        assert_ne!(passwords[0], passwords[1]);
        assert_eq!(conn.password, passwords[1]);
    }

    #[tokio::test]
    async fn second_rejection_surfaces_as_connection_failure() {
        let issuer = Arc::new(RecordingIssuer::default());
        let dialer = FakeDialer::default();
        dialer.reject_next(2);
        let factory = factory(issuer.clone(), dialer.clone());

        let err = factory.open().await.unwrap_err();

        assert!(err.is_auth_rejected());
        assert_eq!(issuer.minted(), 2);
    }

    #[tokio::test]
    async fn retry_can_be_disabled() {
        let issuer = Arc::new(RecordingIssuer::default());
        let dialer = FakeDialer::default();
        dialer.reject_next(1);
        let factory = factory(issuer.clone(), dialer.clone()).retry_on_auth_failure(false);

        let err = factory.open().await.unwrap_err();

        assert!(err.is_auth_rejected());
        assert_eq!(issuer.minted(), 1);
    }

    #[tokio::test]
    async fn issuance_failure_skips_dialing() {
        let issuer = Arc::new(RecordingIssuer::failing());
        let dialer = FakeDialer::default();
        let factory = factory(issuer.clone(), dialer.clone());

        let err = factory.open().await.unwrap_err();

        assert!(matches!(err, Error::CredentialIssuanceFailed(_)));
        assert!(dialer.passwords().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_not_retried() {
        let issuer = Arc::new(RecordingIssuer::default());
        let dialer = FakeDialer::default();
        dialer.fail_next(1);
        let factory = factory(issuer.clone(), dialer.clone());

        let err = factory.open().await.unwrap_err();

        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert!(!err.is_auth_rejected());
        assert_eq!(issuer.minted(), 1);
    }
}
