//! Credential-rotating connection pool
//!
//! Checkout, return and sizing are handled by `deadpool::managed`. The only
//! hook we add is [`FactoryManager::create`], which runs when the pool decides
//! it needs a new physical connection; that is where a fresh credential gets
//! minted. Idle connections are pinged and reused as-is, never re-authenticated.
//!
//! Pools are plain owned handles. [`PoolSlot`] gives callers a lazily built,
//! shared pool without global state: the first `acquire_pool` builds it, later
//! calls get the same handle back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use sqlx::postgres::PgSslMode;
use tokio::sync::OnceCell;
use tracing::info;

use crate::connector::{
    ConnectionFactory, Dialer, Endpoint, PgDialer, RotatingTokenFactory, DEFAULT_PORT,
};
use crate::credential::CredentialIssuer;
use crate::error::ConnectError;
use crate::{Error, Result};

/// Default minimum number of connections opened up front.
pub const DEFAULT_MIN_SIZE: usize = 1;

/// Default maximum number of concurrently open connections.
pub const DEFAULT_MAX_SIZE: usize = 10;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool bounds and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSizing {
    pub min_size: usize,
    pub max_size: usize,
    /// How long a checkout waits for a free slot. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Upper bound on minting a credential plus dialing.
    pub create_timeout: Option<Duration>,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            create_timeout: Some(DEFAULT_CREATE_TIMEOUT),
        }
    }
}

impl PoolSizing {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Everything needed to build a pool for one instance and database.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub instance_name: String,
    pub host: String,
    pub user: String,
    pub database: String,
    pub port: u16,
    pub ssl_mode: PgSslMode,
    pub sizing: PoolSizing,
    pub retry_on_auth_failure: bool,
}

impl PoolSettings {
    pub fn new(
        instance_name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            host: host.into(),
            user: user.into(),
            database: database.into(),
            port: DEFAULT_PORT,
            ssl_mode: PgSslMode::Require,
            sizing: PoolSizing::default(),
            retry_on_auth_failure: true,
        }
    }

    pub fn with_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.sizing.min_size = min_size;
        self.sizing.max_size = max_size;
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            ssl_mode: self.ssl_mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("instance_name", &self.instance_name),
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        self.sizing.validate()
    }
}

impl<D: Dialer> RotatingTokenFactory<D> {
    pub fn from_settings(settings: &PoolSettings, issuer: Arc<dyn CredentialIssuer>, dialer: D) -> Self {
        RotatingTokenFactory::new(settings.instance_name.clone(), settings.endpoint(), issuer, dialer)
            .retry_on_auth_failure(settings.retry_on_auth_failure)
    }
}

/// Adapts a [`ConnectionFactory`] to deadpool.
pub struct FactoryManager<F> {
    factory: F,
}

impl<F: ConnectionFactory> Manager for FactoryManager<F> {
    type Type = F::Connection;
    type Error = Error;

    async fn create(&self) -> Result<F::Connection> {
        self.factory.open().await
    }

    async fn recycle(&self, conn: &mut F::Connection, _metrics: &Metrics) -> RecycleResult<Error> {
        self.factory
            .validate(conn)
            .await
            .map_err(RecycleError::Backend)
    }
}

/// A connection borrowed from the pool; returned to it on drop.
pub type ScopedConnection<F = RotatingTokenFactory> = Object<FactoryManager<F>>;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Bounded pool of connections to a single instance.
pub struct RotatingPool<F: ConnectionFactory = RotatingTokenFactory> {
    inner: Pool<FactoryManager<F>>,
}

impl<F: ConnectionFactory> Clone for RotatingPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl RotatingPool<RotatingTokenFactory<PgDialer>> {
    /// Build a Postgres pool whose connections authenticate with credentials
    /// minted by `issuer`.
    pub async fn connect(settings: &PoolSettings, issuer: Arc<dyn CredentialIssuer>) -> Result<Self> {
        settings.validate()?;
        let factory = RotatingTokenFactory::from_settings(settings, issuer, PgDialer);
        Self::with_factory(factory, &settings.sizing).await
    }
}

impl<F: ConnectionFactory> RotatingPool<F> {
    /// Build a pool around `factory` and open `sizing.min_size` connections.
    pub async fn with_factory(factory: F, sizing: &PoolSizing) -> Result<Self> {
        sizing.validate()?;

        let inner = Pool::builder(FactoryManager { factory })
            .max_size(sizing.max_size)
            .wait_timeout(sizing.wait_timeout)
            .create_timeout(sizing.create_timeout)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let pool = Self { inner };
        pool.warm(sizing.min_size).await?;

        info!(
            instance = %pool.instance_name(),
            min_size = sizing.min_size,
            max_size = sizing.max_size,
            "connection pool ready"
        );

        Ok(pool)
    }

    /// Borrow a connection, opening a new one if none is idle.
    pub async fn connection(&self) -> Result<ScopedConnection<F>> {
        self.inner.get().await.map_err(checkout_error)
    }

    pub fn instance_name(&self) -> &str {
        self.inner.manager().factory.instance_name()
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Close the pool. Outstanding connections are dropped when returned.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn warm(&self, min_size: usize) -> Result<()> {
        let mut held = Vec::with_capacity(min_size);
        for _ in 0..min_size {
            held.push(self.connection().await?);
        }
        Ok(())
    }
}

fn checkout_error(err: PoolError<Error>) -> Error {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Timeout(kind) => ConnectError::Timeout(kind).into(),
        PoolError::Closed => ConnectError::Closed.into(),
        PoolError::NoRuntimeSpecified => {
            Error::Config("pool timeouts require a runtime".to_string())
        }
        PoolError::PostCreateHook(e) => ConnectError::Pool(e.to_string()).into(),
    }
}

/// Lazily initialized, shareable home for one pool.
pub struct PoolSlot<F: ConnectionFactory = RotatingTokenFactory> {
    cell: Arc<OnceCell<RotatingPool<F>>>,
}

impl<F: ConnectionFactory> Clone for PoolSlot<F> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<F: ConnectionFactory> Default for PoolSlot<F> {
    fn default() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
        }
    }
}

impl<F: ConnectionFactory> PoolSlot<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pool, building it with `init` if the slot is empty.
    ///
    /// Concurrent callers wait on a single initialization. If `init` fails the
    /// slot stays empty and the next caller tries again.
    pub async fn get_or_try_init<Fut>(&self, init: impl FnOnce() -> Fut) -> Result<RotatingPool<F>>
    where
        Fut: Future<Output = Result<RotatingPool<F>>>,
    {
        self.cell.get_or_try_init(init).await.cloned()
    }

    /// The pool, or [`Error::PoolNotReady`] if none has been built yet.
    pub fn pool(&self) -> Result<RotatingPool<F>> {
        self.cell.get().cloned().ok_or(Error::PoolNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }
}

impl PoolSlot<RotatingTokenFactory<PgDialer>> {
    /// Build the slot's pool on first use; afterwards return it unchanged.
    ///
    /// Pools are not keyed by instance: once built, later calls get the
    /// existing pool even if `settings` differ.
    pub async fn acquire_pool(
        &self,
        settings: &PoolSettings,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<RotatingPool> {
        self.get_or_try_init(|| RotatingPool::connect(settings, issuer))
            .await
    }
}
