//! In-memory fakes for exercising the pool without a workspace or database.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::postgres::PgSslMode;
use uuid::Uuid;

use crate::connector::{Dialer, DialError, Endpoint};
use crate::credential::{CredentialIssuer, DatabaseCredential};
use crate::pool::{PoolSettings, RotatingPool};
use crate::workspace::WorkspaceError;

/// Issuer that hands out numbered tokens and remembers every request.
#[derive(Default)]
pub struct RecordingIssuer {
    minted: AtomicUsize,
    fail: bool,
    requests: Mutex<Vec<(Uuid, Vec<String>)>>,
}

impl RecordingIssuer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, names)| names.clone())
            .collect()
    }

    pub fn request_ids(&self) -> Vec<Uuid> {
        self.requests.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl CredentialIssuer for RecordingIssuer {
    async fn generate_credential(
        &self,
        request_id: Uuid,
        instance_names: &[String],
    ) -> Result<DatabaseCredential, WorkspaceError> {
        self.requests
            .lock()
            .unwrap()
            .push((request_id, instance_names.to_vec()));

        if self.fail {
            return Err(WorkspaceError::Api {
                status: 403,
                error_code: Some("PERMISSION_DENIED".to_string()),
                message: "not allowed".to_string(),
            });
        }

        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DatabaseCredential::new(format!("token-{n}-{request_id}")))
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    pub id: usize,
    pub password: String,
}

#[derive(Default)]
struct DialerState {
    passwords: Mutex<Vec<String>>,
    reject: AtomicUsize,
    fail: AtomicUsize,
    pings: AtomicUsize,
    unhealthy: AtomicBool,
    opened: AtomicUsize,
}

/// Dialer that records the password of every attempt.
#[derive(Clone, Default)]
pub struct FakeDialer {
    state: Arc<DialerState>,
}

impl FakeDialer {
    /// Reject the next `n` dials as if the token had expired.
    pub fn reject_next(&self, n: usize) {
        self.state.reject.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` dials with a network error.
    pub fn fail_next(&self, n: usize) {
        self.state.fail.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent ping fail.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.state.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn passwords(&self) -> Vec<String> {
        self.state.passwords.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Dialer for FakeDialer {
    type Connection = FakeConnection;

    async fn dial(&self, _endpoint: &Endpoint, password: &str) -> Result<FakeConnection, DialError> {
        self.state.passwords.lock().unwrap().push(password.to_string());

        if take_one(&self.state.reject) {
            return Err(DialError::AuthRejected(sqlx::Error::Protocol(
                "password authentication failed".to_string(),
            )));
        }
        if take_one(&self.state.fail) {
            return Err(DialError::Other(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }

        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            id,
            password: password.to_string(),
        })
    }

    async fn ping(&self, _conn: &mut FakeConnection) -> Result<(), DialError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.unhealthy.load(Ordering::SeqCst) {
            return Err(DialError::Other(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset",
            ))));
        }
        Ok(())
    }
}

/// Hands out `PGPASSWORD` as if it had been minted, for database-backed tests.
///
/// Run those with the libpq variables set:
/// `PGHOST=... PGUSER=... PGPASSWORD=... PGDATABASE=... cargo test -p lakectl-core -- --ignored`
pub struct EnvPasswordIssuer;

#[async_trait]
impl CredentialIssuer for EnvPasswordIssuer {
    async fn generate_credential(
        &self,
        _request_id: Uuid,
        _instance_names: &[String],
    ) -> Result<DatabaseCredential, WorkspaceError> {
        Ok(DatabaseCredential::new(
            std::env::var("PGPASSWORD").unwrap_or_default(),
        ))
    }
}

pub fn db_settings() -> PoolSettings {
    let host = std::env::var("PGHOST").expect("PGHOST required");
    let user = std::env::var("PGUSER").expect("PGUSER required");
    let database = std::env::var("PGDATABASE").expect("PGDATABASE required");
    let mut settings = PoolSettings::new("demo-instance", host, user, database).with_size(1, 4);
    settings.ssl_mode = PgSslMode::Prefer;
    settings
}

pub async fn db_pool() -> RotatingPool {
    RotatingPool::connect(&db_settings(), Arc::new(EnvPasswordIssuer))
        .await
        .expect("pool creation failed")
}
