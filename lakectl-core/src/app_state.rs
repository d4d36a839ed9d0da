//! Session key-value state persisted in a Lakebase table
//!
//! Rows are keyed by `(session_id, key)`; writes are upserts, so repeating a
//! write only moves `updated_at`.

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use tracing::debug;

use crate::connector::ConnectionFactory;
use crate::pool::RotatingPool;
use crate::query::{execute, QualifiedTable, QueryResult, SqlParam};
use crate::{Error, Result};

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_TABLE: &str = "app_state";

/// One stored session value.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AppStateRecord {
    pub session_id: String,
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

/// Repository over a single app-state table.
pub struct AppStateRepo<'a, F: ConnectionFactory<Connection = PgConnection>> {
    pool: &'a RotatingPool<F>,
    table: QualifiedTable,
}

impl<'a, F: ConnectionFactory<Connection = PgConnection>> AppStateRepo<'a, F> {
    pub fn new(pool: &'a RotatingPool<F>, table: QualifiedTable) -> Self {
        Self { pool, table }
    }

    /// Repository over `public.app_state`.
    pub fn with_default_table(pool: &'a RotatingPool<F>) -> Result<Self> {
        Ok(Self::new(pool, QualifiedTable::new(DEFAULT_SCHEMA, DEFAULT_TABLE)?))
    }

    pub fn table(&self) -> &QualifiedTable {
        &self.table
    }

    /// Create the table if it doesn't exist yet.
    pub async fn ensure_table(&self) -> Result<QueryResult> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                session_id TEXT,
                key TEXT,
                value TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (session_id, key)
            )
            "#,
            self.table
        );
        execute(self.pool, &sql, &[]).await
    }

    /// Insert or update `(session_id, key)`, creating the table first if needed.
    pub async fn upsert(&self, session_id: &str, key: &str, value: &str) -> Result<()> {
        self.ensure_table().await?;

        let sql = format!(
            r#"
            INSERT INTO {} (session_id, key, value, updated_at)
            VALUES ($1, $2, $3, CURRENT_TIMESTAMP)
            ON CONFLICT (session_id, key) DO UPDATE
            SET value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            "#,
            self.table
        );
        execute(
            self.pool,
            &sql,
            &[session_id.into(), key.into(), value.into()],
        )
        .await?;

        debug!(table = %self.table, session_id, key, "app state upserted");
        Ok(())
    }

    /// Every column of every row for `session_id`.
    pub async fn for_session(&self, session_id: &str) -> Result<QueryResult> {
        let sql = format!("SELECT * FROM {} WHERE session_id = $1", self.table);
        execute(self.pool, &sql, &[SqlParam::from(session_id)]).await
    }

    /// Typed rows for `session_id`, ordered by key.
    pub async fn records(&self, session_id: &str) -> Result<Vec<AppStateRecord>> {
        let sql = format!(
            "SELECT session_id, key, value, updated_at FROM {} WHERE session_id = $1 ORDER BY key",
            self.table
        );
        let mut conn = self.pool.connection().await?;
        sqlx::query_as::<_, AppStateRecord>(&sql)
            .bind(session_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::QueryFailed)
    }
}
