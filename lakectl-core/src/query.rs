//! Running statements over pooled connections
//!
//! [`execute`] prepares the statement first so the result shape is known even
//! when no rows come back: utility statements (DDL, plain DML) report no
//! columns and yield [`QueryResult::empty`], while a `SELECT` matching nothing
//! still reports its column names.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::BigDecimal;
use sqlx::{
    Column, Encode, Executor, PgConnection, Postgres, Row, Statement, Type, TypeInfo, ValueRef,
};
use tracing::instrument;
use uuid::Uuid;

use crate::connector::ConnectionFactory;
use crate::pool::{PoolSlot, RotatingPool};
use crate::{Error, Result};

/// Postgres identifiers: letters, digits, `_` and `$`, at most 63 bytes.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$").expect("valid identifier regex"));

/// A positional statement parameter (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl SqlParam {
    fn type_info(&self) -> PgTypeInfo {
        match self {
            SqlParam::Null => <UntypedNull as Type<Postgres>>::type_info(),
            SqlParam::Text(_) => <String as Type<Postgres>>::type_info(),
            SqlParam::Bool(_) => <bool as Type<Postgres>>::type_info(),
            SqlParam::Int(_) => <i64 as Type<Postgres>>::type_info(),
            SqlParam::Float(_) => <f64 as Type<Postgres>>::type_info(),
            SqlParam::Timestamp(_) => <DateTime<Utc> as Type<Postgres>>::type_info(),
            SqlParam::Uuid(_) => <Uuid as Type<Postgres>>::type_info(),
        }
    }

    fn bind<'q>(&self, query: Query<'q, Postgres, PgArguments>) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlParam::Null => query.bind(UntypedNull),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.clone()),
            SqlParam::Timestamp(v) => query.bind(*v),
            SqlParam::Uuid(v) => query.bind(*v),
        }
    }
}

/// A NULL sent with the unspecified type (OID 0) so the server infers the
/// parameter type from context instead of assuming `text`.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Float(value)
    }
}

impl From<Uuid> for SqlParam {
    fn from(value: Uuid) -> Self {
        SqlParam::Uuid(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

/// Rows plus the column names the driver reported, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl QueryResult {
    /// The result of a statement that produces no result set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `column` in row `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }
}

/// A validated `schema.table` (or bare `table`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTable {
    pub schema: Option<String>,
    pub table: String,
}

impl QualifiedTable {
    pub fn new(schema: &str, table: &str) -> Result<Self> {
        Ok(Self {
            schema: Some(validate_identifier(schema)?.to_string()),
            table: validate_identifier(table)?.to_string(),
        })
    }

    /// Parse `table` or `schema.table`.
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.trim().split('.').collect();
        match parts.as_slice() {
            [table] => Ok(Self {
                schema: None,
                table: validate_identifier(table)?.to_string(),
            }),
            [schema, table] => Self::new(schema, table),
            _ => Err(Error::InvalidIdentifier(input.to_string())),
        }
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "\"{}\".\"{}\"", schema, self.table),
            None => write!(f, "\"{}\"", self.table),
        }
    }
}

fn validate_identifier(ident: &str) -> Result<&str> {
    if IDENTIFIER.is_match(ident) {
        Ok(ident)
    } else {
        Err(Error::InvalidIdentifier(ident.to_string()))
    }
}

/// Run `sql` with `params` on a connection borrowed from `pool`.
#[instrument(skip(pool, params), fields(instance = %pool.instance_name(), params = params.len()))]
pub async fn execute<F>(pool: &RotatingPool<F>, sql: &str, params: &[SqlParam]) -> Result<QueryResult>
where
    F: ConnectionFactory<Connection = PgConnection>,
{
    let mut conn = pool.connection().await?;
    execute_on(&mut conn, sql, params).await
}

/// Run `sql` on an already borrowed connection.
pub async fn execute_on(conn: &mut PgConnection, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
    let param_types: Vec<PgTypeInfo> = params.iter().map(SqlParam::type_info).collect();
    let statement = (&mut *conn)
        .prepare_with(sql, &param_types)
        .await
        .map_err(Error::QueryFailed)?;
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let query = params
        .iter()
        .fold(sqlx::query(sql), |query, param| param.bind(query));
    let rows = query.fetch_all(&mut *conn).await.map_err(Error::QueryFailed)?;

    if columns.is_empty() {
        return Ok(QueryResult::empty());
    }

    let rows = rows
        .iter()
        .map(|row| decode_row(row, columns.len()))
        .collect::<Result<Vec<_>>>()?;
    Ok(QueryResult { columns, rows })
}

/// `SELECT * FROM <table> LIMIT <limit>`.
pub async fn query_table<F>(pool: &RotatingPool<F>, table: &QualifiedTable, limit: i64) -> Result<QueryResult>
where
    F: ConnectionFactory<Connection = PgConnection>,
{
    let sql = format!("SELECT * FROM {} LIMIT $1", table);
    execute(pool, &sql, &[SqlParam::Int(limit.max(0))]).await
}

impl<F: ConnectionFactory<Connection = PgConnection>> PoolSlot<F> {
    /// [`execute`] on the slot's pool; fails with `PoolNotReady` if unset.
    pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let pool = self.pool()?;
        execute(&pool, sql, params).await
    }
}

fn decode_row(row: &PgRow, width: usize) -> Result<Vec<JsonValue>> {
    (0..width).map(|index| decode_value(row, index)).collect()
}

fn decode_value(row: &PgRow, index: usize) -> Result<JsonValue> {
    let raw = row.try_get_raw(index).map_err(Error::QueryFailed)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let kind = CellKind::from_type_name(&type_name)
        .ok_or_else(|| unsupported_column(row.column(index).name(), &type_name))?;
    kind.decode(row, index).map_err(Error::QueryFailed)
}

fn unsupported_column(column: &str, type_name: &str) -> Error {
    Error::QueryFailed(sqlx::Error::ColumnDecode {
        index: format!("{column:?}"),
        source: format!("no JSON mapping for column type {type_name}; cast it to text in the query").into(),
    })
}

/// Column types with a JSON rendering. NUMERIC and BYTEA become strings so no
/// precision or bytes are lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Json,
    Bytea,
    Timestamp,
    Timestamptz,
    Date,
    Time,
    BoolArray,
    Int4Array,
    Int8Array,
    Float8Array,
    TextArray,
}

impl CellKind {
    fn from_type_name(type_name: &str) -> Option<Self> {
        let kind = match type_name {
            "BOOL" => CellKind::Bool,
            "INT2" => CellKind::Int2,
            "INT4" => CellKind::Int4,
            "INT8" => CellKind::Int8,
            "FLOAT4" => CellKind::Float4,
            "FLOAT8" => CellKind::Float8,
            "NUMERIC" => CellKind::Numeric,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => CellKind::Text,
            "UUID" => CellKind::Uuid,
            "JSON" | "JSONB" => CellKind::Json,
            "BYTEA" => CellKind::Bytea,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::Timestamptz,
            "DATE" => CellKind::Date,
            "TIME" => CellKind::Time,
            "BOOL[]" => CellKind::BoolArray,
            "INT4[]" => CellKind::Int4Array,
            "INT8[]" => CellKind::Int8Array,
            "FLOAT8[]" => CellKind::Float8Array,
            "TEXT[]" | "VARCHAR[]" => CellKind::TextArray,
            _ => return None,
        };
        Some(kind)
    }

    fn decode(self, row: &PgRow, index: usize) -> std::result::Result<JsonValue, sqlx::Error> {
        match self {
            CellKind::Bool => row.try_get::<bool, _>(index).map(JsonValue::from),
            CellKind::Int2 => row.try_get::<i16, _>(index).map(JsonValue::from),
            CellKind::Int4 => row.try_get::<i32, _>(index).map(JsonValue::from),
            CellKind::Int8 => row.try_get::<i64, _>(index).map(JsonValue::from),
            CellKind::Float4 => row.try_get::<f32, _>(index).map(|v| JsonValue::from(v as f64)),
            CellKind::Float8 => row.try_get::<f64, _>(index).map(JsonValue::from),
            CellKind::Numeric => row
                .try_get::<BigDecimal, _>(index)
                .map(|v| JsonValue::from(v.to_string())),
            CellKind::Text => row.try_get::<String, _>(index).map(JsonValue::from),
            CellKind::Uuid => row.try_get::<Uuid, _>(index).map(|v| JsonValue::from(v.to_string())),
            CellKind::Json => row.try_get::<JsonValue, _>(index),
            CellKind::Bytea => row.try_get::<Vec<u8>, _>(index).map(|v| JsonValue::from(bytea_hex(&v))),
            CellKind::Timestamp => row
                .try_get::<NaiveDateTime, _>(index)
                .map(|v| JsonValue::from(v.to_string())),
            CellKind::Timestamptz => row
                .try_get::<DateTime<Utc>, _>(index)
                .map(|v| JsonValue::from(v.to_rfc3339())),
            CellKind::Date => row.try_get::<NaiveDate, _>(index).map(|v| JsonValue::from(v.to_string())),
            CellKind::Time => row.try_get::<NaiveTime, _>(index).map(|v| JsonValue::from(v.to_string())),
            CellKind::BoolArray => row.try_get::<Vec<bool>, _>(index).map(JsonValue::from),
            CellKind::Int4Array => row.try_get::<Vec<i32>, _>(index).map(JsonValue::from),
            CellKind::Int8Array => row.try_get::<Vec<i64>, _>(index).map(JsonValue::from),
            CellKind::Float8Array => row.try_get::<Vec<f64>, _>(index).map(JsonValue::from),
            CellKind::TextArray => row.try_get::<Vec<String>, _>(index).map(JsonValue::from),
        }
    }
}

/// `bytea` in the server's hex output format (`\x0a1b`).
fn bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_pool;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parses_schema_qualified_tables() {
        let table = QualifiedTable::parse("customer_core.customers_oltp").unwrap();
        assert_eq!(table.schema.as_deref(), Some("customer_core"));
        assert_eq!(table.table, "customers_oltp");
        assert_eq!(table.to_string(), "\"customer_core\".\"customers_oltp\"");
    }

    #[test]
    fn bare_table_has_no_schema() {
        let table = QualifiedTable::parse("app_state").unwrap();
        assert_eq!(table.schema, None);
        assert_eq!(table.to_string(), "\"app_state\"");
    }

    #[test]
    fn rejects_injection_and_extra_parts() {
        for input in [
            "users; DROP TABLE users",
            "a.b.c",
            "1table",
            "",
            "public.",
            "\"quoted\"",
        ] {
            assert!(
                matches!(QualifiedTable::parse(input), Err(Error::InvalidIdentifier(_))),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn empty_result_has_no_rows_or_columns() {
        let result = QueryResult::empty();
        assert!(result.is_empty());
        assert!(result.columns.is_empty());
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"columns": [], "rows": []})
        );
    }

    #[test]
    fn serialized_rows_keep_column_order_and_duplicates() {
        let result = QueryResult {
            columns: vec!["session_id".into(), "key".into(), "id".into(), "id".into()],
            rows: vec![vec![json!("abc"), json!("feedback_message"), json!(1), json!(2)]],
        };

        assert_eq!(result.get(0, "key"), Some(&json!("feedback_message")));
        assert_eq!(result.get(0, "missing"), None);

        let rendered = serde_json::to_string(&result).unwrap();
        assert_eq!(
            rendered,
            r#"{"columns":["session_id","key","id","id"],"rows":[["abc","feedback_message",1,2]]}"#
        );
    }

    #[test]
    fn option_params_map_none_to_null() {
        assert_eq!(SqlParam::from(None::<&str>), SqlParam::Null);
        assert_eq!(SqlParam::from(Some("x")), SqlParam::Text("x".into()));
        assert_eq!(SqlParam::from(7_i64), SqlParam::Int(7));
    }

    #[test]
    fn null_params_leave_the_type_to_the_server() {
        assert_eq!(SqlParam::Null.type_info(), PgTypeInfo::with_oid(Oid(0)));
        assert_ne!(
            SqlParam::Null.type_info(),
            SqlParam::Text(String::new()).type_info()
        );
    }

    #[test]
    fn numeric_and_arrays_have_json_mappings() {
        assert_eq!(CellKind::from_type_name("NUMERIC"), Some(CellKind::Numeric));
        assert_eq!(CellKind::from_type_name("BYTEA"), Some(CellKind::Bytea));
        assert_eq!(CellKind::from_type_name("VARCHAR[]"), Some(CellKind::TextArray));
        assert_eq!(CellKind::from_type_name("INT8[]"), Some(CellKind::Int8Array));
    }

    #[test]
    fn unmapped_types_are_errors_not_nulls() {
        assert_eq!(CellKind::from_type_name("INTERVAL"), None);

        let err = unsupported_column("elapsed", "INTERVAL");
        assert!(matches!(err, Error::QueryFailed(sqlx::Error::ColumnDecode { .. })));
        let message = err.to_string();
        assert!(message.contains("INTERVAL"), "{message}");
        assert!(message.contains("elapsed"), "{message}");
    }

    #[test]
    fn bytea_renders_as_hex() {
        assert_eq!(bytea_hex(&[0x0a, 0x1b, 0xff]), "\\x0a1bff");
        assert_eq!(bytea_hex(&[]), "\\x");
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn numeric_columns_keep_their_value() {
        let pool = db_pool().await;

        let result = execute(
            &pool,
            "SELECT 172799.49::numeric(12,2) AS o_totalprice, 'x'::text AS s",
            &[],
        )
        .await
        .unwrap();

        assert_eq!(result.columns, vec!["o_totalprice", "s"]);
        assert_eq!(result.rows, vec![vec![json!("172799.49"), json!("x")]]);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn null_binds_into_non_text_columns() {
        let pool = db_pool().await;
        let mut conn = pool.connection().await.unwrap();
        execute_on(&mut conn, "CREATE TEMP TABLE null_bind (n INT, at TIMESTAMPTZ)", &[])
            .await
            .unwrap();

        let inserted = execute_on(
            &mut conn,
            "INSERT INTO null_bind (n, at) VALUES ($1, $2)",
            &[SqlParam::Null, SqlParam::Null],
        )
        .await
        .unwrap();
        let result = execute_on(&mut conn, "SELECT n, at FROM null_bind", &[])
            .await
            .unwrap();

        assert_eq!(inserted, QueryResult::empty());
        assert_eq!(result.rows, vec![vec![JsonValue::Null, JsonValue::Null]]);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn duplicate_column_names_are_all_kept() {
        let pool = db_pool().await;

        let result = execute(&pool, "SELECT 1 AS id, 2 AS id, 'z' AS a", &[])
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["id", "id", "a"]);
        assert_eq!(result.rows, vec![vec![json!(1), json!(2), json!("z")]]);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn utility_statements_return_the_empty_result() {
        let pool = db_pool().await;
        let mut conn = pool.connection().await.unwrap();

        let result = execute_on(&mut conn, "CREATE TEMP TABLE IF NOT EXISTS scratch (id INT)", &[])
            .await
            .unwrap();

        assert_eq!(result, QueryResult::empty());
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn unmapped_column_types_fail_the_query() {
        let pool = db_pool().await;

        let err = execute(&pool, "SELECT interval '1 day' AS elapsed", &[])
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::QueryFailed(_)));
        assert!(err.to_string().contains("INTERVAL"));
    }

    proptest! {
        #[test]
        fn valid_identifiers_round_trip(schema in "[a-z_][a-z0-9_]{0,20}", table in "[a-z_][a-z0-9_]{0,20}") {
            let parsed = QualifiedTable::parse(&format!("{schema}.{table}")).unwrap();
            prop_assert_eq!(parsed.schema.as_deref(), Some(schema.as_str()));
            prop_assert_eq!(parsed.table, table);
        }

        #[test]
        fn identifiers_with_quotes_or_punctuation_are_rejected(prefix in "[a-z]{1,8}", bad in "[\"';()-]", suffix in "[a-z]{0,8}") {
            let input = format!("{prefix}{bad}{suffix}");
            prop_assert!(QualifiedTable::parse(&input).is_err());
        }
    }
}
