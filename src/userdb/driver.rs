//! Engine-specific connect, probe and execute. Postgres and MySQL ride
//! sqlx pools; SQL Server is a single tiberius client behind a mutex.

use super::{Credentials, EngineKind, QueryOutcome};
use crate::error::AppError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use uuid::Uuid;

type MssqlClient = Client<Compat<TcpStream>>;

const POOL_MAX_CONNECTIONS: u32 = 5;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// One live tenant connection. Cloning shares the underlying transport.
#[derive(Clone)]
pub enum EngineHandle {
    Postgres(sqlx::PgPool),
    MySql(sqlx::MySqlPool),
    Mssql(Arc<Mutex<MssqlClient>>),
}

impl EngineHandle {
    /// Opens a connection for the bundle, bounded by `connect_timeout`.
    pub async fn connect(
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, AppError> {
        match credentials.engine {
            EngineKind::Postgres => connect_postgres(credentials, connect_timeout).await,
            EngineKind::MySql => connect_mysql(credentials, connect_timeout).await,
            EngineKind::Mssql => connect_mssql(credentials, connect_timeout).await,
        }
    }

    /// Trivial liveness round trip.
    pub async fn probe(&self) -> Result<(), AppError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(pool)
                    .await
                    .map_err(probe_error)?;
            }
            Self::MySql(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(pool)
                    .await
                    .map_err(probe_error)?;
            }
            Self::Mssql(client) => {
                let mut client = client.lock().await;
                client
                    .simple_query("SELECT 1")
                    .await
                    .map_err(probe_error)?
                    .into_results()
                    .await
                    .map_err(probe_error)?;
            }
        }
        Ok(())
    }

    /// Runs one statement and normalizes the rows. The SQL text is passed
    /// through untouched.
    pub async fn execute(&self, sql: &str) -> Result<QueryOutcome, AppError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await.map_err(exec_error)?;
                Ok(QueryOutcome::from_rows(
                    rows.iter().map(pg_row_to_json).collect(),
                ))
            }
            Self::MySql(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await.map_err(exec_error)?;
                Ok(QueryOutcome::from_rows(
                    rows.iter().map(mysql_row_to_json).collect(),
                ))
            }
            Self::Mssql(client) => {
                let mut client = client.lock().await;
                let results = client
                    .simple_query(sql)
                    .await
                    .map_err(exec_error)?
                    .into_results()
                    .await
                    .map_err(exec_error)?;
                let rows = results.into_iter().next().unwrap_or_default();
                Ok(QueryOutcome::from_rows(
                    rows.iter().map(mssql_row_to_json).collect(),
                ))
            }
        }
    }

    /// Tears the handle down. Pools close politely, the tds client drops
    /// with its socket.
    pub async fn close(self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::MySql(pool) => pool.close().await,
            Self::Mssql(_) => {}
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = match self {
            Self::Postgres(_) => EngineKind::Postgres,
            Self::MySql(_) => EngineKind::MySql,
            Self::Mssql(_) => EngineKind::Mssql,
        };
        f.debug_tuple("EngineHandle").field(&engine).finish()
    }
}

async fn connect_postgres(
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<EngineHandle, AppError> {
    let mut options = PgConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port)
        .database(&credentials.database)
        .username(&credentials.username)
        .password(&credentials.password);
    if let Some(schema) = credentials
        .schema
        .as_deref()
        .filter(|schema| !schema.trim().is_empty())
    {
        options = options.options([("search_path", schema)]);
    }
    let pool = PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(connect_timeout)
        .idle_timeout(POOL_IDLE_TIMEOUT)
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .map_err(connect_error)?;
    Ok(EngineHandle::Postgres(pool))
}

async fn connect_mysql(
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<EngineHandle, AppError> {
    let options = MySqlConnectOptions::new()
        .host(&credentials.host)
        .port(credentials.port)
        .database(&credentials.database)
        .username(&credentials.username)
        .password(&credentials.password);
    let pool = MySqlPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(connect_timeout)
        .idle_timeout(POOL_IDLE_TIMEOUT)
        .test_before_acquire(true)
        .connect_with(options)
        .await
        .map_err(connect_error)?;
    Ok(EngineHandle::MySql(pool))
}

async fn connect_mssql(
    credentials: &Credentials,
    connect_timeout: Duration,
) -> Result<EngineHandle, AppError> {
    let mut config = Config::new();
    config.host(&credentials.host);
    config.port(credentials.port);
    config.database(&credentials.database);
    config.authentication(AuthMethod::sql_server(
        &credentials.username,
        &credentials.password,
    ));
    config.encryption(if credentials.encrypt.unwrap_or(true) {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::NotSupported
    });
    if credentials.trust_server_certificate.unwrap_or(true) {
        config.trust_cert();
    }

    let addr = config.get_addr();
    let client = tokio::time::timeout(connect_timeout, async move {
        let tcp = TcpStream::connect(addr).await.map_err(connect_error)?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(connect_error)
    })
    .await
    .map_err(|_| {
        AppError::connection(format!(
            "Database connection failed: timed out after {}s",
            connect_timeout.as_secs()
        ))
    })??;
    Ok(EngineHandle::Mssql(Arc::new(Mutex::new(client))))
}

fn connect_error(err: impl fmt::Display) -> AppError {
    AppError::connection(format!("Database connection failed: {err}"))
}

fn probe_error(err: impl fmt::Display) -> AppError {
    AppError::connection(format!("Connection health check failed: {err}"))
}

fn exec_error(err: impl fmt::Display) -> AppError {
    AppError::execution(format!("Query execution failed: {err}"))
}

fn pg_row_to_json(row: &PgRow) -> Value {
    let mut object = Map::new();
    for column in row.columns() {
        object.insert(column.name().to_string(), pg_value(row, column.ordinal()));
    }
    Value::Object(object)
}

/// Decodes one postgres cell by trying concrete Rust types against the
/// column; unmatched types come back as null.
fn pg_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::from(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::from(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(json_f64).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| json_f64(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Uuid>, _>(idx) {
        return v
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return v
            .map(|d| json_f64(d.to_f64().unwrap_or(0.0)))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
        return v
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    Value::Null
}

fn mysql_row_to_json(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for column in row.columns() {
        object.insert(
            column.name().to_string(),
            mysql_value(row, column.ordinal()),
        );
    }
    Value::Object(object)
}

/// Same laddering as postgres, with the unsigned widths MySQL adds.
/// u64 goes first so BIGINT UNSIGNED does not truncate through i64.
fn mysql_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|u| Value::from(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::from(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
        return v.map(|u| Value::from(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::from(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
        return v.map(|u| Value::from(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
        return v.map(|i| Value::from(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
        return v.map(|u| Value::from(u as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(json_f64).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| json_f64(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Uuid>, _>(idx) {
        return v
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return v
            .map(|d| json_f64(d.to_f64().unwrap_or(0.0)))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
        return v
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    Value::Null
}

fn mssql_row_to_json(row: &tiberius::Row) -> Value {
    let mut object = Map::new();
    for (idx, (column, data)) in row.cells().enumerate() {
        object.insert(column.name().to_string(), mssql_value(row, idx, data));
    }
    Value::Object(object)
}

/// Date and time kinds go through the typed chrono getters; everything
/// else converts straight off the wire value.
fn mssql_value(row: &tiberius::Row, idx: usize, data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::DateTime(Some(_))
        | ColumnData::SmallDateTime(Some(_))
        | ColumnData::DateTime2(Some(_)) => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTimeOffset(Some(_)) => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        ColumnData::Date(Some(_)) => row
            .try_get::<NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Time(Some(_)) => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        other => mssql_scalar(other),
    }
}

fn mssql_scalar(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => Value::Bool(*b),
        ColumnData::U8(Some(v)) => Value::from(*v as i64),
        ColumnData::I16(Some(v)) => Value::from(*v as i64),
        ColumnData::I32(Some(v)) => Value::from(*v as i64),
        ColumnData::I64(Some(v)) => Value::from(*v),
        ColumnData::F32(Some(v)) => json_f64(*v as f64),
        ColumnData::F64(Some(v)) => json_f64(*v),
        ColumnData::Numeric(Some(n)) => json_f64(n.value() as f64 / 10f64.powi(n.scale() as i32)),
        ColumnData::String(Some(s)) => Value::String(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::String(g.to_string()),
        ColumnData::Binary(Some(b)) => Value::String(String::from_utf8_lossy(b).into_owned()),
        ColumnData::Xml(Some(x)) => Value::String(x.to_string()),
        _ => Value::Null,
    }
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
