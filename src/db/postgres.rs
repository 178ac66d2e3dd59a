//! PostgreSQL engine backed by a `sqlx` connection pool.
//!
//! Arguments are bound positionally (`$1`, `$2`, ...) from [`Value`]s, and
//! result columns are decoded by type category into [`Value`]s. `NUMERIC`
//! is rendered as its exact decimal string rather than a lossy float.

use crate::config::{Dsn, PoolOptions};
use crate::db::engine::{Connection, Engine, TxOptions};
use crate::error::{DbError, DbResult, DriverError};
use crate::models::{ExecResult, Rows, Value};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, PgSslMode,
    PgStatement, PgTypeInfo, PgValueFormat, PgValueRef,
};
use sqlx::query::Query;
use sqlx::{Column, Decode, Executor, Postgres, Row as _, Statement, Type, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Type categories used to pick a decoder for a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Decimal,
    Integer,
    Float,
    Boolean,
    Json,
    Uuid,
    Binary,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Text,
}

/// Categorize a PostgreSQL type name as reported by the driver.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    match type_name.to_lowercase().as_str() {
        "numeric" | "decimal" => TypeCategory::Decimal,
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "bool" | "boolean" => TypeCategory::Boolean,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        _ => TypeCategory::Text,
    }
}

/// Connection check run by the pool before handing a connection out.
///
/// `Ok(false)` discards the connection and the pool tries another one.
pub type BeforeAcquire = Arc<
    dyn for<'c> Fn(
            &'c mut PgConnection,
            PoolConnectionMetadata,
        ) -> BoxFuture<'c, Result<bool, sqlx::Error>>
        + Send
        + Sync,
>;

/// Resource name of a physical transaction, e.g. `tx_3f2a...`.
pub fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Build driver connect options from a DSN.
pub fn connect_options(dsn: &Dsn) -> DbResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(&dsn.host)
        .port(dsn.port)
        .username(&dsn.user)
        .database(&dsn.database);

    if !dsn.password.is_empty() {
        options = options.password(&dsn.password);
    }
    if !dsn.ssl_mode.is_empty() {
        let mode = dsn
            .ssl_mode
            .parse::<PgSslMode>()
            .map_err(|e| DbError::config(format!("Invalid sslmode '{}': {}", dsn.ssl_mode, e)))?;
        options = options.ssl_mode(mode);
    }
    if !dsn.charset.is_empty() {
        options = options.options([("client_encoding", dsn.charset.as_str())]);
    }

    Ok(options)
}

/// Pool sizing and connection checks from [`PoolOptions`].
///
/// `max_idle_conns` has no pool-side counterpart and is only validated.
pub fn pool_options(pool: &PoolOptions, before_acquire: Option<BeforeAcquire>) -> PgPoolOptions {
    let options = PgPoolOptions::new()
        .max_connections(pool.max_open_conns_or_default())
        .max_lifetime(pool.max_lifetime_or_default())
        .idle_timeout(pool.max_idle_time_or_default())
        .test_before_acquire(true);

    match before_acquire {
        Some(hook) => options.before_acquire(move |conn, meta| hook(conn, meta)),
        None => options,
    }
}

/// Pooled PostgreSQL engine.
#[derive(Debug, Clone)]
pub struct PgEngine {
    pool: PgPool,
}

impl PgEngine {
    /// Open a pool and establish the first connection.
    pub async fn connect(
        dsn: &Dsn,
        pool: &PoolOptions,
        before_acquire: Option<BeforeAcquire>,
    ) -> DbResult<Self> {
        dsn.validate()?;
        pool.validate().map_err(DbError::config)?;
        let options = connect_options(dsn)?;

        info!(
            dsn = %dsn.redacted(),
            max_open_conns = pool.max_open_conns_or_default(),
            before_acquire = before_acquire.is_some(),
            "Connecting to PostgreSQL"
        );

        let pool = pool_options(pool, before_acquire)
            .connect_with(options)
            .await
            .map_err(|e| DbError::classify("connect", e.into()))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Engine for PgEngine {
    fn system(&self) -> &'static str {
        "postgresql"
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        let result = build_query(sql, args).execute(&self.pool).await?;
        Ok(ExecResult::new(result.rows_affected()))
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, DriverError> {
        let rows = build_query(sql, args).fetch_all(&self.pool).await?;
        if rows.is_empty() {
            let columns = describe_columns(Executor::prepare(&self.pool, sql).await);
            return Ok(Rows::new(columns, Vec::new()));
        }
        Ok(decode_rows(&rows))
    }

    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn Connection>, DriverError> {
        let set_transaction = options.set_transaction_sql()?;
        let mut tx = self.pool.begin().await?;
        if let Some(sql) = set_transaction {
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        let id = generate_transaction_id();
        debug!(db.resource = %id, "Physical transaction opened");
        Ok(Box::new(PgTransaction {
            id,
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        use sqlx::Connection as _;
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// One physical transaction. Finishing it releases the connection, after
/// which every call reports [`DriverError::TxDone`].
pub struct PgTransaction {
    id: String,
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

#[async_trait]
impl Connection for PgTransaction {
    fn resource(&self) -> &str {
        &self.id
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DriverError::TxDone)?;
        let result = build_query(sql, args).execute(&mut **tx).await?;
        Ok(ExecResult::new(result.rows_affected()))
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, DriverError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(DriverError::TxDone)?;
        let rows = build_query(sql, args).fetch_all(&mut **tx).await?;
        if rows.is_empty() {
            let columns = describe_columns(Executor::prepare(&mut **tx, sql).await);
            return Ok(Rows::new(columns, Vec::new()));
        }
        Ok(decode_rows(&rows))
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let tx = self.tx.lock().await.take().ok_or(DriverError::TxDone)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        let tx = self.tx.lock().await.take().ok_or(DriverError::TxDone)?;
        tx.rollback().await?;
        Ok(())
    }
}

fn build_query<'q>(sql: &'q str, args: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    args.iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::String(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::Json(j) => query.bind(sqlx::types::Json(j)),
    }
}

/// Column names of a prepared statement, for results without rows.
///
/// Statements that cannot be prepared on their own (e.g. several statements
/// in one string) report no columns.
fn describe_columns(statement: Result<PgStatement<'_>, sqlx::Error>) -> Vec<String> {
    match statement {
        Ok(statement) => statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        Err(e) => {
            debug!(error = %e, "Could not describe empty result");
            Vec::new()
        }
    }
}

fn decode_rows(rows: &[PgRow]) -> Rows {
    let Some(first) = rows.first() else {
        return Rows::default();
    };

    let columns: Vec<String> = first.columns().iter().map(|c| c.name().to_string()).collect();
    let categories: Vec<(TypeCategory, String)> = first
        .columns()
        .iter()
        .map(|c| {
            let name = c.type_info().name().to_lowercase();
            (categorize_type(&name), name)
        })
        .collect();

    let values = rows
        .iter()
        .map(|row| {
            categories
                .iter()
                .enumerate()
                .map(|(idx, (category, type_name))| decode_column(row, idx, *category, type_name))
                .collect()
        })
        .collect();

    Rows::new(columns, values)
}

fn decode_column(row: &PgRow, idx: usize, category: TypeCategory, type_name: &str) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(e) => {
            warn!(column = idx, error = %e, "Failed to read column");
            return Value::Null;
        }
    }

    let decoded = match category {
        TypeCategory::Decimal => row.try_get::<RawDecimal, _>(idx).map(|d| Value::String(d.0)),
        TypeCategory::Integer => match type_name {
            "int2" | "smallint" => row.try_get::<i16, _>(idx).map(Value::from),
            "int4" | "integer" => row.try_get::<i32, _>(idx).map(Value::from),
            _ => row.try_get::<i64, _>(idx).map(Value::from),
        },
        TypeCategory::Float => match type_name {
            "float4" | "real" => row.try_get::<f32, _>(idx).map(Value::from),
            _ => row.try_get::<f64, _>(idx).map(Value::from),
        },
        TypeCategory::Boolean => row.try_get::<bool, _>(idx).map(Value::from),
        TypeCategory::Json => row
            .try_get::<serde_json::Value, _>(idx)
            .map(Value::Json),
        TypeCategory::Uuid => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|u| Value::String(u.to_string())),
        TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).map(Value::Bytes),
        TypeCategory::Timestamp => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        TypeCategory::TimestampTz => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|t| Value::String(t.to_rfc3339())),
        TypeCategory::Date => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::String(d.to_string())),
        TypeCategory::Time => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|t| Value::String(t.to_string())),
        TypeCategory::Text => row.try_get::<String, _>(idx).map(Value::String),
    };

    decoded.unwrap_or_else(|e| {
        warn!(column = idx, column_type = type_name, error = %e, "Failed to decode column");
        Value::Null
    })
}

/// `NUMERIC` value kept as its exact decimal string.
struct RawDecimal(String);

impl Type<Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name == "numeric" || name == "decimal"
    }
}

impl<'r> Decode<'r, Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(format_numeric(value.as_bytes()?)?)),
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary `NUMERIC` wire format: a header of digit count, weight,
/// sign and display scale followed by base-10000 digits, all big-endian.
fn format_numeric(buf: &[u8]) -> Result<String, String> {
    let word = |i: usize| -> Result<u16, String> {
        buf.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".to_string())
    };

    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i32;
    let sign = word(2)?;
    let scale = word(3)? as usize;
    let digits = (0..ndigits)
        .map(|i| word(4 + i).map(|d| d as i16))
        .collect::<Result<Vec<_>, _>>()?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }

    let digit = |pos: i32| -> i16 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(pos)));
            }
        }
    }

    if scale > 0 {
        let mut frac = String::new();
        let mut pos = weight + 1;
        while frac.len() < scale {
            frac.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        frac.truncate(scale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}
