//! sqlscope
//!
//! Scoped PostgreSQL access for async services. A [`Database`] handle reads
//! the active transaction from the [`Context`] passed to each call, so code
//! written against [`Scope`] runs unchanged inside or outside a transaction.
//! Every operation passes through a middleware chain; the bundled
//! [`QueryTracer`] logs latency, row counts and a stable SQL fingerprint.

pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod telemetry;

pub use config::{DatabaseConfig, Dsn, LogConfig, LogOptions, PoolOptions};
pub use db::{
    ActiveScope, Behavior, Cancelable, Context, Database, DatabaseBuilder, DbId, Fetcher,
    IsolationLevel, QueryTracer, RetryBehavior, Scope, Transaction, TxOptions,
};
pub use error::{ClassifiedErrors, DbError, DbResult, DriverError, ErrorBuilder};
pub use fingerprint::{normalize_sql, sql_fingerprint};
pub use models::{ExecResult, FromValue, Row, Rows, Value};
