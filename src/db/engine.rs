//! The pooled-connection engine boundary.
//!
//! [`Engine`] is the pool: it executes statements on any free connection and
//! opens physical transactions. [`Connection`] is one such transaction, pinned
//! to a single physical connection until it is committed or rolled back.
//! Cancellation is handled by the caller through [`crate::db::Context::run`];
//! engine futures are simply dropped when abandoned.

use crate::error::DriverError;
use crate::models::{ExecResult, Rows, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Database system tag used in logs, e.g. `"postgresql"`.
    fn system(&self) -> &'static str;

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DriverError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, DriverError>;

    /// Acquire a connection and start a transaction on it.
    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn Connection>, DriverError>;

    async fn ping(&self) -> Result<(), DriverError>;

    async fn close(&self);
}

/// A physical transaction.
///
/// Once `commit` or `rollback` has been called, every further call returns
/// [`DriverError::TxDone`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier of the physical transaction, for logs.
    fn resource(&self) -> &str;

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DriverError>;

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows, DriverError>;

    async fn commit(&self) -> Result<(), DriverError>;

    async fn rollback(&self) -> Result<(), DriverError>;
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Whatever the server is configured with.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    /// PostgreSQL syntax for this level; `None` keeps the server default.
    pub fn as_sql(&self) -> Result<Option<&'static str>, DriverError> {
        match self {
            Self::Default => Ok(None),
            Self::ReadUncommitted => Ok(Some("READ UNCOMMITTED")),
            Self::ReadCommitted => Ok(Some("READ COMMITTED")),
            // PostgreSQL's repeatable read is snapshot isolation
            Self::RepeatableRead | Self::Snapshot => Ok(Some("REPEATABLE READ")),
            Self::Serializable => Ok(Some("SERIALIZABLE")),
            Self::WriteCommitted | Self::Linearizable => Err(DriverError::Unsupported(format!(
                "isolation level {self}"
            ))),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::WriteCommitted => "write committed",
            Self::RepeatableRead => "repeatable read",
            Self::Snapshot => "snapshot",
            Self::Serializable => "serializable",
            Self::Linearizable => "linearizable",
        };
        f.write_str(name)
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// Options for starting a physical transaction, passed through to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
}

impl TxOptions {
    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            access_mode: AccessMode::ReadOnly,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.access_mode == AccessMode::ReadOnly
    }

    /// `SET TRANSACTION` statement to run right after `BEGIN`, if any.
    pub fn set_transaction_sql(&self) -> Result<Option<String>, DriverError> {
        let mut modes = Vec::with_capacity(2);
        if let Some(level) = self.isolation.as_sql()? {
            modes.push(format!("ISOLATION LEVEL {level}"));
        }
        if self.is_read_only() {
            modes.push("READ ONLY".to_string());
        }

        if modes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("SET TRANSACTION {}", modes.join(" "))))
        }
    }
}
