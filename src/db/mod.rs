//! Database access layer.
//!
//! This module provides:
//! - The execution [`Context`] that carries active transactions, cancellation
//!   and deadlines
//! - The [`Engine`] boundary and its PostgreSQL implementation
//! - The middleware chain wrapped around every operation
//! - Scopes (`Database`, `Transaction`) and the `transact` helpers
//! - Query tracing and opt-in retry middleware

pub mod builder;
pub mod context;
pub mod engine;
pub mod fetch;
pub mod handler;
pub mod postgres;
pub mod retry;
pub mod scope;
pub mod tracer;

pub use builder::DatabaseBuilder;
pub use context::{Context, DbId};
pub use engine::{AccessMode, Connection, Engine, IsolationLevel, TxOptions};
pub use fetch::Fetcher;
pub use handler::{Action, Behavior, Call, Handler, Next, Operation, Outcome, PassThrough};
pub use postgres::{BeforeAcquire, PgEngine};
pub use retry::RetryBehavior;
pub use scope::{ActiveScope, Cancelable, Database, Scope, ScopeKind, Transaction, TxState};
pub use tracer::{QueryTracer, TraceEvent};
