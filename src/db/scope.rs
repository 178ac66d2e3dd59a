//! Scopes: the database root, transactions and nested transaction markers.
//!
//! Every [`Scope`] exposes the same operations. A [`Database`] resolves the
//! active scope for its id from the [`Context`] on each call, so code that
//! runs inside [`Database::transact`] joins the open transaction without the
//! transaction being passed around.
//!
//! Only the outermost [`Transaction`] owns the physical transaction. `begin`
//! on a transaction returns a nested marker sharing the same connection; its
//! `commit` and `rollback` succeed without touching the connection, so an
//! inner rollback does not undo statements already executed.
//!
//! Operations issued through `Database`, `ActiveScope` and `Transaction` run
//! under [`Context::without_cancel`]: a caller that gives up must not leave a
//! transaction dangling. [`Cancelable`] is the view that honors cancellation.

use crate::db::context::{Context, DbId};
use crate::db::engine::{Connection, Engine, TxOptions};
use crate::db::fetch::Fetcher;
use crate::db::handler::{Action, Call, Handler, Operation, Outcome, boxed_action};
use crate::error::{DbError, DbResult, DriverError, ErrorBuilder};
use crate::models::{ExecResult, Row, Rows, Value};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Which variant a scope is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Database,
    Transaction,
    NestedTransaction,
}

/// State of a physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// The operation surface shared by every scope.
#[async_trait]
pub trait Scope: Send + Sync {
    fn db_id(&self) -> &DbId;

    fn kind(&self) -> ScopeKind;

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult>;

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Rows>;

    /// First row of the result; [`DbError::NoRows`] when there is none.
    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Row>;

    /// Start a read-write transaction, or a nested marker inside an active one.
    async fn begin(&self, ctx: &Context) -> DbResult<Transaction> {
        self.begin_with_options(ctx, TxOptions::read_write()).await
    }

    async fn begin_with_options(&self, ctx: &Context, options: TxOptions)
    -> DbResult<Transaction>;

    /// Row helpers over `query`.
    fn fetch<'a>(&'a self, ctx: &Context, sql: &'a str, args: &'a [Value]) -> Fetcher<'a>
    where
        Self: Sized,
    {
        Fetcher::new(self, ctx, sql, args)
    }
}

// =============================================================================
// Database
// =============================================================================

/// The root scope, bound to a pooled engine.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    id: DbId,
    engine: Arc<dyn Engine>,
    handler: Handler,
    errors: Arc<dyn ErrorBuilder>,
    /// Connection string with the password masked
    source: String,
}

impl Database {
    pub(crate) fn from_parts(
        id: DbId,
        engine: Arc<dyn Engine>,
        handler: Handler,
        errors: Arc<dyn ErrorBuilder>,
        source: String,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                id,
                engine,
                handler,
                errors,
                source,
            }),
        }
    }

    pub fn id(&self) -> &DbId {
        &self.inner.id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    pub fn handler(&self) -> &Handler {
        &self.inner.handler
    }

    /// Redacted connection string this database was built from.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// The scope operations on this database currently run against.
    pub fn scope(&self, ctx: &Context) -> ActiveScope {
        match ctx.scope(self.id()) {
            Some(tx) => ActiveScope::Transaction(tx.clone()),
            None => ActiveScope::Database(self.clone()),
        }
    }

    pub fn in_transaction(&self, ctx: &Context) -> bool {
        ctx.scope(self.id()).is_some()
    }

    /// A view of the active scope whose operations honor `ctx` cancellation.
    pub fn with_cancel(&self, ctx: &Context) -> Cancelable {
        Cancelable {
            scope: self.scope(ctx),
        }
    }

    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        ctx.run(self.inner.engine.ping())
            .await
            .map_err(|e| DbError::classify("ping", e))
    }

    pub async fn close(&self) {
        info!(db.id = %self.id(), "Closing database pool");
        self.inner.engine.close().await;
    }

    /// Run `action` in a read-write transaction.
    ///
    /// Joins the active transaction when there is one. The transaction is
    /// committed when `action` succeeds and rolled back on every other exit:
    /// error, panic, or this future being dropped.
    pub async fn transact<F, Fut, T>(&self, ctx: &Context, action: F) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.transaction_with_options(ctx, TxOptions::read_write(), |ctx, _tx| action(ctx))
            .await
    }

    /// Like [`Database::transact`], also handing the transaction to `action`.
    pub async fn transaction<F, Fut, T>(&self, ctx: &Context, action: F) -> DbResult<T>
    where
        F: FnOnce(Context, Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.transaction_with_options(ctx, TxOptions::read_write(), action)
            .await
    }

    pub async fn transaction_with_options<F, Fut, T>(
        &self,
        ctx: &Context,
        options: TxOptions,
        action: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Context, Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let tx = self
            .scope(ctx)
            .begin_in(&ctx.without_cancel(), options)
            .await?;
        let child = ctx.with_scope(tx.clone());
        let mut guard = RollbackGuard::new(tx.clone(), child.without_cancel());

        let result = AssertUnwindSafe(action(child.clone(), tx.clone()))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(value)) => tx.commit(&child).await.map(|()| value),
            Ok(Err(err)) => Err(err),
            Err(panic) => {
                guard.disarm();
                warn!(
                    db.id = %tx.db_id(),
                    tx.resource = %tx.resource(),
                    "Transaction action panicked, rolling back"
                );
                tx.release(&child).await;
                std::panic::resume_unwind(panic);
            }
        };

        guard.disarm();
        tx.release(&child).await;
        outcome
    }

    fn call<'a>(&'a self, operation: Operation, sql: &'a str, args: &'a [Value]) -> Call<'a> {
        Call {
            db_id: self.id(),
            system: self.inner.engine.system(),
            operation,
            resource: None,
            sql,
            args,
            transactional: false,
        }
    }

    /// Classify a driver error and hand it to the error builder.
    fn build_error(&self, ctx: &Context, operation: Operation, err: DriverError) -> DbError {
        let err = DbError::classify(operation.as_str(), err);
        if err.is_tx_done() {
            return err;
        }
        self.inner.errors.build(ctx, err, operation.as_str())
    }

    async fn pool_exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let db = self;
        let call = self.call(Operation::Exec, sql, args);
        let action = boxed_action(move |ctx: Context| async move {
            ctx.run(db.inner.engine.execute(sql, args))
                .await
                .map(Outcome::Affected)
                .map_err(|e| db.build_error(&ctx, Operation::Exec, e))
        });
        self.inner
            .handler
            .run(ctx.clone(), &call, &action)
            .await?
            .into_exec()
    }

    async fn pool_query(
        &self,
        ctx: &Context,
        operation: Operation,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Rows> {
        let db = self;
        let call = self.call(operation, sql, args);
        let action = boxed_action(move |ctx: Context| async move {
            ctx.run(db.inner.engine.query(sql, args))
                .await
                .map(Outcome::Rows)
                .map_err(|e| db.build_error(&ctx, operation, e))
        });
        self.inner
            .handler
            .run(ctx.clone(), &call, &action)
            .await?
            .into_rows()
    }

    async fn pool_begin(&self, ctx: &Context, options: TxOptions) -> DbResult<Transaction> {
        let db = self;
        let call = self.call(Operation::Begin, "BEGIN", &[]);
        let action = boxed_action(move |ctx: Context| async move {
            ctx.run(db.inner.engine.begin(&options))
                .await
                .map(Outcome::Began)
                .map_err(|e| db.build_error(&ctx, Operation::Begin, e))
        });
        let conn = self
            .inner
            .handler
            .run(ctx.clone(), &call, &action)
            .await?
            .into_connection()?;

        info!(
            db.id = %self.id(),
            tx.resource = %conn.resource(),
            tx.isolation = %options.isolation,
            tx.read_only = options.is_read_only(),
            "Transaction started"
        );

        Ok(Transaction {
            shared: Arc::new(TxShared {
                db: self.clone(),
                conn,
                options,
                state: Mutex::new(TxState::Active),
            }),
            level: 0,
        })
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", self.id())
            .field("system", &self.inner.engine.system())
            .field("source", &self.source())
            .field("handler", &self.inner.handler)
            .finish()
    }
}

#[async_trait]
impl Scope for Database {
    fn db_id(&self) -> &DbId {
        self.id()
    }

    fn kind(&self) -> ScopeKind {
        ScopeKind::Database
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.scope(ctx).exec(ctx, sql, args).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Rows> {
        self.scope(ctx).query(ctx, sql, args).await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Row> {
        self.scope(ctx).query_row(ctx, sql, args).await
    }

    async fn begin_with_options(
        &self,
        ctx: &Context,
        options: TxOptions,
    ) -> DbResult<Transaction> {
        self.scope(ctx).begin_with_options(ctx, options).await
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A physical transaction (level 0) or a nested marker on top of one.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxShared>,
    level: u32,
}

struct TxShared {
    db: Database,
    conn: Box<dyn Connection>,
    options: TxOptions,
    state: Mutex<TxState>,
}

impl TxShared {
    fn lock_state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> TxState {
        *self.lock_state()
    }
}

impl Transaction {
    pub fn db_id(&self) -> &DbId {
        self.shared.db.id()
    }

    pub fn database(&self) -> &Database {
        &self.shared.db
    }

    /// 0 for the physical transaction, 1 and up for nested markers.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_nested(&self) -> bool {
        self.level > 0
    }

    pub fn kind(&self) -> ScopeKind {
        if self.is_nested() {
            ScopeKind::NestedTransaction
        } else {
            ScopeKind::Transaction
        }
    }

    /// State of the underlying physical transaction.
    pub fn state(&self) -> TxState {
        self.shared.state()
    }

    pub fn options(&self) -> TxOptions {
        self.shared.options
    }

    /// Identifier of the physical transaction.
    pub fn resource(&self) -> &str {
        self.shared.conn.resource()
    }

    /// Commit the physical transaction; a no-op on nested markers.
    ///
    /// Fails with [`DbError::TxDone`] if the transaction is already finished.
    pub async fn commit(&self, ctx: &Context) -> DbResult<()> {
        if self.is_nested() {
            debug!(
                db.id = %self.db_id(),
                tx.resource = %self.resource(),
                tx.level = self.level,
                "Nested commit ignored"
            );
            return Ok(());
        }

        self.finish(&ctx.without_cancel(), Operation::Commit).await?;
        info!(db.id = %self.db_id(), tx.resource = %self.resource(), "Transaction committed");
        Ok(())
    }

    /// Roll back the physical transaction; a no-op on nested markers.
    ///
    /// Fails with [`DbError::TxDone`] if the transaction is already finished.
    pub async fn rollback(&self, ctx: &Context) -> DbResult<()> {
        if self.is_nested() {
            debug!(
                db.id = %self.db_id(),
                tx.resource = %self.resource(),
                tx.level = self.level,
                "Nested rollback ignored"
            );
            return Ok(());
        }

        self.finish(&ctx.without_cancel(), Operation::Rollback)
            .await?;
        info!(db.id = %self.db_id(), tx.resource = %self.resource(), "Transaction rolled back");
        Ok(())
    }

    /// Guaranteed-cleanup rollback: tolerates an already finished transaction.
    async fn release(&self, ctx: &Context) {
        match self.rollback(ctx).await {
            Ok(()) => {}
            Err(e) if e.is_tx_done() => {
                debug!(db.id = %self.db_id(), tx.resource = %self.resource(), "Transaction already finished");
            }
            Err(e) => {
                warn!(
                    db.id = %self.db_id(),
                    tx.resource = %self.resource(),
                    error = %e,
                    "Cleanup rollback failed"
                );
            }
        }
    }

    async fn finish(&self, ctx: &Context, operation: Operation) -> DbResult<()> {
        let shared = &self.shared;
        let sql = match operation {
            Operation::Commit => "COMMIT",
            _ => "ROLLBACK",
        };
        let call = self.call(operation, sql, &[]);
        let action = boxed_action(move |ctx: Context| async move {
            {
                let mut state = shared.lock_state();
                if state.is_done() {
                    return Err(DbError::tx_done(operation.as_str()));
                }
                *state = match operation {
                    Operation::Commit => TxState::Committed,
                    _ => TxState::RolledBack,
                };
            }

            let result = match operation {
                Operation::Commit => ctx.run(shared.conn.commit()).await,
                _ => ctx.run(shared.conn.rollback()).await,
            };
            if result.is_err() {
                // PostgreSQL discards a transaction whose commit failed
                *shared.lock_state() = TxState::RolledBack;
            }
            result
                .map(|()| Outcome::Done)
                .map_err(|e| shared.db.build_error(&ctx, operation, e))
        });
        self.run(ctx, &call, &action).await?.into_done()
    }

    fn call<'a>(&'a self, operation: Operation, sql: &'a str, args: &'a [Value]) -> Call<'a> {
        Call {
            db_id: self.db_id(),
            system: self.shared.db.engine().system(),
            operation,
            resource: Some(self.resource()),
            sql,
            args,
            transactional: true,
        }
    }

    async fn run<'a, 'b>(
        &'a self,
        ctx: &Context,
        call: &'a Call<'a>,
        action: &'a Action<'b>,
    ) -> DbResult<Outcome> {
        self.shared
            .db
            .handler()
            .run(ctx.clone(), call, action)
            .await
    }

    async fn exec_in(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let shared = &self.shared;
        let call = self.call(Operation::Exec, sql, args);
        let action = boxed_action(move |ctx: Context| async move {
            if shared.state().is_done() {
                return Err(DbError::tx_done(Operation::Exec.as_str()));
            }
            ctx.run(shared.conn.execute(sql, args))
                .await
                .map(Outcome::Affected)
                .map_err(|e| shared.db.build_error(&ctx, Operation::Exec, e))
        });
        self.run(ctx, &call, &action).await?.into_exec()
    }

    async fn query_in(
        &self,
        ctx: &Context,
        operation: Operation,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Rows> {
        let shared = &self.shared;
        let call = self.call(operation, sql, args);
        let action = boxed_action(move |ctx: Context| async move {
            if shared.state().is_done() {
                return Err(DbError::tx_done(operation.as_str()));
            }
            ctx.run(shared.conn.query(sql, args))
                .await
                .map(Outcome::Rows)
                .map_err(|e| shared.db.build_error(&ctx, operation, e))
        });
        self.run(ctx, &call, &action).await?.into_rows()
    }

    /// Open a nested marker one level deeper; options are those of the outer transaction.
    fn begin_nested(&self) -> DbResult<Transaction> {
        if self.state().is_done() {
            return Err(DbError::tx_done(Operation::Begin.as_str()));
        }
        let nested = Transaction {
            shared: Arc::clone(&self.shared),
            level: self.level + 1,
        };
        debug!(
            db.id = %self.db_id(),
            tx.resource = %self.resource(),
            tx.level = nested.level,
            "Nested transaction started"
        );
        Ok(nested)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("db_id", self.db_id())
            .field("resource", &self.resource())
            .field("level", &self.level)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Scope for Transaction {
    fn db_id(&self) -> &DbId {
        self.shared.db.id()
    }

    fn kind(&self) -> ScopeKind {
        Transaction::kind(self)
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.exec_in(&ctx.without_cancel(), sql, args).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Rows> {
        self.query_in(&ctx.without_cancel(), Operation::Query, sql, args)
            .await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Row> {
        first_row(
            self.query_in(&ctx.without_cancel(), Operation::QueryRow, sql, args)
                .await?,
        )
    }

    async fn begin_with_options(
        &self,
        _ctx: &Context,
        _options: TxOptions,
    ) -> DbResult<Transaction> {
        self.begin_nested()
    }
}

fn first_row(rows: Rows) -> DbResult<Row> {
    rows.into_first().ok_or(DbError::NoRows)
}

// =============================================================================
// Active scope
// =============================================================================

/// The scope resolved from a context: the database itself or its active transaction.
#[derive(Debug, Clone)]
pub enum ActiveScope {
    Database(Database),
    Transaction(Transaction),
}

impl ActiveScope {
    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            Self::Database(_) => None,
            Self::Transaction(tx) => Some(tx),
        }
    }

    async fn exec_in(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        match self {
            Self::Database(db) => db.pool_exec(ctx, sql, args).await,
            Self::Transaction(tx) => tx.exec_in(ctx, sql, args).await,
        }
    }

    async fn query_in(
        &self,
        ctx: &Context,
        operation: Operation,
        sql: &str,
        args: &[Value],
    ) -> DbResult<Rows> {
        match self {
            Self::Database(db) => db.pool_query(ctx, operation, sql, args).await,
            Self::Transaction(tx) => tx.query_in(ctx, operation, sql, args).await,
        }
    }

    async fn begin_in(&self, ctx: &Context, options: TxOptions) -> DbResult<Transaction> {
        match self {
            Self::Database(db) => db.pool_begin(ctx, options).await,
            Self::Transaction(tx) => tx.begin_nested(),
        }
    }
}

#[async_trait]
impl Scope for ActiveScope {
    fn db_id(&self) -> &DbId {
        match self {
            Self::Database(db) => db.id(),
            Self::Transaction(tx) => tx.db_id(),
        }
    }

    fn kind(&self) -> ScopeKind {
        match self {
            Self::Database(_) => ScopeKind::Database,
            Self::Transaction(tx) => tx.kind(),
        }
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.exec_in(&ctx.without_cancel(), sql, args).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Rows> {
        self.query_in(&ctx.without_cancel(), Operation::Query, sql, args)
            .await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Row> {
        first_row(
            self.query_in(&ctx.without_cancel(), Operation::QueryRow, sql, args)
                .await?,
        )
    }

    async fn begin_with_options(
        &self,
        ctx: &Context,
        options: TxOptions,
    ) -> DbResult<Transaction> {
        self.begin_in(&ctx.without_cancel(), options).await
    }
}

// =============================================================================
// Cancelable
// =============================================================================

/// A scope whose operations stop when the caller's context is cancelled or expires.
#[derive(Debug, Clone)]
pub struct Cancelable {
    scope: ActiveScope,
}

impl Cancelable {
    pub fn scope(&self) -> &ActiveScope {
        &self.scope
    }
}

#[async_trait]
impl Scope for Cancelable {
    fn db_id(&self) -> &DbId {
        self.scope.db_id()
    }

    fn kind(&self) -> ScopeKind {
        self.scope.kind()
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.scope.exec_in(ctx, sql, args).await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Rows> {
        self.scope
            .query_in(ctx, Operation::Query, sql, args)
            .await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> DbResult<Row> {
        first_row(
            self.scope
                .query_in(ctx, Operation::QueryRow, sql, args)
                .await?,
        )
    }

    async fn begin_with_options(
        &self,
        ctx: &Context,
        options: TxOptions,
    ) -> DbResult<Transaction> {
        self.scope.begin_in(ctx, options).await
    }
}

// =============================================================================
// Cleanup on drop
// =============================================================================

/// Rolls the transaction back in the background if `transact` is dropped mid-flight.
struct RollbackGuard {
    pending: Option<(Transaction, Context)>,
}

impl RollbackGuard {
    fn new(tx: Transaction, ctx: Context) -> Self {
        Self {
            pending: Some((tx, ctx)),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some((tx, ctx)) = self.pending.take() else {
            return;
        };
        if tx.is_nested() || tx.state().is_done() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    db.id = %tx.db_id(),
                    tx.resource = %tx.resource(),
                    "Transaction abandoned, rolling back"
                );
                handle.spawn(async move {
                    if let Err(e) = tx.rollback(&ctx).await {
                        if !e.is_tx_done() {
                            error!(tx.resource = %tx.resource(), error = %e, "Background rollback failed");
                        }
                    }
                });
            }
            Err(_) => {
                error!(
                    db.id = %tx.db_id(),
                    tx.resource = %tx.resource(),
                    "Transaction abandoned outside a runtime, leaving it to the driver"
                );
            }
        }
    }
}
