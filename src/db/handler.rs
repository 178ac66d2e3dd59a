//! Middleware chain wrapped around every primitive database operation.
//!
//! A [`Handler`] is built once from an ordered list of [`Behavior`]s by folding
//! them right to left onto the base handler, so the first registered behavior
//! is the outermost one: its "before" logic runs first and its "after" logic
//! runs last. The base handler runs the [`Action`] supplied by the scope, which
//! performs the real engine call and classifies driver errors.

use crate::db::context::{Context, DbId};
use crate::db::engine::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, Rows, Value};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Kind of primitive operation passing through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Exec,
    Query,
    QueryRow,
    Begin,
    Commit,
    Rollback,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Query => "query",
            Self::QueryRow => "query_row",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// Check if this operation controls a transaction rather than running a statement.
    pub fn is_tx_control(&self) -> bool {
        matches!(self, Self::Begin | Self::Commit | Self::Rollback)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one operation, visible to every behavior.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub db_id: &'a DbId,
    /// Database system tag reported by the engine
    pub system: &'static str,
    pub operation: Operation,
    /// Physical transaction id, when running inside one
    pub resource: Option<&'a str>,
    pub sql: &'a str,
    pub args: &'a [Value],
    pub transactional: bool,
}

/// Result of an operation, as seen by behaviors.
pub enum Outcome {
    Affected(ExecResult),
    Rows(Rows),
    Began(Box<dyn Connection>),
    Done,
}

impl Outcome {
    /// Rows affected or returned, for statement outcomes.
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            Self::Affected(result) => Some(result.rows_affected),
            Self::Rows(rows) => Some(rows.len() as u64),
            Self::Began(_) | Self::Done => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Affected(_) => "affected",
            Self::Rows(_) => "rows",
            Self::Began(_) => "began",
            Self::Done => "done",
        }
    }

    fn unexpected(self, expected: &str) -> DbError {
        DbError::internal(format!(
            "expected {expected} outcome, got {}",
            self.kind()
        ))
    }

    pub fn into_exec(self) -> DbResult<ExecResult> {
        match self {
            Self::Affected(result) => Ok(result),
            other => Err(other.unexpected("affected")),
        }
    }

    pub fn into_rows(self) -> DbResult<Rows> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(other.unexpected("rows")),
        }
    }

    pub fn into_connection(self) -> DbResult<Box<dyn Connection>> {
        match self {
            Self::Began(conn) => Ok(conn),
            other => Err(other.unexpected("began")),
        }
    }

    pub fn into_done(self) -> DbResult<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(other.unexpected("done")),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Affected(result) => f.debug_tuple("Affected").field(result).finish(),
            Self::Rows(rows) => f.debug_tuple("Rows").field(&rows.len()).finish(),
            Self::Began(conn) => f.debug_tuple("Began").field(&conn.resource()).finish(),
            Self::Done => f.write_str("Done"),
        }
    }
}

/// The engine call at the end of the chain. May be invoked more than once.
pub type Action<'a> = dyn Fn(Context) -> BoxFuture<'a, DbResult<Outcome>> + Send + Sync + 'a;

/// Box the futures of `f` so it can serve as an [`Action`].
pub fn boxed_action<'a, F, Fut>(
    f: F,
) -> impl Fn(Context) -> BoxFuture<'a, DbResult<Outcome>> + Send + Sync + 'a
where
    F: Fn(Context) -> Fut + Send + Sync + 'a,
    Fut: Future<Output = DbResult<Outcome>> + Send + 'a,
{
    move |ctx| f(ctx).boxed()
}

/// The rest of the chain below a behavior.
///
/// `'a` is how long the chain is borrowed, `'b` is what the action itself
/// borrows; the action must outlive the borrow of it.
#[derive(Clone, Copy)]
pub struct Next<'a, 'b> {
    handler: &'a Handler,
    call: &'a Call<'a>,
    action: &'a Action<'b>,
}

impl<'a, 'b> Next<'a, 'b> {
    /// Run the remaining behaviors and the action.
    pub async fn run(self, ctx: Context) -> DbResult<Outcome> {
        match self.handler {
            Handler::Base => (self.action)(ctx).await,
            Handler::Layer { behavior, next } => {
                let below = Next {
                    handler: next,
                    call: self.call,
                    action: self.action,
                };
                behavior.apply(ctx, self.call, below).await
            }
        }
    }
}

/// Cross-cutting logic wrapped around database operations.
///
/// An implementation may call `next` once, several times (retry) or not at
/// all (short-circuit), and may inspect or replace its outcome.
#[async_trait]
pub trait Behavior: Send + Sync {
    async fn apply(&self, ctx: Context, call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome>;
}

/// Composed middleware chain.
pub enum Handler {
    Base,
    Layer {
        behavior: Arc<dyn Behavior>,
        next: Arc<Handler>,
    },
}

impl Handler {
    /// Compose `behaviors`; the first one wraps outermost.
    pub fn new(behaviors: Vec<Arc<dyn Behavior>>) -> Self {
        behaviors
            .into_iter()
            .rev()
            .fold(Handler::Base, |next, behavior| Handler::Layer {
                behavior,
                next: Arc::new(next),
            })
    }

    /// Number of behaviors in the chain.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut handler = self;
        while let Handler::Layer { next, .. } = handler {
            depth += 1;
            handler = next;
        }
        depth
    }

    pub async fn run<'a, 'b>(
        &'a self,
        ctx: Context,
        call: &'a Call<'a>,
        action: &'a Action<'b>,
    ) -> DbResult<Outcome> {
        Next {
            handler: self,
            call,
            action,
        }
        .run(ctx)
        .await
    }
}

impl Default for Handler {
    fn default() -> Self {
        Handler::Base
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Behavior that only forwards to the rest of the chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Behavior for PassThrough {
    async fn apply(&self, ctx: Context, _call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Behavior for Record {
        async fn apply(&self, ctx: Context, _call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
            self.log.lock().unwrap().push(format!("{}.before", self.name));
            let outcome = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}.after", self.name));
            outcome
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Behavior for ShortCircuit {
        async fn apply(&self, _ctx: Context, _call: &Call<'_>, _next: Next<'_, '_>) -> DbResult<Outcome> {
            Ok(Outcome::Affected(ExecResult::new(42)))
        }
    }

    fn call(id: &DbId) -> Call<'_> {
        Call {
            db_id: id,
            system: "test",
            operation: Operation::Exec,
            resource: None,
            sql: "update t set a = 1",
            args: &[],
            transactional: false,
        }
    }

    #[tokio::test]
    async fn test_first_registered_wraps_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Handler::new(vec![
            Arc::new(Record {
                name: "A",
                log: log.clone(),
            }),
            Arc::new(Record {
                name: "B",
                log: log.clone(),
            }),
        ]);
        assert_eq!(handler.depth(), 2);

        let id = DbId::from("platform");
        let call = call(&id);
        let base_log = log.clone();
        let action = boxed_action(move |_ctx: Context| {
            let base_log = base_log.clone();
            async move {
                base_log.lock().unwrap().push("base".to_string());
                Ok(Outcome::Affected(ExecResult::new(1)))
            }
        });

        let outcome = handler.run(Context::new(), &call, &action).await.unwrap();
        assert_eq!(outcome.rows_affected(), Some(1));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A.before", "B.before", "base", "B.after", "A.after"]
        );
    }

    #[tokio::test]
    async fn test_action_borrows_locals_declared_before_it() {
        let handler = Handler::new(vec![Arc::new(PassThrough)]);
        let id = DbId::from("platform");
        let values = vec![Value::Int(3)];
        let args = values.as_slice();
        let base = Call { args, ..call(&id) };
        let action = boxed_action(move |_ctx: Context| async move {
            Ok(Outcome::Affected(ExecResult::new(args.len() as u64)))
        });

        let outcome = handler.run(Context::new(), &base, &action).await.unwrap();
        assert_eq!(outcome.rows_affected(), Some(1));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_base() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Handler::new(vec![Arc::new(PassThrough), Arc::new(ShortCircuit)]);

        let id = DbId::from("platform");
        let call = call(&id);
        let counter = calls.clone();
        let action = boxed_action(move |_ctx: Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Outcome::Done) }
        });

        let outcome = handler.run(Context::new(), &call, &action).await.unwrap();
        assert_eq!(outcome.into_exec().unwrap().rows_affected, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_action() {
        let handler = Handler::default();
        assert_eq!(handler.depth(), 0);

        let id = DbId::from("platform");
        let call = call(&id);
        let action = boxed_action(|_ctx: Context| async { Ok(Outcome::Done) });
        let outcome = handler.run(Context::new(), &call, &action).await.unwrap();
        assert!(outcome.into_done().is_ok());
    }

    #[test]
    fn test_outcome_mismatch_is_internal_error() {
        let err = Outcome::Done.into_rows().unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::QueryRow.as_str(), "query_row");
        assert!(Operation::Commit.is_tx_control());
        assert!(!Operation::Exec.is_tx_control());
    }
}
