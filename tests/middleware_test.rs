//! Integration tests for the middleware chain wrapped around database operations.

mod common;

use async_trait::async_trait;
use common::{ScriptedEngine, database_with};
use sqlscope::db::{Behavior, Call, Next, Operation, Outcome};
use sqlscope::{Context, DbError, DbResult, RetryBehavior, Scope};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

/// Records the calls it sees before and after the rest of the chain.
struct Recorder {
    name: &'static str,
    log: Log,
}

#[async_trait]
impl Behavior for Recorder {
    async fn apply(&self, ctx: Context, call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
        let resource = call.resource.unwrap_or("pool");
        self.log
            .lock()
            .unwrap()
            .push(format!("{}>{} {}", self.name, call.operation, resource));
        let result = next.run(ctx).await;
        self.log
            .lock()
            .unwrap()
            .push(format!("{}<{}", self.name, call.operation));
        result
    }
}

/// Rejects writes without reaching the engine.
struct ReadOnlyGuard;

#[async_trait]
impl Behavior for ReadOnlyGuard {
    async fn apply(&self, ctx: Context, call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
        if call.operation == Operation::Exec {
            return Err(DbError::invalid_input(format!(
                "writes are disabled on {}",
                call.db_id
            )));
        }
        next.run(ctx).await
    }
}

fn recorder(name: &'static str, log: &Log) -> Recorder {
    Recorder {
        name,
        log: Arc::clone(log),
    }
}

#[tokio::test]
async fn test_first_registered_behavior_is_outermost() {
    let engine = ScriptedEngine::new();
    let log = Log::default();
    let db = database_with("platform", &engine, |b| {
        b.with_behavior(recorder("a", &log))
            .with_behavior(recorder("b", &log))
    })
    .await;

    db.exec(&Context::new(), "update t set x = 1", &[])
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a>exec pool", "b>exec pool", "b<exec", "a<exec"]
    );
    assert_eq!(engine.journal(), vec!["exec pool: update t set x = 1"]);
}

#[tokio::test]
async fn test_transaction_operations_pass_through_chain() {
    let engine = ScriptedEngine::new();
    let log = Log::default();
    let db = database_with("platform", &engine, |b| b.with_behavior(recorder("a", &log))).await;
    let scope = &db;

    db.transact(&Context::new(), |ctx| async move {
        scope.query(&ctx, "select 1", &[]).await?;
        Ok(())
    })
    .await
    .unwrap();

    let log = log.lock().unwrap();
    let entries: Vec<&str> = log
        .iter()
        .filter(|line| line.contains('>'))
        .map(String::as_str)
        .collect();
    assert_eq!(
        entries,
        vec!["a>begin pool", "a>query tx_1", "a>commit tx_1", "a>rollback tx_1"]
    );
}

#[tokio::test]
async fn test_cleanup_rollback_after_commit_reaches_chain_as_tx_done() {
    let engine = ScriptedEngine::new();
    let log = Log::default();
    let db = database_with("platform", &engine, |b| b.with_behavior(recorder("a", &log))).await;

    db.transact(&Context::new(), |_ctx| async move { Ok(()) })
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert!(log.contains(&"a>rollback tx_1".to_string()));
    assert_eq!(engine.count("rollback"), 0);
}

#[tokio::test]
async fn test_behavior_can_short_circuit() {
    let engine = ScriptedEngine::new();
    let db = database_with("platform", &engine, |b| b.with_behavior(ReadOnlyGuard)).await;
    let ctx = Context::new();

    let err = db
        .exec(&ctx, "delete from users", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert!(err.to_string().contains("platform"));

    db.query(&ctx, "select * from users", &[]).await.unwrap();
    assert_eq!(engine.journal(), vec!["query pool: select * from users"]);
}

#[tokio::test]
async fn test_retry_behavior_recovers_pool_statements() {
    let engine = ScriptedEngine::new();
    let db = database_with("platform", &engine, |b| {
        b.with_behavior(RetryBehavior::new(3, Duration::ZERO))
    })
    .await;

    engine.fail_next(2);
    let result = db.exec(&Context::new(), "insert into t values (1)", &[]).await;

    assert_eq!(result.unwrap().rows_affected, 1);
    assert_eq!(engine.count("exec pool"), 3);
}

#[tokio::test]
async fn test_retry_behavior_leaves_transactions_alone() {
    let engine = ScriptedEngine::new();
    let db = database_with("platform", &engine, |b| {
        b.with_behavior(RetryBehavior::new(3, Duration::ZERO))
    })
    .await;
    let scope = &db;

    engine.fail_next(1);
    let result = db
        .transact(&Context::new(), |ctx| async move {
            scope.exec(&ctx, "insert into t values (2)", &[]).await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(DbError::Connection { .. })));
    assert_eq!(engine.count("exec tx_1"), 1);
    assert_eq!(engine.count("rollback tx_1"), 1);
}
