//! Scripted in-memory engine shared by the integration tests.
//!
//! The engine records every statement it receives as a journal line:
//! `exec pool: <sql>`, `begin tx_1`, `query tx_1: <sql>`, `commit tx_1`, ...

#![allow(dead_code)]

use async_trait::async_trait;
use sqlscope::db::{Connection, Engine, TxOptions};
use sqlscope::{Database, DatabaseBuilder, DriverError, ExecResult, Rows, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    journal: Mutex<Vec<String>>,
    results: Mutex<HashMap<String, Rows>>,
    failures: AtomicU32,
    delay_ms: AtomicU32,
}

impl Script {
    fn record(&self, line: String) {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }

    fn rows_for(&self, sql: &str) -> Rows {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sql)
            .cloned()
            .unwrap_or_default()
    }

    async fn step(&self) -> Result<(), DriverError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay.into())).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DriverError::Sqlx(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

/// Engine whose results and failures are scripted by the test.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    next_tx: AtomicU32,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rows returned for `sql`; unscripted queries return no rows.
    pub fn script_rows(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.script
            .results
            .lock()
            .unwrap()
            .insert(sql.to_string(), Rows::new(columns, rows));
    }

    /// Fail the next `n` statements with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.script.failures.store(n, Ordering::SeqCst);
    }

    /// Make every statement take `delay` before completing.
    pub fn set_delay(&self, delay: Duration) {
        self.script
            .delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn journal(&self) -> Vec<String> {
        self.script.journal.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.journal()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn system(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, sql: &str, _args: &[Value]) -> Result<ExecResult, DriverError> {
        self.script.record(format!("exec pool: {sql}"));
        self.script.step().await?;
        Ok(ExecResult::new(1))
    }

    async fn query(&self, sql: &str, _args: &[Value]) -> Result<Rows, DriverError> {
        self.script.record(format!("query pool: {sql}"));
        self.script.step().await?;
        Ok(self.script.rows_for(sql))
    }

    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn Connection>, DriverError> {
        let set_transaction = options.set_transaction_sql()?;
        let id = format!("tx_{}", self.next_tx.fetch_add(1, Ordering::SeqCst) + 1);
        match set_transaction {
            Some(sql) => self.script.record(format!("begin {id} {sql}")),
            None => self.script.record(format!("begin {id}")),
        }
        Ok(Box::new(ScriptedConnection {
            id,
            script: Arc::clone(&self.script),
            finished: AtomicBool::new(false),
        }))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {
        self.script.record("close".to_string());
    }
}

struct ScriptedConnection {
    id: String,
    script: Arc<Script>,
    finished: AtomicBool,
}

impl ScriptedConnection {
    fn finish(&self, verb: &str) -> Result<(), DriverError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(DriverError::TxDone);
        }
        self.script.record(format!("{verb} {}", self.id));
        Ok(())
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn resource(&self) -> &str {
        &self.id
    }

    async fn execute(&self, sql: &str, _args: &[Value]) -> Result<ExecResult, DriverError> {
        self.script.record(format!("exec {}: {sql}", self.id));
        self.script.step().await?;
        Ok(ExecResult::new(1))
    }

    async fn query(&self, sql: &str, _args: &[Value]) -> Result<Rows, DriverError> {
        self.script.record(format!("query {}: {sql}", self.id));
        self.script.step().await?;
        Ok(self.script.rows_for(sql))
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.finish("commit")
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.finish("rollback")
    }
}

/// A database named `id` on top of `engine`, built with `configure`.
pub async fn database_with(
    id: &str,
    engine: &Arc<ScriptedEngine>,
    configure: impl FnOnce(DatabaseBuilder) -> DatabaseBuilder,
) -> Database {
    let builder = DatabaseBuilder::new()
        .with_database_id(id)
        .with_engine(engine.clone());
    configure(builder).build().await.unwrap()
}

pub async fn database(engine: &Arc<ScriptedEngine>) -> Database {
    database_with("platform", engine, |b| b).await
}

/// Poll the journal until `line` shows up or a second has passed.
pub async fn wait_for(engine: &ScriptedEngine, line: &str) -> bool {
    for _ in 0..100 {
        if engine.journal().iter().any(|l| l == line) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
