//! Query tracer middleware.
//!
//! Records latency, row count and SQL fingerprint of every operation and
//! emits one `tracing` event per operation:
//!
//! | event           | level | when                                   |
//! |-----------------|-------|----------------------------------------|
//! | `db_timeout`    | WARN  | deadline exceeded (`sql.state=57014`)  |
//! | `db_tx_done`    | DEBUG | transaction already finished           |
//! | `db_error`      | ERROR | any other failure                      |
//! | `db_slow_query` | WARN  | latency above `max_allowed_duration`   |
//! | `db_query`      | DEBUG | otherwise                              |
//!
//! The normalized template and the bound arguments are only rendered when
//! DEBUG is enabled.

use crate::config::{DEFAULT_MAX_ALLOWED_DURATION_MS, DEFAULT_MAX_TEMPLATE_LEN, LogOptions};
use crate::db::context::Context;
use crate::db::handler::{Behavior, Call, Next, Outcome};
use crate::error::{DbError, DbResult};
use crate::fingerprint::{hash_template, normalize_sql, safe_template};
use crate::models::Value;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::Level;

/// Event emitted for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Timeout,
    TxDone,
    Error,
    SlowQuery,
    Query,
}

impl TraceEvent {
    /// Pick the event for an operation outcome; the first matching rule wins.
    pub fn classify(error: Option<&DbError>, elapsed: Duration, max_allowed: Duration) -> Self {
        match error {
            Some(e) if e.is_timeout() => Self::Timeout,
            Some(e) if e.is_tx_done() => Self::TxDone,
            Some(_) => Self::Error,
            None if elapsed > max_allowed => Self::SlowQuery,
            None => Self::Query,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Timeout => "db_timeout",
            Self::TxDone => "db_tx_done",
            Self::Error => "db_error",
            Self::SlowQuery => "db_slow_query",
            Self::Query => "db_query",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Self::Timeout | Self::SlowQuery => Level::WARN,
            Self::TxDone | Self::Query => Level::DEBUG,
            Self::Error => Level::ERROR,
        }
    }
}

/// Fields of one trace event.
struct Record<'a> {
    system: &'static str,
    operation: &'static str,
    resource: &'a str,
    latency: Duration,
    rows: Option<u64>,
    fingerprint: String,
    query: Option<String>,
    binds: Option<String>,
    sql_state: Option<&'a str>,
    table: Option<&'a str>,
    constraint: Option<&'a str>,
    error: Option<String>,
}

macro_rules! emit {
    ($level:expr, $record:expr, $message:expr) => {{
        let record = $record;
        tracing::event!(
            $level,
            db.system = record.system,
            db.operation = record.operation,
            db.resource = record.resource,
            db.latency = ?record.latency,
            db.rows = record.rows,
            db.fingerprint = %record.fingerprint,
            db.query = record.query.as_deref(),
            db.binds = record.binds.as_deref(),
            sql.state = record.sql_state,
            db.table = record.table,
            db.constraint = record.constraint,
            error = record.error.as_deref(),
            "{}",
            $message
        )
    }};
}

/// Behavior that logs every operation passing through the chain.
#[derive(Debug, Clone)]
pub struct QueryTracer {
    options: LogOptions,
}

impl QueryTracer {
    /// Zero thresholds fall back to the defaults.
    pub fn new(mut options: LogOptions) -> Self {
        if options.max_template_len == 0 {
            options.max_template_len = DEFAULT_MAX_TEMPLATE_LEN;
        }
        if options.max_allowed_duration_ms == 0 {
            options.max_allowed_duration_ms = DEFAULT_MAX_ALLOWED_DURATION_MS;
        }
        Self { options }
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    fn record(&self, call: &Call<'_>, result: &DbResult<Outcome>, latency: Duration) {
        let error = result.as_ref().err();
        let event = TraceEvent::classify(error, latency, self.options.max_allowed_duration());

        let normalized = normalize_sql(call.sql);
        let verbose = tracing::enabled!(Level::DEBUG);

        let record = Record {
            system: call.system,
            operation: call.operation.as_str(),
            resource: call.resource.unwrap_or("pool"),
            latency,
            rows: result.as_ref().ok().and_then(Outcome::rows_affected),
            fingerprint: hash_template(&normalized),
            query: verbose.then(|| safe_template(&normalized, self.options.max_template_len)),
            binds: (verbose && !call.args.is_empty()).then(|| render_binds(call.args)),
            sql_state: error.and_then(DbError::sql_state),
            table: error.and_then(DbError::table),
            constraint: error.and_then(DbError::constraint),
            error: error.filter(|_| event != TraceEvent::TxDone).map(ToString::to_string),
        };

        // Callsite levels must be constant.
        let level = event.level();
        if level == Level::ERROR {
            emit!(Level::ERROR, record, event.message());
        } else if level == Level::WARN {
            emit!(Level::WARN, record, event.message());
        } else {
            emit!(Level::DEBUG, record, event.message());
        }
    }
}

impl Default for QueryTracer {
    fn default() -> Self {
        Self::new(LogOptions::default())
    }
}

fn render_binds(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_literal)
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Behavior for QueryTracer {
    async fn apply(&self, ctx: Context, call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
        let started = Instant::now();
        let result = next.run(ctx).await;
        self.record(call, &result, started.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    const MAX: Duration = Duration::from_millis(200);

    #[test]
    fn test_classify_timeout_first() {
        let err = DbError::classify("exec", DriverError::DeadlineExceeded);
        let event = TraceEvent::classify(Some(&err), Duration::from_secs(5), MAX);
        assert_eq!(event, TraceEvent::Timeout);
        assert_eq!(event.message(), "db_timeout");
        assert_eq!(event.level(), Level::WARN);
    }

    #[test]
    fn test_classify_tx_done_is_tolerated() {
        let err = DbError::tx_done("rollback");
        let event = TraceEvent::classify(Some(&err), Duration::ZERO, MAX);
        assert_eq!(event, TraceEvent::TxDone);
        assert_eq!(event.level(), Level::DEBUG);
    }

    #[test]
    fn test_classify_error() {
        let err = DbError::classify("exec", DriverError::Canceled);
        let event = TraceEvent::classify(Some(&err), Duration::from_secs(5), MAX);
        assert_eq!(event, TraceEvent::Error);
        assert_eq!(event.level(), Level::ERROR);
    }

    #[test]
    fn test_classify_slow_and_fast() {
        assert_eq!(
            TraceEvent::classify(None, Duration::from_millis(201), MAX),
            TraceEvent::SlowQuery
        );
        assert_eq!(
            TraceEvent::classify(None, Duration::from_millis(200), MAX),
            TraceEvent::Query
        );
    }

    #[test]
    fn test_zero_options_fall_back_to_defaults() {
        let tracer = QueryTracer::new(LogOptions {
            max_template_len: 0,
            max_allowed_duration_ms: 0,
        });
        assert_eq!(tracer.options(), &LogOptions::default());
    }

    #[test]
    fn test_render_binds() {
        let args = [Value::Int(1), Value::from("x"), Value::Null];
        assert_eq!(render_binds(&args), "1, 'x', NULL");
    }
}
