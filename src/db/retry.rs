//! Opt-in retry middleware for connection failures.

use crate::db::context::Context;
use crate::db::handler::{Behavior, Call, Next, Outcome};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

/// Re-runs pool-level statements that failed to reach the database.
///
/// Statements inside a transaction and transaction control operations are
/// never retried: the physical transaction is gone once its connection fails.
/// Attempt `n` waits `backoff * n` before running again.
#[derive(Debug, Clone)]
pub struct RetryBehavior {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryBehavior {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn applies_to(call: &Call<'_>) -> bool {
        !call.transactional && !call.operation.is_tx_control()
    }
}

impl Default for RetryBehavior {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_ATTEMPTS,
            Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        )
    }
}

#[async_trait]
impl Behavior for RetryBehavior {
    async fn apply(&self, ctx: Context, call: &Call<'_>, next: Next<'_, '_>) -> DbResult<Outcome> {
        if !Self::applies_to(call) {
            return next.run(ctx).await;
        }

        let mut attempt = 1;
        loop {
            match next.run(ctx.clone()).await {
                Err(e @ DbError::Connection { .. })
                    if attempt < self.max_attempts && !ctx.is_cancelled() =>
                {
                    warn!(
                        db.id = %call.db_id,
                        db.operation = call.operation.as_str(),
                        attempt = attempt,
                        error = %e,
                        "Retrying database operation"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
