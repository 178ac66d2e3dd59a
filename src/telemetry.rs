//! Tracing subscriber setup.

use crate::config::LogConfig;
use crate::error::{DbError, DbResult};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: &LogConfig) -> DbResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };

    result.map_err(|e| DbError::config(format!("Failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        let err = init_tracing(&config).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }
}
