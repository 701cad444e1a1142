use std::env;
use std::str::FromStr;
use tokio::time::Duration;
use tracing::warn;

use crate::util::retry::BackoffConfig;

/// Tunables for a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Deadline for polling the database within one pass.
    pub pass_timeout: Duration,
    /// Interval schedule used while polling.
    pub backoff: BackoffConfig,
    /// Upper bound on re-fetch-and-reapply cycles for one status write.
    pub status_write_attempts: u32,
    /// Re-sync interval once the deployment is steady.
    pub resync_interval: Duration,
    /// Requeue interval while converging or after a transient failure.
    pub converge_interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            pass_timeout: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
            status_write_attempts: 5,
            resync_interval: Duration::from_secs(5 * 60),
            converge_interval: Duration::from_secs(10),
        }
    }
}

impl ReconcileConfig {
    /// Defaults overridden by `ARANGO_OPERATOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let backoff = BackoffConfig {
            initial_delay: parse(&lookup, "ARANGO_OPERATOR_RETRY_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff.initial_delay),
            max_delay: parse(&lookup, "ARANGO_OPERATOR_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff.max_delay),
            ..defaults.backoff.clone()
        };

        Self {
            pass_timeout: parse(&lookup, "ARANGO_OPERATOR_PASS_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pass_timeout),
            backoff,
            status_write_attempts: parse(&lookup, "ARANGO_OPERATOR_STATUS_WRITE_ATTEMPTS")
                .filter(|attempts: &u32| *attempts > 0)
                .unwrap_or(defaults.status_write_attempts),
            resync_interval: parse(&lookup, "ARANGO_OPERATOR_RESYNC_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.resync_interval),
            converge_interval: defaults.converge_interval,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
