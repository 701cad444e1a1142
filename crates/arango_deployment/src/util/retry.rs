//! Retry an eventually-consistent operation until it succeeds or a deadline passes.
//!
//! The deadline is the only way to stop a retry loop. Each attempt is itself
//! bounded by the time left, so a hung network call cannot overrun the deadline.

use std::error::Error as StdErrorTrait;
use std::fmt;
use std::future::Future;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Interval schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_BACKOFF,
            max_delay: MAX_BACKOFF,
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

impl BackoffConfig {
    /// Fixed interval, no growth.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64);
        next.clamp(Duration::from_millis(1), self.max_delay.max(Duration::from_millis(1)))
    }
}

/// The deadline elapsed before the operation succeeded.
///
/// `last` is the most recent failure reported by the operation. It is `None`
/// only when no attempt finished before the deadline.
#[derive(Debug)]
pub struct RetryTimeout<E> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: Option<E>,
}

impl<E: fmt::Display> fmt::Display for RetryTimeout<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "not succeeded after {} attempts ({:.1}s)",
            self.attempts,
            self.elapsed.as_secs_f64()
        )?;
        match &self.last {
            Some(last) => write!(f, ": {last}"),
            None => write!(f, ": no attempt completed"),
        }
    }
}

impl<E: StdErrorTrait + 'static> StdErrorTrait for RetryTimeout<E> {
    fn source(&self) -> Option<&(dyn StdErrorTrait + 'static)> {
        self.last.as_ref().map(|e| e as &(dyn StdErrorTrait + 'static))
    }
}

/// Invokes `operation` until it returns `Ok` or `deadline` elapses.
///
/// Sleeps between attempts according to `backoff`, never past the deadline.
pub async fn retry<F, Fut, T, E>(
    backoff: &BackoffConfig,
    deadline: Duration,
    mut operation: F,
) -> Result<T, RetryTimeout<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let start = Instant::now();
    let until = start + deadline;
    let mut delay = backoff.initial_delay.max(Duration::from_millis(1));
    let mut attempts = 0;
    let mut last = None;

    loop {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        attempts += 1;
        match timeout(remaining, operation()).await {
            Ok(Ok(value)) => {
                debug!(attempts, elapsed_ms = start.elapsed().as_millis(), "Operation succeeded");
                return Ok(value);
            }
            Ok(Err(e)) => {
                debug!(attempts, error = %e, "Attempt failed");
                last = Some(e);
            }
            Err(_) => {
                debug!(attempts, "Attempt interrupted by deadline");
                break;
            }
        }

        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        sleep(delay.min(remaining)).await;
        delay = backoff.next_delay(delay);
    }

    let elapsed = start.elapsed();
    warn!(
        attempts,
        elapsed_ms = elapsed.as_millis(),
        last_error = last.as_ref().map(|e| e.to_string()),
        "Retry deadline elapsed"
    );
    Err(RetryTimeout {
        attempts,
        elapsed,
        last,
    })
}
