//! Polling and retry policies.
//!
//! Every wait loop in strata is driven by an explicit [`PollPolicy`] passed in
//! by the caller, so test code can run the same loops with millisecond values
//! instead of real five-second sleeps. [`retry_backoff`] covers the other
//! shape of transient failure: a bounded number of attempts with jittered
//! exponential backoff, used where an operation races an external process
//! (e.g. fetching the installer's credential file right after provisioning).

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Fixed-interval polling bounds for `wait`-style loops.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollPolicy {
    /// Delay between consecutive polls
    pub interval: Duration,
    /// Overall deadline for the loop
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    /// Create a policy with the given interval and timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// A fast policy for unit tests (1ms interval, 250ms timeout)
    pub fn fast() -> Self {
        Self {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Bounded-attempt backoff for transiently failing operations.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap on the per-attempt delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with bounded, jittered exponential backoff.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. Jitter spreads retries between 0.5x and 1.5x of the nominal
/// delay so parallel callers don't synchronize.
pub async fn retry_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.initial_delay;
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt == max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "operation failed after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }

    unreachable!("max_attempts is at least 1")
}
