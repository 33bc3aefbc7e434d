//! Bounded exponential backoff for transient failures

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts per fetch or persist
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;

/// Default cap on a single retry delay, in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

/// Retry policy; the delay doubles after each failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Outcome of a retried operation with the attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Attempted<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            },
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = %what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            },
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        let delays: Vec<_> = (1..=5).map(|a| policy.backoff(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(&RetryPolicy::default(), "fetch", |_: &String| true, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("timeout".to_string())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(outcome.result, Ok(42));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let outcome: Attempted<(), String> =
            with_retry(&RetryPolicy::default(), "fetch", |_: &String| false, || async { Err("404".to_string()) }).await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        let outcome: Attempted<(), String> =
            with_retry(&policy, "persist", |_: &String| true, || async { Err("down".to_string()) }).await;
        assert_eq!(outcome.attempts, 4);
        // 1s + 2s + 4s of backoff under paused time
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
