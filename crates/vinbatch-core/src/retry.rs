//! Bounded retry policy with a pluggable backoff strategy.
//!
//! Every call site that retries owns its own [`RetryPolicy`], so the attempt
//! ceiling and delays are visible where they apply.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(retry-1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 500,
            max_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Stateless retry policy: `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Returns the delay to wait after the `attempt`-th failure (1-based).
    /// Returns `None` once `attempt` reaches `max_attempts`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let ms = match &self.backoff {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let base = *initial_ms as f64 * multiplier.powi(attempt.saturating_sub(1) as i32);
                base.min(*max_ms as f64) as u64
            }
        };
        Some(Duration::from_millis(ms))
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects, or
    /// the attempt ceiling is hit. Returns the last error and the number of
    /// attempts made on failure.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, (E, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if retryable(&e) => match self.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed, retrying"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => return Err((e, attempt)),
                },
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}
