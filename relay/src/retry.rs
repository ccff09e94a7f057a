//! Exponential-backoff retry for outbound LLM calls.
//!
//! Only transient failures retry (I/O timeouts, 5xx-class provider
//! failures, rate limits). Non-transient failures — auth, bad request —
//! and cancellation return immediately. Delays grow geometrically from
//! `initial_delay` by `multiplier`, capped at `max_delay`, with ±25%
//! jitter so synchronized callers do not stampede a recovering endpoint.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{AgentError, Result};

/// Retry policy for one logical outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Geometric growth factor.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The jittered delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // ±25% jitter.
        let jittered = capped * (0.75 + fastrand::f64() * 0.5);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. The attempt number (starting at 1) is passed to
    /// each invocation.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err: Option<AgentError> = None;

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    debug!(attempt, error = %err, "Transient failure");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.delay_for(attempt - 1)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AgentError::internal("retry loop without attempts")))
    }
}
