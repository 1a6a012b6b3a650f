//! Bounded retry with exponential backoff.
//!
//! The policy is a value passed to the call site rather than a wrapper
//! baked into it, so attempts, backoff and the retryability predicate can
//! be tuned and tested on their own.
//!
//! Only wrap operations that are safe to repeat. Cancellation is the
//! usual async kind: dropping the returned future stops the loop at the
//! next await point, including in the middle of a backoff sleep.

use std::future::Future;

use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::correlation::CorrelationId;

/// Per-call state handed to every attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    /// Same value for every attempt of one logical call
    pub correlation_id: CorrelationId,
}

impl RetryContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff())
    }

    /// Runs `operation` until it succeeds, fails permanently, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn call<T, E, F, Fut, P>(
        &self,
        correlation_id: CorrelationId,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut(&RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut ctx = RetryContext {
            attempt: 1,
            max_attempts: self.max_attempts,
            correlation_id,
        };

        loop {
            match operation(&ctx).await {
                Ok(value) => {
                    if ctx.attempt > 1 {
                        debug!(
                            correlation_id = %ctx.correlation_id,
                            attempt = ctx.attempt,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => {
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        attempt = ctx.attempt,
                        "Permanent failure, not retrying: {e}"
                    );
                    return Err(e);
                }
                Err(e) if ctx.is_last_attempt() => {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        attempts = ctx.attempt,
                        "Giving up after transient failures: {e}"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff.delay_for_attempt(ctx.attempt);
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        attempt = ctx.attempt,
                        max_attempts = ctx.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    ctx.attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
