//! Retry with exponential backoff for transient remote failures.

use std::future::Future;
use std::time::{Duration, SystemTime};

use tracing::warn;

use super::{Result, SynthesisError};

/// Retry budget and backoff schedule for one remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Add up to 25% random jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64).max(0.0) as u64;
        let jitter = if self.jitter {
            (capped as f64 * 0.25 * jitter_fraction()) as u64
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    /// Delay after `err`, honouring a server-suggested delay when rate limited.
    pub fn delay_after(&self, attempt: u32, err: &SynthesisError) -> Duration {
        match err {
            SynthesisError::RateLimited {
                retry_after: Some(delay),
            } => *delay,
            _ => self.backoff_for(attempt),
        }
    }
}

/// Cheap pseudo-random fraction in `[0, 1)` for jitter.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// A retry that is about to happen.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub operation: &'static str,
    /// Attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: SynthesisError,
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent. Each attempt is bounded by `call_timeout`; an elapsed attempt
/// counts as a transport failure. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    operation: &'static str,
    mut on_retry: impl FnMut(&RetryNotice),
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SynthesisError::Transport(format!(
                "{operation} timed out after {call_timeout:?}"
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let delay = policy.delay_after(attempt, &err);
        warn!(
            operation,
            attempt,
            max_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        on_retry(&RetryNotice {
            operation,
            attempt,
            delay,
            error: err,
        });
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
