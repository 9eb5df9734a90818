//! Retry policy - full-jitter exponential backoff
//!
//! One policy drives every retry loop in the crate: HTTP status retries,
//! indexer "transient" envelopes and JSON-RPC rate-limit errors. Each caller
//! supplies its own classifier deciding whether an error deserves another
//! attempt.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::VolumeError;
use crate::metrics::RunMetrics;

/// What the classifier wants done with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Fatal - return the error to the caller
    Stop,
    /// Retry after the jittered backoff
    Retry,
    /// Retry after a server-provided delay (still capped at `max_delay`)
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Same delays, different attempt budget
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.base_delay, self.max_delay)
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))`
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Uniform in `[0, backoff_ceiling(attempt))`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling_ms))
    }

    /// Delay before the attempt following `attempt`
    pub fn delay_for(&self, attempt: u32, decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RetryAfter(hint) if !hint.is_zero() => hint.min(self.max_delay),
            _ => self.jittered_delay(attempt),
        }
    }

    /// Run `op` until it succeeds, the classifier says stop, or the attempt
    /// budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut, C>(
        &self,
        metrics: &RunMetrics,
        label: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, VolumeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, VolumeError>>,
        C: Fn(&VolumeError) -> RetryDecision,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let decision = classify(&err);
            if decision == RetryDecision::Stop || attempt >= self.max_attempts {
                return Err(err);
            }

            let wait = self.delay_for(attempt, decision);
            metrics.record_retry();
            warn!(
                "{} failed ({}); attempt {}/{}, retrying after {}ms",
                label,
                err,
                attempt,
                self.max_attempts,
                wait.as_millis()
            );
            sleep(wait).await;
            attempt += 1;
        }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP-date.
///
/// Returns `None` when the value is unusable or already in the past, in
/// which case the caller falls back to jittered backoff.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs > 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let wait_ms = (date.with_timezone(&Utc) - now).num_milliseconds();
    (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64))
}
