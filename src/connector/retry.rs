//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::connector::ConnectorStats;
use crate::error::ConnectorError;
use crate::models::RetryConfig;

/// The maximum share of a backoff delay added as random jitter.
const JITTER_RATIO: f64 = 0.1;

/// A retry policy applied to transient transport errors.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: config.initial_backoff(),
            max: config.max_backoff(),
        }
    }

    /// The delay before the attempt following the given failed attempt, `attempt` being 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_RATIO));
        base.saturating_add(jitter).min(self.max)
    }

    /// Run the given operation, retrying transient errors until the attempt budget is exhausted.
    ///
    /// Permanent errors are returned immediately. A transient error on the final attempt is
    /// returned as a permanent error.
    pub async fn run<T, F, Fut>(&self, stats: &ConnectorStats, what: &str, mut op: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(val) => return Ok(val),
                Err(err) => self.backoff_or_fail(stats, what, attempt, err).await?,
            }
            attempt += 1;
        }
    }

    /// Wait out the backoff after the given failed attempt, or return the error to surface if the
    /// operation may not be retried.
    pub async fn backoff_or_fail(&self, stats: &ConnectorStats, what: &str, attempt: u32, err: ConnectorError) -> Result<(), ConnectorError> {
        match err {
            ConnectorError::Transient(msg) if attempt < self.max_attempts => {
                let delay = self.backoff(attempt);
                tracing::warn!(
                    error = %msg,
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient error during {}, retrying",
                    what
                );
                stats.incr_retries();
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ConnectorError::Transient(msg) => Err(ConnectorError::Permanent(format!("{} failed after {} attempts: {}", what, self.max_attempts, msg))),
            err => Err(err),
        }
    }
}
