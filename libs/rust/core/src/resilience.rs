//! Retry with exponential backoff and jitter, used when a round stalls below its participant threshold.

use rand::{thread_rng, Rng};
use std::time::Duration;
use tracing::warn;

use crate::telemetry::FL_METRICS;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `None` retries until the operation succeeds.
    pub max_retries: Option<usize>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: Some(5), base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 } }
}

impl RetryConfig {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let mut delay = std::cmp::min(exp, self.max_delay);
        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
            let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
            delay = Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64);
        }
        delay
    }

    pub fn exhausted(&self, attempt: usize) -> bool { self.max_retries.is_some_and(|max| attempt >= max) }

    /// Sleep before attempt `attempt + 1`.
    pub async fn backoff(&self, attempt: usize, reason: &str) {
        let delay = self.delay_for(attempt);
        FL_METRICS.retries_total.inc();
        warn!(attempt, delay_ms = delay.as_millis() as u64, error=%reason, "retrying_after_backoff");
        tokio::time::sleep(delay).await;
    }
}

pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if cfg.exhausted(attempt) => return Err(e),
            Err(e) => cfg.backoff(attempt, &e.to_string()).await,
        }
        attempt += 1;
    }
}
