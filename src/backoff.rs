//! Exponential backoff and bounded retry loops.
//!
//! `calculate_backoff_delay` is the pure delay curve. `retry_with_cancellation`
//! runs a unit of work up to `max_retries + 1` times and stops as soon as an
//! external token is cancelled, including while sleeping between attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Jitter spreads each delay uniformly over ±25% of its value.
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffConfig {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            min_delay_ms,
            max_delay_ms,
            multiplier,
            jitter: false,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Failure of a cancellation-aware retry loop.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,

    #[error("retries exhausted: {0}")]
    Exhausted(E),
}

/// Observer called before each inter-attempt sleep with the index of the
/// attempt that just failed, the delay about to be slept and its error.
pub type RetryObserver<'a, E> = &'a (dyn Fn(u32, Duration, &E) + Send + Sync);

/// `min(max_delay, min_delay * multiplier^attempt)`, jittered when enabled,
/// never below `min_delay`.
pub fn calculate_backoff_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let min = config.min_delay_ms as f64;
    let max = config.max_delay_ms as f64;
    let mut delay = (min * config.multiplier.powf(attempt as f64)).min(max);

    if config.jitter {
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        delay *= factor;
    }

    // NaN and overflow collapse onto the floor.
    let delay = if delay.is_finite() { delay.max(min) } else { min };
    Duration::from_millis(delay as u64)
}

pub async fn retry_with_cancellation<T, E, F, Fut>(
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut operation: F,
    on_retry: Option<RetryObserver<'_, E>>,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_retries {
                    return Err(RetryError::Exhausted(err));
                }
                let delay = calculate_backoff_delay(attempt, config);
                if let Some(observer) = on_retry {
                    observer(attempt, delay, &err);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
