// ===============================
// src/retry.rs
// ===============================
//
// Differentiated retry for venue REST calls:
// - auth (401/403)      : never retried
// - rate limit (429)    : up to max_retries_429
// - server (5xx)        : up to max_retries_5xx
// - network / timeout   : up to max_retries_network
// - anything else       : never retried
//
// Delay for attempt n (0-based) = min(base * 2^n, cap) + up to 10% jitter.
// Total attempts = max(budgets) + 1. On exhaustion the last error is returned.
//
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{ApiError, FailureClass};
use crate::metrics::QUOTE_RETRIES;

const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries_network: u32,
    pub max_retries_5xx: u32,
    pub max_retries_429: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_network: 3,
            max_retries_5xx: 2,
            max_retries_429: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries_network
            .max(self.max_retries_5xx)
            .max(self.max_retries_429)
            + 1
    }

    fn budget(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::RateLimited => self.max_retries_429,
            FailureClass::Server => self.max_retries_5xx,
            FailureClass::Network => self.max_retries_network,
            FailureClass::Authentication | FailureClass::Fatal => 0,
        }
    }
}

/// Backoff before retrying after `attempt` failed. `jitter_unit` is in [0, 1).
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32, jitter_unit: f64) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    let raw = cfg.backoff_base.saturating_mul(factor).min(cfg.backoff_max);
    raw + raw.mul_f64(JITTER_FACTOR * jitter_unit.clamp(0.0, 1.0))
}

/// Runs `op` until it succeeds, fails with a non-retryable class, or its class
/// budget is spent.
pub async fn retry_with_backoff<T, F, Fut>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut last_err: Option<ApiError> = None;
    for attempt in 0..cfg.max_attempts() {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let class = e.class();
                if attempt >= cfg.budget(class) {
                    return Err(e);
                }
                let delay = backoff_delay(cfg, attempt, rand::thread_rng().gen::<f64>());
                warn!(%what, class = class.as_str(), attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                QUOTE_RETRIES.with_label_values(&[class.as_str()]).inc();
                last_err = Some(e);
                sleep(delay).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ApiError::Validation("retry budget is empty".into())))
}
