//! Bounded retry with exponential backoff for transient upstream failures.

use crate::config::RetryConfig;
use crate::error::{RagError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Execute an async operation, retrying errors for which
/// [`RagError::is_retryable`] holds.
///
/// Permanent errors and pool exhaustion return immediately so the caller can
/// apply its own backoff.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, service: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt == config.max_retries {
                    return Err(e);
                }

                let backoff = compute_backoff(config, attempt);
                tracing::warn!(
                    service,
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RagError::upstream(service, "All retry attempts exhausted")))
}

/// Exponential backoff with up to 25% random jitter.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    let ms = if config.jitter {
        let jitter = (capped as f64 * 0.25 * rand::thread_rng().gen_range(0.0..1.0)) as u64;
        capped + jitter
    } else {
        capped
    };
    Duration::from_millis(ms)
}
