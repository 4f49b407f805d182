//! Jittered exponential backoff for transient store failures.

use crate::error::StoreError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use trisum_core::StoreConfig;

/// Run `op`, retrying transient failures up to the configured attempt count.
///
/// Backoff doubles from the configured base and carries multiplicative
/// jitter in [0.5, 1.5) so concurrent writers against the shared registry
/// file do not stampede in lockstep.
pub(crate) async fn with_retries<T, F, Fut>(config: &StoreConfig, op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.retry_attempts.max(1) => {
                let delay = jittered_backoff(config.retry_base_backoff_ms, attempt);
                tracing::debug!(%err, attempt, ?delay, "transient store failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn jittered_backoff(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((exp as f64 * jitter) as u64)
}
