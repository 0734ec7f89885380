//! Backoff computation for step retries.
//!
//! A failed step is re-enqueued with a delay derived from its retry strategy
//! and how many retries have already been performed:
//!
//! - **fixed**: `retry_delay`
//! - **linear**: `retry_delay * (retry_count + 1)`
//! - **exponential**: `retry_delay * 2^retry_count`, capped

use std::time::Duration;

use sagaflow_types::workflow::RetryStrategy;

/// Upper bound on any computed backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3_600);

/// Exponent cap so the shift below cannot overflow.
const MAX_EXPONENT: u32 = 20;

/// Delay before the next attempt of a step that has already been retried
/// `retry_count` times.
pub fn backoff_delay(strategy: RetryStrategy, retry_delay_ms: u64, retry_count: u32) -> Duration {
    let ms = match strategy {
        RetryStrategy::Fixed => retry_delay_ms,
        RetryStrategy::Linear => retry_delay_ms.saturating_mul(u64::from(retry_count) + 1),
        RetryStrategy::Exponential => {
            retry_delay_ms.saturating_mul(1u64 << retry_count.min(MAX_EXPONENT))
        }
    };
    Duration::from_millis(ms).min(MAX_BACKOFF)
}
