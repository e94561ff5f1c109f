//! Backoff schedules for store write retries.
//!
//! Transient store timeouts are retried indefinitely; the schedule below
//! caps the delay so a recovered store is picked up quickly.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Delay used once the exponential schedule is exhausted; retries continue
/// at this interval forever.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Backoff for emitted-stream and checkpoint write retries after a store
/// timeout.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
/// - No attempt limit; timeouts retry until the store answers
pub fn write_retry_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(MAX_RETRY_DELAY)
        .with_jitter()
        .without_max_times()
}
