//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Consumers build a fresh
//! iterator from the builder after every success, which resets the delay.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between redeliveries of a message whose handler failed.
///
/// - Min delay: `min`
/// - Max delay: `max`
/// - No attempt cap: a failing message is retried until it succeeds or the
///   consumer stops
/// - Jitter enabled
pub fn handler_backoff(min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max.max(min))
        .without_max_times()
        .with_jitter()
}

/// Backoff after a transient poll error.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - No attempt cap
/// - Jitter enabled
pub fn poll_error_backoff() -> ExponentialBuilder {
    handler_backoff(Duration::from_millis(100), Duration::from_secs(5))
}
