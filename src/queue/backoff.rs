//! Exponential backoff with jitter (spec §4.C).
//!
//! Grounded in `enterprise::cloud::sync::RetryPolicy`'s backoff formula,
//! narrowed to the single jitter style spec §4.C names (uniform, symmetric
//! around the computed delay).

use rand::Rng;

use crate::config::RetryQueueConfig;

/// `delay = min(maxDelay, initialDelay × multiplier^(retryCount − 1))`, then
/// jittered uniformly in `[-jitter * delay, +jitter * delay]`, clamped to `>= 0`.
///
/// `retry_count` is 1-indexed: the first retry (`retry_count = 1`) uses the
/// base `initial_delay_secs` with no growth.
pub fn compute_delay_secs(config: &RetryQueueConfig, retry_count: u32) -> f64 {
    let exponent = retry_count.saturating_sub(1) as i32;
    let base = config.initial_delay_secs * config.multiplier.powi(exponent);
    let delay = base.min(config.max_delay_secs);

    let jitter_span = config.jitter * delay;
    let jitter = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };

    (delay + jitter).max(0.0)
}
