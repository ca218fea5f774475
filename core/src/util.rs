use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule with jitter: 200ms, 400ms, 800ms, 1600ms.
/// Used by the active-adapter driver between failed polls.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << attempt.saturating_sub(1).min(6));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}
