//! Exponential backoff shared by both connection adapters.

use std::time::Duration;

use rand::Rng;

/// Hard cap on the exponential component.
const MAX_DELAY_MS: u64 = 30_000;

/// Upper bound (exclusive) of the uniform random jitter added to each delay.
const JITTER_MS: u64 = 1000;

/// Stateless delay calculator: `min(base * 2^attempt, 30s) + jitter`.
///
/// Both adapters use the same policy with independent attempt counters, so
/// the arithmetic lives here rather than being duplicated per adapter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64) -> Self {
        Self { base_ms }
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(MAX_DELAY_MS);
        let jitter = rand::rng().random_range(0..JITTER_MS);
        Duration::from_millis(exponential + jitter)
    }
}
