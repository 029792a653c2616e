//! Retry backoff computation shared by all transports

use crate::config::{QueueConfig, RetryBackoff};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Relative jitter applied to every retry delay
const JITTER_FRACTION: f64 = 0.25;

/// Base delay before jitter for the given attempt count
///
/// Fixed mode always returns the configured base delay. Exponential mode
/// doubles per prior attempt: `base * 2^(attempts - 1)`.
pub fn base_delay_ms(config: &QueueConfig, attempts: u32) -> u64 {
    match config.retry_backoff {
        RetryBackoff::Fixed => config.retry_delay_ms,
        RetryBackoff::Exponential => {
            let exponent = attempts.saturating_sub(1).min(31);
            config.retry_delay_ms.saturating_mul(1u64 << exponent)
        }
    }
}

/// Next eligible instant for a retried job
///
/// Applies a symmetric random jitter of ±25% of the base delay so that
/// retries from simultaneous failures spread out.
pub fn next_run_at(config: &QueueConfig, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let base = base_delay_ms(config, attempts) as f64;
    let jitter = base * rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let delay_ms = (base + jitter).max(0.0) as i64;
    now + Duration::milliseconds(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backoff: RetryBackoff, base_ms: u64) -> QueueConfig {
        QueueConfig {
            retry_backoff: backoff,
            retry_delay_ms: base_ms,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn fixed_backoff_ignores_attempts() {
        let cfg = config(RetryBackoff::Fixed, 1000);
        assert_eq!(base_delay_ms(&cfg, 1), 1000);
        assert_eq!(base_delay_ms(&cfg, 5), 1000);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let cfg = config(RetryBackoff::Exponential, 1000);
        assert_eq!(base_delay_ms(&cfg, 1), 1000);
        assert_eq!(base_delay_ms(&cfg, 2), 2000);
        assert_eq!(base_delay_ms(&cfg, 3), 4000);
        assert_eq!(base_delay_ms(&cfg, 4), 8000);
    }

    #[test]
    fn exponential_backoff_saturates() {
        let cfg = config(RetryBackoff::Exponential, u64::MAX / 2);
        // Must not overflow on absurd attempt counts
        let _ = base_delay_ms(&cfg, 200);
    }

    #[test]
    fn next_run_at_stays_within_jitter_bounds() {
        let cfg = config(RetryBackoff::Fixed, 10_000);
        let now = Utc::now();
        for _ in 0..100 {
            let run_at = next_run_at(&cfg, 1, now);
            let delta = (run_at - now).num_milliseconds();
            assert!((7_500..=12_500).contains(&delta), "delta {} out of range", delta);
        }
    }
}
