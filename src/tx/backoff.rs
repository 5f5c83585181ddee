//! Bounded exponential backoff with jitter for transient chain failures

use rand::Rng;
use std::time::Duration;

/// Retry bounds for network calls against a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try; 0 means try once
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for one send or query
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, call_timeout: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            call_timeout,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay.as_millis() as u64,
            self.max_delay.as_millis() as u64,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            Duration::from_millis(200),
            Duration::from_millis(5_000),
            Duration::from_secs(30),
        )
    }
}

/// Exponential delay capped at `max_ms`, plus up to 10% jitter
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(calculate_backoff(0, 100, 2000), Duration::ZERO);

        let first = calculate_backoff(1, 100, 2000);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(110));

        let second = calculate_backoff(2, 100, 2000);
        assert!(second >= Duration::from_millis(200));

        let capped = calculate_backoff(20, 100, 1000);
        assert!(capped >= Duration::from_millis(1000) && capped < Duration::from_millis(1100));
    }

    #[test]
    fn test_policy_delay_uses_bounds() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_secs(1),
        );
        assert!(policy.delay(5) < Duration::from_millis(45));
    }
}
