use std::env;
use std::time::Duration;

pub const RENDER_RETRY_MAX_DEFAULT: u32 = 12;
pub const RENDER_RETRY_MAX_LIMIT: u32 = 50;
pub const RENDER_RETRY_DELAY_MS_DEFAULT: u64 = 5_000;
pub const RENDER_RETRY_DELAY_CAP_MS: u64 = 30_000;

/// Bounded linear backoff for renders the remote service reports as still
/// being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RENDER_RETRY_MAX_DEFAULT,
            base_delay: Duration::from_millis(RENDER_RETRY_DELAY_MS_DEFAULT),
            max_delay: Duration::from_millis(RENDER_RETRY_DELAY_CAP_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Reads `FASHIONISTA_RENDER_RETRIES` and `FASHIONISTA_RENDER_RETRY_DELAY_MS`,
    /// falling back to the defaults for missing or unparsable values.
    pub fn from_env() -> Self {
        let max_attempts = env::var("FASHIONISTA_RENDER_RETRIES")
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .map(|value| value.min(RENDER_RETRY_MAX_LIMIT))
            .unwrap_or(RENDER_RETRY_MAX_DEFAULT);
        let base_ms = env::var("FASHIONISTA_RENDER_RETRY_DELAY_MS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|value| value.clamp(50, RENDER_RETRY_DELAY_CAP_MS))
            .unwrap_or(RENDER_RETRY_DELAY_MS_DEFAULT);
        Self::new(
            max_attempts,
            Duration::from_millis(base_ms),
            Duration::from_millis(RENDER_RETRY_DELAY_CAP_MS),
        )
    }

    /// Delay before retry number `attempt + 1`, or `None` once `attempt`
    /// retries have already been spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let multiplier = attempt.saturating_add(1);
        Some(self.base_delay.saturating_mul(multiplier).min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn default_policy_starts_at_five_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(10)));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(9), Some(Duration::from_secs(30)));
    }

    #[test]
    fn policy_stops_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(15));
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(15)));
        assert_eq!(policy.next_delay(2), None);
    }

    #[test]
    fn zero_attempt_policy_never_retries() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(0), None);
    }
}
