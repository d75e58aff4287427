//! Exponential backoff for connect and reconnect attempts.

use std::time::Duration;

/// How the transport spaces out connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Attempts before giving up.  Always at least 1.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts have run.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_delays_double_and_cap() {
        // Arrange
        let policy = ReconnectPolicy::default();

        // Act
        let delays: Vec<u64> = (1..=7)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();

        // Assert
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_attempt_numbers_stay_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_multiplier_of_one_is_constant() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(250),
            multiplier: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(250));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_zero_budget_still_allows_one_attempt() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!policy.should_retry(1));
    }
}
