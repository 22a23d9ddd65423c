//! Reconnect backoff policy

use mcp_relay_core::ReconnectSettings;
use std::time::Duration;

/// Exponential reconnect schedule
///
/// Attempts are 1-based: the delay before attempt `n` is
/// `base_delay * multiplier^(n - 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            enabled: settings.enabled,
            base_delay: Duration::from_millis(settings.backoff_ms),
            multiplier: Self::DEFAULT_MULTIPLIER,
            max_attempts: settings.max_retries,
        }
    }

    /// Delay before the given attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Whether attempt `n` may be made at all
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && attempt >= 1 && attempt <= self.max_attempts
    }

    /// Next attempt number and its delay, given how many attempts were made
    /// since the last successful connect. `None` once the budget is spent.
    pub fn next_attempt(&self, attempts_made: u32) -> Option<(u32, Duration)> {
        let attempt = attempts_made.checked_add(1)?;
        if !self.allows(attempt) {
            return None;
        }
        Some((attempt, self.delay_for(attempt)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(base_ms),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_exponential_schedule() {
        let p = policy(1000, 5);
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.delay_for(5), Duration::from_millis(16000));
    }

    #[test]
    fn test_ceiling() {
        let p = policy(1000, 3);
        assert_eq!(p.next_attempt(0), Some((1, Duration::from_millis(1000))));
        assert_eq!(p.next_attempt(2), Some((3, Duration::from_millis(4000))));
        assert_eq!(p.next_attempt(3), None);
        assert!(!p.allows(4));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let p = policy(250, 5);
        // A successful connect resets the counter, so the next failure starts over
        let (attempt, delay) = p.next_attempt(0).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(delay, p.base_delay);
    }

    #[test]
    fn test_disabled_never_retries() {
        let mut p = policy(1000, 5);
        p.enabled = false;
        assert_eq!(p.next_attempt(0), None);
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let p = policy(1000, u32::MAX);
        assert_eq!(p.delay_for(5000), Duration::MAX);
    }

    #[test]
    fn test_from_settings() {
        let p = ReconnectPolicy::from_settings(&ReconnectSettings {
            enabled: true,
            max_retries: 7,
            backoff_ms: 300,
        });
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.base_delay, Duration::from_millis(300));
        assert_eq!(p.multiplier, ReconnectPolicy::DEFAULT_MULTIPLIER);
    }
}
