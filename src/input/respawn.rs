use std::time::Duration;

use crate::config::DetectionConfig;

/// Bounded exponential backoff for restarting a failed transport
#[derive(Debug, Clone, PartialEq)]
pub struct RespawnPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    healthy_after: Duration,
}

/// Uptime that marks a transport as having started properly
const DEFAULT_HEALTHY_AFTER: Duration = Duration::from_secs(10);

impl RespawnPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        RespawnPolicy {
            initial_delay,
            max_delay,
            max_attempts,
            healthy_after: DEFAULT_HEALTHY_AFTER,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.respawn_initial_delay_ms),
            Duration::from_millis(config.respawn_max_delay_ms),
            config.respawn_max_attempts,
        )
        .with_healthy_after(Duration::from_millis(config.respawn_healthy_after_ms))
    }

    /// Restart without waiting (tests, scripted transports)
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, max_attempts)
            .with_healthy_after(Duration::from_secs(1))
    }

    pub fn with_healthy_after(mut self, healthy_after: Duration) -> Self {
        self.healthy_after = healthy_after;
        self
    }

    /// Whether a transport that stayed up for `uptime` had started fine
    pub fn healthy(&self, uptime: Duration) -> bool {
        uptime >= self.healthy_after
    }

    /// Delay before restart number `failures`; zero and one both give the initial delay
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether `failures` consecutive failures exceed the budget
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RespawnPolicy::new(Duration::from_millis(250), Duration::from_secs(2), 8);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RespawnPolicy::immediate(3);
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
    }

    #[test]
    fn test_healthy_uptime() {
        let policy = RespawnPolicy::immediate(3);
        assert!(!policy.healthy(Duration::from_millis(20)));
        assert!(policy.healthy(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(0), Duration::ZERO);

        let policy = RespawnPolicy::default();
        assert!(!policy.healthy(Duration::from_secs(9)));
        assert!(policy.healthy(Duration::from_secs(3600)));
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
    }

    #[test]
    fn test_default_matches_config() {
        let policy = RespawnPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 8);
    }
}
