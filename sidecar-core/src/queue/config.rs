//! Queue manager configuration, with minimum floors enforced in the
//! constructors rather than trusted to the caller.

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: i32,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl RetryConfig {
    pub fn new(max_attempts: i32, base_delay_ms: i64, max_delay_ms: i64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay_ms.max(0),
            max_delay_ms: max_delay_ms.max(100),
        }
    }

    /// `min(max_delay_ms, base_delay_ms * 2^(attempts-1))`.
    pub fn delay_for_attempt(&self, attempts: i32) -> i64 {
        let exponent = (attempts - 1).max(0) as u32;
        let candidate = self.base_delay_ms.saturating_mul(2i64.saturating_pow(exponent));
        candidate.min(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2, 1500, 45_000)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CooldownConfig {
    pub auth_required_ms: i64,
    pub challenge_ms: i64,
    pub rate_limited_ms: i64,
    pub degraded_ms: i64,
}

impl CooldownConfig {
    pub fn new(auth_required_ms: i64, challenge_ms: i64, rate_limited_ms: i64, degraded_ms: i64) -> Self {
        Self {
            auth_required_ms: auth_required_ms.max(1_000),
            challenge_ms: challenge_ms.max(1_000),
            rate_limited_ms: rate_limited_ms.max(1_000),
            degraded_ms: degraded_ms.max(1_000),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self::new(300_000, 90_000, 45_000, 15_000)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_in_flight: usize,
    pub max_queue_depth: usize,
    pub retry: RetryConfig,
    pub cooldowns: CooldownConfig,
}

impl QueueConfig {
    pub fn new(
        max_in_flight: usize,
        max_queue_depth: usize,
        retry: RetryConfig,
        cooldowns: CooldownConfig,
    ) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            max_queue_depth: max_queue_depth.max(1),
            retry,
            cooldowns,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(1, 120, RetryConfig::default(), CooldownConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_backs_off_and_caps() {
        let retry = RetryConfig::new(5, 1000, 4000);
        assert_eq!(retry.delay_for_attempt(1), 1000);
        assert_eq!(retry.delay_for_attempt(2), 2000);
        assert_eq!(retry.delay_for_attempt(3), 4000);
        assert_eq!(retry.delay_for_attempt(4), 4000);
    }

    #[test]
    fn cooldown_floors_enforced() {
        let c = CooldownConfig::new(0, 0, 0, 0);
        assert_eq!(c.auth_required_ms, 1_000);
        assert_eq!(c.challenge_ms, 1_000);
        assert_eq!(c.rate_limited_ms, 1_000);
        assert_eq!(c.degraded_ms, 1_000);
    }

    #[test]
    fn queue_floors_enforced() {
        let q = QueueConfig::new(0, 0, RetryConfig::default(), CooldownConfig::default());
        assert_eq!(q.max_in_flight, 1);
        assert_eq!(q.max_queue_depth, 1);
    }
}
