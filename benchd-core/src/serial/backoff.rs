//! Bounded exponential backoff for reconnects and transport retries.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Symmetric jitter fraction applied to the capped delay; 0 disables it.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Supervisor reconnect schedule: `min(base * 2^(attempt-1), max)`.
    pub fn reconnect(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay before the given 1-based attempt, always within
    /// `[base_ms, max_ms]`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let raw = self.base_ms as f64 * self.factor.powi(exponent as i32);
        let capped = raw.min(self.max_ms as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = rand::rng().random_range(-self.jitter..=self.jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };

        jittered.clamp(self.base_ms as f64, self.max_ms as f64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_doubles_until_cap() {
        let policy = BackoffPolicy::reconnect(1000, 15_000);
        assert_eq!(policy.delay_ms(1), 1000);
        assert_eq!(policy.delay_ms(2), 2000);
        assert_eq!(policy.delay_ms(3), 4000);
        assert_eq!(policy.delay_ms(5), 15_000);
        assert_eq!(policy.delay_ms(30), 15_000);
    }

    #[test]
    fn jittered_delay_stays_bounded() {
        let policy = BackoffPolicy {
            base_ms: 1000,
            max_ms: 15_000,
            factor: 1.8,
            jitter: 0.2,
        };
        for _ in 0..200 {
            let delay = policy.delay_ms(10);
            assert!(delay >= 12_000, "delay {delay} below jitter floor");
            assert!(delay <= 15_000, "delay {delay} above cap");
        }
    }

    #[test]
    fn delay_never_drops_below_base() {
        let policy = BackoffPolicy {
            base_ms: 1000,
            max_ms: 15_000,
            factor: 1.8,
            jitter: 0.9,
        };
        for attempt in 1..12 {
            assert!(policy.delay_ms(attempt) >= 1000);
        }
    }
}
