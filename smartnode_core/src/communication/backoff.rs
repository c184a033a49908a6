//! Reconnect backoff
//!
//! [`BackoffPolicy`] computes `first × factor^(attempt-1)` clamped to `max` and applies
//! a [`JitterPolicy`]. [`ReconnectBackoff`] tracks consecutive failures and guarantees
//! the delays it hands out never shrink until [`ReconnectBackoff::reset`] is called
//! after a successful connection.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomisation applied to each backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Exact exponential delays
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2 + uniform[0, delay/2]`
    #[default]
    Equal,
    /// Uniform in `[first, previous × 3]`, capped
    Decorrelated,
}

impl JitterPolicy {
    fn apply(&self, delay: Duration, first: Duration, prev: Duration, max: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => {
                if ms == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
            }
            JitterPolicy::Equal => {
                let half = ms / 2;
                if half == 0 {
                    return delay;
                }
                Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
            }
            JitterPolicy::Decorrelated => {
                let low = first.as_millis() as u64;
                let high = (prev.as_millis() as u64)
                    .saturating_mul(3)
                    .min(max.as_millis() as u64)
                    .max(low);
                if low >= high {
                    return first;
                }
                Duration::from_millis(rand::thread_rng().gen_range(low..=high))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for a 1-based attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Stateful backoff over consecutive connection failures
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt. Never smaller than the previous one and never
    /// above the cap.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.policy.base_delay(self.attempt);
        let prev = if self.last.is_zero() {
            self.policy.first
        } else {
            self.last
        };
        let jittered = self
            .policy
            .jitter
            .apply(base, self.policy.first, prev, self.policy.max);
        let delay = jittered.max(self.last).min(self.policy.max);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of consecutive failures since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(2),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exact_sequence_without_jitter() {
        let mut backoff = ReconnectBackoff::new(policy(JitterPolicy::None));
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000]);
        assert_eq!(backoff.attempt(), 7);
    }

    #[test]
    fn test_jittered_delays_never_decrease() {
        for jitter in [
            JitterPolicy::Full,
            JitterPolicy::Equal,
            JitterPolicy::Decorrelated,
        ] {
            let mut backoff = ReconnectBackoff::new(policy(jitter));
            let mut prev = Duration::ZERO;
            for _ in 0..50 {
                let delay = backoff.next_delay();
                assert!(delay >= prev, "{:?}: {:?} < {:?}", jitter, delay, prev);
                assert!(delay <= Duration::from_secs(2));
                prev = delay;
            }
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = ReconnectBackoff::new(policy(JitterPolicy::None));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_overflowing_factor_is_capped() {
        let p = BackoffPolicy {
            factor: f64::MAX,
            ..policy(JitterPolicy::None)
        };
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(40), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_policy_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            jitter: JitterPolicy,
        }
        let w: Wrapper = toml::from_str("jitter = \"decorrelated\"").unwrap();
        assert_eq!(w.jitter, JitterPolicy::Decorrelated);
    }
}
