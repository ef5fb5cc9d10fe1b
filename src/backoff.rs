//! Delay strategies applied before a failed message is redelivered.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long to wait before the next attempt of a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`, plus up to `jitter` of random delay.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: Duration,
    },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to apply after attempt number `attempt` (1-based) has failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max, jitter } => {
                let exp = attempt.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exp).min(max);

                delay.saturating_add(jitter_delay(jitter))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(1))
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let jitter_ms = jitter.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ignores_attempt() {
        let backoff = Backoff::Fixed(Duration::from_millis(250));

        assert_eq!(backoff.delay_for(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_for(9), Duration::from_millis(250));
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(1_000));

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(50),
        };

        for _ in 0..100 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_saturates_near_duration_max() {
        let backoff = Backoff::Exponential {
            base: Duration::MAX,
            max: Duration::MAX,
            jitter: Duration::from_secs(1),
        };

        assert_eq!(backoff.delay_for(3), Duration::MAX);
    }
}
