use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Bounded exponential backoff with additive jitter.
///
/// Delay for attempt `n` (1-based) is `initial * multiplier^(n-1)`, capped at
/// `max`, plus up to `jitter * delay` of random slack. The cap holds after
/// jitter as well.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms.max(1)),
            max: Duration::from_millis(config.max_ms.max(config.initial_ms.max(1))),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Advance and return the delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.base_delay(self.attempt);

        let jitter_range = (base.as_millis() as f64 * self.jitter) as u64;
        let jitter = if jitter_range > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
        } else {
            Duration::ZERO
        };

        (base + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn grows_exponentially_until_cap() {
        let mut backoff = Backoff::new(&config(0.0));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(&config(0.25));
        for _ in 0..50 {
            let delay = backoff.next_delay();
            let base = backoff.base_delay(backoff.attempt());
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(1_000));
        }
    }
}
