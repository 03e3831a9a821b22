//! Retry delays
//!
//! A failed session is recreated after a delay that stays at the configured
//! retry delay for the first attempts and then grows:
//!
//! - calls 1 to 9 of [`DelayCounter::increase`] keep the delay unchanged
//! - every later call doubles it, never beyond 60 seconds
//! - [`DelayCounter::reset`] returns to the initial delay after a session
//!   is established
//!
//! Recovery attempts do not use the counter: they wait a random pause up to
//! `first_retry_max_delay_ms`, see [`jittered_pause`].

use rand::Rng;
use std::time::Duration;

/// Number of increases that keep the delay constant
const CONSTANT_ATTEMPTS: u32 = 9;

/// Ceiling of the growing delay
pub const MAX_DELAY_MS: u64 = 60_000;

/// Growing retry delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayCounter {
    initial_ms: u64,
    current_ms: u64,
    attempts: u32,
}

impl DelayCounter {
    /// Counter starting at `initial_ms`
    pub fn new(initial_ms: u64) -> Self {
        Self {
            initial_ms,
            current_ms: initial_ms,
            attempts: 0,
        }
    }

    /// Current delay
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Current delay in milliseconds
    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Account for one more failed attempt
    pub fn increase(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > CONSTANT_ATTEMPTS {
            self.current_ms = self.current_ms.saturating_mul(2).min(MAX_DELAY_MS);
        }
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
        self.attempts = 0;
    }

    /// Reset with a new initial delay (the retry option changed)
    pub fn reset_to(&mut self, initial_ms: u64) {
        self.initial_ms = initial_ms;
        self.reset();
    }
}

/// Uniform random pause in `[0, max]`
pub fn jittered_pause(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_nine_increases_are_constant() {
        let mut counter = DelayCounter::new(4000);
        for _ in 0..9 {
            counter.increase();
            assert_eq!(counter.current_ms(), 4000);
        }
        counter.increase();
        assert_eq!(counter.current_ms(), 8000);
    }

    #[test]
    fn test_capped_at_sixty_seconds() {
        let mut counter = DelayCounter::new(4000);
        for _ in 0..100 {
            counter.increase();
            assert!(counter.current_ms() <= MAX_DELAY_MS);
        }
        assert_eq!(counter.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset() {
        let mut counter = DelayCounter::new(1000);
        for _ in 0..12 {
            counter.increase();
        }
        assert_eq!(counter.current_ms(), 8000);
        counter.reset();
        assert_eq!(counter.current_ms(), 1000);
        for _ in 0..9 {
            counter.increase();
        }
        assert_eq!(counter.current_ms(), 1000);

        counter.reset_to(2500);
        assert_eq!(counter.current_ms(), 2500);
    }

    #[test]
    fn test_jittered_pause_bounds() {
        assert_eq!(jittered_pause(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(jittered_pause(Duration::from_millis(100)) <= Duration::from_millis(100));
        }
    }
}
