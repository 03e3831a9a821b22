//! Slow-client detection
//!
//! The server periodically sends `SYNC,<seconds>` with the time elapsed since
//! the stream started. Comparing it with the local clock tells how far behind
//! the client is in consuming the stream. A smoothed delay above
//! [`SLOW_THRESHOLD_MS`] means the client cannot keep up with streaming and
//! should move to polling.
//!
//! A single delay above [`HUGE_DELAY_MS`] is usually the machine waking up
//! from sleep rather than a slow link: the first one in a row is ignored.

use tokio::time::Instant;

/// Smoothed delay above which the client is slow
pub const SLOW_THRESHOLD_MS: f64 = 7000.0;

/// Delay treated as a clock jump
pub const HUGE_DELAY_MS: f64 = 20000.0;

const MOMENTUM: f64 = 0.5;

/// Exponential moving average of the stream delay
#[derive(Debug, Clone, Default)]
pub struct SlowingHandler {
    reference: Option<Instant>,
    mean_delay_ms: Option<f64>,
    huge_in_a_row: bool,
}

impl SlowingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current smoothed delay, if any `SYNC` was measured
    pub fn mean_delay_ms(&self) -> Option<f64> {
        self.mean_delay_ms
    }

    /// Account for `SYNC,<seconds>` received at `now`
    ///
    /// Returns `true` when the client should switch to polling.
    pub fn on_sync(&mut self, seconds: u64, now: Instant) -> bool {
        let Some(reference) = self.reference else {
            self.reference = Some(now);
            self.huge_in_a_row = false;
            return false;
        };

        let expected = reference + std::time::Duration::from_secs(seconds);
        let delay_ms = if now >= expected {
            now.duration_since(expected).as_millis() as f64
        } else {
            -(expected.duration_since(now).as_millis() as f64)
        };

        if delay_ms > HUGE_DELAY_MS && !self.huge_in_a_row {
            self.huge_in_a_row = true;
            tracing::debug!(delay_ms, "ignoring first huge sync delay");
            return false;
        }
        self.huge_in_a_row = delay_ms > HUGE_DELAY_MS;

        let mean = match self.mean_delay_ms {
            Some(mean) => MOMENTUM * mean + (1.0 - MOMENTUM) * delay_ms,
            None => delay_ms,
        };
        self.mean_delay_ms = Some(mean);

        if mean > SLOW_THRESHOLD_MS {
            tracing::info!(mean_delay_ms = mean, "client is too slow for streaming");
            true
        } else {
            false
        }
    }

    /// Forget the measurements (new stream)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sync_sets_reference() {
        let mut handler = SlowingHandler::new();
        assert!(!handler.on_sync(100, Instant::now()));
        assert_eq!(handler.mean_delay_ms(), None);
    }

    #[test]
    fn test_steady_stream_is_not_slow() {
        let t0 = Instant::now();
        let mut handler = SlowingHandler::new();
        handler.on_sync(0, t0);
        assert!(!handler.on_sync(10, t0 + Duration::from_millis(10_200)));
        assert_eq!(handler.mean_delay_ms(), Some(200.0));
    }

    #[test]
    fn test_growing_delay_is_slow() {
        let t0 = Instant::now();
        let mut handler = SlowingHandler::new();
        handler.on_sync(0, t0);
        assert!(!handler.on_sync(10, t0 + Duration::from_millis(16_000)));
        assert!(handler.on_sync(20, t0 + Duration::from_millis(30_000)));
        assert_eq!(handler.mean_delay_ms(), Some(8000.0));
    }

    #[test]
    fn test_first_huge_delay_ignored() {
        let t0 = Instant::now();
        let mut handler = SlowingHandler::new();
        handler.on_sync(0, t0);
        assert!(!handler.on_sync(10, t0 + Duration::from_secs(40)));
        assert_eq!(handler.mean_delay_ms(), None);
        assert!(handler.on_sync(20, t0 + Duration::from_secs(50)));
    }
}
