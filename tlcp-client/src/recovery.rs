//! Recovery bookkeeping
//!
//! [`RecoveryBean`] records whether the session is in the middle of a
//! recovery and since when. A new bean is derived from the previous one at
//! each interruption:
//!
//! | previous      | start recovery | result                         |
//! |---------------|----------------|--------------------------------|
//! | recovering    | yes            | recovering, same start time    |
//! | recovering    | no             | not recovering                 |
//! | not recovering| yes            | recovering, started now        |
//! | not recovering| no             | not recovering                 |
//!
//! The start time is kept across repeated attempts so that the whole
//! recovery, not each attempt, is bounded by `session_recovery_timeout_ms`.

use tokio::time::Instant;

/// Recovery-in-progress flag and start time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryBean {
    started_at: Option<Instant>,
}

impl RecoveryBean {
    /// Not recovering
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the bean for the next attempt
    pub fn next(&self, start_recovery: bool, now: Instant) -> Self {
        let started_at = match (self.started_at, start_recovery) {
            (Some(start), true) => Some(start),
            (None, true) => Some(now),
            (_, false) => None,
        };
        Self { started_at }
    }

    /// Whether a recovery is in progress
    pub fn is_recovery(&self) -> bool {
        self.started_at.is_some()
    }

    /// Milliseconds of recovery left out of `max_ms`
    ///
    /// Outside a recovery the full budget is left. The value goes negative
    /// once the budget is exhausted.
    pub fn time_left_ms(&self, max_ms: u64, now: Instant) -> i64 {
        match self.started_at {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start).as_millis() as i64;
                max_ms as i64 - elapsed
            }
            None => max_ms as i64,
        }
    }

    /// The recovery succeeded; the clock starts over at the next interruption
    pub fn restore_time_left(&mut self) {
        self.started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transition_table() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);

        let idle = RecoveryBean::new();
        assert!(!idle.next(false, t1).is_recovery());

        let started = idle.next(true, t0);
        assert!(started.is_recovery());

        let again = started.next(true, t1);
        assert_eq!(again, started);

        assert!(!started.next(false, t1).is_recovery());
    }

    #[test]
    fn test_time_left_is_bounded_by_first_start() {
        let t0 = Instant::now();
        let bean = RecoveryBean::new().next(true, t0);
        assert_eq!(bean.time_left_ms(15000, t0), 15000);
        assert_eq!(bean.time_left_ms(15000, t0 + Duration::from_secs(5)), 10000);

        let later = bean.next(true, t0 + Duration::from_secs(10));
        assert!(later.time_left_ms(15000, t0 + Duration::from_secs(20)) <= 0);
    }

    #[test]
    fn test_not_recovering_has_full_budget() {
        let bean = RecoveryBean::new();
        assert_eq!(bean.time_left_ms(15000, Instant::now()), 15000);
    }

    #[test]
    fn test_restore_time_left() {
        let t0 = Instant::now();
        let mut bean = RecoveryBean::new().next(true, t0);
        bean.restore_time_left();
        assert!(!bean.is_recovery());
        assert_eq!(bean.time_left_ms(15000, t0 + Duration::from_secs(60)), 15000);
    }
}
