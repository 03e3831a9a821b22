//! Prog counter for countable notifications
//!
//! The server numbers every data-bearing notification it sends on a session
//! (updates, subscription and message outcomes, MPN notifications). The client
//! keeps its own count of the ones it delivered. On a recovery bind the server
//! announces with `PROG,<n>` where its replay starts, and the client drops the
//! replayed notifications it already delivered.
//!
//! If the server announces a prog the client never reached, notifications
//! were lost: the counter records a mismatch, reports it once, and recovery
//! stays disabled for the logical session from then on.

/// Whether a countable notification should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fresh notification; the counter advanced
    Deliver,
    /// Already delivered before the interruption; drop it
    Skip,
}

/// Result of checking a `PROG` announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgCheck {
    /// Consistent with the local count
    InSync,
    /// Inconsistent; reported the first time only
    Mismatch,
    /// Inconsistent again after an earlier mismatch
    AlreadyMismatched,
}

/// Running count of delivered countable notifications
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgCounter {
    delivered: u64,
    to_skip: u64,
    mismatch: bool,
}

impl ProgCounter {
    /// Fresh counter for a new logical session
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of countable notifications delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Replayed notifications still expected to be dropped
    pub fn pending_skips(&self) -> u64 {
        self.to_skip
    }

    /// Whether a prog mismatch was ever detected
    pub fn is_mismatched(&self) -> bool {
        self.mismatch
    }

    /// Account for one countable notification
    pub fn on_countable(&mut self) -> Delivery {
        if self.to_skip > 0 {
            self.to_skip -= 1;
            Delivery::Skip
        } else {
            self.delivered += 1;
            Delivery::Deliver
        }
    }

    /// Check a `PROG,<prog>` announcement
    ///
    /// While recovering, `prog` may be behind the local count: the difference
    /// is replay and will be skipped. Outside recovery the two must match.
    pub fn on_prog(&mut self, prog: u64, recovering: bool) -> ProgCheck {
        let consistent = if recovering {
            prog <= self.delivered
        } else {
            prog == self.delivered
        };
        if consistent {
            if recovering {
                self.to_skip = self.delivered - prog;
            }
            return ProgCheck::InSync;
        }
        if self.mismatch {
            ProgCheck::AlreadyMismatched
        } else {
            self.mismatch = true;
            ProgCheck::Mismatch
        }
    }
}
