//! Timers for the session executor
//!
//! Nothing in the session layer ever cancels a timer. Every scheduled
//! [`TimerTask`] carries the identity of the session object that scheduled it
//! and the epoch it was scheduled under; when it fires, the owner compares
//! the epoch with its current one and drops the task if it moved on.
//!
//! The [`Scheduler`] trait is the only clock the session layer sees, so tests
//! can drive time by hand.

use std::time::Duration;
use tokio::time::Instant;

/// Timers owned by the session state machine, guarded by `phase_count`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseTimer {
    /// Create or recovery request unanswered
    CreateTimeout,
    /// First streaming bind unanswered
    FirstBindTimeout,
    /// Polling bind unanswered
    BindTimeout,
    /// Check for silence on the stream
    Keepalive,
    /// Pause between polls (or before the first bind) is over
    Pause,
    /// Backoff before retry or recovery is over
    Sleep,
    /// The server did not honour a force-rebind in time
    SwitchTimeout,
}

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Session state machine timer
    Phase { phase_count: u64, timer: PhaseTimer },
    /// Reverse heartbeat check
    Heartbeat { phase: u64 },
    /// Retransmission check of a sent control request
    Retransmit { key: u64 },
}

/// A timer scheduled by the session identified by `session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTask {
    /// Object id of the session that scheduled the task
    pub session: u64,
    pub kind: TimerKind,
}

/// Clock and timer service
pub trait Scheduler: Send {
    /// Current time
    fn now(&self) -> Instant;

    /// Deliver `task` back to the executor after `delay`
    fn schedule(&mut self, delay: Duration, task: TimerTask);
}
