//! Reverse heartbeats
//!
//! Keeps the client-to-server direction from staying silent longer than the
//! effective interval: the smaller of the user's interval and the maximum
//! the session imposes, ignoring whichever is zero. Every control request
//! actually sent counts as traffic; a heartbeat goes out only when nothing
//! else did for a whole interval.
//!
//! Checks are [`TimerKind::Heartbeat`] timers carrying the timer's `phase`;
//! changing the interval or stopping bumps the phase, which turns every
//! check already scheduled into a no-op.

use crate::environment::Environment;
use crate::scheduler::{TimerKind, TimerTask};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ReverseHeartbeatTimer {
    session: u64,
    user_interval_ms: u64,
    max_interval_ms: u64,
    last_sent: Option<Instant>,
    phase: u64,
    bind_sent: bool,
}

impl ReverseHeartbeatTimer {
    /// Timer of the session object `session`
    pub fn new(session: u64, user_interval_ms: u64) -> Self {
        Self {
            session,
            user_interval_ms,
            max_interval_ms: 0,
            last_sent: None,
            phase: 0,
            bind_sent: false,
        }
    }

    /// Interval in force, `0` when disabled
    pub fn current_interval_ms(&self) -> u64 {
        match (self.user_interval_ms, self.max_interval_ms) {
            (0, max) => max,
            (user, 0) => user,
            (user, max) => user.min(max),
        }
    }

    /// The bind was issued; checks may start
    pub fn on_bind_sent(&mut self, env: &mut Environment) {
        self.last_sent = Some(env.now());
        if !self.bind_sent {
            self.bind_sent = true;
            self.reschedule(env);
        }
    }

    /// A control request went on the wire at `now`
    pub fn on_control_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn set_user_interval(&mut self, env: &mut Environment, interval_ms: u64) {
        self.user_interval_ms = interval_ms;
        self.reschedule(env);
    }

    pub fn set_max_interval(&mut self, env: &mut Environment, interval_ms: u64) {
        self.max_interval_ms = interval_ms;
        self.reschedule(env);
    }

    /// A check fired; returns whether a heartbeat must be sent now
    pub fn on_timer(&mut self, env: &mut Environment, phase: u64) -> bool {
        if phase != self.phase || !self.bind_sent {
            return false;
        }
        let interval = self.current_interval_ms();
        if interval == 0 {
            return false;
        }

        let now = env.now();
        let elapsed = self
            .last_sent
            .map(|sent| now.saturating_duration_since(sent).as_millis() as u64)
            .unwrap_or(interval);
        if elapsed >= interval {
            self.last_sent = Some(now);
            self.schedule_check(env, interval);
            true
        } else {
            self.schedule_check(env, interval - elapsed);
            false
        }
    }

    /// No more heartbeats for this session
    pub fn stop(&mut self) {
        self.phase += 1;
        self.bind_sent = false;
    }

    fn reschedule(&mut self, env: &mut Environment) {
        self.phase += 1;
        if !self.bind_sent {
            return;
        }
        let interval = self.current_interval_ms();
        if interval == 0 {
            return;
        }
        let now = env.now();
        let elapsed = self
            .last_sent
            .map(|sent| now.saturating_duration_since(sent).as_millis() as u64)
            .unwrap_or(0);
        self.schedule_check(env, interval.saturating_sub(elapsed));
    }

    fn schedule_check(&self, env: &mut Environment, delay_ms: u64) {
        tracing::trace!(session = self.session, phase = self.phase, delay_ms, "heartbeat check");
        env.schedule(
            Duration::from_millis(delay_ms),
            TimerTask {
                session: self.session,
                kind: TimerKind::Heartbeat { phase: self.phase },
            },
        );
    }
}
