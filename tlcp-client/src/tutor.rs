//! Retransmission policy of control requests
//!
//! Every control request travels with a [`RequestTutor`]. The request
//! managers ask it whether the request is still worth sending; once the
//! request is on the wire, the protocol waits for the tutor's timeout and
//! then asks whether the request succeeded. If it did not, and the tutor was
//! not aborted meanwhile, the request is sent again.
//!
//! # Tutors
//!
//! - [`VoidTutor`]: fire and forget (heartbeat, destroy, bind)
//! - [`ControlTutor`]: retransmit with a doubling timeout until answered
//!   (subscriptions, messages)
//! - [`ConstrainTutor`]: bandwidth changes; never lets an old request undo a
//!   newer one
//! - [`ForceRebindTutor`]: only meaningful while the session stays in the
//!   phase it was issued in
//! - [`MpnTutor`]: MPN requests, retransmitted on a fixed timeout
//!
//! Tutors are shared between the queue, the in-flight bookkeeping and the
//! retransmission timer, so their state is atomic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Initial retransmission timeout
pub const MIN_TIMEOUT_MS: u64 = 4000;

/// Ceiling of the doubling retransmission timeout
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// State every tutor carries
#[derive(Debug)]
pub struct TutorState {
    aborted: AtomicBool,
    answered: AtomicBool,
    aborts: AtomicU32,
    timeout_ms: AtomicU64,
}

impl Default for TutorState {
    fn default() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            aborts: AtomicU32::new(0),
            timeout_ms: AtomicU64::new(MIN_TIMEOUT_MS),
        }
    }
}

impl TutorState {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Number of `notify_abort` calls received
    pub fn abort_count(&self) -> u32 {
        self.aborts.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::AcqRel);
        self.aborted.store(true, Ordering::Release);
    }

    fn answer(&self) {
        self.answered.store(true, Ordering::Release);
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    fn double_timeout(&self) {
        let current = self.timeout_ms.load(Ordering::Acquire);
        self.timeout_ms
            .store(current.saturating_mul(2).min(MAX_TIMEOUT_MS), Ordering::Release);
    }
}

/// Retransmission controller of one control request
pub trait RequestTutor: Send + Sync + fmt::Debug {
    fn state(&self) -> &TutorState;

    /// Whether the request should still go on the wire
    fn should_be_sent(&self) -> bool {
        !self.is_aborted()
    }

    /// Whether no retransmission is needed any more
    fn verify_success(&self) -> bool {
        self.state().is_answered()
    }

    /// Timeout that does not grow with retransmissions
    fn fixed_timeout(&self) -> Option<Duration> {
        None
    }

    /// How long to wait for an answer before checking again
    fn timeout(&self) -> Duration {
        self.fixed_timeout().unwrap_or_else(|| self.state().timeout())
    }

    /// The request is about to be sent again
    fn on_retransmit(&self) {
        if self.fixed_timeout().is_none() {
            self.state().double_timeout();
        }
    }

    /// The request was physically sent
    fn notify_sent(&self) {}

    /// The server answered (`REQOK` or `REQERR`)
    fn notify_response(&self) {
        self.state().answer();
    }

    /// The request was replaced or discarded before being answered
    fn notify_abort(&self) {
        self.state().abort();
    }

    fn is_aborted(&self) -> bool {
        self.state().is_aborted()
    }
}

/// Fire-and-forget requests
#[derive(Debug, Default)]
pub struct VoidTutor {
    state: TutorState,
}

impl VoidTutor {
    pub fn shared() -> Arc<dyn RequestTutor> {
        Arc::new(Self::default())
    }
}

impl RequestTutor for VoidTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }

    fn verify_success(&self) -> bool {
        true
    }
}

/// Requests retransmitted until answered
#[derive(Debug, Default)]
pub struct ControlTutor {
    state: TutorState,
}

impl ControlTutor {
    pub fn shared() -> Arc<dyn RequestTutor> {
        Arc::new(Self::default())
    }
}

impl RequestTutor for ControlTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }
}

/// Latest constrain request sent and answered, by `LS_reqId`
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    last_sent: AtomicU64,
    last_answered: AtomicU64,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn superseded(&self, req_id: u64) -> bool {
        self.last_sent.load(Ordering::Acquire) > req_id
            || self.last_answered.load(Ordering::Acquire) > req_id
    }
}

/// Tutor of a bandwidth change
///
/// A constrain request may only go out, or be retransmitted, while no more
/// recent constrain request has been sent or answered.
#[derive(Debug)]
pub struct ConstrainTutor {
    state: TutorState,
    req_id: u64,
    tracker: Arc<BandwidthTracker>,
}

impl ConstrainTutor {
    pub fn shared(req_id: u64, tracker: Arc<BandwidthTracker>) -> Arc<dyn RequestTutor> {
        Arc::new(Self {
            state: TutorState::default(),
            req_id,
            tracker,
        })
    }
}

impl RequestTutor for ConstrainTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }

    fn should_be_sent(&self) -> bool {
        !self.is_aborted() && !self.tracker.superseded(self.req_id)
    }

    fn verify_success(&self) -> bool {
        self.state.is_answered() || self.tracker.superseded(self.req_id)
    }

    fn notify_sent(&self) {
        self.tracker.last_sent.fetch_max(self.req_id, Ordering::AcqRel);
    }

    fn notify_response(&self) {
        self.state.answer();
        self.tracker
            .last_answered
            .fetch_max(self.req_id, Ordering::AcqRel);
    }
}

/// Tutor of a force-rebind
///
/// Bound to the session phase it was issued in; once the session moves on,
/// the request is pointless.
#[derive(Debug)]
pub struct ForceRebindTutor {
    state: TutorState,
    phase_count: u64,
    current_phase: Arc<AtomicU64>,
    timeout: Duration,
}

impl ForceRebindTutor {
    pub fn shared(
        phase_count: u64,
        current_phase: Arc<AtomicU64>,
        timeout: Duration,
    ) -> Arc<dyn RequestTutor> {
        Arc::new(Self {
            state: TutorState::default(),
            phase_count,
            current_phase,
            timeout,
        })
    }

    fn same_phase(&self) -> bool {
        self.current_phase.load(Ordering::Acquire) == self.phase_count
    }
}

impl RequestTutor for ForceRebindTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }

    fn should_be_sent(&self) -> bool {
        !self.is_aborted() && self.same_phase()
    }

    fn verify_success(&self) -> bool {
        self.state.is_answered() || !self.same_phase()
    }

    fn fixed_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }
}

/// Tutor of MPN requests
#[derive(Debug)]
pub struct MpnTutor {
    state: TutorState,
    timeout: Duration,
}

impl MpnTutor {
    pub fn shared(timeout: Duration) -> Arc<dyn RequestTutor> {
        Arc::new(Self {
            state: TutorState::default(),
            timeout,
        })
    }
}

impl RequestTutor for MpnTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }

    fn fixed_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_tutor_never_retransmits() {
        let tutor = VoidTutor::shared();
        assert!(tutor.should_be_sent());
        assert!(tutor.verify_success());
    }

    #[test]
    fn test_control_tutor_doubles_timeout() {
        let tutor = ControlTutor::shared();
        assert!(!tutor.verify_success());
        assert_eq!(tutor.timeout(), Duration::from_millis(4000));
        tutor.on_retransmit();
        assert_eq!(tutor.timeout(), Duration::from_millis(8000));
        for _ in 0..10 {
            tutor.on_retransmit();
        }
        assert_eq!(tutor.timeout(), Duration::from_millis(MAX_TIMEOUT_MS));
        tutor.notify_response();
        assert!(tutor.verify_success());
    }

    #[test]
    fn test_abort_is_counted() {
        let tutor = ControlTutor::shared();
        tutor.notify_abort();
        assert!(tutor.is_aborted());
        assert!(!tutor.should_be_sent());
        assert_eq!(tutor.state().abort_count(), 1);
    }

    #[test]
    fn test_constrain_no_regression() {
        let tracker = Arc::new(BandwidthTracker::new());
        let older = ConstrainTutor::shared(3, tracker.clone());
        let newer = ConstrainTutor::shared(7, tracker.clone());

        older.notify_sent();
        assert!(!older.verify_success());

        newer.notify_sent();
        assert!(older.verify_success());
        assert!(!older.should_be_sent());
        assert!(!newer.verify_success());
        assert!(newer.should_be_sent());

        newer.notify_response();
        assert!(newer.verify_success());
    }

    #[test]
    fn test_constrain_answer_supersedes_older() {
        let tracker = Arc::new(BandwidthTracker::new());
        let older = ConstrainTutor::shared(1, tracker.clone());
        let newer = ConstrainTutor::shared(2, tracker);
        newer.notify_response();
        assert!(older.verify_success());
    }

    #[test]
    fn test_force_rebind_bound_to_phase() {
        let phase = Arc::new(AtomicU64::new(5));
        let tutor = ForceRebindTutor::shared(5, phase.clone(), Duration::from_millis(2000));
        assert!(tutor.should_be_sent());
        assert!(!tutor.verify_success());
        tutor.on_retransmit();
        assert_eq!(tutor.timeout(), Duration::from_millis(2000));

        phase.store(6, Ordering::Release);
        assert!(!tutor.should_be_sent());
        assert!(tutor.verify_success());
    }
}
