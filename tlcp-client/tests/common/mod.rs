//! Common test utilities for tlcp-client integration tests
//!
//! The session layer is sans-IO, so these doubles stand in for the network
//! and the clock: transports record what they were asked to do, the
//! scheduler keeps timers in a list until a test fires them, and the
//! [`Harness`] feeds server lines back through the [`SessionManager`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tlcp_client::scheduler::{PhaseTimer, Scheduler, TimerKind, TimerTask};
use tlcp_client::transport::{ConnId, HttpRequest, HttpTransport, TransportEvent, TransportEventKind, WsTransport};
use tlcp_client::tutor::{RequestTutor, TutorState};
use tlcp_client::{ClientEvent, ConnectionDetails, ConnectionOptions, Environment, SessionManager};
use tlcp_core::ClientStatus;
use tokio::time::Instant;

pub const SERVER: &str = "http://push.example.com";

#[derive(Default)]
struct WireLog {
    now: Option<Instant>,
    http: Vec<(ConnId, HttpRequest)>,
    http_closed: Vec<ConnId>,
    ws_connects: Vec<(ConnId, String)>,
    ws_frames: Vec<(ConnId, String)>,
    ws_closed: Vec<ConnId>,
    timers: Vec<(Instant, TimerTask)>,
}

/// Shared record of everything the session layer did to the outside world
#[derive(Clone, Default)]
pub struct Wire(Arc<Mutex<WireLog>>);

impl Wire {
    fn log(&self) -> MutexGuard<'_, WireLog> {
        self.0.lock().unwrap()
    }

    /// Frozen clock; only [`Wire::advance`] moves it
    pub fn now(&self) -> Instant {
        *self.log().now.get_or_insert_with(Instant::now)
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.log().now = Some(now + by);
    }

    pub fn http_requests(&self) -> Vec<(ConnId, HttpRequest)> {
        self.log().http.clone()
    }

    pub fn last_http(&self) -> (ConnId, HttpRequest) {
        self.log().http.last().cloned().expect("no HTTP request sent")
    }

    pub fn http_closed(&self) -> Vec<ConnId> {
        self.log().http_closed.clone()
    }

    pub fn ws_connects(&self) -> Vec<(ConnId, String)> {
        self.log().ws_connects.clone()
    }

    pub fn ws_frames(&self) -> Vec<(ConnId, String)> {
        self.log().ws_frames.clone()
    }

    pub fn ws_closed(&self) -> Vec<ConnId> {
        self.log().ws_closed.clone()
    }

    /// Timers not fired yet, with their due time
    pub fn pending_timers(&self) -> Vec<(Instant, TimerTask)> {
        self.log().timers.clone()
    }

    /// Remove the most recent timer matching `wanted`, moving the clock to
    /// its due time
    pub fn take_timer(&self, wanted: impl Fn(&TimerKind) -> bool) -> Option<TimerTask> {
        let mut log = self.log();
        let pos = log.timers.iter().rposition(|(_, task)| wanted(&task.kind))?;
        let (at, task) = log.timers.remove(pos);
        let now = *log.now.get_or_insert_with(Instant::now);
        if at > now {
            log.now = Some(at);
        }
        Some(task)
    }
}

/// Scheduler whose timers fire only when a test says so
pub struct ManualScheduler(pub Wire);

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.0.now()
    }

    fn schedule(&mut self, delay: Duration, task: TimerTask) {
        let due = self.0.now() + delay;
        self.0.log().timers.push((due, task));
    }
}

pub struct RecordingHttp(pub Wire);

impl HttpTransport for RecordingHttp {
    fn send(&mut self, conn: ConnId, request: HttpRequest) {
        self.0.log().http.push((conn, request));
    }

    fn close(&mut self, conn: ConnId) {
        self.0.log().http_closed.push(conn);
    }
}

pub struct RecordingWs(pub Wire);

impl WsTransport for RecordingWs {
    fn connect(&mut self, conn: ConnId, url: String) {
        self.0.log().ws_connects.push((conn, url));
    }

    fn send(&mut self, conn: ConnId, frame: String) {
        self.0.log().ws_frames.push((conn, frame));
    }

    fn close(&mut self, conn: ConnId) {
        self.0.log().ws_closed.push(conn);
    }
}

/// Environment wired to the recording doubles
pub fn test_env(options: ConnectionOptions) -> (Environment, Wire) {
    let wire = Wire::default();
    let env = Environment::new(
        ConnectionDetails::new(SERVER),
        options,
        Box::new(ManualScheduler(wire.clone())),
        Box::new(RecordingHttp(wire.clone())),
        Box::new(RecordingWs(wire.clone())),
    );
    (env, wire)
}

/// Tutor counting how often its request hit the wire
#[derive(Debug, Default)]
pub struct CountingTutor {
    state: TutorState,
    sent: AtomicU32,
}

impl CountingTutor {
    pub fn shared() -> Arc<CountingTutor> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.state.abort_count()
    }
}

impl RequestTutor for CountingTutor {
    fn state(&self) -> &TutorState {
        &self.state
    }

    fn notify_sent(&self) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }
}

/// A session manager driven by hand
pub struct Harness {
    pub env: Environment,
    pub manager: SessionManager,
    pub wire: Wire,
    events: Vec<ClientEvent>,
}

impl Harness {
    pub fn new(options: ConnectionOptions) -> Self {
        let (env, wire) = test_env(options);
        Self {
            env,
            manager: SessionManager::new(),
            wire,
            events: Vec::new(),
        }
    }

    pub fn connect(&mut self) {
        self.manager.connect(&mut self.env, &mut self.events);
    }

    pub fn transport(&mut self, conn: ConnId, kind: TransportEventKind) {
        self.manager
            .on_transport(&mut self.env, &TransportEvent::new(conn, kind), &mut self.events);
    }

    /// Deliver server lines on `conn`
    pub fn feed(&mut self, conn: ConnId, lines: &[&str]) {
        for line in lines {
            self.transport(conn, TransportEventKind::Message(line.to_string()));
        }
    }

    /// Connection of the latest HTTP request
    pub fn last_http_conn(&self) -> ConnId {
        self.wire.last_http().0
    }

    /// Fire the latest pending timer matching `wanted`
    pub fn fire(&mut self, wanted: impl Fn(&TimerKind) -> bool) -> bool {
        match self.wire.take_timer(wanted) {
            Some(task) => {
                self.manager.on_timer(&mut self.env, task, &mut self.events);
                true
            }
            None => false,
        }
    }

    /// Fire the latest pending session timer of type `timer`
    pub fn fire_phase(&mut self, timer: PhaseTimer) -> bool {
        self.fire(|kind| matches!(kind, TimerKind::Phase { timer: t, .. } if *t == timer))
    }

    pub fn status(&self) -> ClientStatus {
        self.manager.client_status()
    }

    /// Events collected since the last call
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// Create over HTTP, then answer with `CONOK` and `LOOP,0`; returns the
    /// connection of the create request
    pub fn created(&mut self, session_id: &str) -> ConnId {
        self.connect();
        let create = self.last_http_conn();
        let conok = format!("CONOK,{session_id},50000000,5000,*");
        self.feed(create, &[conok.as_str(), "LOOP,0"]);
        self.transport(create, TransportEventKind::Closed);
        create
    }

    /// A session bound over HTTP and receiving; returns the stream connection
    pub fn receiving_over_http(&mut self, session_id: &str) -> ConnId {
        self.created(session_id);
        let bind = self.last_http_conn();
        let conok = format!("CONOK,{session_id},50000000,5000,*");
        self.feed(bind, &[conok.as_str()]);
        bind
    }
}
