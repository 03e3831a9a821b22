//! Session state machine
//!
//! One [`Session`] drives one physical connection strategy (a transport) for
//! a logical server session. When the strategy has to change, because the
//! connection was lost, the transport must be switched or stream-sense falls
//! back to another transport, the session ends and hands an [`Inherited`]
//! bundle to its successor through a [`SessionEvent`].
//!
//! ```text
//! Off ─▶ Creating ─▶ Created ─▶ FirstPause ─▶ FirstBinding ─▶ Receiving ⇄ Stalling ─▶ Stalled
//!           ▲                                     │   ▲             │
//!           │                                     ▼   │ (polling)   ▼
//!           └──────────────── Sleep ◀──────── Pause ─▶ Binding    Sleep
//! ```
//!
//! Every transition bumps `phase_count`; timers carry the value they were
//! scheduled under and are dropped when it moved on.

use crate::batch::RequestObjects;
use crate::delay_counter::{jittered_pause, DelayCounter};
use crate::environment::Environment;
use crate::protocol::{PendingRequests, Protocol, ProtocolEvent};
use crate::recovery::RecoveryBean;
use crate::scheduler::{PhaseTimer, TimerKind, TimerTask};
use crate::slowing::SlowingHandler;
use crate::transport::TransportEvent;
use crate::tutor::{ForceRebindTutor, VoidTutor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tlcp_core::{ClientRequest, ClientStatus, ProgCounter, ServerErrorKind, StreamParams, Transport};
use tokio::time::Instant;

/// Phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Off,
    /// Create or recovery request outstanding
    Creating,
    /// `CONOK` of the create request received
    Created,
    FirstPause,
    /// First bind outstanding
    FirstBinding,
    Receiving,
    Stalling,
    Stalled,
    /// Between two polls
    Pause,
    /// Poll outstanding
    Binding,
    /// Backing off before the next create or recovery
    Sleep,
}

/// State a session passes on to its successor
#[derive(Debug)]
pub struct Inherited {
    pub session_id: Option<String>,
    pub control_link: Option<String>,
    pub request_limit: Option<u64>,
    pub keepalive_ms: u64,
    pub prog: ProgCounter,
    pub recovery: RecoveryBean,
    pub recovery_disabled: bool,
    pub retry_delay: DelayCounter,
    pub polling_interval_ms: u64,
    pub slowing: SlowingHandler,
    pub pending: PendingRequests,
}

/// What a session reports to the session manager
#[derive(Debug)]
pub enum SessionEvent {
    Status(ClientStatus),
    /// `CONOK` of a create or recovery request
    Started { session_id: String, recovered: bool },
    /// A bind was accepted on `transport`
    Bound { transport: Transport },
    /// The first bind failed to establish; try the next transport
    StreamSense { inherited: Inherited, ws_failed: bool },
    /// The connection can be replaced by one on `target`
    SwitchReady { inherited: Inherited, target: Transport },
    /// A switch to `target` waits for the server
    Switching { target: Transport },
    /// Create a fresh session, on `target` if given
    Retry {
        inherited: Inherited,
        target: Option<Transport>,
        cause: String,
    },
    /// Recover the interrupted session
    Recover { inherited: Inherited },
    /// The server ended the session for good
    ServerError { code: i32, message: String },
    /// Notification for the layers above
    Protocol(ProtocolEvent),
}

pub struct Session {
    id: u64,
    transport: Transport,
    phase: Phase,
    phase_count: Arc<AtomicU64>,
    session_id: Option<String>,
    control_link: Option<String>,
    request_limit: Option<u64>,
    keepalive_ms: u64,
    bind_count: u64,
    recovery: RecoveryBean,
    recovery_disabled: bool,
    retry_delay: DelayCounter,
    polling_interval_ms: u64,
    slowing: SlowingHandler,
    protocol: Protocol,
    deferred: Vec<RequestObjects>,
    inherited_pending: Option<PendingRequests>,
    switch_target: Option<Transport>,
    sleep_recover: bool,
    sleep_cause: String,
    last_bind_sent: Option<Instant>,
    last_activity: Option<Instant>,
}

impl Session {
    /// Session object on `transport`, continuing `inherited` if given
    pub fn new(env: &mut Environment, transport: Transport, inherited: Option<Inherited>) -> Self {
        let id = env.next_object_id();
        let inherited = inherited.unwrap_or_else(|| Inherited {
            session_id: None,
            control_link: None,
            request_limit: None,
            keepalive_ms: env.options.keepalive_interval_ms,
            prog: ProgCounter::new(),
            recovery: RecoveryBean::new(),
            recovery_disabled: false,
            retry_delay: DelayCounter::new(env.options.retry_delay_ms),
            polling_interval_ms: env.options.polling_interval_ms,
            slowing: SlowingHandler::new(),
            pending: PendingRequests::default(),
        });

        let mut protocol = Protocol::new(env, id, transport.is_ws(), inherited.prog);
        if let Some(session_id) = &inherited.session_id {
            protocol.resume(
                session_id,
                inherited.control_link.as_deref(),
                inherited.request_limit,
            );
        }

        Self {
            id,
            transport,
            phase: Phase::Off,
            phase_count: Arc::new(AtomicU64::new(0)),
            session_id: inherited.session_id,
            control_link: inherited.control_link,
            request_limit: inherited.request_limit,
            keepalive_ms: inherited.keepalive_ms,
            bind_count: 0,
            recovery: inherited.recovery,
            recovery_disabled: inherited.recovery_disabled,
            retry_delay: inherited.retry_delay,
            polling_interval_ms: inherited.polling_interval_ms,
            slowing: inherited.slowing,
            protocol,
            deferred: Vec::new(),
            inherited_pending: Some(inherited.pending),
            switch_target: None,
            sleep_recover: false,
            sleep_cause: String::new(),
            last_bind_sent: None,
            last_activity: None,
        }
    }

    /// Object id used to route timers
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn phase_count(&self) -> u64 {
        self.phase_count.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn keepalive_ms(&self) -> u64 {
        self.keepalive_ms
    }

    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval_ms
    }

    /// Number of binds accepted by the server
    pub fn bind_count(&self) -> u64 {
        self.bind_count
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Off | Phase::Sleep)
    }

    fn change_phase(&mut self, phase: Phase) {
        let count = self.phase_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            session = self.id,
            session_id = ?self.session_id,
            from = ?self.phase,
            to = ?phase,
            phase_count = count,
            "session phase"
        );
        self.phase = phase;
    }

    fn schedule(&self, env: &mut Environment, delay: Duration, timer: PhaseTimer) {
        env.schedule(
            delay,
            TimerTask {
                session: self.id,
                kind: TimerKind::Phase {
                    phase_count: self.phase_count(),
                    timer,
                },
            },
        );
    }

    /// Open a brand-new logical session
    pub fn start_create(&mut self, env: &mut Environment, cause: Option<String>, out: &mut Vec<SessionEvent>) {
        let old_session = self.session_id.take();
        self.control_link = None;
        self.request_limit = None;
        self.recovery = RecoveryBean::new();
        self.recovery_disabled = false;
        self.slowing.reset();
        drop(self.protocol.take_prog());
        self.adopt_deferred();

        self.change_phase(Phase::Creating);
        out.push(SessionEvent::Status(ClientStatus::Connecting));
        let request = ClientRequest::CreateSession {
            adapter_set: env.details.adapter_set.clone(),
            user: env.details.user.clone(),
            password: env.details.password.clone(),
            requested_max_bandwidth: env.options.requested_max_bandwidth,
            old_session,
            stream: StreamParams {
                send_sync: env.options.send_sync,
                cause,
                ..StreamParams::immediate_poll()
            },
        };
        self.protocol.send_create(env, request);
        self.schedule(env, self.retry_delay.current(), PhaseTimer::CreateTimeout);
    }

    /// Resume the logical session after an interruption
    pub fn start_recovery(&mut self, env: &mut Environment, out: &mut Vec<SessionEvent>) {
        let Some(session_id) = self.session_id.clone() else {
            tracing::error!(session = self.id, "recovery without a session");
            self.start_create(env, Some("recovery.error".into()), out);
            return;
        };
        let pending = self.inherited_pending.take().unwrap_or_default();
        self.deferred.extend(pending.unsent);
        let mut events = Vec::new();
        self.protocol.restore_pending(
            env,
            PendingRequests {
                unsent: Vec::new(),
                awaiting: pending.awaiting,
            },
            &mut events,
        );

        self.change_phase(Phase::Creating);
        out.push(SessionEvent::Status(ClientStatus::TryingRecovery));
        if let Some(metrics) = &env.metrics {
            metrics.record_recovery();
        }
        let recovery_from = self.protocol.prog().delivered();
        tracing::info!(session_id = %session_id, recovery_from, "recovering session");
        self.protocol.send_create(
            env,
            ClientRequest::RecoverSession {
                session_id,
                recovery_from,
                stream: StreamParams {
                    send_sync: env.options.send_sync,
                    ..StreamParams::immediate_poll()
                },
            },
        );
        self.schedule(env, self.retry_delay.current(), PhaseTimer::CreateTimeout);
        self.handle(env, events, out);
    }

    /// Bind an existing session on this session's transport
    pub fn start_bind(&mut self, env: &mut Environment, out: &mut Vec<SessionEvent>) {
        if self.session_id.is_none() {
            tracing::error!(session = self.id, "bind without a session");
            self.start_create(env, None, out);
            return;
        }
        let pending = self.inherited_pending.take().unwrap_or_default();
        let mut events = Vec::new();
        self.protocol.restore_pending(env, pending, &mut events);
        self.change_phase(Phase::FirstPause);
        self.bind(env, out);
        self.handle(env, events, out);
    }

    /// Requests inherited by a create wait for the new session like the
    /// requests added while creating
    fn adopt_deferred(&mut self) {
        if let Some(pending) = self.inherited_pending.take() {
            self.deferred.extend(pending.awaiting);
            self.deferred.extend(pending.unsent);
        }
    }

    fn stream_params(&self, env: &Environment) -> StreamParams {
        let polling = self.transport.is_polling();
        StreamParams {
            polling,
            polling_ms: self.polling_interval_ms,
            idle_ms: env.options.idle_timeout_ms,
            keepalive_ms: env.options.keepalive_interval_ms,
            content_length: (!self.transport.is_ws() && !polling)
                .then_some(env.options.content_length),
            send_sync: env.options.send_sync,
            cause: None,
        }
    }

    fn bind(&mut self, env: &mut Environment, out: &mut Vec<SessionEvent>) {
        let Some(session_id) = self.session_id.clone() else {
            self.fail_stop(env, "bind without a session", out);
            return;
        };
        let first = self.phase == Phase::FirstPause;
        let request = ClientRequest::BindSession {
            session_id,
            stream: self.stream_params(env),
        };
        if !self.protocol.send_bind(env, request) {
            tracing::warn!(session = self.id, "WebSocket broken before bind");
            if first {
                self.stream_sense(env, true, out);
            } else {
                self.on_lost(env, "WebSocket broken".into(), out);
            }
            return;
        }

        self.last_bind_sent = Some(env.now());
        if first {
            self.change_phase(Phase::FirstBinding);
            if !self.transport.is_polling() {
                out.push(SessionEvent::Status(ClientStatus::StreamSensing));
            }
        } else {
            self.change_phase(Phase::Binding);
        }

        let timeout = match (self.transport.is_polling(), first) {
            (false, true) => (env.options.switch_check_timeout(), PhaseTimer::FirstBindTimeout),
            (false, false) => (
                Duration::from_millis(self.keepalive_ms) + env.options.reconnect_timeout(),
                PhaseTimer::BindTimeout,
            ),
            (true, _) => (
                Duration::from_millis(env.options.idle_timeout_ms) + env.options.reconnect_timeout(),
                PhaseTimer::BindTimeout,
            ),
        };
        self.schedule(env, timeout.0, timeout.1);
    }

    /// Queue a control request
    pub fn add_request(&mut self, env: &mut Environment, objects: RequestObjects, out: &mut Vec<SessionEvent>) {
        if matches!(self.phase, Phase::Off | Phase::Creating | Phase::Sleep) {
            tracing::trace!(request = objects.request.name(), "request deferred");
            self.deferred.push(objects);
            return;
        }
        let mut events = Vec::new();
        self.protocol.add_request(env, objects, &mut events);
        self.handle(env, events, out);
    }

    pub fn set_reverse_heartbeat_interval(&mut self, env: &mut Environment, interval_ms: u64) {
        self.protocol.set_reverse_heartbeat_interval(env, interval_ms);
    }

    /// Move to `target` at the first opportunity
    pub fn switch_to(&mut self, env: &mut Environment, target: Transport, cause: &str, out: &mut Vec<SessionEvent>) {
        if target == self.transport && self.switch_target.is_none() {
            return;
        }
        tracing::info!(session = self.id, from = ?self.transport, to = ?target, cause, "switch requested");
        match self.phase {
            Phase::FirstPause | Phase::Pause => self.switch_ready(env, target, out),
            Phase::Creating | Phase::Created => {
                self.switch_target = Some(target);
                out.push(SessionEvent::Switching { target });
            }
            Phase::FirstBinding | Phase::Binding | Phase::Receiving | Phase::Stalling | Phase::Stalled => {
                let pending = self.switch_target.replace(target).is_some();
                out.push(SessionEvent::Switching { target });
                if pending {
                    return;
                }
                let request = ClientRequest::ForceRebind {
                    req_id: env.next_req_id(),
                    cause: Some(cause.to_string()),
                    polling_ms: target.is_polling().then_some(self.polling_interval_ms),
                };
                let tutor = ForceRebindTutor::shared(
                    self.phase_count(),
                    self.phase_count.clone(),
                    env.options.force_bind_timeout(),
                );
                let mut events = Vec::new();
                self.protocol
                    .add_request(env, RequestObjects::new(request, tutor), &mut events);
                let timeout = env.options.switch_check_timeout();
                self.schedule(env, timeout, PhaseTimer::SwitchTimeout);
                self.handle(env, events, out);
            }
            Phase::Off | Phase::Sleep => {
                tracing::debug!(phase = ?self.phase, "switch ignored while inactive");
            }
        }
    }

    /// Route a transport event
    pub fn on_transport(&mut self, env: &mut Environment, event: &TransportEvent, out: &mut Vec<SessionEvent>) {
        let mut events = Vec::new();
        self.protocol.on_transport(env, event, &mut events);
        self.handle(env, events, out);
    }

    /// A timer of this session fired
    pub fn on_timer(&mut self, env: &mut Environment, kind: TimerKind, out: &mut Vec<SessionEvent>) {
        let mut events = Vec::new();
        match kind {
            TimerKind::Heartbeat { phase } => self.protocol.on_heartbeat(env, phase, &mut events),
            TimerKind::Retransmit { key } => self.protocol.on_retransmit(env, key, &mut events),
            TimerKind::Phase {
                timer: PhaseTimer::SwitchTimeout,
                ..
            } => self.on_switch_timeout(env, out),
            TimerKind::Phase { phase_count, timer } => {
                if phase_count != self.phase_count() {
                    tracing::trace!(?timer, phase_count, "stale timer");
                    return;
                }
                self.on_phase_timer(env, timer, out);
            }
        }
        self.handle(env, events, out);
    }

    fn on_phase_timer(&mut self, env: &mut Environment, timer: PhaseTimer, out: &mut Vec<SessionEvent>) {
        match (timer, self.phase) {
            (PhaseTimer::CreateTimeout, Phase::Creating) => {
                tracing::info!(session = self.id, "create request timed out");
                self.on_lost(env, "create timeout".into(), out);
            }
            (PhaseTimer::FirstBindTimeout, Phase::FirstBinding) => {
                tracing::info!(session = self.id, transport = ?self.transport, "stream not established in time");
                self.stream_sense(env, false, out);
            }
            (PhaseTimer::BindTimeout, Phase::Binding | Phase::FirstBinding) => {
                self.on_lost(env, "bind timeout".into(), out);
            }
            (PhaseTimer::Pause, Phase::Pause | Phase::FirstPause) => self.bind(env, out),
            (PhaseTimer::Sleep, Phase::Sleep) => self.end_sleep(out),
            (PhaseTimer::Keepalive, Phase::Receiving) => {
                let now = env.now();
                let keepalive = Duration::from_millis(self.keepalive_ms);
                let idle = self
                    .last_activity
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(keepalive);
                if idle < keepalive {
                    self.schedule(env, keepalive - idle, PhaseTimer::Keepalive);
                } else {
                    self.change_phase(Phase::Stalling);
                    let timeout = env.options.stalled_timeout();
                    self.schedule(env, timeout, PhaseTimer::Keepalive);
                }
            }
            (PhaseTimer::Keepalive, Phase::Stalling) => {
                self.change_phase(Phase::Stalled);
                out.push(SessionEvent::Status(ClientStatus::Stalled));
                let timeout = env.options.reconnect_timeout();
                self.schedule(env, timeout, PhaseTimer::Keepalive);
            }
            (PhaseTimer::Keepalive, Phase::Stalled) => self.on_lost(env, "stalled".into(), out),
            (timer, phase) => tracing::trace!(?timer, ?phase, "timer not applicable"),
        }
    }

    fn on_switch_timeout(&mut self, env: &mut Environment, out: &mut Vec<SessionEvent>) {
        if !self.is_active() {
            return;
        }
        let Some(target) = self.switch_target.take() else {
            return;
        };
        tracing::warn!(session = self.id, to = ?target, "force rebind not honoured; creating a new session");
        self.protocol.close(env);
        let inherited = self.take_inherited();
        self.change_phase(Phase::Off);
        out.push(SessionEvent::Retry {
            inherited,
            target: Some(target),
            cause: "switch.timeout".into(),
        });
    }

    fn handle(&mut self, env: &mut Environment, events: Vec<ProtocolEvent>, out: &mut Vec<SessionEvent>) {
        for event in events {
            if self.phase == Phase::Off {
                tracing::trace!(?event, "event after session end");
                continue;
            }
            match event {
                ProtocolEvent::ConOk {
                    session_id,
                    request_limit,
                    keepalive_ms,
                    ..
                } => self.on_conok(env, session_id, request_limit, keepalive_ms, out),
                ProtocolEvent::Loop { pause_ms } => self.on_loop(env, pause_ms, out),
                ProtocolEvent::ServerError { code, message, conerr } => {
                    self.on_server_error(env, code, message, conerr, out);
                }
                ProtocolEvent::ProtocolError { code, message } => {
                    if let Some(metrics) = &env.metrics {
                        metrics.record_server_error(code);
                    }
                    if self.session_id.is_some() {
                        tracing::warn!(code, message = %message, "protocol error; new session");
                        self.retry_after(env, Duration::ZERO, format!("protocol.error {code}"), out);
                    } else {
                        self.protocol.close(env);
                        self.change_phase(Phase::Off);
                        out.push(SessionEvent::ServerError { code, message });
                    }
                }
                ProtocolEvent::Interrupted { ws_error, cause } => {
                    if ws_error && self.phase == Phase::FirstBinding {
                        self.stream_sense(env, true, out);
                    } else if matches!(self.phase, Phase::Sleep) {
                        tracing::trace!(cause = %cause, "interruption while sleeping");
                    } else {
                        self.on_lost(env, cause, out);
                    }
                }
                ProtocolEvent::ProgMismatch => {
                    self.recovery_disabled = true;
                    self.on_activity(env, out);
                    out.push(SessionEvent::Protocol(ProtocolEvent::ProgMismatch));
                }
                ProtocolEvent::Sync { seconds } => {
                    self.on_activity(env, out);
                    let slow = env.options.slowing_enabled
                        && !self.transport.is_polling()
                        && self.phase == Phase::Receiving
                        && self.slowing.on_sync(seconds, env.now());
                    if slow {
                        let target = self.transport.to_polling();
                        self.switch_to(env, target, "slow", out);
                    }
                }
                ProtocolEvent::ControlResponse { .. } => out.push(SessionEvent::Protocol(event)),
                other => {
                    self.on_activity(env, out);
                    out.push(SessionEvent::Protocol(other));
                }
            }
        }
    }

    fn on_activity(&mut self, env: &mut Environment, out: &mut Vec<SessionEvent>) {
        self.last_activity = Some(env.now());
        if matches!(self.phase, Phase::Stalling | Phase::Stalled) {
            let was_stalled = self.phase == Phase::Stalled;
            self.change_phase(Phase::Receiving);
            if was_stalled {
                out.push(SessionEvent::Status(ClientStatus::Connected(self.transport)));
            }
            self.schedule_keepalive(env);
        }
    }

    fn schedule_keepalive(&mut self, env: &mut Environment) {
        if self.keepalive_ms > 0 && !self.transport.is_polling() {
            self.schedule(env, Duration::from_millis(self.keepalive_ms), PhaseTimer::Keepalive);
        }
    }

    fn on_conok(
        &mut self,
        env: &mut Environment,
        session_id: String,
        request_limit: u64,
        keepalive_ms: u64,
        out: &mut Vec<SessionEvent>,
    ) {
        self.session_id = Some(session_id.clone());
        self.request_limit = Some(request_limit);
        self.keepalive_ms = keepalive_ms;
        self.control_link = self.protocol.control_link().map(str::to_string);

        match self.phase {
            Phase::Creating => {
                let recovered = self.recovery.is_recovery();
                if recovered {
                    self.recovery.restore_time_left();
                } else if let Some(metrics) = &env.metrics {
                    metrics.record_session_created(self.transport.status_token());
                }
                self.retry_delay.reset();
                self.change_phase(Phase::Created);
                tracing::info!(session_id = %session_id, recovered, keepalive_ms, "session started");
                out.push(SessionEvent::Started { session_id, recovered });

                let mut events = Vec::new();
                for objects in std::mem::take(&mut self.deferred) {
                    self.protocol.add_request(env, objects, &mut events);
                }
                self.handle(env, events, out);
            }
            Phase::FirstBinding | Phase::Binding => {
                self.bind_count += 1;
                self.change_phase(Phase::Receiving);
                self.last_activity = Some(env.now());
                out.push(SessionEvent::Status(ClientStatus::Connected(self.transport)));
                out.push(SessionEvent::Bound {
                    transport: self.transport,
                });
                self.schedule_keepalive(env);
            }
            phase => self.fail_stop(env, &format!("CONOK while {phase:?}"), out),
        }
    }

    fn on_loop(&mut self, env: &mut Environment, pause_ms: u64, out: &mut Vec<SessionEvent>) {
        if let Some(target) = self.switch_target.take() {
            if target != self.transport {
                self.switch_ready(env, target, out);
                return;
            }
        }
        match self.phase {
            Phase::Created => {
                self.change_phase(Phase::FirstPause);
                self.pause(env, Duration::from_millis(pause_ms), out);
            }
            Phase::FirstBinding | Phase::Binding | Phase::Receiving | Phase::Stalling | Phase::Stalled => {
                self.change_phase(Phase::Pause);
                let delay = if self.transport.is_polling() {
                    if pause_ms < self.polling_interval_ms {
                        tracing::debug!(pause_ms, "polling interval lowered by the server");
                        self.polling_interval_ms = pause_ms;
                    }
                    let elapsed = self
                        .last_bind_sent
                        .map(|sent| env.now().saturating_duration_since(sent))
                        .unwrap_or_default();
                    Duration::from_millis(self.polling_interval_ms).saturating_sub(elapsed)
                } else {
                    Duration::ZERO
                };
                self.pause(env, delay, out);
            }
            phase => self.fail_stop(env, &format!("LOOP while {phase:?}"), out),
        }
    }

    fn pause(&mut self, env: &mut Environment, delay: Duration, out: &mut Vec<SessionEvent>) {
        if delay.is_zero() {
            self.bind(env, out);
        } else {
            self.schedule(env, delay, PhaseTimer::Pause);
        }
    }

    fn on_server_error(
        &mut self,
        env: &mut Environment,
        code: i32,
        message: String,
        conerr: bool,
        out: &mut Vec<SessionEvent>,
    ) {
        if let Some(metrics) = &env.metrics {
            metrics.record_server_error(code);
        }
        match ServerErrorKind::classify(code, env.options.handle_server_busy) {
            ServerErrorKind::Takeover
            | ServerErrorKind::Expiry
            | ServerErrorKind::RecoveryError
            | ServerErrorKind::SyncError => {
                tracing::info!(code, message = %message, conerr, "session dropped by the server");
                self.retry_after(env, Duration::ZERO, format!("server.error {code}"), out);
            }
            ServerErrorKind::ServerBusy => {
                tracing::info!(code, "server busy; retrying");
                self.retry_after(env, Duration::ZERO, "server.busy".into(), out);
            }
            ServerErrorKind::Fatal => {
                tracing::error!(code, message = %message, conerr, "session closed by the server");
                self.protocol.close(env);
                self.change_phase(Phase::Off);
                out.push(SessionEvent::ServerError { code, message });
            }
        }
    }

    /// The connection was lost; recover or start over
    fn on_lost(&mut self, env: &mut Environment, cause: String, out: &mut Vec<SessionEvent>) {
        let now = env.now();
        let max_ms = env.options.session_recovery_timeout_ms;
        let time_left = self.recovery.time_left_ms(max_ms, now);
        let can_recover = self.session_id.is_some()
            && !self.recovery_disabled
            && !self.protocol.prog().is_mismatched()
            && max_ms > 0;

        if can_recover && time_left > 0 {
            let pause = if self.recovery.is_recovery() {
                self.retry_delay
                    .current()
                    .min(Duration::from_millis(time_left as u64))
            } else {
                jittered_pause(Duration::from_millis(env.options.first_retry_max_delay_ms))
            };
            tracing::info!(session = self.id, cause = %cause, time_left, ?pause, "connection lost; will recover");
            self.recovery = self.recovery.next(true, now);
            out.push(SessionEvent::Status(ClientStatus::TryingRecovery));
            self.sleep(env, true, pause, cause, out);
        } else {
            let pause = self.retry_delay.current();
            self.retry_delay.increase();
            tracing::info!(session = self.id, cause = %cause, time_left, ?pause, "connection lost; will retry");
            self.recovery = self.recovery.next(false, now);
            out.push(SessionEvent::Status(ClientStatus::WillRetry));
            self.sleep(env, false, pause, cause, out);
        }
    }

    fn retry_after(&mut self, env: &mut Environment, pause: Duration, cause: String, out: &mut Vec<SessionEvent>) {
        self.recovery = RecoveryBean::new();
        out.push(SessionEvent::Status(ClientStatus::WillRetry));
        self.sleep(env, false, pause, cause, out);
    }

    fn sleep(&mut self, env: &mut Environment, recover: bool, pause: Duration, cause: String, out: &mut Vec<SessionEvent>) {
        self.protocol.close(env);
        self.change_phase(Phase::Sleep);
        self.sleep_recover = recover;
        self.sleep_cause = cause;
        if pause.is_zero() {
            self.end_sleep(out);
        } else {
            self.schedule(env, pause, PhaseTimer::Sleep);
        }
    }

    fn end_sleep(&mut self, out: &mut Vec<SessionEvent>) {
        let inherited = self.take_inherited();
        self.change_phase(Phase::Off);
        if self.sleep_recover {
            out.push(SessionEvent::Recover { inherited });
        } else {
            out.push(SessionEvent::Retry {
                inherited,
                target: None,
                cause: std::mem::take(&mut self.sleep_cause),
            });
        }
    }

    fn stream_sense(&mut self, env: &mut Environment, ws_failed: bool, out: &mut Vec<SessionEvent>) {
        self.protocol.close(env);
        let inherited = self.take_inherited();
        self.change_phase(Phase::Off);
        out.push(SessionEvent::StreamSense { inherited, ws_failed });
    }

    fn switch_ready(&mut self, env: &mut Environment, target: Transport, out: &mut Vec<SessionEvent>) {
        tracing::info!(session = self.id, to = ?target, "switching transport");
        self.switch_target = None;
        self.protocol.close(env);
        let inherited = self.take_inherited();
        self.change_phase(Phase::Off);
        out.push(SessionEvent::SwitchReady { inherited, target });
    }

    /// Unexpected state: stop rather than guess
    fn fail_stop(&mut self, env: &mut Environment, reason: &str, out: &mut Vec<SessionEvent>) {
        tracing::error!(session = self.id, phase = ?self.phase, reason, "illegal session state");
        self.retry_after(env, self.retry_delay.current(), reason.to_string(), out);
    }

    fn take_inherited(&mut self) -> Inherited {
        let mut pending = self.protocol.take_pending();
        if let Some(earlier) = self.inherited_pending.take() {
            pending.awaiting.extend(earlier.awaiting);
            pending.unsent.extend(earlier.unsent);
        }
        pending.unsent.append(&mut self.deferred);
        Inherited {
            session_id: self.session_id.clone(),
            control_link: self.control_link.clone(),
            request_limit: self.request_limit,
            keepalive_ms: self.keepalive_ms,
            prog: self.protocol.take_prog(),
            recovery: self.recovery,
            recovery_disabled: self.recovery_disabled,
            retry_delay: self.retry_delay.clone(),
            polling_interval_ms: self.polling_interval_ms,
            slowing: self.slowing.clone(),
            pending,
        }
    }

    /// Close the session, destroying it on the server if `destroy`
    pub fn close(&mut self, env: &mut Environment, destroy: bool) {
        if destroy && self.is_active() {
            if let Some(session_id) = self.session_id.clone() {
                let request = ClientRequest::Destroy {
                    req_id: env.next_req_id(),
                    session_id,
                    cause: Some("api".into()),
                    close_socket: true,
                };
                let objects = RequestObjects::new(request, VoidTutor::shared())
                    .with_server(self.protocol.target_server());
                let mut events = Vec::new();
                self.protocol.send_destroy(env, objects, &mut events);
            }
        }
        for objects in self.deferred.drain(..) {
            objects.tutor.notify_abort();
        }
        self.protocol.close(env);
        self.change_phase(Phase::Off);
    }
}
