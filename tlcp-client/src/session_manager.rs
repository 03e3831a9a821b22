//! Session manager
//!
//! Owns the current [`Session`] and replaces it whenever the session asks
//! for a successor: stream-sense fallback, transport switch, retry with a
//! fresh session or recovery. The manager also turns session output into
//! [`ClientEvent`]s and builds the control requests issued by the
//! application.
//!
//! # Transport selection
//!
//! Without a forced transport the first candidate is WebSocket streaming,
//! or HTTP streaming while WebSocket is disabled. Stream-sense then walks
//! `WS-STREAMING → HTTP-STREAMING → HTTP-POLLING`, never leaving what the
//! forced transport pins. Falling back from WebSocket to HTTP disables
//! WebSocket for this client until the server reports a different client IP.

use crate::batch::RequestObjects;
use crate::environment::Environment;
use crate::listener::{ControlKind, ControlOutcome};
use crate::notification::{ClientEvent, MessageOutcome};
use crate::protocol::ProtocolEvent;
use crate::scheduler::TimerTask;
use crate::session::{Inherited, Session, SessionEvent};
use crate::transport::TransportEvent;
use crate::tutor::{BandwidthTracker, ConstrainTutor, ControlTutor, MpnTutor, RequestTutor};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tlcp_core::{
    Bandwidth, ClientRequest, ClientStatus, ForcedTransport, Frequency, MessageParams,
    SubscriptionParams, Transport, UNORDERED_MESSAGES,
};

/// State of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Off,
    Active { transport: Transport, switching: bool },
    /// Closed by a fatal server error
    End,
}

/// Message to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub text: String,
    /// `None` for unordered messages
    pub sequence: Option<String>,
    pub max_wait_ms: Option<u64>,
    /// Report MSGDONE/MSGFAIL
    pub outcome: bool,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sequence: None,
            max_wait_ms: None,
            outcome: true,
        }
    }

    pub fn in_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }
}

pub struct SessionManager {
    status: ManagerStatus,
    session: Option<Session>,
    client_status: ClientStatus,
    bandwidth: Arc<BandwidthTracker>,
    message_progs: HashMap<String, u64>,
    buffered: Vec<RequestObjects>,
    last_client_ip: Option<String>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            status: ManagerStatus::Off,
            session: None,
            client_status: ClientStatus::Disconnected,
            bandwidth: Arc::new(BandwidthTracker::new()),
            message_progs: HashMap::new(),
            buffered: Vec::new(),
            last_client_ip: None,
        }
    }

    pub fn status(&self) -> ManagerStatus {
        self.status
    }

    pub fn client_status(&self) -> ClientStatus {
        self.client_status
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// First transport to try
    pub fn select_transport(env: &Environment) -> Transport {
        let forced = env.options.forced_transport;
        let ws = forced
            .and_then(|f| f.ws())
            .unwrap_or_else(|| !env.is_ws_disabled());
        let polling = forced.and_then(|f| f.polling()).unwrap_or(false);
        Transport::new(ws, polling)
    }

    /// Next transport after `current` failed to establish
    pub fn sense_fallback(current: Transport, forced: Option<ForcedTransport>) -> Transport {
        let forced_ws = forced.and_then(|f| f.ws());
        let forced_polling = forced.and_then(|f| f.polling());
        if current.is_ws() && forced_ws != Some(true) {
            Transport::new(false, current.is_polling())
        } else if !current.is_polling() && forced_polling != Some(false) {
            current.to_polling()
        } else {
            current
        }
    }

    /// Start connecting unless already connected
    pub fn connect(&mut self, env: &mut Environment, out: &mut Vec<ClientEvent>) {
        if matches!(self.status, ManagerStatus::Active { .. }) {
            tracing::debug!("connect ignored: already active");
            return;
        }
        let transport = Self::select_transport(env);
        tracing::info!(server = %env.details.server_address, ?transport, "connecting");
        let mut session = Session::new(env, transport, None);
        let buffered = std::mem::take(&mut self.buffered);
        self.restart_message_progs(buffered.iter());
        let mut events = Vec::new();
        session.start_create(env, None, &mut events);
        for objects in buffered {
            session.add_request(env, objects, &mut events);
        }
        self.status = ManagerStatus::Active {
            transport,
            switching: false,
        };
        self.session = Some(session);
        self.handle(env, events, out);
    }

    /// Close the session and destroy it on the server
    pub fn disconnect(&mut self, env: &mut Environment, out: &mut Vec<ClientEvent>) {
        let Some(mut session) = self.session.take() else {
            self.status = ManagerStatus::Off;
            return;
        };
        tracing::info!(session_id = ?session.session_id(), "disconnecting");
        session.close(env, true);
        self.status = ManagerStatus::Off;
        self.message_progs.clear();
        out.push(ClientEvent::SessionClosed);
        self.set_status(env, ClientStatus::Disconnected, out);
    }

    fn add_request(&mut self, env: &mut Environment, objects: RequestObjects, out: &mut Vec<ClientEvent>) {
        let Some(session) = &mut self.session else {
            tracing::debug!(request = objects.request.name(), "not connected; request buffered");
            self.buffered.push(objects);
            return;
        };
        let mut events = Vec::new();
        session.add_request(env, objects, &mut events);
        self.handle(env, events, out);
    }

    fn control(&mut self, env: &mut Environment, request: ClientRequest, tutor: Arc<dyn RequestTutor>, out: &mut Vec<ClientEvent>) {
        self.add_request(env, RequestObjects::new(request, tutor), out);
    }

    pub fn subscribe(&mut self, env: &mut Environment, sub_id: u32, params: SubscriptionParams, out: &mut Vec<ClientEvent>) {
        let req_id = env.next_req_id();
        let request = ClientRequest::Subscribe { req_id, sub_id, params };
        self.control(env, request, ControlTutor::shared(), out);
    }

    pub fn unsubscribe(&mut self, env: &mut Environment, sub_id: u32, out: &mut Vec<ClientEvent>) {
        let req_id = env.next_req_id();
        self.control(env, ClientRequest::Unsubscribe { req_id, sub_id }, ControlTutor::shared(), out);
    }

    pub fn reconfigure(&mut self, env: &mut Environment, sub_id: u32, max_frequency: Frequency, out: &mut Vec<ClientEvent>) {
        let req_id = env.next_req_id();
        let request = ClientRequest::Reconfigure {
            req_id,
            sub_id,
            max_frequency,
        };
        self.control(env, request, ControlTutor::shared(), out);
    }

    /// Send a message; returns its progressive within the sequence
    pub fn send_message(&mut self, env: &mut Environment, message: OutgoingMessage, out: &mut Vec<ClientEvent>) -> u64 {
        let sequence = message
            .sequence
            .unwrap_or_else(|| UNORDERED_MESSAGES.to_string());
        let prog = self.message_progs.entry(sequence.clone()).or_insert(0);
        *prog += 1;
        let prog = *prog;
        let req_id = env.next_req_id();
        let request = ClientRequest::Message {
            req_id,
            message: MessageParams {
                text: message.text,
                sequence,
                prog,
                max_wait_ms: message.max_wait_ms,
                outcome: message.outcome,
            },
        };
        self.control(env, request, ControlTutor::shared(), out);
        prog
    }

    pub fn set_requested_max_bandwidth(&mut self, env: &mut Environment, bandwidth: Bandwidth, out: &mut Vec<ClientEvent>) {
        env.options.requested_max_bandwidth = bandwidth;
        if self.session.is_none() {
            return;
        }
        let req_id = env.next_req_id();
        let tutor = ConstrainTutor::shared(req_id, Arc::clone(&self.bandwidth));
        self.control(env, ClientRequest::Constrain { req_id, bandwidth }, tutor, out);
    }

    /// Change the forced transport, switching the live session if needed
    pub fn set_forced_transport(&mut self, env: &mut Environment, forced: Option<ForcedTransport>, out: &mut Vec<ClientEvent>) {
        env.options.forced_transport = forced;
        let target = Self::select_transport(env);
        let Some(session) = &mut self.session else {
            return;
        };
        if session.transport() == target {
            return;
        }
        let mut events = Vec::new();
        session.switch_to(env, target, "api", &mut events);
        self.handle(env, events, out);
    }

    pub fn set_reverse_heartbeat_interval(&mut self, env: &mut Environment, interval_ms: u64) {
        env.options.reverse_heartbeat_interval_ms = interval_ms;
        if let Some(session) = &mut self.session {
            session.set_reverse_heartbeat_interval(env, interval_ms);
        }
    }

    /// Issue an MPN operation; returns its request id
    pub fn mpn(&mut self, env: &mut Environment, op: String, params: Vec<(String, String)>, out: &mut Vec<ClientEvent>) -> u64 {
        let req_id = env.next_req_id();
        let tutor = MpnTutor::shared(env.options.retry_delay());
        self.control(env, ClientRequest::Mpn { req_id, op, params }, tutor, out);
        req_id
    }

    pub fn on_transport(&mut self, env: &mut Environment, event: &TransportEvent, out: &mut Vec<ClientEvent>) {
        let Some(session) = &mut self.session else {
            tracing::trace!(conn = event.conn, "transport event without a session");
            return;
        };
        let mut events = Vec::new();
        session.on_transport(env, event, &mut events);
        self.handle(env, events, out);
    }

    pub fn on_timer(&mut self, env: &mut Environment, task: TimerTask, out: &mut Vec<ClientEvent>) {
        let Some(session) = &mut self.session else {
            return;
        };
        if session.id() != task.session {
            tracing::trace!(session = task.session, "timer of a replaced session");
            return;
        }
        let mut events = Vec::new();
        session.on_timer(env, task.kind, &mut events);
        self.handle(env, events, out);
    }

    fn set_status(&mut self, env: &Environment, status: ClientStatus, out: &mut Vec<ClientEvent>) {
        if self.client_status == status {
            return;
        }
        tracing::info!(from = self.client_status.as_str(), to = status.as_str(), "client status");
        self.client_status = status;
        if let Some(metrics) = &env.metrics {
            metrics.record_status(status);
        }
        out.push(ClientEvent::StatusChanged(status));
    }

    /// Restart numbering for a fresh session, except in sequences whose
    /// messages are carried over with the progs they were given
    fn restart_message_progs<'a>(&mut self, carried: impl Iterator<Item = &'a RequestObjects>) {
        let live: HashSet<&str> = carried
            .filter_map(|objects| match &objects.request {
                ClientRequest::Message { message, .. } => Some(message.sequence.as_str()),
                _ => None,
            })
            .collect();
        self.message_progs
            .retain(|sequence, _| live.contains(sequence.as_str()));
    }

    /// Replace the session with one on `transport` continuing `inherited`
    fn replace(&mut self, env: &mut Environment, transport: Transport, inherited: Inherited) -> Session {
        self.status = ManagerStatus::Active {
            transport,
            switching: false,
        };
        Session::new(env, transport, Some(inherited))
    }

    fn handle(&mut self, env: &mut Environment, events: Vec<SessionEvent>, out: &mut Vec<ClientEvent>) {
        let mut queue = std::collections::VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            let mut follow_up = Vec::new();
            match event {
                SessionEvent::Status(status) => self.set_status(env, status, out),
                SessionEvent::Started { session_id, recovered } => {
                    out.push(ClientEvent::SessionStarted { session_id, recovered });
                }
                SessionEvent::Bound { transport } => out.push(ClientEvent::SessionBound { transport }),
                SessionEvent::Switching { target } => {
                    if let ManagerStatus::Active { transport, .. } = self.status {
                        tracing::debug!(from = ?transport, to = ?target, "switch pending");
                        self.status = ManagerStatus::Active {
                            transport,
                            switching: true,
                        };
                    }
                }
                SessionEvent::StreamSense { inherited, ws_failed } => {
                    let Some(current) = self.session.as_ref().map(Session::transport) else {
                        continue;
                    };
                    let next = Self::sense_fallback(current, env.options.forced_transport);
                    if current.is_ws() && !next.is_ws() {
                        tracing::warn!(ws_failed, "WebSocket unusable; disabled until the network changes");
                        env.disable_ws(self.last_client_ip.clone());
                    }
                    tracing::info!(from = ?current, to = ?next, "stream-sense");
                    let mut session = self.replace(env, next, inherited);
                    session.start_bind(env, &mut follow_up);
                    self.session = Some(session);
                }
                SessionEvent::SwitchReady { inherited, target } => {
                    let mut session = self.replace(env, target, inherited);
                    session.start_bind(env, &mut follow_up);
                    self.session = Some(session);
                }
                SessionEvent::Retry {
                    inherited,
                    target,
                    cause,
                } => {
                    let transport = target.unwrap_or_else(|| Self::select_transport(env));
                    self.restart_message_progs(inherited.pending.unsent.iter().chain(&inherited.pending.awaiting));
                    let mut session = self.replace(env, transport, inherited);
                    session.start_create(env, Some(cause), &mut follow_up);
                    self.session = Some(session);
                }
                SessionEvent::Recover { inherited } => {
                    let transport = self
                        .session
                        .as_ref()
                        .map(Session::transport)
                        .unwrap_or_else(|| Self::select_transport(env));
                    let mut session = self.replace(env, transport, inherited);
                    session.start_recovery(env, &mut follow_up);
                    self.session = Some(session);
                }
                SessionEvent::ServerError { code, message } => {
                    self.status = ManagerStatus::End;
                    self.session = None;
                    out.push(ClientEvent::ServerError { code, message });
                    out.push(ClientEvent::SessionClosed);
                    self.set_status(env, ClientStatus::Disconnected, out);
                }
                SessionEvent::Protocol(event) => self.on_protocol(env, event, out),
            }
            queue.extend(follow_up);
        }
    }

    fn on_protocol(&mut self, env: &mut Environment, event: ProtocolEvent, out: &mut Vec<ClientEvent>) {
        match event {
            ProtocolEvent::Data(message) => {
                if let Some(event) = ClientEvent::from_data(message) {
                    if matches!(event, ClientEvent::Update { .. }) {
                        if let Some(metrics) = &env.metrics {
                            metrics.record_update();
                        }
                    }
                    out.push(event);
                }
            }
            ProtocolEvent::Cons(bandwidth) => out.push(ClientEvent::Bandwidth(bandwidth)),
            ProtocolEvent::ServName(name) => out.push(ClientEvent::ServerName(name)),
            ProtocolEvent::ClientIp(ip) => {
                env.on_client_ip(&ip);
                self.last_client_ip = Some(ip.clone());
                out.push(ClientEvent::ClientIp(ip));
            }
            ProtocolEvent::ControlResponse { kind, outcome } => self.on_control_response(kind, outcome, out),
            ProtocolEvent::ProgMismatch => {
                tracing::warn!("prog mismatch; this session can no longer be recovered");
            }
            other => tracing::trace!(event = ?other, "protocol event not forwarded"),
        }
    }

    fn on_control_response(&mut self, kind: ControlKind, outcome: ControlOutcome, out: &mut Vec<ClientEvent>) {
        match (kind, outcome) {
            (ControlKind::Message { sequence, prog }, ControlOutcome::Ok) => out.push(ClientEvent::Message {
                sequence,
                prog,
                outcome: MessageOutcome::Ack,
            }),
            (ControlKind::Message { sequence, prog }, ControlOutcome::Error { code, message }) => {
                out.push(ClientEvent::Message {
                    sequence,
                    prog,
                    outcome: MessageOutcome::from_error(code, message),
                });
            }
            (ControlKind::Subscribe { sub_id }, ControlOutcome::Error { code, message }) => {
                out.push(ClientEvent::SubscriptionError { sub_id, code, message });
            }
            (ControlKind::Mpn { req_id, op }, outcome) => out.push(ClientEvent::MpnResponse { req_id, op, outcome }),
            (kind @ (ControlKind::Unsubscribe { .. } | ControlKind::Reconfigure { .. }), ControlOutcome::Error { code, message }) => {
                out.push(ClientEvent::ControlError { kind, code, message });
            }
            (kind, ControlOutcome::Error { code, message }) => {
                tracing::debug!(?kind, code, message = %message, "control request refused");
            }
            (kind, ControlOutcome::Ok) => tracing::trace!(?kind, "control request accepted"),
        }
    }

    /// Stop everything without contacting the server
    pub fn shutdown(&mut self, env: &mut Environment) {
        if let Some(mut session) = self.session.take() {
            session.close(env, false);
        }
        self.status = ManagerStatus::Off;
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::tests::{recording_env, recording_env_with};
    use crate::options::ConnectionOptions;

    #[test]
    fn test_initial_transport() {
        let (mut env, _) = recording_env();
        assert_eq!(SessionManager::select_transport(&env), Transport::WsStreaming);
        env.disable_ws(None);
        assert_eq!(SessionManager::select_transport(&env), Transport::HttpStreaming);

        let (env, _) = recording_env_with(ConnectionOptions {
            forced_transport: Some(ForcedTransport::Exact(Transport::HttpPolling)),
            ..ConnectionOptions::default()
        });
        assert_eq!(SessionManager::select_transport(&env), Transport::HttpPolling);
    }

    #[test]
    fn test_sense_fallback_chain() {
        assert_eq!(
            SessionManager::sense_fallback(Transport::WsStreaming, None),
            Transport::HttpStreaming
        );
        assert_eq!(
            SessionManager::sense_fallback(Transport::HttpStreaming, None),
            Transport::HttpPolling
        );
        assert_eq!(
            SessionManager::sense_fallback(Transport::WsStreaming, Some(ForcedTransport::Ws)),
            Transport::WsPolling
        );
        assert_eq!(
            SessionManager::sense_fallback(
                Transport::HttpStreaming,
                Some(ForcedTransport::Exact(Transport::HttpStreaming))
            ),
            Transport::HttpStreaming
        );
    }

    #[test]
    fn test_requests_buffered_before_connect() {
        let (mut env, recorded) = recording_env_with(ConnectionOptions {
            forced_transport: Some(ForcedTransport::Http),
            ..ConnectionOptions::default()
        });
        let mut manager = SessionManager::new();
        let mut out = Vec::new();
        manager.unsubscribe(&mut env, 4, &mut out);
        assert!(recorded.http_requests().is_empty());

        manager.connect(&mut env, &mut out);
        assert_eq!(manager.client_status(), ClientStatus::Connecting);
        assert_eq!(out, vec![ClientEvent::StatusChanged(ClientStatus::Connecting)]);
        assert_eq!(recorded.http_requests().len(), 1);
    }

    #[test]
    fn test_message_progs_per_sequence() {
        let (mut env, _) = recording_env();
        let mut manager = SessionManager::new();
        let mut out = Vec::new();
        assert_eq!(manager.send_message(&mut env, OutgoingMessage::new("a"), &mut out), 1);
        assert_eq!(manager.send_message(&mut env, OutgoingMessage::new("b"), &mut out), 2);
        assert_eq!(
            manager.send_message(&mut env, OutgoingMessage::new("c").in_sequence("orders"), &mut out),
            1
        );
    }

    #[test]
    fn test_message_error_mapping() {
        let mut manager = SessionManager::new();
        let mut out = Vec::new();
        manager.on_control_response(
            ControlKind::Message {
                sequence: "s".into(),
                prog: 2,
            },
            ControlOutcome::Error {
                code: 39,
                message: "gone".into(),
            },
            &mut out,
        );
        assert_eq!(
            out,
            vec![ClientEvent::Message {
                sequence: "s".into(),
                prog: 2,
                outcome: MessageOutcome::Discarded,
            }]
        );
    }
}
