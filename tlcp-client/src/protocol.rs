//! TLCP stream protocol
//!
//! [`Protocol`] owns the physical side of one session object: the stream
//! connection, the control request managers, the prog counter, the reverse
//! heartbeat timer and the retransmission bookkeeping. The session drives it
//! with create, recovery and bind requests and receives [`ProtocolEvent`]s
//! in return.
//!
//! # Stream status
//!
//! ```text
//! NoStream ──send──▶ OpeningStream ──CONOK──▶ ReadingStream ──LOOP──▶ NoStream
//!                          │                        │
//!                          └──CONERR / END / error──┴──▶ StreamClosed
//! ```
//!
//! While opening, only `CONOK`, `CONERR`, `END`, `REQOK`, `REQERR` and
//! `ERROR` are legal; anything else, or a line that does not parse, is a
//! protocol error (code 61) that closes the stream. Once closed, every line
//! is ignored.
//!
//! # Transports
//!
//! Create and recovery requests always travel as HTTP polls. Binds and
//! control requests use the session's transport: a WebSocket session opens
//! its socket on the first bind and multiplexes control traffic on it.
//!
//! # Retransmission
//!
//! Every control request the managers report as sent is remembered together
//! with a [`TimerKind::Retransmit`] timer set to its tutor's timeout. When
//! the timer fires the request is dropped if its tutor was aborted or is
//! satisfied, and queued again otherwise.

use crate::batch::RequestObjects;
use crate::environment::Environment;
use crate::heartbeat::ReverseHeartbeatTimer;
use crate::http_manager::HttpRequestManager;
use crate::listener::{ControlKind, ControlOutcome};
use crate::request_manager::{ManagerEvent, RequestManager};
use crate::scheduler::{TimerKind, TimerTask};
use crate::transport::{ConnId, HttpRequest, TransportEvent, TransportEventKind};
use crate::tutor::VoidTutor;
use crate::ws_manager::WsRequestManager;
use std::collections::BTreeMap;
use tlcp_core::request::{http_url, ws_url};
use tlcp_core::{
    parse_line, remap_error_code, Bandwidth, ClientRequest, ProgCheck, ProgCounter, ServerMessage,
    Delivery, PROTOCOL_ERROR_CODE,
};

/// State of the stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    NoStream,
    OpeningStream,
    ReadingStream,
    StreamClosed,
}

/// What the protocol reports to its session
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// The stream was accepted
    ConOk {
        session_id: String,
        request_limit: u64,
        keepalive_ms: u64,
        control_link: Option<String>,
    },
    /// The stream ended normally; rebind after `pause_ms`
    Loop { pause_ms: u64 },
    /// `CONERR`, `END`, `ERROR` or a session-level control error
    ServerError {
        code: i32,
        message: String,
        /// Raised by `CONERR`: the server refused the session outright
        conerr: bool,
    },
    /// The client could not make sense of the server (code 61)
    ProtocolError { code: i32, message: String },
    /// The stream connection failed or closed unexpectedly
    Interrupted {
        /// The WebSocket failed before the stream was established
        ws_error: bool,
        cause: String,
    },
    /// A fresh countable notification
    Data(ServerMessage),
    /// `PROG` disagrees with the local count
    ProgMismatch,
    Sync { seconds: u64 },
    Cons(Bandwidth),
    ServName(String),
    ClientIp(String),
    /// `PROBE` or `NOOP`
    Keepalive,
    ControlResponse {
        kind: ControlKind,
        outcome: ControlOutcome,
    },
}

/// Requests handed over to the session that supersedes this one
#[derive(Debug, Default)]
pub struct PendingRequests {
    /// Never written
    pub unsent: Vec<RequestObjects>,
    /// Written, still waiting for their tutor's verdict
    pub awaiting: Vec<RequestObjects>,
}

impl PendingRequests {
    pub fn is_empty(&self) -> bool {
        self.unsent.is_empty() && self.awaiting.is_empty()
    }
}

/// Address requests go to after `CONOK` named a control link
///
/// The link may omit the scheme, in which case the server address's is used.
pub fn control_link_address(server_address: &str, link: &str) -> String {
    if link.contains("://") {
        return link.to_string();
    }
    let scheme = server_address
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or("http");
    format!("{scheme}://{link}")
}

pub struct Protocol {
    session: u64,
    status: StreamStatus,
    stream_conn: Option<ConnId>,
    http: HttpRequestManager,
    ws: Option<WsRequestManager>,
    prog: ProgCounter,
    recovering: bool,
    heartbeat: ReverseHeartbeatTimer,
    retransmissions: BTreeMap<u64, RequestObjects>,
    next_key: u64,
    server_address: String,
    control_link: Option<String>,
    ignore_control_link: bool,
    session_id: Option<String>,
}

impl Protocol {
    /// Protocol of session object `session`
    pub fn new(env: &Environment, session: u64, is_ws: bool, prog: ProgCounter) -> Self {
        let server_address = env.details.server_address.clone();
        Self {
            session,
            status: StreamStatus::NoStream,
            stream_conn: None,
            http: HttpRequestManager::new(server_address.clone()),
            ws: is_ws.then(|| WsRequestManager::new(ws_url(&server_address))),
            prog,
            recovering: false,
            heartbeat: ReverseHeartbeatTimer::new(
                session,
                env.options.reverse_heartbeat_interval_ms,
            ),
            retransmissions: BTreeMap::new(),
            next_key: 0,
            server_address,
            control_link: None,
            ignore_control_link: env.options.server_instance_address_ignored,
            session_id: None,
        }
    }

    /// Continue a logical session established by an earlier protocol
    pub fn resume(
        &mut self,
        session_id: &str,
        control_link: Option<&str>,
        request_limit: Option<u64>,
    ) {
        self.set_session(session_id);
        if let Some(link) = control_link {
            self.set_control_link(link);
        }
        if let Some(limit) = request_limit {
            self.http.set_request_limit(limit);
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn is_ws(&self) -> bool {
        self.ws.is_some()
    }

    pub fn prog(&self) -> &ProgCounter {
        &self.prog
    }

    /// Hand the prog counter over to a successor
    pub fn take_prog(&mut self) -> ProgCounter {
        std::mem::take(&mut self.prog)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn control_link(&self) -> Option<&str> {
        self.control_link.as_deref()
    }

    /// Number of sent requests whose retransmission is still possible
    pub fn awaiting_count(&self) -> usize {
        self.retransmissions.len()
    }

    /// Server the session lives on
    pub fn target_server(&self) -> String {
        match &self.control_link {
            Some(link) if !self.ignore_control_link => link.clone(),
            _ => self.server_address.clone(),
        }
    }

    fn set_session(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
        self.http.set_session(session_id);
        if let Some(ws) = &mut self.ws {
            ws.set_session(session_id);
        }
    }

    fn set_control_link(&mut self, link: &str) {
        self.control_link = Some(control_link_address(&self.server_address, link));
        let target = self.target_server();
        self.http.set_control_link(target.clone());
        if let Some(ws) = &mut self.ws {
            ws.set_url(ws_url(&target));
        }
    }

    /// Send a create or recovery request as an HTTP poll
    pub fn send_create(&mut self, env: &mut Environment, request: ClientRequest) {
        self.recovering = matches!(request, ClientRequest::RecoverSession { .. });
        let server = if self.recovering {
            self.target_server()
        } else {
            self.server_address.clone()
        };
        let conn = env.next_conn();
        tracing::debug!(
            conn,
            session = self.session,
            recovery = self.recovering,
            server = %server,
            "sending {}",
            request.name()
        );
        env.http.send(
            conn,
            HttpRequest {
                url: http_url(&server, request.name()),
                body: request.encode_transport_unaware(None),
            },
        );
        self.stream_conn = Some(conn);
        self.status = StreamStatus::OpeningStream;
    }

    /// Send a bind request on the session's transport
    ///
    /// Returns `false` if the WebSocket is broken and the bind was dropped.
    pub fn send_bind(&mut self, env: &mut Environment, request: ClientRequest) -> bool {
        let conn = match &mut self.ws {
            Some(ws) => {
                if !ws.send_bind(env, RequestObjects::new(request, VoidTutor::shared())) {
                    return false;
                }
                ws.conn()
            }
            None => {
                let conn = env.next_conn();
                env.http.send(
                    conn,
                    HttpRequest {
                        url: http_url(&self.target_server(), request.name()),
                        body: request.encode_transport_unaware(None),
                    },
                );
                Some(conn)
            }
        };
        tracing::debug!(conn = ?conn, session = self.session, "bind sent");
        self.stream_conn = conn;
        self.status = StreamStatus::OpeningStream;
        self.heartbeat.on_bind_sent(env);
        true
    }

    /// Queue a control request on the session's transport
    pub fn add_request(
        &mut self,
        env: &mut Environment,
        objects: RequestObjects,
        out: &mut Vec<ProtocolEvent>,
    ) {
        let mut events = Vec::new();
        self.control_manager().add(env, objects, &mut events);
        self.process(env, events, out);
    }

    /// Queue a destroy request; it always travels over HTTP so closing the
    /// socket cannot lose it
    pub fn send_destroy(
        &mut self,
        env: &mut Environment,
        objects: RequestObjects,
        out: &mut Vec<ProtocolEvent>,
    ) {
        let mut events = Vec::new();
        self.http.add(env, objects, &mut events);
        self.process(env, events, out);
    }

    fn control_manager(&mut self) -> &mut dyn RequestManager {
        match &mut self.ws {
            Some(ws) => ws,
            None => &mut self.http,
        }
    }

    pub fn set_reverse_heartbeat_interval(&mut self, env: &mut Environment, interval_ms: u64) {
        self.heartbeat.set_user_interval(env, interval_ms);
    }

    /// Route a transport event
    pub fn on_transport(
        &mut self,
        env: &mut Environment,
        event: &TransportEvent,
        out: &mut Vec<ProtocolEvent>,
    ) {
        let is_stream = self.stream_conn == Some(event.conn);
        let ws_conn = self.ws.as_ref().and_then(WsRequestManager::conn);
        let mut events = Vec::new();

        let handled = match &mut self.ws {
            Some(ws) => ws.on_transport(env, event, &mut events),
            None => false,
        };
        if !handled && !is_stream {
            self.http.on_transport(env, event, &mut events);
        }
        self.process(env, events, out);

        if !is_stream {
            return;
        }
        match &event.kind {
            TransportEventKind::Message(line) => self.on_stream_line(env, line, out),
            TransportEventKind::Closed => {
                self.on_stream_end(false, "stream closed".to_string(), out);
            }
            TransportEventKind::Broken(reason) => {
                let ws_error = ws_conn == Some(event.conn);
                self.on_stream_end(ws_error, reason.clone(), out);
            }
            TransportEventKind::Open | TransportEventKind::Written => {}
        }
    }

    fn on_stream_end(&mut self, ws_error: bool, cause: String, out: &mut Vec<ProtocolEvent>) {
        let opening = self.status == StreamStatus::OpeningStream;
        match self.status {
            StreamStatus::OpeningStream | StreamStatus::ReadingStream => {
                tracing::info!(session = self.session, status = ?self.status, cause = %cause, "stream interrupted");
                self.status = StreamStatus::StreamClosed;
                out.push(ProtocolEvent::Interrupted {
                    ws_error: ws_error && opening,
                    cause,
                });
            }
            StreamStatus::NoStream | StreamStatus::StreamClosed => {}
        }
    }

    fn on_stream_line(&mut self, env: &mut Environment, line: &str, out: &mut Vec<ProtocolEvent>) {
        if self.status == StreamStatus::StreamClosed {
            tracing::trace!(line, "stream closed, line ignored");
            return;
        }

        let message = match parse_line(line) {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(session = self.session, error = %err, "unparsable server line");
                self.fail(env, PROTOCOL_ERROR_CODE, err.to_string(), out);
                return;
            }
        };

        match self.status {
            StreamStatus::NoStream => {
                // The socket stays open between WebSocket polls
                if matches!(
                    message,
                    ServerMessage::ReqOk { .. }
                        | ServerMessage::ReqErr { .. }
                        | ServerMessage::WsOk
                        | ServerMessage::Probe
                        | ServerMessage::Noop
                ) {
                    self.dispatch(env, message, out);
                } else {
                    tracing::debug!(tag = message.tag(), "line between streams ignored");
                }
            }
            StreamStatus::OpeningStream => match message {
                ServerMessage::ConOk { .. }
                | ServerMessage::ConErr { .. }
                | ServerMessage::End { .. }
                | ServerMessage::ReqOk { .. }
                | ServerMessage::ReqErr { .. }
                | ServerMessage::Error { .. }
                | ServerMessage::WsOk => self.dispatch(env, message, out),
                other => {
                    let reason = format!("unexpected {} while opening the stream", other.tag());
                    self.fail(env, PROTOCOL_ERROR_CODE, reason, out);
                }
            },
            StreamStatus::ReadingStream => {
                if matches!(message, ServerMessage::ConOk { .. }) {
                    self.fail(env, PROTOCOL_ERROR_CODE, "unexpected CONOK".to_string(), out);
                } else {
                    self.dispatch(env, message, out);
                }
            }
            StreamStatus::StreamClosed => {}
        }
    }

    fn dispatch(&mut self, env: &mut Environment, message: ServerMessage, out: &mut Vec<ProtocolEvent>) {
        match message {
            ServerMessage::ConOk {
                session_id,
                request_limit,
                keepalive_ms,
                control_link,
            } => {
                self.status = StreamStatus::ReadingStream;
                self.set_session(&session_id);
                self.http.set_request_limit(request_limit);
                if let Some(link) = &control_link {
                    self.set_control_link(link);
                }
                if self.ws.is_some() {
                    self.heartbeat.set_max_interval(env, keepalive_ms);
                }
                out.push(ProtocolEvent::ConOk {
                    session_id,
                    request_limit,
                    keepalive_ms,
                    control_link,
                });
            }
            ServerMessage::ConErr { code, message } => {
                self.close_stream(env);
                out.push(ProtocolEvent::ServerError {
                    code,
                    message,
                    conerr: true,
                });
            }
            ServerMessage::End { code, message } | ServerMessage::Error { code, message } => {
                self.close_stream(env);
                out.push(ProtocolEvent::ServerError {
                    code,
                    message,
                    conerr: false,
                });
            }
            ServerMessage::Loop { pause_ms } => {
                self.status = StreamStatus::NoStream;
                out.push(ProtocolEvent::Loop { pause_ms });
            }
            ServerMessage::ReqOk { req_id } => {
                let (Some(req_id), Some(ws)) = (req_id, &mut self.ws) else {
                    tracing::trace!(req_id = ?req_id, "REQOK on stream ignored");
                    return;
                };
                let mut events = Vec::new();
                ws.on_req_ok(req_id, &mut events);
                self.process(env, events, out);
            }
            ServerMessage::ReqErr {
                req_id,
                code,
                message,
            } => {
                let Some(ws) = &mut self.ws else {
                    tracing::warn!(req_id, code, "REQERR on HTTP stream ignored");
                    return;
                };
                let mut events = Vec::new();
                ws.on_req_err(req_id, code, message, &mut events);
                self.process(env, events, out);
            }
            ServerMessage::Prog { prog } => {
                match self.prog.on_prog(prog, self.recovering) {
                    ProgCheck::InSync => {
                        tracing::debug!(prog, skip = self.prog.pending_skips(), "prog in sync");
                    }
                    ProgCheck::Mismatch => {
                        tracing::warn!(prog, delivered = self.prog.delivered(), "prog mismatch");
                        out.push(ProtocolEvent::ProgMismatch);
                    }
                    ProgCheck::AlreadyMismatched => {
                        tracing::debug!(prog, "prog mismatch again");
                    }
                }
                self.recovering = false;
            }
            ServerMessage::Sync { seconds } => out.push(ProtocolEvent::Sync { seconds }),
            ServerMessage::Cons { bandwidth } => out.push(ProtocolEvent::Cons(bandwidth)),
            ServerMessage::ServName { name } => out.push(ProtocolEvent::ServName(name)),
            ServerMessage::ClientIp { ip } => out.push(ProtocolEvent::ClientIp(ip)),
            ServerMessage::Probe | ServerMessage::Noop => out.push(ProtocolEvent::Keepalive),
            ServerMessage::WsOk => tracing::trace!("WSOK"),
            countable => match self.prog.on_countable() {
                Delivery::Deliver => out.push(ProtocolEvent::Data(countable)),
                Delivery::Skip => {
                    tracing::trace!(tag = countable.tag(), "replayed notification skipped");
                }
            },
        }
    }

    fn process(&mut self, env: &mut Environment, events: Vec<ManagerEvent>, out: &mut Vec<ProtocolEvent>) {
        for event in events {
            match event {
                ManagerEvent::Sent(objects) => {
                    self.heartbeat.on_control_sent(env.now());
                    if let Some(metrics) = &env.metrics {
                        metrics.record_control_sent(objects.request.name());
                    }
                    if !objects.tutor.verify_success() {
                        self.track(env, objects);
                    }
                }
                ManagerEvent::Response(ProtocolEvent::ControlResponse {
                    outcome: ControlOutcome::Error { code, message },
                    ..
                }) if code == 20 || code == 11 => {
                    tracing::warn!(code, message = %message, "control request hit a session error");
                    out.push(ProtocolEvent::ServerError {
                        code: remap_error_code(code),
                        message,
                        conerr: false,
                    });
                }
                ManagerEvent::Response(event) => out.push(event),
                ManagerEvent::Fatal { code, message } => self.fail(env, code, message, out),
            }
        }
    }

    fn fail(&mut self, env: &mut Environment, code: i32, message: String, out: &mut Vec<ProtocolEvent>) {
        self.close_stream(env);
        if code == PROTOCOL_ERROR_CODE {
            out.push(ProtocolEvent::ProtocolError { code, message });
        } else {
            out.push(ProtocolEvent::ServerError {
                code,
                message,
                conerr: false,
            });
        }
    }

    fn close_stream(&mut self, env: &mut Environment) {
        self.status = StreamStatus::StreamClosed;
        let Some(conn) = self.stream_conn.take() else {
            return;
        };
        match &mut self.ws {
            Some(ws) if ws.conn() == Some(conn) => ws.close(env),
            _ => env.http.close(conn),
        }
    }

    fn track(&mut self, env: &mut Environment, objects: RequestObjects) {
        self.next_key += 1;
        let key = self.next_key;
        env.schedule(
            objects.tutor.timeout(),
            TimerTask {
                session: self.session,
                kind: TimerKind::Retransmit { key },
            },
        );
        self.retransmissions.insert(key, objects);
    }

    /// A retransmission timer fired
    pub fn on_retransmit(&mut self, env: &mut Environment, key: u64, out: &mut Vec<ProtocolEvent>) {
        let Some(objects) = self.retransmissions.remove(&key) else {
            return;
        };
        if objects.tutor.is_aborted() || objects.tutor.verify_success() {
            return;
        }
        objects.tutor.on_retransmit();
        tracing::debug!(
            session = self.session,
            request = objects.request.name(),
            req_id = ?objects.request.req_id(),
            "retransmitting"
        );
        if let Some(metrics) = &env.metrics {
            metrics.record_retransmission(objects.request.name());
        }
        self.add_request(env, objects, out);
    }

    /// A reverse heartbeat check fired
    pub fn on_heartbeat(&mut self, env: &mut Environment, phase: u64, out: &mut Vec<ProtocolEvent>) {
        if self.heartbeat.on_timer(env, phase) {
            self.add_request(
                env,
                RequestObjects::new(ClientRequest::Heartbeat, VoidTutor::shared()),
                out,
            );
        }
    }

    /// Take every request a successor must deliver
    pub fn take_pending(&mut self) -> PendingRequests {
        let mut unsent = Vec::new();
        if let Some(ws) = &mut self.ws {
            unsent.extend(ws.take_unsent());
        }
        unsent.extend(self.http.take_unsent());
        let awaiting = std::mem::take(&mut self.retransmissions)
            .into_values()
            .collect();
        PendingRequests { unsent, awaiting }
    }

    /// Take over the requests of a predecessor
    pub fn restore_pending(
        &mut self,
        env: &mut Environment,
        pending: PendingRequests,
        out: &mut Vec<ProtocolEvent>,
    ) {
        for objects in pending.awaiting {
            self.track(env, objects);
        }
        for objects in pending.unsent {
            self.add_request(env, objects, out);
        }
    }

    /// Release every connection
    pub fn close(&mut self, env: &mut Environment) {
        self.heartbeat.stop();
        self.close_stream(env);
        if let Some(ws) = &mut self.ws {
            ws.close(env);
        }
        self.http.close(env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::tests::{recording_env, Recorded};
    use crate::tutor::ControlTutor;
    use tlcp_core::StreamParams;

    fn create() -> ClientRequest {
        ClientRequest::CreateSession {
            adapter_set: None,
            user: None,
            password: None,
            requested_max_bandwidth: Bandwidth::Unlimited,
            old_session: None,
            stream: StreamParams::immediate_poll(),
        }
    }

    fn feed(protocol: &mut Protocol, env: &mut Environment, conn: ConnId, lines: &[&str]) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        for line in lines {
            protocol.on_transport(
                env,
                &TransportEvent::new(conn, TransportEventKind::Message(line.to_string())),
                &mut out,
            );
        }
        out
    }

    fn created(is_ws: bool) -> (Protocol, Environment, Recorded, ConnId) {
        let (mut env, recorded) = recording_env();
        let mut protocol = Protocol::new(&env, 1, is_ws, ProgCounter::new());
        protocol.send_create(&mut env, create());
        let conn = recorded.http_requests()[0].0;
        (protocol, env, recorded, conn)
    }

    #[test]
    fn test_create_goes_over_http() {
        let (protocol, _, recorded, _) = created(true);
        let sent = recorded.http_requests();
        assert!(sent[0]
            .1
            .url
            .starts_with("http://push.example.com/lightstreamer/create_session.txt"));
        assert!(recorded.ws_connects().is_empty());
        assert_eq!(protocol.status(), StreamStatus::OpeningStream);
    }

    #[test]
    fn test_conok_then_loop() {
        let (mut protocol, mut env, _, conn) = created(false);
        let out = feed(
            &mut protocol,
            &mut env,
            conn,
            &["CONOK,S1,50000000,5000,*", "LOOP,0"],
        );
        assert_eq!(
            out,
            vec![
                ProtocolEvent::ConOk {
                    session_id: "S1".into(),
                    request_limit: 50_000_000,
                    keepalive_ms: 5000,
                    control_link: None,
                },
                ProtocolEvent::Loop { pause_ms: 0 },
            ]
        );
        assert_eq!(protocol.status(), StreamStatus::NoStream);
    }

    #[test]
    fn test_data_while_opening_is_a_protocol_error() {
        let (mut protocol, mut env, recorded, conn) = created(false);
        let out = feed(&mut protocol, &mut env, conn, &["U,1,1,a", "CONOK,S1,1,1,*"]);
        assert!(matches!(
            out.as_slice(),
            [ProtocolEvent::ProtocolError { code: 61, .. }]
        ));
        assert_eq!(protocol.status(), StreamStatus::StreamClosed);
        assert_eq!(recorded.http_closed(), vec![conn]);
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let (mut protocol, mut env, _, conn) = created(false);
        let out = feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "WHAT,1"]);
        assert!(matches!(out.last(), Some(ProtocolEvent::ProtocolError { code: 61, .. })));
    }

    #[test]
    fn test_garbage_between_streams_is_a_protocol_error() {
        let (mut protocol, mut env, _, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        assert_eq!(protocol.status(), StreamStatus::NoStream);

        let out = feed(&mut protocol, &mut env, conn, &["WHAT,1"]);
        assert!(matches!(
            out.as_slice(),
            [ProtocolEvent::ProtocolError { code: 61, .. }]
        ));
        assert_eq!(protocol.status(), StreamStatus::StreamClosed);
    }

    #[test]
    fn test_control_link_redirects_requests() {
        let (mut protocol, mut env, recorded, conn) = created(false);
        feed(
            &mut protocol,
            &mut env,
            conn,
            &["CONOK,S1,50000000,5000,node7.example.com", "LOOP,0"],
        );
        assert_eq!(protocol.target_server(), "http://node7.example.com");
        let mut out = Vec::new();
        protocol.add_request(
            &mut env,
            RequestObjects::new(
                ClientRequest::Unsubscribe { req_id: 1, sub_id: 1 },
                ControlTutor::shared(),
            ),
            &mut out,
        );
        let sent = recorded.http_requests();
        assert!(sent
            .last()
            .unwrap()
            .1
            .url
            .starts_with("http://node7.example.com/lightstreamer/control.txt"));
    }

    #[test]
    fn test_recovery_replay_is_skipped() {
        let (mut env, recorded) = recording_env();
        let mut prog = ProgCounter::new();
        for _ in 0..3 {
            prog.on_countable();
        }
        let mut protocol = Protocol::new(&env, 1, false, prog);
        protocol.resume("S1", None, None);
        protocol.send_create(
            &mut env,
            ClientRequest::RecoverSession {
                session_id: "S1".into(),
                recovery_from: 3,
                stream: StreamParams::immediate_poll(),
            },
        );
        let conn = recorded.http_requests()[0].0;
        let out = feed(
            &mut protocol,
            &mut env,
            conn,
            &["CONOK,S1,50000000,5000,*", "PROG,2", "U,1,1,old", "U,1,1,new"],
        );
        let data: Vec<_> = out
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::Data(_)))
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(protocol.prog().delivered(), 4);
    }

    #[test]
    fn test_prog_mismatch_reported() {
        let (mut protocol, mut env, _, conn) = created(false);
        let out = feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "PROG,5"]);
        assert_eq!(out.last(), Some(&ProtocolEvent::ProgMismatch));
    }

    #[test]
    fn test_unexpected_close_is_an_interruption() {
        let (mut protocol, mut env, _, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*"]);
        let mut out = Vec::new();
        protocol.on_transport(&mut env, &TransportEvent::new(conn, TransportEventKind::Closed), &mut out);
        assert!(matches!(
            out.as_slice(),
            [ProtocolEvent::Interrupted { ws_error: false, .. }]
        ));
    }

    #[test]
    fn test_close_after_loop_is_normal() {
        let (mut protocol, mut env, _, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        let mut out = Vec::new();
        protocol.on_transport(&mut env, &TransportEvent::new(conn, TransportEventKind::Closed), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retransmission_until_answered() {
        let (mut protocol, mut env, recorded, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        let mut out = Vec::new();
        let objects = RequestObjects::new(
            ClientRequest::Unsubscribe { req_id: 9, sub_id: 1 },
            ControlTutor::shared(),
        );
        let tutor = objects.tutor.clone();
        protocol.add_request(&mut env, objects, &mut out);
        assert_eq!(protocol.awaiting_count(), 1);

        let control_conn = recorded.http_requests().last().unwrap().0;
        protocol.on_transport(&mut env, &TransportEvent::new(control_conn, TransportEventKind::Closed), &mut out);

        let key = match recorded.timers().last().map(|(_, t)| t.kind) {
            Some(TimerKind::Retransmit { key }) => key,
            other => panic!("unexpected timer {other:?}"),
        };
        let before = recorded.http_requests().len();
        protocol.on_retransmit(&mut env, key, &mut out);
        assert_eq!(recorded.http_requests().len(), before + 1);
        assert_eq!(tutor.timeout().as_millis(), 8000);

        let control_conn = recorded.http_requests().last().unwrap().0;
        feed(&mut protocol, &mut env, control_conn, &["REQOK,9"]);
        protocol.on_transport(&mut env, &TransportEvent::new(control_conn, TransportEventKind::Closed), &mut out);
        let key = match recorded.timers().last().map(|(_, t)| t.kind) {
            Some(TimerKind::Retransmit { key }) => key,
            other => panic!("unexpected timer {other:?}"),
        };
        let before = recorded.http_requests().len();
        protocol.on_retransmit(&mut env, key, &mut out);
        assert_eq!(recorded.http_requests().len(), before);
    }

    #[test]
    fn test_sync_error_on_control_request() {
        let (mut protocol, mut env, recorded, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        let mut out = Vec::new();
        protocol.add_request(
            &mut env,
            RequestObjects::new(
                ClientRequest::Unsubscribe { req_id: 2, sub_id: 1 },
                ControlTutor::shared(),
            ),
            &mut out,
        );
        let control_conn = recorded.http_requests().last().unwrap().0;
        let mut out = feed(&mut protocol, &mut env, control_conn, &["REQERR,2,20,sync error"]);
        protocol.on_transport(&mut env, &TransportEvent::new(control_conn, TransportEventKind::Closed), &mut out);
        assert!(out
            .iter()
            .any(|e| matches!(e, ProtocolEvent::ServerError { code: 20, conerr: false, .. })));
    }

    #[test]
    fn test_ws_bind_and_responses_on_stream() {
        let (mut protocol, mut env, recorded, conn) = created(true);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        assert!(protocol.send_bind(
            &mut env,
            ClientRequest::BindSession {
                session_id: "S1".into(),
                stream: StreamParams::immediate_poll(),
            },
        ));
        let (ws, url) = recorded.ws_connects()[0].clone();
        assert_eq!(url, "ws://push.example.com/lightstreamer");

        let mut out = Vec::new();
        for kind in [TransportEventKind::Open, TransportEventKind::Written, TransportEventKind::Written] {
            protocol.on_transport(&mut env, &TransportEvent::new(ws, kind), &mut out);
        }
        protocol.add_request(
            &mut env,
            RequestObjects::new(
                ClientRequest::Unsubscribe { req_id: 5, sub_id: 2 },
                ControlTutor::shared(),
            ),
            &mut out,
        );
        protocol.on_transport(&mut env, &TransportEvent::new(ws, TransportEventKind::Written), &mut out);

        let out = feed(
            &mut protocol,
            &mut env,
            ws,
            &["WSOK", "CONOK,S1,50000000,5000,*", "REQOK,5"],
        );
        assert!(out.iter().any(|e| matches!(
            e,
            ProtocolEvent::ControlResponse {
                kind: ControlKind::Unsubscribe { sub_id: 2 },
                outcome: ControlOutcome::Ok
            }
        )));
    }

    #[test]
    fn test_pending_requests_move_to_successor() {
        let (mut protocol, mut env, recorded, conn) = created(false);
        feed(&mut protocol, &mut env, conn, &["CONOK,S1,50000000,5000,*", "LOOP,0"]);
        let mut out = Vec::new();
        for req_id in 1..=3 {
            protocol.add_request(
                &mut env,
                RequestObjects::new(
                    ClientRequest::Unsubscribe { req_id, sub_id: req_id as u32 },
                    ControlTutor::shared(),
                ),
                &mut out,
            );
        }
        let pending = protocol.take_pending();
        assert_eq!(pending.awaiting.len(), 1);
        assert_eq!(pending.unsent.len(), 2);

        let mut successor = Protocol::new(&env, 2, false, protocol.take_prog());
        successor.resume("S1", None, None);
        let before = recorded.http_requests().len();
        successor.restore_pending(&mut env, pending, &mut out);
        assert_eq!(recorded.http_requests().len(), before + 1);
        assert_eq!(successor.awaiting_count(), 2);
    }
}
