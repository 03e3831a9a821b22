//! Control request delivery over WebSocket
//!
//! The socket carrying the session stream also carries control requests, one
//! frame at a time: a request is *ongoing* from the moment it is handed to
//! the transport until the transport confirms it was written. Requests that
//! expect an answer are then parked in a map keyed by `LS_reqId`, because
//! their `REQOK`/`REQERR` arrives interleaved with the data on the stream.
//!
//! # Socket state
//!
//! ```text
//! NotConnected ──connect──▶ Connecting ──Open──▶ Connected
//!                                │                   │
//!                                └──Broken / Closed──┴──▶ Broken
//! ```
//!
//! A bind request goes ahead of queued control requests. Once the socket is
//! broken a bind is discarded (the session falls back to HTTP), while
//! control requests stay queued for whoever takes them over.

use crate::batch::{RequestObjects, RequestQueues};
use crate::environment::Environment;
use crate::request_manager::{ManagerEvent, RequestManager};
use crate::transport::{ConnId, TransportEvent, TransportEventKind};
use std::collections::HashMap;
use tlcp_core::ClientRequest;

/// Socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    NotConnected,
    Connecting,
    Connected,
    Broken,
}

#[derive(Debug)]
enum Ongoing {
    /// The `wsok` greeting
    Greeting,
    Request(RequestObjects),
}

/// WebSocket control request manager
#[derive(Debug)]
pub struct WsRequestManager {
    state: WsState,
    url: String,
    conn: Option<ConnId>,
    queues: RequestQueues,
    pending_bind: Option<RequestObjects>,
    ongoing: Option<Ongoing>,
    pending: HashMap<u64, RequestObjects>,
    session_id: Option<String>,
    default_session: Option<String>,
}

impl WsRequestManager {
    /// Manager for a socket to `url`, not opened yet
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            state: WsState::NotConnected,
            url: url.into(),
            conn: None,
            queues: RequestQueues::new(),
            pending_bind: None,
            ongoing: None,
            pending: HashMap::new(),
            session_id: None,
            default_session: None,
        }
    }

    /// Change the address; only effective before the socket is opened
    pub fn set_url(&mut self, url: impl Into<String>) {
        if self.state == WsState::NotConnected {
            self.url = url.into();
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Number of requests waiting for `REQOK`/`REQERR`
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open the socket if nobody did yet
    pub fn open(&mut self, env: &mut Environment) -> Option<ConnId> {
        if self.state == WsState::NotConnected {
            let conn = env.next_conn();
            tracing::debug!(conn, url = %self.url, "opening WebSocket");
            env.ws.connect(conn, self.url.clone());
            self.conn = Some(conn);
            self.state = WsState::Connecting;
        }
        self.conn
    }

    /// Send a bind request ahead of queued requests
    ///
    /// Returns `false`, discarding the request, if the socket is broken.
    pub fn send_bind(&mut self, env: &mut Environment, objects: RequestObjects) -> bool {
        if self.state == WsState::Broken {
            tracing::debug!("WebSocket broken, bind discarded");
            return false;
        }
        self.pending_bind = Some(objects);
        self.open(env);
        self.flush(env);
        true
    }

    /// Handle an event on the socket
    ///
    /// Returns `false` if `event` belongs to another connection. Messages are
    /// left to the protocol.
    pub fn on_transport(
        &mut self,
        env: &mut Environment,
        event: &TransportEvent,
        events: &mut Vec<ManagerEvent>,
    ) -> bool {
        if self.conn != Some(event.conn) {
            return false;
        }
        match &event.kind {
            TransportEventKind::Open => {
                self.state = WsState::Connected;
                env.ws.send(event.conn, "wsok".to_string());
                self.ongoing = Some(Ongoing::Greeting);
            }
            TransportEventKind::Written => self.on_written(env, events),
            TransportEventKind::Closed | TransportEventKind::Broken(_) => {
                tracing::debug!(conn = event.conn, event = ?event.kind, "WebSocket gone");
                self.state = WsState::Broken;
            }
            TransportEventKind::Message(_) => {}
        }
        true
    }

    fn on_written(&mut self, env: &mut Environment, events: &mut Vec<ManagerEvent>) {
        match self.ongoing.take() {
            Some(Ongoing::Request(objects)) => {
                objects.tutor.notify_sent();
                match &objects.request {
                    ClientRequest::BindSession { session_id, .. }
                    | ClientRequest::RecoverSession { session_id, .. } => {
                        self.default_session = Some(session_id.clone());
                    }
                    request => {
                        if let Some(req_id) = request.req_id() {
                            self.pending.insert(req_id, objects.clone());
                        }
                    }
                }
                events.push(ManagerEvent::Sent(objects));
            }
            Some(Ongoing::Greeting) => {}
            None => tracing::warn!("write confirmation with nothing ongoing"),
        }
        self.flush(env);
    }

    fn flush(&mut self, env: &mut Environment) {
        if self.state != WsState::Connected || self.ongoing.is_some() {
            return;
        }
        let Some(conn) = self.conn else {
            return;
        };

        let next = match self.pending_bind.take() {
            Some(bind) => Some(bind),
            None => loop {
                match self.queues.shift() {
                    Some(objects) if !objects.tutor.should_be_sent() => {
                        tracing::debug!(request = objects.request.name(), "request no longer needed");
                        if !objects.tutor.is_aborted() {
                            objects.tutor.notify_abort();
                        }
                    }
                    other => break other,
                }
            },
        };
        let Some(objects) = next else {
            return;
        };

        let params = objects
            .request
            .encode_transport_aware(self.session_id.as_deref(), self.default_session.as_deref());
        tracing::trace!(conn, request = objects.request.name(), "writing frame");
        env.ws.send(conn, objects.request.ws_frame(&params));
        self.ongoing = Some(Ongoing::Request(objects));
    }

    /// `REQOK,<reqId>` read from the stream
    pub fn on_req_ok(&mut self, req_id: u64, events: &mut Vec<ManagerEvent>) {
        match self.pending.remove(&req_id) {
            Some(objects) => {
                let mut dispatched = Vec::new();
                objects.listener.on_ok(objects.tutor.as_ref(), &mut dispatched);
                events.extend(dispatched.into_iter().map(ManagerEvent::Response));
            }
            None => tracing::warn!(req_id, "REQOK for unknown request discarded"),
        }
    }

    /// `REQERR,<reqId>,<code>,<message>` read from the stream
    pub fn on_req_err(
        &mut self,
        req_id: u64,
        code: i32,
        message: String,
        events: &mut Vec<ManagerEvent>,
    ) {
        match self.pending.remove(&req_id) {
            Some(objects) => {
                let mut dispatched = Vec::new();
                objects
                    .listener
                    .on_error(objects.tutor.as_ref(), code, message, &mut dispatched);
                events.extend(dispatched.into_iter().map(ManagerEvent::Response));
            }
            None => tracing::warn!(req_id, code, "REQERR for unknown request discarded"),
        }
    }
}

impl RequestManager for WsRequestManager {
    fn add(&mut self, env: &mut Environment, objects: RequestObjects, events: &mut Vec<ManagerEvent>) {
        self.queues.add(objects);
        self.flush(env);
    }

    /// Requests are never batched on a socket
    fn set_request_limit(&mut self, _limit: u64) {}

    fn take_unsent(&mut self) -> Vec<RequestObjects> {
        let mut unsent = Vec::new();
        if let Some(Ongoing::Request(objects)) = self.ongoing.take() {
            if !objects.request.is_session_request() {
                unsent.push(objects);
            }
        }
        unsent.extend(self.queues.drain());
        unsent
    }

    fn close(&mut self, env: &mut Environment) {
        // Released even when broken
        if let Some(conn) = self.conn {
            env.ws.close(conn);
        }
        self.state = WsState::Broken;
        self.pending_bind = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::tests::recording_env;
    use crate::listener::{ControlKind, ControlOutcome};
    use crate::protocol::ProtocolEvent;
    use crate::tutor::{ControlTutor, VoidTutor};
    use tlcp_core::StreamParams;

    fn bind() -> RequestObjects {
        RequestObjects::new(
            ClientRequest::BindSession {
                session_id: "S1".into(),
                stream: StreamParams {
                    polling: false,
                    polling_ms: 0,
                    idle_ms: 0,
                    keepalive_ms: 0,
                    content_length: None,
                    send_sync: true,
                    cause: None,
                },
            },
            VoidTutor::shared(),
        )
    }

    fn unsubscribe(req_id: u64) -> RequestObjects {
        RequestObjects::new(
            ClientRequest::Unsubscribe { req_id, sub_id: 3 },
            ControlTutor::shared(),
        )
    }

    fn event(conn: ConnId, kind: TransportEventKind) -> TransportEvent {
        TransportEvent::new(conn, kind)
    }

    fn connected() -> (WsRequestManager, Environment, crate::environment::tests::Recorded, ConnId) {
        let (mut env, recorded) = recording_env();
        let mut manager = WsRequestManager::new("ws://h/lightstreamer");
        manager.set_session("S1");
        let mut events = Vec::new();
        assert!(manager.send_bind(&mut env, bind()));
        let conn = manager.conn().unwrap();
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Open), &mut events);
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Written), &mut events);
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Written), &mut events);
        (manager, env, recorded, conn)
    }

    #[test]
    fn test_greeting_then_bind_first() {
        let (mut env, recorded) = recording_env();
        let mut manager = WsRequestManager::new("ws://h/lightstreamer");
        let mut events = Vec::new();
        manager.add(&mut env, unsubscribe(1), &mut events);
        manager.send_bind(&mut env, bind());
        let conn = recorded.ws_connects()[0].0;

        manager.on_transport(&mut env, &event(conn, TransportEventKind::Open), &mut events);
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Written), &mut events);

        let frames: Vec<String> = recorded.ws_frames().into_iter().map(|(_, f)| f).collect();
        assert_eq!(frames[0], "wsok");
        assert!(frames[1].starts_with("bind_session\r\nLS_session=S1"));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_session_omitted_after_bind() {
        let (mut manager, mut env, recorded, _) = connected();
        let mut events = Vec::new();
        manager.add(&mut env, unsubscribe(7), &mut events);
        let frames = recorded.ws_frames();
        assert_eq!(frames.last().unwrap().1, "control\r\nLS_reqId=7&LS_op=delete&LS_subId=3");
    }

    #[test]
    fn test_response_routed_once() {
        let (mut manager, mut env, _, conn) = connected();
        let mut events = Vec::new();
        manager.add(&mut env, unsubscribe(7), &mut events);
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Written), &mut events);
        assert_eq!(manager.pending_count(), 1);

        let mut events = Vec::new();
        manager.on_req_ok(7, &mut events);
        assert!(matches!(
            events.as_slice(),
            [ManagerEvent::Response(ProtocolEvent::ControlResponse {
                kind: ControlKind::Unsubscribe { sub_id: 3 },
                outcome: ControlOutcome::Ok,
            })]
        ));

        let mut again = Vec::new();
        manager.on_req_ok(7, &mut again);
        manager.on_req_err(7, 19, "late".into(), &mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn test_one_frame_at_a_time() {
        let (mut manager, mut env, recorded, conn) = connected();
        let mut events = Vec::new();
        let before = recorded.ws_frames().len();
        manager.add(&mut env, unsubscribe(1), &mut events);
        manager.add(&mut env, unsubscribe(2), &mut events);
        assert_eq!(recorded.ws_frames().len(), before + 1);
        manager.on_transport(&mut env, &event(conn, TransportEventKind::Written), &mut events);
        assert_eq!(recorded.ws_frames().len(), before + 2);
    }

    #[test]
    fn test_broken_socket_discards_bind_keeps_requests() {
        let (mut manager, mut env, _, conn) = connected();
        let mut events = Vec::new();
        manager.on_transport(
            &mut env,
            &event(conn, TransportEventKind::Broken("reset".into())),
            &mut events,
        );
        assert_eq!(manager.state(), WsState::Broken);
        assert!(!manager.send_bind(&mut env, bind()));

        manager.add(&mut env, unsubscribe(4), &mut events);
        let unsent = manager.take_unsent();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].request.req_id(), Some(4));
    }

    #[test]
    fn test_broken_socket_released_on_close() {
        let (mut manager, mut env, recorded, conn) = connected();
        let mut events = Vec::new();
        manager.on_transport(
            &mut env,
            &event(conn, TransportEventKind::Broken("reset".into())),
            &mut events,
        );
        manager.close(&mut env);
        assert_eq!(recorded.ws_closed(), vec![conn]);
    }
}
