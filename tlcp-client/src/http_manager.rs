//! Control request delivery over HTTP
//!
//! At most one control connection is open at a time. Whenever the manager is
//! idle it picks the next non-empty queue in round-robin order and drains as
//! many of its requests as fit in one POST body (joined by `\r\n`, within the
//! server's request limit). The response body must hold exactly one line per
//! request, answered in order, or a single `ERROR` line failing the whole
//! batch.
//!
//! # Status
//!
//! ```text
//! Idle ──send batch──▶ Waiting ──Closed / Broken──▶ Idle ──▶ next batch
//! ```
//!
//! An empty response is not an answer: the requests stay with their tutors,
//! which retransmit on timeout.

use crate::batch::{BatchKind, RequestObjects, RequestQueues};
use crate::environment::Environment;
use crate::request_manager::{ManagerEvent, RequestManager};
use crate::transport::{ConnId, HttpRequest, TransportEvent, TransportEventKind};
use tlcp_core::request::http_url;
use tlcp_core::{parse_line, ServerMessage, PROTOCOL_ERROR_CODE};

/// Collects the response of one batch
#[derive(Debug)]
struct BatchedListener {
    conn: ConnId,
    entries: Vec<RequestObjects>,
    lines: Vec<String>,
    opened: bool,
}

#[derive(Debug)]
enum HttpStatus {
    Idle,
    Waiting(BatchedListener),
}

/// HTTP control request manager
#[derive(Debug)]
pub struct HttpRequestManager {
    queues: RequestQueues,
    status: HttpStatus,
    request_limit: Option<u64>,
    session_id: Option<String>,
    server: String,
    closed: bool,
}

impl HttpRequestManager {
    /// Manager posting to `server` until a control link is known
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            queues: RequestQueues::new(),
            status: HttpStatus::Idle,
            request_limit: None,
            session_id: None,
            server: server.into(),
            closed: false,
        }
    }

    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Send further requests to `server`
    pub fn set_control_link(&mut self, server: impl Into<String>) {
        self.server = server.into();
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.status, HttpStatus::Waiting(_))
    }

    /// Connection of the batch in flight, if any
    pub fn conn(&self) -> Option<ConnId> {
        match &self.status {
            HttpStatus::Waiting(listener) => Some(listener.conn),
            HttpStatus::Idle => None,
        }
    }

    /// Handle an event on the control connection
    ///
    /// Returns `false` if `event` belongs to another connection.
    pub fn on_transport(
        &mut self,
        env: &mut Environment,
        event: &TransportEvent,
        events: &mut Vec<ManagerEvent>,
    ) -> bool {
        let HttpStatus::Waiting(listener) = &mut self.status else {
            return false;
        };
        if listener.conn != event.conn {
            return false;
        }

        match &event.kind {
            TransportEventKind::Open => listener.opened = true,
            TransportEventKind::Message(line) => listener.lines.push(line.clone()),
            TransportEventKind::Written => {}
            TransportEventKind::Closed => {
                let HttpStatus::Waiting(listener) =
                    std::mem::replace(&mut self.status, HttpStatus::Idle)
                else {
                    return true;
                };
                Self::complete(listener, events);
                self.dequeue(env, events);
            }
            TransportEventKind::Broken(reason) => {
                tracing::warn!(
                    conn = event.conn,
                    opened = listener.opened,
                    requests = listener.entries.len(),
                    reason = %reason,
                    "control connection broken"
                );
                self.status = HttpStatus::Idle;
                self.dequeue(env, events);
            }
        }
        true
    }

    fn complete(listener: BatchedListener, events: &mut Vec<ManagerEvent>) {
        let BatchedListener {
            conn,
            entries,
            lines,
            ..
        } = listener;

        if lines.is_empty() {
            tracing::debug!(conn, "empty control response, waiting for retransmission");
            return;
        }

        if lines.len() == 1 {
            if let Ok(ServerMessage::Error { code, message }) = parse_line(&lines[0]) {
                tracing::error!(conn, code, message = %message, "control batch refused");
                events.push(ManagerEvent::Fatal { code, message });
                return;
            }
        }

        if lines.len() != entries.len() {
            events.push(ManagerEvent::Fatal {
                code: PROTOCOL_ERROR_CODE,
                message: format!(
                    "{} responses to {} control requests",
                    lines.len(),
                    entries.len()
                ),
            });
            return;
        }

        let mut dispatched = Vec::new();
        for (line, objects) in lines.iter().zip(entries.iter()) {
            match parse_line(line) {
                Ok(ServerMessage::ReqOk { .. }) => {
                    objects.listener.on_ok(objects.tutor.as_ref(), &mut dispatched);
                }
                Ok(ServerMessage::ReqErr { code, message, .. }) => {
                    objects
                        .listener
                        .on_error(objects.tutor.as_ref(), code, message, &mut dispatched);
                }
                Ok(other) => {
                    events.push(ManagerEvent::Fatal {
                        code: PROTOCOL_ERROR_CODE,
                        message: format!("unexpected {} in control response", other.tag()),
                    });
                    return;
                }
                Err(err) => {
                    events.push(ManagerEvent::Fatal {
                        code: PROTOCOL_ERROR_CODE,
                        message: err.to_string(),
                    });
                    return;
                }
            }
        }
        events.extend(dispatched.into_iter().map(ManagerEvent::Response));
    }

    fn dequeue(&mut self, env: &mut Environment, events: &mut Vec<ManagerEvent>) {
        if self.closed || self.is_waiting() {
            return;
        }
        while let Some(kind) = self.queues.next_queue() {
            if let Some((server, entries, body)) = self.take_batch(kind) {
                self.send_batch(env, server, entries, body, events);
                return;
            }
        }
    }

    fn take_batch(&mut self, kind: BatchKind) -> Option<(String, Vec<RequestObjects>, String)> {
        let limit = self.request_limit;
        let session_id = self.session_id.clone();
        let default_server = self.server.clone();
        let queue = self.queues.queue_mut(kind);

        let mut entries: Vec<RequestObjects> = Vec::new();
        let mut body = String::new();
        let mut target: Option<String> = None;

        while let Some(first) = queue.first() {
            if !first.tutor.should_be_sent() {
                if let Some(skipped) = queue.shift() {
                    tracing::debug!(request = skipped.request.name(), "request no longer needed");
                    if !skipped.tutor.is_aborted() {
                        skipped.tutor.notify_abort();
                    }
                }
                continue;
            }

            let server = first.server.clone().unwrap_or_else(|| default_server.clone());
            if target.as_ref().is_some_and(|t| *t != server) {
                break;
            }

            let encoded = first.request.encode_transport_unaware(session_id.as_deref());
            let grown = if body.is_empty() {
                encoded.len()
            } else {
                body.len() + 2 + encoded.len()
            };
            if !entries.is_empty() && limit.is_some_and(|limit| grown as u64 > limit) {
                break;
            }

            let Some(objects) = queue.shift() else {
                break;
            };
            if !body.is_empty() {
                body.push_str("\r\n");
            }
            body.push_str(&encoded);
            entries.push(objects);
            target = Some(server);

            if kind == BatchKind::Destroy {
                break;
            }
        }

        let server = target?;
        Some((server, entries, body))
    }

    fn send_batch(
        &mut self,
        env: &mut Environment,
        server: String,
        entries: Vec<RequestObjects>,
        body: String,
        events: &mut Vec<ManagerEvent>,
    ) {
        let Some(name) = entries.first().map(|objects| objects.request.name()) else {
            return;
        };
        let conn = env.next_conn();
        tracing::debug!(conn, request = name, count = entries.len(), server = %server, "sending control batch");
        env.http.send(
            conn,
            HttpRequest {
                url: http_url(&server, name),
                body,
            },
        );
        if let Some(metrics) = &env.metrics {
            metrics.record_batch(entries.len() as u64);
        }
        for objects in &entries {
            objects.tutor.notify_sent();
            events.push(ManagerEvent::Sent(objects.clone()));
        }
        self.status = HttpStatus::Waiting(BatchedListener {
            conn,
            entries,
            lines: Vec::new(),
            opened: false,
        });
    }
}

impl RequestManager for HttpRequestManager {
    fn add(&mut self, env: &mut Environment, objects: RequestObjects, events: &mut Vec<ManagerEvent>) {
        if self.closed {
            tracing::debug!(request = objects.request.name(), "manager closed, request dropped");
            objects.tutor.notify_abort();
            return;
        }
        self.queues.add(objects);
        self.dequeue(env, events);
    }

    fn set_request_limit(&mut self, limit: u64) {
        self.request_limit = Some(limit);
    }

    fn take_unsent(&mut self) -> Vec<RequestObjects> {
        self.queues.drain()
    }

    /// Abandon the batch in flight; queued destroy requests still go out,
    /// one connection each
    fn close(&mut self, env: &mut Environment) {
        if let HttpStatus::Waiting(listener) = std::mem::replace(&mut self.status, HttpStatus::Idle) {
            env.http.close(listener.conn);
        }
        self.closed = true;

        let session_id = self.session_id.clone();
        for objects in self.queues.queue_mut(BatchKind::Destroy).drain() {
            let server = objects.server.clone().unwrap_or_else(|| self.server.clone());
            let conn = env.next_conn();
            tracing::debug!(conn, server = %server, "sending destroy");
            env.http.send(
                conn,
                HttpRequest {
                    url: http_url(&server, objects.request.name()),
                    body: objects.request.encode_transport_unaware(session_id.as_deref()),
                },
            );
        }
    }
}
