//! Per-client context passed down the session layer
//!
//! Everything a session, protocol or request manager needs besides its own
//! state lives here: options, clock, transports, id allocators, metrics and
//! the WebSocket availability flag. It is owned by the session executor and
//! lent to each handler as `&mut Environment`.

use crate::metrics::ClientMetrics;
use crate::options::{ConnectionDetails, ConnectionOptions};
use crate::scheduler::{Scheduler, TimerTask};
use crate::transport::{ConnId, HttpTransport, WsTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Context of one client instance
pub struct Environment {
    pub details: ConnectionDetails,
    pub options: ConnectionOptions,
    pub scheduler: Box<dyn Scheduler>,
    pub http: Box<dyn HttpTransport>,
    pub ws: Box<dyn WsTransport>,
    pub metrics: Option<Arc<ClientMetrics>>,
    next_conn: ConnId,
    next_req_id: u64,
    next_object_id: u64,
    ws_disabled_for: Option<Option<String>>,
}

impl Environment {
    pub fn new(
        details: ConnectionDetails,
        options: ConnectionOptions,
        scheduler: Box<dyn Scheduler>,
        http: Box<dyn HttpTransport>,
        ws: Box<dyn WsTransport>,
    ) -> Self {
        Self {
            details,
            options,
            scheduler,
            http,
            ws,
            metrics: None,
            next_conn: 0,
            next_req_id: 0,
            next_object_id: 0,
            ws_disabled_for: None,
        }
    }

    /// Attach OpenTelemetry metrics
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn now(&self) -> Instant {
        self.scheduler.now()
    }

    pub fn schedule(&mut self, delay: Duration, task: TimerTask) {
        self.scheduler.schedule(delay, task);
    }

    /// Fresh connection id
    pub fn next_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        self.next_conn
    }

    /// Fresh `LS_reqId`
    pub fn next_req_id(&mut self) -> u64 {
        self.next_req_id += 1;
        self.next_req_id
    }

    /// Fresh id for a session object
    pub fn next_object_id(&mut self) -> u64 {
        self.next_object_id += 1;
        self.next_object_id
    }

    /// Whether WebSocket was given up on for this client
    pub fn is_ws_disabled(&self) -> bool {
        self.ws_disabled_for.is_some()
    }

    /// Stop trying WebSocket until the client address changes
    pub fn disable_ws(&mut self, client_ip: Option<String>) {
        tracing::info!(client_ip = ?client_ip, "WebSocket disabled");
        self.ws_disabled_for = Some(client_ip);
    }

    /// Re-enable WebSocket if `client_ip` differs from the address it was
    /// disabled for. Returns whether it was re-enabled.
    ///
    /// If the address was unknown when WebSocket was disabled, the first one
    /// reported becomes the reference.
    pub fn on_client_ip(&mut self, client_ip: &str) -> bool {
        match &self.ws_disabled_for {
            Some(None) => {
                self.ws_disabled_for = Some(Some(client_ip.to_string()));
                false
            }
            Some(Some(disabled_for)) if disabled_for != client_ip => {
                tracing::info!(client_ip, "client address changed, WebSocket enabled again");
                self.ws_disabled_for = None;
                true
            }
            _ => false,
        }
    }
}
