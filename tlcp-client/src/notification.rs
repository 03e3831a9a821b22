//! Notifications delivered to the application
//!
//! Everything the session layer has to tell the layers above (status
//! changes, session lifecycle, real-time updates, message outcomes, control
//! request failures) is a [`ClientEvent`]. Events are published on a
//! broadcast channel; [`NotificationHandler`] additionally dispatches them to
//! async callbacks registered by event name.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tlcp_client::{ClientEvent, TlcpClient};
//!
//! # async fn example(client: &TlcpClient) {
//! client.on_event("update", |event| async move {
//!     if let ClientEvent::Update { sub_id, item, fields } = event {
//!         println!("{sub_id}/{item}: {fields:?}");
//!     }
//! }).await;
//!
//! let mut events = client.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! # }
//! ```

use crate::listener::{ControlKind, ControlOutcome};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tlcp_core::{Bandwidth, ClientStatus, FieldValue, ServerMessage, Transport};
use tokio::sync::Mutex;

/// What became of a sent message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// `REQOK`: the server received the message
    Ack,
    /// `MSGDONE`: the adapter processed it
    Done { response: Option<String> },
    /// `MSGFAIL` 38 or 39: dropped before reaching the adapter
    Discarded,
    /// Refused by the adapter (code 0 or negative)
    Denied { code: i32, message: String },
    Error { code: i32, message: String },
}

impl MessageOutcome {
    /// Outcome of a `MSGFAIL` or `REQERR` with `code`
    pub fn from_error(code: i32, message: String) -> Self {
        match code {
            38 | 39 => MessageOutcome::Discarded,
            code if code <= 0 => MessageOutcome::Denied { code, message },
            code => MessageOutcome::Error { code, message },
        }
    }
}

/// Notification for the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StatusChanged(ClientStatus),
    SessionStarted { session_id: String, recovered: bool },
    SessionBound { transport: Transport },
    SessionClosed,
    /// The server closed the session and no retry will follow
    ServerError { code: i32, message: String },
    Subscribed {
        sub_id: u32,
        items: u32,
        fields: u32,
        /// `(key, command)` field positions of COMMAND subscriptions
        command: Option<(u32, u32)>,
    },
    SubscriptionError { sub_id: u32, code: i32, message: String },
    Unsubscribed { sub_id: u32 },
    Update {
        sub_id: u32,
        item: u32,
        fields: Vec<FieldValue>,
    },
    EndOfSnapshot { sub_id: u32, item: u32 },
    ClearSnapshot { sub_id: u32, item: u32 },
    LostUpdates { sub_id: u32, item: u32, lost: u64 },
    Configured {
        sub_id: u32,
        max_frequency: Option<f64>,
        filtered: bool,
    },
    Message {
        sequence: String,
        prog: u64,
        outcome: MessageOutcome,
    },
    Bandwidth(Bandwidth),
    ServerName(String),
    ClientIp(String),
    MpnRegistered { device_id: String, adapter_name: String },
    MpnSubscribed { sub_id: u32, mpn_sub_id: String },
    MpnDeleted { mpn_sub_id: String },
    MpnBadgeReset { device_id: String },
    MpnResponse {
        req_id: u64,
        op: String,
        outcome: ControlOutcome,
    },
    /// A control request the application cannot act on was refused
    ControlError {
        kind: ControlKind,
        code: i32,
        message: String,
    },
}

impl ClientEvent {
    /// Name handlers are registered under
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StatusChanged(_) => "status",
            ClientEvent::SessionStarted { .. } => "session_started",
            ClientEvent::SessionBound { .. } => "session_bound",
            ClientEvent::SessionClosed => "session_closed",
            ClientEvent::ServerError { .. } => "server_error",
            ClientEvent::Subscribed { .. } => "subscribed",
            ClientEvent::SubscriptionError { .. } => "subscription_error",
            ClientEvent::Unsubscribed { .. } => "unsubscribed",
            ClientEvent::Update { .. } => "update",
            ClientEvent::EndOfSnapshot { .. } => "end_of_snapshot",
            ClientEvent::ClearSnapshot { .. } => "clear_snapshot",
            ClientEvent::LostUpdates { .. } => "lost_updates",
            ClientEvent::Configured { .. } => "configured",
            ClientEvent::Message { .. } => "message",
            ClientEvent::Bandwidth(_) => "bandwidth",
            ClientEvent::ServerName(_) => "server_name",
            ClientEvent::ClientIp(_) => "client_ip",
            ClientEvent::MpnRegistered { .. } => "mpn_registered",
            ClientEvent::MpnSubscribed { .. } => "mpn_subscribed",
            ClientEvent::MpnDeleted { .. } => "mpn_deleted",
            ClientEvent::MpnBadgeReset { .. } => "mpn_badge_reset",
            ClientEvent::MpnResponse { .. } => "mpn_response",
            ClientEvent::ControlError { .. } => "control_error",
        }
    }

    /// Event carried by a data notification of the stream
    ///
    /// Returns `None` for lines that only matter to the session layer.
    pub fn from_data(message: ServerMessage) -> Option<Self> {
        let event = match message {
            ServerMessage::Update { sub_id, item, fields } => ClientEvent::Update { sub_id, item, fields },
            ServerMessage::SubOk { sub_id, items, fields } => ClientEvent::Subscribed {
                sub_id,
                items,
                fields,
                command: None,
            },
            ServerMessage::SubCmd {
                sub_id,
                items,
                fields,
                key_pos,
                command_pos,
            } => ClientEvent::Subscribed {
                sub_id,
                items,
                fields,
                command: Some((key_pos, command_pos)),
            },
            ServerMessage::Unsub { sub_id } => ClientEvent::Unsubscribed { sub_id },
            ServerMessage::EndOfSnapshot { sub_id, item } => ClientEvent::EndOfSnapshot { sub_id, item },
            ServerMessage::ClearSnapshot { sub_id, item } => ClientEvent::ClearSnapshot { sub_id, item },
            ServerMessage::Overflow { sub_id, item, lost } => ClientEvent::LostUpdates { sub_id, item, lost },
            ServerMessage::Conf {
                sub_id,
                max_frequency,
                filtered,
            } => ClientEvent::Configured {
                sub_id,
                max_frequency,
                filtered,
            },
            ServerMessage::MsgDone {
                sequence,
                prog,
                response,
            } => ClientEvent::Message {
                sequence,
                prog,
                outcome: MessageOutcome::Done { response },
            },
            ServerMessage::MsgFail {
                sequence,
                prog,
                code,
                message,
            } => ClientEvent::Message {
                sequence,
                prog,
                outcome: MessageOutcome::from_error(code, message),
            },
            ServerMessage::MpnReg {
                device_id,
                adapter_name,
            } => ClientEvent::MpnRegistered {
                device_id,
                adapter_name,
            },
            ServerMessage::MpnOk { sub_id, mpn_sub_id } => ClientEvent::MpnSubscribed { sub_id, mpn_sub_id },
            ServerMessage::MpnDel { mpn_sub_id } => ClientEvent::MpnDeleted { mpn_sub_id },
            ServerMessage::MpnZero { device_id } => ClientEvent::MpnBadgeReset { device_id },
            other => {
                tracing::trace!(tag = other.tag(), "no application event");
                return None;
            }
        };
        Some(event)
    }
}

/// Type for event handler functions
pub type EventFn = Arc<dyn Fn(ClientEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registry of async event handlers, keyed by [`ClientEvent::name`]
#[derive(Clone)]
pub struct NotificationHandler {
    handlers: Arc<Mutex<HashMap<&'static str, EventFn>>>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `handler` for events named `name`, replacing any previous one
    pub async fn register<F, Fut>(&self, name: &'static str, handler: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventFn = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.lock().await.insert(name, handler);
    }

    /// Run the handler registered for `event`, if any
    pub async fn handle(&self, event: ClientEvent) {
        let handler = self.handlers.lock().await.get(event.name()).cloned();
        match handler {
            Some(handler) => handler(event).await,
            None => tracing::trace!(event = event.name(), "no handler registered"),
        }
    }

    pub async fn has_handler(&self, name: &str) -> bool {
        self.handlers.lock().await.contains_key(name)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.handlers.lock().await.remove(name).is_some()
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}
