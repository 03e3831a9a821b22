//! Client requests and their wire encoding
//!
//! Every request the client sends renders to a `key=value&...` parameter
//! string. Over HTTP the string is the POST body of
//! `<server>/lightstreamer/<name>.txt?LS_protocol=TLCP-2.5.0`; over WebSocket
//! it becomes the frame `<name>\r\n<params>`.
//!
//! # Session id
//!
//! Control, message and heartbeat requests do not carry a session id of their
//! own: the encoder supplies it. Two variants exist:
//!
//! - [`ClientRequest::encode_transport_unaware`] always writes `LS_session`.
//! - [`ClientRequest::encode_transport_aware`] omits it when the WebSocket
//!   the request travels on is already bound to the same session.
//!
//! Create, bind, recovery and destroy requests name their session explicitly
//! and are encoded the same way in both variants.

use crate::codec::encode_value;
use crate::types::Bandwidth;
use std::fmt::Write as _;

/// Protocol version spoken by this client
pub const TLCP_VERSION: &str = "TLCP-2.5.0";

/// WebSocket subprotocol announced on connect
pub const WS_SUBPROTOCOL: &str = "TLCP-2.5.0.lightstreamer.com";

/// Query string appended to every HTTP request path
pub const PROTOCOL_QUERY: &str = "LS_protocol=TLCP-2.5.0";

/// Subscription mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Merge,
    Distinct,
    Command,
    Raw,
}

impl SubscriptionMode {
    fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Command => "COMMAND",
            SubscriptionMode::Raw => "RAW",
        }
    }
}

/// Requested snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Yes,
    No,
    /// Only the last `n` events (DISTINCT mode)
    Length(u32),
}

/// Requested maximum update frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frequency {
    Unlimited,
    Unfiltered,
    /// Updates per second
    Limited(f64),
}

impl Frequency {
    fn to_wire(self) -> String {
        match self {
            Frequency::Unlimited => "unlimited".to_string(),
            Frequency::Unfiltered => "unfiltered".to_string(),
            Frequency::Limited(f) => Bandwidth::Limited(f).to_wire(),
        }
    }
}

/// Parameters of a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionParams {
    pub mode: SubscriptionMode,
    /// Item group name or space-separated item list
    pub group: String,
    /// Field schema name or space-separated field list
    pub schema: String,
    pub data_adapter: Option<String>,
    pub selector: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub max_frequency: Option<Frequency>,
    /// Buffer size, `None` lets the server decide
    pub buffer_size: Option<u32>,
}

impl SubscriptionParams {
    /// MERGE subscription with snapshot left to the server
    pub fn new(mode: SubscriptionMode, group: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            mode,
            group: group.into(),
            schema: schema.into(),
            data_adapter: None,
            selector: None,
            snapshot: None,
            max_frequency: None,
            buffer_size: None,
        }
    }
}

/// Parameters shared by create and bind requests
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub polling: bool,
    /// `LS_polling_millis`; only sent when polling
    pub polling_ms: u64,
    /// `LS_idle_millis`; only sent when polling
    pub idle_ms: u64,
    /// `LS_keepalive_millis`; only sent when streaming and non-zero
    pub keepalive_ms: u64,
    /// `LS_content_length`; only sent over HTTP streaming
    pub content_length: Option<u64>,
    /// `false` adds `LS_send_sync=false`
    pub send_sync: bool,
    /// Reason for the connection, for server logs
    pub cause: Option<String>,
}

impl StreamParams {
    /// Parameters for a zero-wait HTTP poll, as used by create and recovery
    pub fn immediate_poll() -> Self {
        Self {
            polling: true,
            polling_ms: 0,
            idle_ms: 0,
            keepalive_ms: 0,
            content_length: None,
            send_sync: true,
            cause: None,
        }
    }
}

/// Message send parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MessageParams {
    pub text: String,
    /// Sequence name; `UNORDERED_MESSAGES` for none
    pub sequence: String,
    /// Progressive number within the sequence
    pub prog: u64,
    /// Maximum time the server may wait for earlier messages, in ms
    pub max_wait_ms: Option<u64>,
    /// Whether the client wants MSGDONE/MSGFAIL
    pub outcome: bool,
}

/// A request sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// `create_session`
    CreateSession {
        adapter_set: Option<String>,
        user: Option<String>,
        password: Option<String>,
        requested_max_bandwidth: Bandwidth,
        /// Session being replaced, if any
        old_session: Option<String>,
        stream: StreamParams,
    },
    /// `bind_session` carrying `LS_recovery_from`
    RecoverSession {
        session_id: String,
        recovery_from: u64,
        stream: StreamParams,
    },
    /// `bind_session`
    BindSession {
        session_id: String,
        stream: StreamParams,
    },
    /// `control` with `LS_op=add`
    Subscribe {
        req_id: u64,
        sub_id: u32,
        params: SubscriptionParams,
    },
    /// `control` with `LS_op=delete`
    Unsubscribe { req_id: u64, sub_id: u32 },
    /// `control` with `LS_op=reconf`
    Reconfigure {
        req_id: u64,
        sub_id: u32,
        max_frequency: Frequency,
    },
    /// `control` with `LS_op=constrain`
    Constrain { req_id: u64, bandwidth: Bandwidth },
    /// `control` with `LS_op=force_rebind`
    ForceRebind {
        req_id: u64,
        cause: Option<String>,
        polling_ms: Option<u64>,
    },
    /// `control` with `LS_op=destroy`, always aimed at `session_id`
    Destroy {
        req_id: u64,
        session_id: String,
        cause: Option<String>,
        close_socket: bool,
    },
    /// `msg`
    Message { req_id: u64, message: MessageParams },
    /// `heartbeat`
    Heartbeat,
    /// `control` MPN operation with caller-supplied parameters
    Mpn {
        req_id: u64,
        op: String,
        params: Vec<(String, String)>,
    },
}

impl ClientRequest {
    /// Request name used in the HTTP path and WebSocket frame
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::CreateSession { .. } => "create_session",
            ClientRequest::RecoverSession { .. } | ClientRequest::BindSession { .. } => {
                "bind_session"
            }
            ClientRequest::Message { .. } => "msg",
            ClientRequest::Heartbeat => "heartbeat",
            _ => "control",
        }
    }

    /// `LS_reqId`, for requests that get a `REQOK`/`REQERR` reply
    pub fn req_id(&self) -> Option<u64> {
        match self {
            ClientRequest::Subscribe { req_id, .. }
            | ClientRequest::Unsubscribe { req_id, .. }
            | ClientRequest::Reconfigure { req_id, .. }
            | ClientRequest::Constrain { req_id, .. }
            | ClientRequest::ForceRebind { req_id, .. }
            | ClientRequest::Destroy { req_id, .. }
            | ClientRequest::Message { req_id, .. }
            | ClientRequest::Mpn { req_id, .. } => Some(*req_id),
            _ => None,
        }
    }

    /// Whether this request opens a stream (create, bind, recovery)
    pub fn is_session_request(&self) -> bool {
        matches!(
            self,
            ClientRequest::CreateSession { .. }
                | ClientRequest::RecoverSession { .. }
                | ClientRequest::BindSession { .. }
        )
    }

    /// Encode with an explicit `LS_session` wherever one applies
    pub fn encode_transport_unaware(&self, session_id: Option<&str>) -> String {
        self.encode(session_id)
    }

    /// Encode for a WebSocket whose default session is `ws_default_session`
    ///
    /// `LS_session` is left out when it would repeat the default.
    pub fn encode_transport_aware(
        &self,
        session_id: Option<&str>,
        ws_default_session: Option<&str>,
    ) -> String {
        match (session_id, ws_default_session) {
            (Some(sid), Some(default)) if sid == default => self.encode(None),
            _ => self.encode(session_id),
        }
    }

    fn encode(&self, session_id: Option<&str>) -> String {
        let mut q = Query::default();
        match self {
            ClientRequest::CreateSession {
                adapter_set,
                user,
                password,
                requested_max_bandwidth,
                old_session,
                stream,
            } => {
                q.push("LS_cid", CLIENT_ID);
                q.push_opt("LS_adapter_set", adapter_set.as_deref());
                q.push_opt("LS_user", user.as_deref());
                q.push_opt("LS_password", password.as_deref());
                if *requested_max_bandwidth != Bandwidth::Unlimited {
                    q.push("LS_requested_max_bandwidth", &requested_max_bandwidth.to_wire());
                }
                q.push_opt("LS_old_session", old_session.as_deref());
                q.push_stream(stream);
            }
            ClientRequest::RecoverSession {
                session_id,
                recovery_from,
                stream,
            } => {
                q.push("LS_session", session_id);
                q.push("LS_recovery_from", &recovery_from.to_string());
                q.push_stream(stream);
            }
            ClientRequest::BindSession { session_id, stream } => {
                q.push("LS_session", session_id);
                q.push_stream(stream);
            }
            ClientRequest::Subscribe {
                req_id,
                sub_id,
                params,
            } => {
                q.control(*req_id, "add", session_id);
                q.push("LS_subId", &sub_id.to_string());
                q.push("LS_mode", params.mode.as_str());
                q.push("LS_group", &params.group);
                q.push("LS_schema", &params.schema);
                q.push_opt("LS_data_adapter", params.data_adapter.as_deref());
                q.push_opt("LS_selector", params.selector.as_deref());
                match params.snapshot {
                    Some(Snapshot::Yes) => q.push("LS_snapshot", "true"),
                    Some(Snapshot::No) => q.push("LS_snapshot", "false"),
                    Some(Snapshot::Length(n)) => q.push("LS_snapshot", &n.to_string()),
                    None => {}
                }
                if let Some(freq) = params.max_frequency {
                    q.push("LS_requested_max_frequency", &freq.to_wire());
                }
                if let Some(size) = params.buffer_size {
                    q.push("LS_requested_buffer_size", &size.to_string());
                }
            }
            ClientRequest::Unsubscribe { req_id, sub_id } => {
                q.control(*req_id, "delete", session_id);
                q.push("LS_subId", &sub_id.to_string());
            }
            ClientRequest::Reconfigure {
                req_id,
                sub_id,
                max_frequency,
            } => {
                q.control(*req_id, "reconf", session_id);
                q.push("LS_subId", &sub_id.to_string());
                q.push("LS_requested_max_frequency", &max_frequency.to_wire());
            }
            ClientRequest::Constrain { req_id, bandwidth } => {
                q.control(*req_id, "constrain", session_id);
                q.push("LS_requested_max_bandwidth", &bandwidth.to_wire());
            }
            ClientRequest::ForceRebind {
                req_id,
                cause,
                polling_ms,
            } => {
                q.control(*req_id, "force_rebind", session_id);
                q.push_opt("LS_cause", cause.as_deref());
                if let Some(ms) = polling_ms {
                    q.push("LS_polling_millis", &ms.to_string());
                }
            }
            ClientRequest::Destroy {
                req_id,
                session_id: target,
                cause,
                close_socket,
            } => {
                q.push("LS_reqId", &req_id.to_string());
                q.push("LS_op", "destroy");
                q.push("LS_session", target);
                q.push_opt("LS_cause", cause.as_deref());
                if *close_socket {
                    q.push("LS_close_socket", "true");
                }
            }
            ClientRequest::Message { req_id, message } => {
                q.push("LS_reqId", &req_id.to_string());
                q.push_opt("LS_session", session_id);
                q.push("LS_message", &message.text);
                if message.sequence != crate::codec::UNORDERED_MESSAGES {
                    q.push("LS_sequence", &message.sequence);
                }
                q.push("LS_msg_prog", &message.prog.to_string());
                if let Some(wait) = message.max_wait_ms {
                    q.push("LS_max_wait", &wait.to_string());
                }
                if !message.outcome {
                    q.push("LS_outcome", "false");
                }
            }
            ClientRequest::Heartbeat => {
                q.push_opt("LS_session", session_id);
            }
            ClientRequest::Mpn { req_id, op, params } => {
                q.control(*req_id, op, session_id);
                for (key, value) in params {
                    q.push(key, value);
                }
            }
        }
        q.finish()
    }

    /// WebSocket frame for this request
    pub fn ws_frame(&self, params: &str) -> String {
        format!("{}\r\n{}", self.name(), params)
    }
}

/// URL an HTTP request named `name` is POSTed to
pub fn http_url(server_address: &str, name: &str) -> String {
    format!(
        "{}/lightstreamer/{}.txt?{}",
        server_address.trim_end_matches('/'),
        name,
        PROTOCOL_QUERY
    )
}

/// WebSocket URL for `server_address` (`http` becomes `ws`, `https` `wss`)
pub fn ws_url(server_address: &str) -> String {
    let base = server_address.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/lightstreamer")
}

/// `LS_cid` identifying this library to the server
const CLIENT_ID: &str = concat!("tlcp-rs-", env!("CARGO_PKG_VERSION"));

#[derive(Default)]
struct Query {
    buf: String,
}

impl Query {
    fn push(&mut self, key: &str, value: &str) {
        if !self.buf.is_empty() {
            self.buf.push('&');
        }
        let _ = write!(self.buf, "{}={}", key, encode_value(value));
    }

    fn push_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }

    fn control(&mut self, req_id: u64, op: &str, session_id: Option<&str>) {
        self.push("LS_reqId", &req_id.to_string());
        self.push("LS_op", op);
        self.push_opt("LS_session", session_id);
    }

    fn push_stream(&mut self, stream: &StreamParams) {
        if stream.polling {
            self.push("LS_polling", "true");
            self.push("LS_polling_millis", &stream.polling_ms.to_string());
            self.push("LS_idle_millis", &stream.idle_ms.to_string());
        } else {
            if stream.keepalive_ms > 0 {
                self.push("LS_keepalive_millis", &stream.keepalive_ms.to_string());
            }
            if let Some(len) = stream.content_length {
                self.push("LS_content_length", &len.to_string());
            }
        }
        if !stream.send_sync {
            self.push("LS_send_sync", "false");
        }
        self.push_opt("LS_cause", stream.cause.as_deref());
    }

    fn finish(self) -> String {
        self.buf
    }
}
