//! Core TLCP types and codec for tlcp
//!
//! This crate holds the stateless half of a TLCP client:
//!
//! - **Codec**: parsing of server lines into [`ServerMessage`] and decoding
//!   of update field lists
//! - **Requests**: [`ClientRequest`] and its `key=value&...` encoding, URLs
//!   and WebSocket frames
//! - **Prog counter**: the count of delivered countable notifications used to
//!   drop replay after a recovery
//! - **Error handling**: the error taxonomy and the classification of server
//!   error codes
//! - **Observability**: `tracing` subscriber and OpenTelemetry setup
//!
//! # Architecture
//!
//! Nothing here performs I/O or holds session state. The `tlcp-client` crate
//! builds the session state machine, the request managers and the transports
//! on top of these pieces.
//!
//! # Example
//!
//! ```rust
//! use tlcp_core::{codec, ClientRequest, ServerMessage};
//!
//! let bind = ClientRequest::BindSession {
//!     session_id: "S1".into(),
//!     stream: tlcp_core::request::StreamParams::immediate_poll(),
//! };
//! assert_eq!(bind.name(), "bind_session");
//!
//! let reply = codec::parse_line("LOOP,0").unwrap();
//! assert_eq!(reply, ServerMessage::Loop { pause_ms: 0 });
//! ```

pub mod codec;
pub mod error;
pub mod observability;
pub mod prog;
pub mod request;
pub mod types;

pub use codec::{parse_line, ServerMessage, UNORDERED_MESSAGES};
pub use error::{remap_error_code, Error, Result, ServerErrorKind, PROTOCOL_ERROR_CODE};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use prog::{Delivery, ProgCheck, ProgCounter};
pub use request::{
    ClientRequest, Frequency, MessageParams, Snapshot, StreamParams, SubscriptionMode,
    SubscriptionParams,
};
pub use types::{Bandwidth, ClientStatus, FieldValue, ForcedTransport, Transport};
