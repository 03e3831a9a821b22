//! TLCP client over HTTP and WebSocket
//!
//! This crate keeps a TLCP session alive against a push server: it creates
//! and binds sessions, senses the best transport, recovers broken streams,
//! and delivers subscription and message control requests reliably.
//!
//! # Core Features
//!
//! - **Transports**: WS-STREAMING, HTTP-STREAMING and HTTP-POLLING, with
//!   stream-sense fallback and transport switches
//! - **Recovery**: broken streams resume from the last received prog
//! - **Control requests**: batched, retransmitted and deduplicated
//! - **Bandwidth**: requested max bandwidth and client-side slowing detection
//! - **Observability**: `tracing` spans and OpenTelemetry metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tlcp_client::{ClientBuilder, ClientEvent};
//! use tlcp_core::{SubscriptionMode, SubscriptionParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("https://push.example.com")
//!         .with_adapter_set("DEMO")
//!         .connect()
//!         .await?;
//!
//!     client.on_event("update", |event| async move {
//!         if let ClientEvent::Update { sub_id, item, .. } = event {
//!             println!("subscription {sub_id} item {item} changed");
//!         }
//!     }).await;
//!
//!     client.subscribe(SubscriptionParams::new(
//!         SubscriptionMode::Merge,
//!         "item1 item2",
//!         "last_price time",
//!     ))?;
//!     Ok(())
//! }
//! ```
//!
//! # Layers
//!
//! [`TlcpClient`] sends commands to an executor task that owns a
//! [`SessionManager`]. The manager drives one [`Session`](session::Session)
//! at a time; a session drives a [`Protocol`](protocol::Protocol), which
//! owns the stream connection and a request manager for control requests.
//! All of it is sans-IO: transports and timers are reached through the
//! [`Environment`], so the whole layer can be driven by hand in tests.

pub mod batch;
mod client;
mod client_builder;
pub mod delay_counter;
pub mod environment;
pub mod heartbeat;
pub mod http_manager;
mod http_transport;
pub mod listener;
mod metrics;
mod notification;
mod options;
pub mod protocol;
pub mod recovery;
pub mod request_manager;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod session_manager;
pub mod slowing;
pub mod transport;
pub mod tutor;
pub mod ws_manager;
mod ws_transport;

pub use client::TlcpClient;
pub use client_builder::{ClientBuilder, TransportFactory};
pub use environment::Environment;
pub use http_transport::ReqwestTransport;
pub use metrics::ClientMetrics;
pub use notification::{ClientEvent, EventFn, MessageOutcome, NotificationHandler};
pub use options::{ConnectionDetails, ConnectionOptions};
pub use runtime::{EventSink, Executor};
pub use session_manager::{ManagerStatus, OutgoingMessage, SessionManager};
pub use ws_transport::TungsteniteTransport;
