//! TLCP - Lightstreamer's Text Lightstreamer Client Protocol
//!
//! This is the convenience crate that re-exports the TLCP sub-crates.
//! Use this crate if you want a single dependency for the whole client.
//!
//! # Architecture
//!
//! TLCP is organized into modular crates:
//!
//! - **tlcp-core**: Wire codec, requests, prog counter, error handling,
//!   observability
//! - **tlcp-client**: Session state machine, control request delivery,
//!   HTTP and WebSocket transports, the client facade
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tlcp::core::{SubscriptionMode, SubscriptionParams};
//! use tlcp::client::{ClientBuilder, ClientEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientBuilder::new("https://push.example.com")
//!         .with_adapter_set("DEMO")
//!         .connect()
//!         .await?;
//!
//!     let sub_id = client.subscribe(SubscriptionParams::new(
//!         SubscriptionMode::Merge,
//!         "item1",
//!         "last_price",
//!     ))?;
//!
//!     let mut events = client.events();
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::Update { sub_id: id, fields, .. } = event {
//!             if id == sub_id {
//!                 println!("{fields:?}");
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub use tlcp_client as client;
pub use tlcp_core as core;

pub use tlcp_client::TlcpClient;
