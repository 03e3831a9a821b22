//! Client builder
//!
//! The `ClientBuilder` provides a fluent API for configuring the client
//! before it starts. It allows you to:
//! - Set the adapter set and credentials
//! - Tune connection options (timeouts, bandwidth, forced transport)
//! - Configure observability (OpenTelemetry)
//! - Plug in custom transports
//!
//! # Examples
//!
//! ```rust,no_run
//! use tlcp_client::{ClientBuilder, ConnectionOptions};
//! use tlcp_core::{ForcedTransport, Transport};
//!
//! # async fn example() -> tlcp_core::Result<()> {
//! let client = ClientBuilder::new("https://push.example.com")
//!     .with_adapter_set("DEMO")
//!     .connect()
//!     .await?;
//!
//! // Polling only, with telemetry
//! let options = ConnectionOptions {
//!     forced_transport: Some(ForcedTransport::Exact(Transport::HttpPolling)),
//!     polling_interval_ms: 1000,
//!     ..ConnectionOptions::default()
//! };
//! let client2 = ClientBuilder::new("https://push.example.com")
//!     .with_options(options)
//!     .with_default_observability()
//!     .service_name("quotes")
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::environment::Environment;
use crate::http_transport::ReqwestTransport;
use crate::options::{ConnectionDetails, ConnectionOptions};
use crate::runtime::{EventSink, Executor, TokioScheduler};
use crate::transport::{HttpTransport, WsTransport};
use crate::ws_transport::TungsteniteTransport;
use crate::{ClientMetrics, TlcpClient};
use std::sync::Arc;
use tlcp_core::{ClientStatus, Error, ObservabilityConfig, Result};
use tokio::sync::{broadcast, mpsc, watch};

/// Creates the transports of a client from the sink they post events to
pub type TransportFactory =
    Box<dyn FnOnce(EventSink) -> (Box<dyn HttpTransport>, Box<dyn WsTransport>) + Send>;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Builder for configuring and creating a TlcpClient
pub struct ClientBuilder {
    details: ConnectionDetails,
    options: ConnectionOptions,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
    transports: Option<TransportFactory>,
    event_capacity: usize,
}

impl ClientBuilder {
    /// Builder for the server at `server_address` (`http://` or `https://`)
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            details: ConnectionDetails::new(server_address),
            options: ConnectionOptions::default(),
            observability_config: None,
            service_name: None,
            transports: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_adapter_set(mut self, adapter_set: impl Into<String>) -> Self {
        self.details.adapter_set = Some(adapter_set.into());
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.details.user = Some(user.into());
        self.details.password = Some(password.into());
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Replace the `reqwest`/`tokio-tungstenite` transports
    pub fn with_transports<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(EventSink) -> (Box<dyn HttpTransport>, Box<dyn WsTransport>) + Send + 'static,
    {
        self.transports = Some(Box::new(factory));
        self
    }

    /// Events a slow receiver may fall behind before losing some
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Start the session executor without connecting
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<TlcpClient> {
        let address = &self.details.server_address;
        if !(address.starts_with("http://") || address.starts_with("https://")) {
            return Err(Error::InvalidArgument(format!(
                "server address must be http:// or https://, got {address}"
            )));
        }
        self.options.validate()?;

        let metrics = match self.observability_config {
            Some(mut config) => {
                if let Some(name) = self.service_name {
                    config.service_name = name;
                }
                tlcp_core::init_observability(config.clone()).map_err(|e| {
                    Error::IllegalState(format!("failed to initialize observability: {e}"))
                })?;
                Some(Arc::new(ClientMetrics::new(config.service_name.clone())))
            }
            None => None,
        };

        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(inputs.clone());
        let (http, ws) = match self.transports {
            Some(factory) => factory(sink),
            None => (
                Box::new(ReqwestTransport::new(sink.clone())) as Box<dyn HttpTransport>,
                Box::new(TungsteniteTransport::new(sink)) as Box<dyn WsTransport>,
            ),
        };
        let mut env = Environment::new(
            self.details,
            self.options,
            Box::new(TokioScheduler::new(inputs.clone())),
            http,
            ws,
        );
        if let Some(metrics) = &metrics {
            env = env.with_metrics(Arc::clone(metrics));
        }

        let (events, _) = broadcast::channel(self.event_capacity);
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        tracing::info!(server = %env.details.server_address, "starting session executor");
        tokio::spawn(Executor::new(env, inputs_rx, events.clone(), status_tx).run());

        Ok(TlcpClient::new(inputs, events, status_rx, metrics))
    }

    /// Build the client and open a session
    pub async fn connect(self) -> Result<TlcpClient> {
        let client = self.build()?;
        client.connect()?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = ClientBuilder::new("https://push.example.com");
        assert_eq!(builder.details.server_address, "https://push.example.com");
        assert!(builder.details.adapter_set.is_none());
        assert!(builder.transports.is_none());
    }

    #[test]
    fn test_builder_details() {
        let builder = ClientBuilder::new("https://push.example.com")
            .with_adapter_set("DEMO")
            .with_credentials("user", "secret");
        assert_eq!(builder.details.adapter_set.as_deref(), Some("DEMO"));
        assert_eq!(builder.details.user.as_deref(), Some("user"));
        assert_eq!(builder.details.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_builder_observability_config() {
        let config = ObservabilityConfig::new("test-client")
            .with_otlp_endpoint("http://localhost:4317")
            .with_log_level("debug");

        let builder = ClientBuilder::new("https://push.example.com").with_observability(config);

        let obs_config = builder.observability_config.unwrap();
        assert_eq!(obs_config.service_name, "test-client");
        assert_eq!(obs_config.log_level, "debug");
    }

    #[test]
    fn test_builder_default_observability() {
        let builder = ClientBuilder::new("https://push.example.com").with_default_observability();
        assert_eq!(builder.observability_config.unwrap().service_name, "tlcp");
    }

    #[test]
    fn test_builder_chaining() {
        let builder = ClientBuilder::new("https://push.example.com")
            .with_options(ConnectionOptions {
                retry_delay_ms: 1000,
                ..ConnectionOptions::default()
            })
            .service_name("test-service")
            .event_capacity(0);

        assert_eq!(builder.options.retry_delay_ms, 1000);
        assert_eq!(builder.service_name, Some("test-service".to_string()));
        assert_eq!(builder.event_capacity, 1);
    }

    #[tokio::test]
    async fn test_rejects_websocket_address() {
        let result = ClientBuilder::new("ws://push.example.com").build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rejects_invalid_options() {
        let result = ClientBuilder::new("https://push.example.com")
            .with_options(ConnectionOptions {
                retry_delay_ms: 0,
                ..ConnectionOptions::default()
            })
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
