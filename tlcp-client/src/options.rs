//! Connection details and options
//!
//! [`ConnectionDetails`] says where and as whom to connect;
//! [`ConnectionOptions`] carries the timeouts, bandwidth and transport
//! preferences the session timers and request encoders read. Both are plain
//! serde structs so they can be loaded from JSON:
//!
//! ```rust
//! use tlcp_client::ConnectionOptions;
//!
//! let options = ConnectionOptions::from_json(r#"{
//!     "retry_delay_ms": 2000,
//!     "forced_transport": "HTTP-POLLING",
//!     "requested_max_bandwidth": "40"
//! }"#).unwrap();
//! assert_eq!(options.retry_delay_ms, 2000);
//! assert_eq!(options.session_recovery_timeout_ms, 15000);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tlcp_core::{Bandwidth, Error, ForcedTransport, Result};

/// Server address and credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    /// `http(s)://host[:port]`
    pub server_address: String,
    #[serde(default)]
    pub adapter_set: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ConnectionDetails {
    /// Details for `server_address` with no adapter set or credentials
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            adapter_set: None,
            user: None,
            password: None,
        }
    }
}

/// Session timing, bandwidth and transport options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Base delay before a new create after a failure
    pub retry_delay_ms: u64,
    /// Upper bound of the random pause before a recovery attempt
    pub first_retry_max_delay_ms: u64,
    /// How long recovery is attempted before falling back to a new session
    pub session_recovery_timeout_ms: u64,
    /// Requested keepalive; 0 lets the server decide
    pub keepalive_interval_ms: u64,
    /// Silence after the keepalive before the session is `STALLED`
    pub stalled_timeout_ms: u64,
    /// Silence after `STALLED` before the connection is dropped
    pub reconnect_timeout_ms: u64,
    /// Requested polling interval
    pub polling_interval_ms: u64,
    /// How long a poll may be held open by the server
    pub idle_timeout_ms: u64,
    /// `LS_content_length` for HTTP streaming
    pub content_length: u64,
    /// Retransmission timeout of force-rebind requests
    pub force_bind_timeout_ms: u64,
    /// Time allowed for a transport switch or a first streaming bind
    pub switch_check_timeout_ms: u64,
    /// Reverse heartbeat interval; 0 disables it
    pub reverse_heartbeat_interval_ms: u64,
    pub requested_max_bandwidth: Bandwidth,
    pub forced_transport: Option<ForcedTransport>,
    /// Switch to polling when the client falls behind the server clock
    pub slowing_enabled: bool,
    /// Ignore the control link announced in `CONOK`
    pub server_instance_address_ignored: bool,
    /// Treat error 5 as "retry now" instead of fatal
    pub handle_server_busy: bool,
    /// Ask the server for `SYNC` notifications
    pub send_sync: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            retry_delay_ms: 4000,
            first_retry_max_delay_ms: 100,
            session_recovery_timeout_ms: 15000,
            keepalive_interval_ms: 0,
            stalled_timeout_ms: 2000,
            reconnect_timeout_ms: 3000,
            polling_interval_ms: 0,
            idle_timeout_ms: 19000,
            content_length: 50_000_000,
            force_bind_timeout_ms: 2000,
            switch_check_timeout_ms: 4000,
            reverse_heartbeat_interval_ms: 0,
            requested_max_bandwidth: Bandwidth::Unlimited,
            forced_transport: None,
            slowing_enabled: false,
            server_instance_address_ignored: false,
            handle_server_busy: false,
            send_sync: true,
        }
    }
}

impl ConnectionOptions {
    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject values the session timers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.retry_delay_ms == 0 {
            return Err(Error::InvalidArgument("retry_delay_ms must be positive".into()));
        }
        if self.content_length == 0 {
            return Err(Error::InvalidArgument("content_length must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_millis(self.stalled_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn switch_check_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_check_timeout_ms)
    }

    pub fn force_bind_timeout(&self) -> Duration {
        Duration::from_millis(self.force_bind_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlcp_core::Transport;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.retry_delay_ms, 4000);
        assert_eq!(options.first_retry_max_delay_ms, 100);
        assert_eq!(options.session_recovery_timeout_ms, 15000);
        assert_eq!(options.content_length, 50_000_000);
        assert!(options.send_sync);
        assert!(!options.handle_server_busy);
        assert_eq!(options.forced_transport, None);
    }

    #[test]
    fn test_from_json_partial() {
        let options = ConnectionOptions::from_json(
            r#"{"forced_transport": "WS-POLLING", "requested_max_bandwidth": "unmanaged", "slowing_enabled": true}"#,
        )
        .unwrap();
        assert_eq!(
            options.forced_transport,
            Some(ForcedTransport::Exact(Transport::WsPolling))
        );
        assert_eq!(options.requested_max_bandwidth, Bandwidth::Unmanaged);
        assert!(options.slowing_enabled);
        assert_eq!(options.idle_timeout_ms, 19000);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(ConnectionOptions::from_json(r#"{"retry_delay_ms": 0}"#).is_err());
        assert!(ConnectionOptions::from_json(r#"{"forced_transport": "PIGEON"}"#).is_err());
        assert!(ConnectionOptions::from_json("not json").is_err());
    }

    #[test]
    fn test_details_roundtrip_from_json() {
        let details: ConnectionDetails =
            serde_json::from_str(r#"{"server_address": "https://push.example.com", "adapter_set": "DEMO"}"#)
                .unwrap();
        assert_eq!(details.adapter_set.as_deref(), Some("DEMO"));
        assert_eq!(details.user, None);
    }
}
