//! Shared TLCP domain types
//!
//! These are the small value types that travel between the codec, the
//! session layer and the public client: bandwidth and frequency values as the
//! server expresses them, decoded update fields, transport kinds and the
//! client status literals.
//!
//! # Status literals
//!
//! [`ClientStatus::as_str`] returns the exact tokens existing dashboards and
//! tests match on (`CONNECTING`, `CONNECTED:WS-STREAMING`, ...). They must not
//! change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Bandwidth as requested by the client or granted by the server (`CONS`)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Bandwidth {
    /// No limit
    #[default]
    Unlimited,
    /// The server does not manage bandwidth for this session
    Unmanaged,
    /// Limit in kilobits per second
    Limited(f64),
}

impl Bandwidth {
    /// Wire form used in `LS_requested_max_bandwidth`
    pub fn to_wire(&self) -> String {
        match self {
            Bandwidth::Unlimited => "unlimited".to_string(),
            Bandwidth::Unmanaged => "unmanaged".to_string(),
            Bandwidth::Limited(kbps) => format_number(*kbps),
        }
    }
}

impl FromStr for Bandwidth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlimited" => Ok(Bandwidth::Unlimited),
            "unmanaged" => Ok(Bandwidth::Unmanaged),
            other => parse_decimal(other)
                .map(Bandwidth::Limited)
                .ok_or_else(|| Error::InvalidArgument(format!("bad bandwidth: {other}"))),
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for Bandwidth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse `\d+(\.\d+)?` strictly
pub(crate) fn parse_decimal(s: &str) -> Option<f64> {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    if int.is_empty() || !int.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    s.parse().ok()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// A single field of a decoded `U` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// The field did not change since the previous update
    Unchanged,
    /// The field is null (`#`)
    Null,
    /// The field has a new value; `$` decodes to the empty string
    Value(String),
}

impl FieldValue {
    /// The new value, if the field carries one
    pub fn as_value(&self) -> Option<&str> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// The four physical transports a session can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// WebSocket, long-lived stream
    WsStreaming,
    /// WebSocket, one bind per poll
    WsPolling,
    /// HTTP, long-lived chunked response
    HttpStreaming,
    /// HTTP, one request per poll
    HttpPolling,
}

impl Transport {
    /// Build from the two axes
    pub fn new(is_ws: bool, is_polling: bool) -> Self {
        match (is_ws, is_polling) {
            (true, false) => Transport::WsStreaming,
            (true, true) => Transport::WsPolling,
            (false, false) => Transport::HttpStreaming,
            (false, true) => Transport::HttpPolling,
        }
    }

    /// Whether the transport is WebSocket
    pub fn is_ws(&self) -> bool {
        matches!(self, Transport::WsStreaming | Transport::WsPolling)
    }

    /// Whether the transport polls
    pub fn is_polling(&self) -> bool {
        matches!(self, Transport::WsPolling | Transport::HttpPolling)
    }

    /// The same medium in polling mode
    pub fn to_polling(self) -> Self {
        Transport::new(self.is_ws(), true)
    }

    /// Token used inside `CONNECTED:<token>`
    pub fn status_token(&self) -> &'static str {
        match self {
            Transport::WsStreaming => "WS-STREAMING",
            Transport::WsPolling => "WS-POLLING",
            Transport::HttpStreaming => "HTTP-STREAMING",
            Transport::HttpPolling => "HTTP-POLLING",
        }
    }
}

/// The `forced_transport` option
///
/// `Ws` and `Http` pin the medium but still let stream-sense move between
/// streaming and polling; the four full forms pin both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForcedTransport {
    /// `WS`
    Ws,
    /// `HTTP`
    Http,
    /// `WS-STREAMING`, `WS-POLLING`, `HTTP-STREAMING`, `HTTP-POLLING`
    Exact(Transport),
}

impl ForcedTransport {
    /// Whether polling is pinned (`Some(true)`), streaming is pinned
    /// (`Some(false)`) or free (`None`)
    pub fn polling(&self) -> Option<bool> {
        match self {
            ForcedTransport::Exact(t) => Some(t.is_polling()),
            _ => None,
        }
    }

    /// Whether WebSocket is pinned (`Some(true)`), HTTP is pinned
    /// (`Some(false)`) or free (`None`)
    pub fn ws(&self) -> Option<bool> {
        match self {
            ForcedTransport::Ws => Some(true),
            ForcedTransport::Http => Some(false),
            ForcedTransport::Exact(t) => Some(t.is_ws()),
        }
    }
}

impl FromStr for ForcedTransport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WS" => Ok(ForcedTransport::Ws),
            "HTTP" => Ok(ForcedTransport::Http),
            "WS-STREAMING" => Ok(ForcedTransport::Exact(Transport::WsStreaming)),
            "WS-POLLING" => Ok(ForcedTransport::Exact(Transport::WsPolling)),
            "HTTP-STREAMING" => Ok(ForcedTransport::Exact(Transport::HttpStreaming)),
            "HTTP-POLLING" => Ok(ForcedTransport::Exact(Transport::HttpPolling)),
            other => Err(Error::InvalidArgument(format!(
                "unknown forced transport: {other}"
            ))),
        }
    }
}

impl fmt::Display for ForcedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForcedTransport::Ws => f.write_str("WS"),
            ForcedTransport::Http => f.write_str("HTTP"),
            ForcedTransport::Exact(t) => f.write_str(t.status_token()),
        }
    }
}

impl Serialize for ForcedTransport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ForcedTransport {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// High-level client status reported upward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    /// `CONNECTING`
    Connecting,
    /// `CONNECTED:STREAM-SENSING`
    StreamSensing,
    /// `CONNECTED:<transport>`
    Connected(Transport),
    /// `STALLED`
    Stalled,
    /// `DISCONNECTED:WILL-RETRY`
    WillRetry,
    /// `DISCONNECTED:TRYING-RECOVERY`
    TryingRecovery,
    /// `DISCONNECTED`
    Disconnected,
}

impl ClientStatus {
    /// The exact literal token
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Connecting => "CONNECTING",
            ClientStatus::StreamSensing => "CONNECTED:STREAM-SENSING",
            ClientStatus::Connected(Transport::WsStreaming) => "CONNECTED:WS-STREAMING",
            ClientStatus::Connected(Transport::WsPolling) => "CONNECTED:WS-POLLING",
            ClientStatus::Connected(Transport::HttpStreaming) => "CONNECTED:HTTP-STREAMING",
            ClientStatus::Connected(Transport::HttpPolling) => "CONNECTED:HTTP-POLLING",
            ClientStatus::Stalled => "STALLED",
            ClientStatus::WillRetry => "DISCONNECTED:WILL-RETRY",
            ClientStatus::TryingRecovery => "DISCONNECTED:TRYING-RECOVERY",
            ClientStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_parse() {
        assert_eq!("unlimited".parse::<Bandwidth>().unwrap(), Bandwidth::Unlimited);
        assert_eq!("unmanaged".parse::<Bandwidth>().unwrap(), Bandwidth::Unmanaged);
        assert_eq!("12.5".parse::<Bandwidth>().unwrap(), Bandwidth::Limited(12.5));
        assert!("12.".parse::<Bandwidth>().is_err());
        assert!("-3".parse::<Bandwidth>().is_err());
    }

    #[test]
    fn test_bandwidth_wire() {
        assert_eq!(Bandwidth::Limited(40.0).to_wire(), "40");
        assert_eq!(Bandwidth::Limited(0.5).to_wire(), "0.5");
        assert_eq!(Bandwidth::Unlimited.to_wire(), "unlimited");
    }

    #[test]
    fn test_status_literals() {
        assert_eq!(ClientStatus::Connecting.as_str(), "CONNECTING");
        assert_eq!(ClientStatus::StreamSensing.as_str(), "CONNECTED:STREAM-SENSING");
        assert_eq!(
            ClientStatus::Connected(Transport::WsStreaming).as_str(),
            "CONNECTED:WS-STREAMING"
        );
        assert_eq!(
            ClientStatus::Connected(Transport::HttpPolling).as_str(),
            "CONNECTED:HTTP-POLLING"
        );
        assert_eq!(ClientStatus::TryingRecovery.as_str(), "DISCONNECTED:TRYING-RECOVERY");
    }

    #[test]
    fn test_forced_transport_parse() {
        assert_eq!("WS".parse::<ForcedTransport>().unwrap(), ForcedTransport::Ws);
        let exact: ForcedTransport = "HTTP-POLLING".parse().unwrap();
        assert_eq!(exact.polling(), Some(true));
        assert_eq!(exact.ws(), Some(false));
        assert!("SMOKE-SIGNALS".parse::<ForcedTransport>().is_err());
    }

    #[test]
    fn test_transport_axes() {
        let t = Transport::new(true, false);
        assert_eq!(t, Transport::WsStreaming);
        assert_eq!(t.to_polling(), Transport::WsPolling);
        assert!(!Transport::HttpStreaming.is_ws());
    }
}
