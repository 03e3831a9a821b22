//! Error types for tlcp
//!
//! This module provides the error taxonomy shared by every tlcp crate. It
//! defines two things:
//!
//! - **Error**: Application-level errors for internal use (uses thiserror)
//! - **ServerErrorKind**: The classification of numeric error codes carried by
//!   `CONERR`, `END`, `REQERR` and `ERROR` lines into the action the session
//!   has to take
//!
//! # Error Categories
//!
//! TLCP failures fall into five families, and each one is handled differently
//! by the session layer:
//!
//! 1. **Parse errors**: a malformed server line. Always fatal to the current
//!    stream and reported as protocol error code `61`.
//! 2. **Server-declared errors**: `CONERR`/`END` codes, each with its own
//!    recovery policy (see [`ServerErrorKind`]).
//! 3. **Control-request errors**: `REQERR` on a specific request, routed to
//!    that request's listener.
//! 4. **Transport failures**: broken or unexpectedly closed sockets, treated
//!    uniformly as an interruption.
//! 5. **Internal invariant violations**: unexpected state during a callback.
//!    The session is forced `OFF`.
//!
//! # Examples
//!
//! ```rust
//! use tlcp_core::{Error, ServerErrorKind};
//!
//! let kind = ServerErrorKind::classify(41, false);
//! assert_eq!(kind, ServerErrorKind::Takeover);
//!
//! let error = Error::parse("LOOP,x", "invalid pause");
//! assert_eq!(error.code(), Some(61));
//! ```

use thiserror::Error;

/// Protocol error code used for every malformed or out-of-place server line.
pub const PROTOCOL_ERROR_CODE: i32 = 61;

/// Result type for tlcp operations
///
/// This is a convenience type alias that uses the tlcp `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for tlcp operations
///
/// # Usage with thiserror
///
/// This enum uses the `thiserror` crate to automatically implement
/// `std::error::Error` and provide readable messages. It is `Clone` so the
/// same failure can be fanned out to several waiting callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A server line could not be parsed
    ///
    /// Always surfaced with protocol code 61.
    #[error("Malformed message '{line}': {reason}")]
    Parse {
        /// The offending line, verbatim
        line: String,
        /// Why it was rejected
        reason: String,
    },

    /// A server-declared error (`CONERR`, `END`, `ERROR`)
    #[error("Server error {code}: {message}")]
    Server {
        /// Numeric code sent by the server
        code: i32,
        /// Decoded message sent by the server
        message: String,
    },

    /// A control request was refused by the server (`REQERR`)
    #[error("Control request refused ({code}): {message}")]
    Control {
        /// Numeric code sent by the server
        code: i32,
        /// Decoded message sent by the server
        message: String,
    },

    /// Transport layer failure (socket broken, connect refused, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation was attempted in a state that does not allow it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A caller-supplied value was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No session is active
    #[error("Not connected")]
    NotConnected,

    /// The session executor is gone
    #[error("Session executor channel closed")]
    ChannelClosed,

    /// Serialization or deserialization error (configuration loading)
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a parse error for `line`
    pub fn parse(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Numeric protocol code associated with this error, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Parse { .. } => Some(PROTOCOL_ERROR_CODE),
            Error::Server { code, .. } | Error::Control { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// The action implied by a server error code
///
/// | code     | kind            | session action                               |
/// |----------|-----------------|----------------------------------------------|
/// | 40, 41   | `Takeover`      | recreate the session                         |
/// | 48       | `Expiry`        | recreate the session                         |
/// | 20       | `SyncError`     | recreate, never recover                      |
/// | 4        | `RecoveryError` | recovery refused, recreate                   |
/// | 5        | `ServerBusy`    | retry at once (only when enabled)            |
/// | other    | `Fatal`         | close, notify the user, no retry             |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    /// The session was taken over or forcibly closed (codes 40, 41)
    Takeover,
    /// The session expired on the server (code 48)
    Expiry,
    /// Client and server lost synchronisation (code 20)
    SyncError,
    /// The server could not recover the session (code 4)
    RecoveryError,
    /// The server is temporarily overloaded (code 5)
    ServerBusy,
    /// Anything else: surfaced to the user
    Fatal,
}

impl ServerErrorKind {
    /// Classify a server error code
    ///
    /// `handle_server_busy` gates code 5; when off, code 5 is fatal like any
    /// other unlisted code.
    pub fn classify(code: i32, handle_server_busy: bool) -> Self {
        match code {
            40 | 41 => ServerErrorKind::Takeover,
            48 => ServerErrorKind::Expiry,
            20 => ServerErrorKind::SyncError,
            4 => ServerErrorKind::RecoveryError,
            5 if handle_server_busy => ServerErrorKind::ServerBusy,
            _ => ServerErrorKind::Fatal,
        }
    }
}

/// Remap codes the server reuses with a different meaning on the control path
///
/// Code 11 ("bad session" on a control request) is reported as CONERR 21.
pub fn remap_error_code(code: i32) -> i32 {
    if code == 11 {
        21
    } else {
        code
    }
}
