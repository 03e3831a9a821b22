//! Transport collaborator interface
//!
//! The session layer never touches sockets. It asks an [`HttpTransport`] or a
//! [`WsTransport`] to open connections and send bytes, and gets everything
//! back as [`TransportEvent`]s posted to the session executor. Each physical
//! connection is named by a [`ConnId`] allocated by the session layer, so
//! events for connections nobody owns any more are simply dropped.

use tlcp_core::{Error, Result};

/// Identifier of one physical connection
pub type ConnId = u64;

/// An HTTP POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub body: String,
}

/// HTTP side of the transport
///
/// Every request uses its own connection id. The response body is reported
/// line by line, then `Closed`; failures are `Broken`.
pub trait HttpTransport: Send {
    fn send(&mut self, conn: ConnId, request: HttpRequest);

    /// Abandon the connection; no further events are expected
    fn close(&mut self, conn: ConnId);
}

/// WebSocket side of the transport
///
/// `connect` is answered by `Open` or `Broken`. Each `send` is answered by
/// `Written` once the frame is on the wire, in send order.
pub trait WsTransport: Send {
    fn connect(&mut self, conn: ConnId, url: String);

    fn send(&mut self, conn: ConnId, frame: String);

    fn close(&mut self, conn: ConnId);
}

/// What happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Connection established (HTTP: response headers received)
    Open,
    /// One line of the response stream, without terminator
    Message(String),
    /// A WebSocket frame was written
    Written,
    /// Orderly end of the stream
    Closed,
    /// The connection failed
    Broken(String),
}

/// Event reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub conn: ConnId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(conn: ConnId, kind: TransportEventKind) -> Self {
        Self { conn, kind }
    }
}

/// Split a received chunk into complete lines, keeping the remainder
///
/// Lines end in `\r\n` or `\n`; `buffer` holds the incomplete tail between
/// calls.
pub fn split_lines(buffer: &mut String, chunk: &str) -> Vec<String> {
    buffer.push_str(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let mut line: String = buffer.drain(..=pos).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Cuts a byte stream into lines
///
/// A multi-byte character may straddle two chunks; only an incomplete
/// sequence at the end of a chunk is held back.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk`, pushing every completed line to `lines`
    ///
    /// Lines completed before an invalid byte are still pushed; the stream
    /// cannot be read past it.
    pub fn push(&mut self, chunk: &[u8], lines: &mut Vec<String>) -> Result<()> {
        self.pending.extend_from_slice(chunk);
        let (valid, invalid) = match std::str::from_utf8(&self.pending) {
            Ok(text) => (text.len(), false),
            Err(err) => (err.valid_up_to(), err.error_len().is_some()),
        };
        let bytes: Vec<u8> = self.pending.drain(..valid).collect();
        let text = String::from_utf8(bytes).map_err(|err| Error::Transport(err.to_string()))?;
        lines.extend(split_lines(&mut self.buffer, &text));
        if invalid {
            return Err(Error::Transport("invalid UTF-8 in response".into()));
        }
        Ok(())
    }

    /// End of stream; returns the unterminated last line, if any
    pub fn finish(&mut self) -> Result<Option<String>> {
        if !self.pending.is_empty() {
            return Err(Error::Transport("response ends inside a character".into()));
        }
        let tail = std::mem::take(&mut self.buffer);
        Ok((!tail.is_empty()).then_some(tail))
    }
}
