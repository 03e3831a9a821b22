//! WebSocket transport on `tokio-tungstenite`
//!
//! Each connection runs in its own task: it opens the socket with the TLCP
//! subprotocol, writes the frames it is handed in order and reports every
//! line it reads. Text frames may carry several `\r\n`-terminated lines.

use crate::runtime::EventSink;
use crate::transport::{split_lines, ConnId, TransportEventKind, WsTransport};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tlcp_core::request::WS_SUBPROTOCOL;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

enum Outgoing {
    Frame(String),
    Close,
}

pub struct TungsteniteTransport {
    sink: EventSink,
    conns: HashMap<ConnId, mpsc::UnboundedSender<Outgoing>>,
}

impl TungsteniteTransport {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            conns: HashMap::new(),
        }
    }
}

impl WsTransport for TungsteniteTransport {
    fn connect(&mut self, conn: ConnId, url: String) {
        self.conns.retain(|_, tx| !tx.is_closed());
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.insert(conn, tx);
        tokio::spawn(run_connection(conn, url, rx, self.sink.clone()));
    }

    fn send(&mut self, conn: ConnId, frame: String) {
        let sent = self
            .conns
            .get(&conn)
            .map(|tx| tx.send(Outgoing::Frame(frame)).is_ok())
            .unwrap_or(false);
        if !sent {
            self.sink
                .post(conn, TransportEventKind::Broken("WebSocket not open".into()));
        }
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(tx) = self.conns.remove(&conn) {
            let _ = tx.send(Outgoing::Close);
        }
    }
}

async fn run_connection(
    conn: ConnId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            sink.post(conn, TransportEventKind::Broken(err.to_string()));
            return;
        }
    };
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));

    tracing::debug!(conn, url = %url, "opening WebSocket");
    let (stream, _) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(conn, error = %err, "WebSocket connection failed");
            sink.post(conn, TransportEventKind::Broken(err.to_string()));
            return;
        }
    };
    sink.post(conn, TransportEventKind::Open);

    let (mut write, mut read) = stream.split();
    let mut buffer = String::new();
    loop {
        tokio::select! {
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(err) = write.send(Message::Text(frame)).await {
                        sink.post(conn, TransportEventKind::Broken(err.to_string()));
                        return;
                    }
                    sink.post(conn, TransportEventKind::Written);
                }
                Some(Outgoing::Close) | None => {
                    let _ = write.close().await;
                    tracing::debug!(conn, "WebSocket closed");
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for line in split_lines(&mut buffer, &text) {
                        sink.post(conn, TransportEventKind::Message(line));
                    }
                    // A frame always ends on a line boundary
                    if !buffer.is_empty() {
                        let line = std::mem::take(&mut buffer);
                        sink.post(conn, TransportEventKind::Message(line));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    sink.post(conn, TransportEventKind::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    sink.post(conn, TransportEventKind::Broken(err.to_string()));
                    return;
                }
            },
        }
    }
}
