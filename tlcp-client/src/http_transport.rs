//! HTTP transport on `reqwest`
//!
//! Each request is a POST whose response body is read as a stream and cut
//! into lines as chunks arrive, so one request can carry a long-lived
//! streaming session as well as a single poll or control response.

use crate::runtime::EventSink;
use crate::transport::{ConnId, HttpRequest, HttpTransport, LineDecoder, TransportEventKind};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::task::AbortHandle;

pub struct ReqwestTransport {
    client: reqwest::Client,
    sink: EventSink,
    tasks: HashMap<ConnId, AbortHandle>,
}

impl ReqwestTransport {
    pub fn new(sink: EventSink) -> Self {
        Self::with_client(reqwest::Client::new(), sink)
    }

    pub fn with_client(client: reqwest::Client, sink: EventSink) -> Self {
        Self {
            client,
            sink,
            tasks: HashMap::new(),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&mut self, conn: ConnId, request: HttpRequest) {
        self.tasks.retain(|_, task| !task.is_finished());
        let task = tokio::spawn(run_request(conn, self.client.clone(), request, self.sink.clone()));
        self.tasks.insert(conn, task.abort_handle());
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(task) = self.tasks.remove(&conn) {
            task.abort();
        }
    }
}

async fn run_request(conn: ConnId, client: reqwest::Client, request: HttpRequest, sink: EventSink) {
    tracing::trace!(conn, url = %request.url, "POST");
    let response = client
        .post(&request.url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(request.body)
        .send()
        .await;
    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let reason = format!("HTTP {}", response.status());
            sink.post(conn, TransportEventKind::Broken(reason));
            return;
        }
        Err(err) => {
            tracing::debug!(conn, error = %err, "HTTP request failed");
            sink.post(conn, TransportEventKind::Broken(err.to_string()));
            return;
        }
    };
    sink.post(conn, TransportEventKind::Open);

    let mut body = response.bytes_stream();
    let mut decoder = LineDecoder::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                sink.post(conn, TransportEventKind::Broken(err.to_string()));
                return;
            }
        };
        let mut lines = Vec::new();
        let decoded = decoder.push(&chunk, &mut lines);
        for line in lines {
            sink.post(conn, TransportEventKind::Message(line));
        }
        if let Err(err) = decoded {
            tracing::warn!(conn, error = %err, "unreadable response body");
            sink.post(conn, TransportEventKind::Broken(err.to_string()));
            return;
        }
    }
    match decoder.finish() {
        Ok(Some(line)) => sink.post(conn, TransportEventKind::Message(line)),
        Ok(None) => {}
        Err(err) => {
            sink.post(conn, TransportEventKind::Broken(err.to_string()));
            return;
        }
    }
    sink.post(conn, TransportEventKind::Closed);
}
