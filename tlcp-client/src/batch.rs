//! Control request queues
//!
//! Requests waiting to be sent are kept in four [`BatchRequest`] queues, one
//! per [`BatchKind`]. A queue is FIFO, but some requests carry a key, and a
//! queue never holds two unsent requests with the same key: the newer one
//! takes the older one's place in the queue and the older one's tutor is
//! told it was aborted.
//!
//! # Keys
//!
//! | request                     | queue     | key                 |
//! |-----------------------------|-----------|---------------------|
//! | message                     | message   | none (never merged) |
//! | heartbeat                   | heartbeat | none (never merged) |
//! | constrain                   | control   | `C`                 |
//! | force-rebind                | control   | `F`                 |
//! | subscribe / unsubscribe     | control   | `sub:<subId>`       |
//! | reconfigure                 | control   | `reconf:<subId>`    |
//! | MPN                         | control   | `mpn:<reqId>`       |
//! | destroy                     | destroy   | `destroy:<session>` |
//!
//! A queued subscribe is replaced by an unsubscribe of the same
//! subscription; a second unsubscribe for a subscription that already has one
//! queued is dropped instead.

use crate::listener::ControlListener;
use crate::tutor::RequestTutor;
use std::collections::VecDeque;
use std::sync::Arc;
use tlcp_core::ClientRequest;

/// A request with its tutor and response listener
#[derive(Debug, Clone)]
pub struct RequestObjects {
    pub request: ClientRequest,
    pub tutor: Arc<dyn RequestTutor>,
    pub listener: ControlListener,
    /// Server the request must go to instead of the session's current one
    pub server: Option<String>,
}

impl RequestObjects {
    pub fn new(request: ClientRequest, tutor: Arc<dyn RequestTutor>) -> Self {
        let listener = ControlListener::for_request(&request);
        Self {
            request,
            tutor,
            listener,
            server: None,
        }
    }

    /// Pin the request to `server`
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// The four request queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Message,
    Control,
    Destroy,
    Heartbeat,
}

impl BatchKind {
    /// Round-robin order of the queues
    pub const ALL: [BatchKind; 4] = [
        BatchKind::Message,
        BatchKind::Control,
        BatchKind::Destroy,
        BatchKind::Heartbeat,
    ];

    pub fn for_request(request: &ClientRequest) -> Self {
        match request {
            ClientRequest::Message { .. } => BatchKind::Message,
            ClientRequest::Heartbeat => BatchKind::Heartbeat,
            ClientRequest::Destroy { .. } => BatchKind::Destroy,
            _ => BatchKind::Control,
        }
    }

    /// Request name shared by every request of this queue
    pub fn request_name(&self) -> &'static str {
        match self {
            BatchKind::Message => "msg",
            BatchKind::Heartbeat => "heartbeat",
            BatchKind::Control | BatchKind::Destroy => "control",
        }
    }
}

fn key_of(request: &ClientRequest) -> Option<String> {
    match request {
        ClientRequest::Constrain { .. } => Some("C".to_string()),
        ClientRequest::ForceRebind { .. } => Some("F".to_string()),
        ClientRequest::Subscribe { sub_id, .. } | ClientRequest::Unsubscribe { sub_id, .. } => {
            Some(format!("sub:{sub_id}"))
        }
        ClientRequest::Reconfigure { sub_id, .. } => Some(format!("reconf:{sub_id}")),
        ClientRequest::Mpn { req_id, .. } => Some(format!("mpn:{req_id}")),
        ClientRequest::Destroy { session_id, .. } => Some(format!("destroy:{session_id}")),
        _ => None,
    }
}

#[derive(Debug)]
struct Entry {
    key: Option<String>,
    objects: RequestObjects,
}

/// One queue of unsent requests
#[derive(Debug)]
pub struct BatchRequest {
    kind: BatchKind,
    entries: VecDeque<Entry>,
}

impl BatchRequest {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            entries: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Queue `objects`, replacing a queued request with the same key
    ///
    /// Returns `false` if the new request was dropped in favour of the queued
    /// one.
    pub fn add(&mut self, objects: RequestObjects) -> bool {
        let key = key_of(&objects.request);
        let existing = key
            .as_deref()
            .and_then(|key| self.entries.iter().position(|e| e.key.as_deref() == Some(key)));

        let Some(pos) = existing else {
            self.entries.push_back(Entry { key, objects });
            return true;
        };

        let queued = &self.entries[pos].objects.request;
        if matches!(
            (queued, &objects.request),
            (ClientRequest::Unsubscribe { .. }, ClientRequest::Unsubscribe { .. })
        ) {
            tracing::debug!(key = ?key, "unsubscribe already queued");
            objects.tutor.notify_abort();
            return false;
        }
        if matches!(
            (queued, &objects.request),
            (ClientRequest::Unsubscribe { .. }, ClientRequest::Subscribe { .. })
        ) {
            tracing::warn!(key = ?key, "subscription id reused while its unsubscribe is queued");
        }

        let replaced = std::mem::replace(&mut self.entries[pos].objects, objects);
        replaced.tutor.notify_abort();
        true
    }

    /// Pop the oldest request
    pub fn shift(&mut self) -> Option<RequestObjects> {
        self.entries.pop_front().map(|entry| entry.objects)
    }

    /// Oldest request, without removing it
    pub fn first(&self) -> Option<&RequestObjects> {
        self.entries.front().map(|entry| &entry.objects)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every queued request, oldest first
    pub fn drain(&mut self) -> Vec<RequestObjects> {
        self.entries.drain(..).map(|entry| entry.objects).collect()
    }
}

/// The four queues with round-robin selection
#[derive(Debug)]
pub struct RequestQueues {
    queues: [BatchRequest; 4],
    next: usize,
}

impl Default for RequestQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueues {
    pub fn new() -> Self {
        Self {
            queues: BatchKind::ALL.map(BatchRequest::new),
            next: 0,
        }
    }

    /// Queue `objects` in the queue of its kind
    pub fn add(&mut self, objects: RequestObjects) -> bool {
        let kind = BatchKind::for_request(&objects.request);
        self.queue_mut(kind).add(objects)
    }

    pub fn queue(&self, kind: BatchKind) -> &BatchRequest {
        &self.queues[Self::index(kind)]
    }

    pub fn queue_mut(&mut self, kind: BatchKind) -> &mut BatchRequest {
        &mut self.queues[Self::index(kind)]
    }

    /// Next non-empty queue in round-robin order
    pub fn next_queue(&mut self) -> Option<BatchKind> {
        for offset in 0..self.queues.len() {
            let idx = (self.next + offset) % self.queues.len();
            if !self.queues[idx].is_empty() {
                self.next = (idx + 1) % self.queues.len();
                return Some(self.queues[idx].kind());
            }
        }
        None
    }

    /// Pop one request from the next non-empty queue
    pub fn shift(&mut self) -> Option<RequestObjects> {
        let kind = self.next_queue()?;
        self.queue_mut(kind).shift()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(BatchRequest::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(BatchRequest::is_empty)
    }

    /// Take every queued request
    pub fn drain(&mut self) -> Vec<RequestObjects> {
        self.queues.iter_mut().flat_map(BatchRequest::drain).collect()
    }

    fn index(kind: BatchKind) -> usize {
        match kind {
            BatchKind::Message => 0,
            BatchKind::Control => 1,
            BatchKind::Destroy => 2,
            BatchKind::Heartbeat => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tutor::{ControlTutor, VoidTutor};
    use tlcp_core::{MessageParams, SubscriptionMode, SubscriptionParams};

    fn subscribe(sub_id: u32) -> RequestObjects {
        RequestObjects::new(
            ClientRequest::Subscribe {
                req_id: 1,
                sub_id,
                params: SubscriptionParams::new(SubscriptionMode::Merge, "g", "s"),
            },
            ControlTutor::shared(),
        )
    }

    fn unsubscribe(sub_id: u32) -> RequestObjects {
        RequestObjects::new(
            ClientRequest::Unsubscribe { req_id: 2, sub_id },
            ControlTutor::shared(),
        )
    }

    fn message(prog: u64) -> RequestObjects {
        RequestObjects::new(
            ClientRequest::Message {
                req_id: prog,
                message: MessageParams {
                    text: "hi".into(),
                    sequence: "seq".into(),
                    prog,
                    max_wait_ms: None,
                    outcome: true,
                },
            },
            ControlTutor::shared(),
        )
    }

    #[test]
    fn test_unsubscribe_replaces_queued_subscribe() {
        let mut queue = BatchRequest::new(BatchKind::Control);
        let sub = subscribe(5);
        let sub_tutor = sub.tutor.clone();
        queue.add(sub);
        assert!(queue.add(unsubscribe(5)));

        assert_eq!(queue.len(), 1);
        assert_eq!(sub_tutor.state().abort_count(), 1);
        assert!(matches!(
            queue.shift().map(|o| o.request),
            Some(ClientRequest::Unsubscribe { sub_id: 5, .. })
        ));
    }

    #[test]
    fn test_second_unsubscribe_is_dropped() {
        let mut queue = BatchRequest::new(BatchKind::Control);
        let first = unsubscribe(5);
        let first_tutor = first.tutor.clone();
        queue.add(first);
        let second = unsubscribe(5);
        let second_tutor = second.tutor.clone();
        assert!(!queue.add(second));
        assert_eq!(queue.len(), 1);
        assert_eq!(first_tutor.state().abort_count(), 0);
        assert_eq!(second_tutor.state().abort_count(), 1);
    }

    #[test]
    fn test_substitution_keeps_position() {
        let mut queue = BatchRequest::new(BatchKind::Control);
        queue.add(RequestObjects::new(
            ClientRequest::Constrain {
                req_id: 1,
                bandwidth: tlcp_core::Bandwidth::Limited(10.0),
            },
            ControlTutor::shared(),
        ));
        queue.add(subscribe(1));
        queue.add(RequestObjects::new(
            ClientRequest::Constrain {
                req_id: 3,
                bandwidth: tlcp_core::Bandwidth::Unlimited,
            },
            ControlTutor::shared(),
        ));
        assert_eq!(queue.len(), 2);
        assert!(matches!(
            queue.shift().map(|o| o.request),
            Some(ClientRequest::Constrain { req_id: 3, .. })
        ));
        assert!(matches!(
            queue.shift().map(|o| o.request),
            Some(ClientRequest::Subscribe { sub_id: 1, .. })
        ));
    }

    #[test]
    fn test_messages_never_merged() {
        let mut queue = BatchRequest::new(BatchKind::Message);
        queue.add(message(1));
        queue.add(message(2));
        queue.add(message(3));
        assert_eq!(queue.len(), 3);
        let progs: Vec<u64> = queue
            .drain()
            .into_iter()
            .filter_map(|o| match o.request {
                ClientRequest::Message { message, .. } => Some(message.prog),
                _ => None,
            })
            .collect();
        assert_eq!(progs, vec![1, 2, 3]);
    }

    #[test]
    fn test_round_robin_over_queues() {
        let mut queues = RequestQueues::new();
        queues.add(subscribe(1));
        queues.add(subscribe(2));
        queues.add(message(1));
        queues.add(RequestObjects::new(ClientRequest::Heartbeat, VoidTutor::shared()));

        assert_eq!(queues.next_queue(), Some(BatchKind::Message));
        queues.queue_mut(BatchKind::Message).shift();
        assert_eq!(queues.next_queue(), Some(BatchKind::Control));
        queues.queue_mut(BatchKind::Control).shift();
        assert_eq!(queues.next_queue(), Some(BatchKind::Heartbeat));
        queues.queue_mut(BatchKind::Heartbeat).shift();
        assert_eq!(queues.next_queue(), Some(BatchKind::Control));
        assert_eq!(queues.len(), 1);
    }
}
