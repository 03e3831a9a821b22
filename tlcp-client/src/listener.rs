//! Response dispatch of control requests
//!
//! A [`ControlListener`] turns the server's answer to one control request
//! into a [`ProtocolEvent::ControlResponse`] and tells the request's tutor
//! that an answer arrived. What the answer means for the caller (a refused
//! subscription, an acknowledged message) is decided further up from the
//! [`ControlKind`].
//!
//! Copies of a request made for retransmission share one listener state, so
//! whichever answer comes first is the only one dispatched.

use crate::protocol::ProtocolEvent;
use crate::tutor::RequestTutor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tlcp_core::ClientRequest;

/// What a control request was about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    Subscribe { sub_id: u32 },
    Unsubscribe { sub_id: u32 },
    Reconfigure { sub_id: u32 },
    Constrain,
    ForceRebind,
    Destroy,
    Message { sequence: String, prog: u64 },
    Heartbeat,
    Mpn { req_id: u64, op: String },
    /// Create, bind and recovery requests
    Session,
}

impl ControlKind {
    pub fn of(request: &ClientRequest) -> Self {
        match request {
            ClientRequest::Subscribe { sub_id, .. } => ControlKind::Subscribe { sub_id: *sub_id },
            ClientRequest::Unsubscribe { sub_id, .. } => {
                ControlKind::Unsubscribe { sub_id: *sub_id }
            }
            ClientRequest::Reconfigure { sub_id, .. } => {
                ControlKind::Reconfigure { sub_id: *sub_id }
            }
            ClientRequest::Constrain { .. } => ControlKind::Constrain,
            ClientRequest::ForceRebind { .. } => ControlKind::ForceRebind,
            ClientRequest::Destroy { .. } => ControlKind::Destroy,
            ClientRequest::Message { message, .. } => ControlKind::Message {
                sequence: message.sequence.clone(),
                prog: message.prog,
            },
            ClientRequest::Heartbeat => ControlKind::Heartbeat,
            ClientRequest::Mpn { req_id, op, .. } => ControlKind::Mpn {
                req_id: *req_id,
                op: op.clone(),
            },
            ClientRequest::CreateSession { .. }
            | ClientRequest::RecoverSession { .. }
            | ClientRequest::BindSession { .. } => ControlKind::Session,
        }
    }
}

/// Result of a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Ok,
    Error { code: i32, message: String },
}

/// Dispatches the answer to one control request
#[derive(Debug, Clone)]
pub struct ControlListener {
    kind: ControlKind,
    completed: Arc<AtomicBool>,
}

impl ControlListener {
    pub fn for_request(request: &ClientRequest) -> Self {
        Self {
            kind: ControlKind::of(request),
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> &ControlKind {
        &self.kind
    }

    /// An answer was already dispatched
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn complete(&self) -> bool {
        let first = !self.completed.swap(true, Ordering::AcqRel);
        if !first {
            tracing::debug!(kind = ?self.kind, "duplicate answer ignored");
        }
        first
    }

    /// `REQOK`
    pub fn on_ok(&self, tutor: &dyn RequestTutor, out: &mut Vec<ProtocolEvent>) {
        if !self.complete() {
            return;
        }
        tutor.notify_response();
        out.push(ProtocolEvent::ControlResponse {
            kind: self.kind.clone(),
            outcome: ControlOutcome::Ok,
        });
    }

    /// `REQERR`
    pub fn on_error(
        &self,
        tutor: &dyn RequestTutor,
        code: i32,
        message: String,
        out: &mut Vec<ProtocolEvent>,
    ) {
        if !self.complete() {
            return;
        }
        tutor.notify_response();
        match self.kind {
            ControlKind::Destroy | ControlKind::ForceRebind | ControlKind::Constrain => {
                tracing::warn!(kind = ?self.kind, code, message = %message, "control request refused");
            }
            _ => {
                tracing::debug!(kind = ?self.kind, code, "control request refused");
            }
        }
        out.push(ProtocolEvent::ControlResponse {
            kind: self.kind.clone(),
            outcome: ControlOutcome::Error { code, message },
        });
    }
}
