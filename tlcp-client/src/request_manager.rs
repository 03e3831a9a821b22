//! Contract shared by the HTTP and WebSocket request managers
//!
//! A request manager accepts [`RequestObjects`], gets them on the wire in
//! queue order, and routes the server's answers back to each request's
//! listener. What happens is reported to the protocol as [`ManagerEvent`]s.

use crate::batch::RequestObjects;
use crate::environment::Environment;
use crate::protocol::ProtocolEvent;

/// Something a request manager reports to the protocol
#[derive(Debug)]
pub enum ManagerEvent {
    /// The request was handed to the transport
    Sent(RequestObjects),
    /// A listener dispatched an answer
    Response(ProtocolEvent),
    /// The control channel failed in a way no single request accounts for
    Fatal { code: i32, message: String },
}

/// Delivery of control requests over one transport
pub trait RequestManager: Send {
    /// Queue `objects` and send it as soon as the transport allows
    fn add(&mut self, env: &mut Environment, objects: RequestObjects, events: &mut Vec<ManagerEvent>);

    /// Maximum body length the server accepts for one request
    fn set_request_limit(&mut self, limit: u64);

    /// Remove every request not yet written, oldest first
    fn take_unsent(&mut self) -> Vec<RequestObjects>;

    /// Move every unsent request to `target`, keeping tutors and listeners
    fn copy_to(
        &mut self,
        env: &mut Environment,
        target: &mut dyn RequestManager,
        events: &mut Vec<ManagerEvent>,
    ) {
        for objects in self.take_unsent() {
            target.add(env, objects, events);
        }
    }

    /// Drop the connection; nothing else will be sent
    fn close(&mut self, env: &mut Environment);
}
