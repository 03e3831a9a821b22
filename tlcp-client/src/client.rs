//! TLCP client
//!
//! [`TlcpClient`] is the handle the application holds. It only turns calls
//! into [`Command`]s for the session executor; every piece of session state
//! lives in the executor task.
//!
//! # Client Lifecycle
//!
//! 1. **Build**: [`ClientBuilder`](crate::ClientBuilder) spawns the executor
//! 2. **Connect**: a session is created and kept alive, recovering or
//!    recreating it as the network allows
//! 3. **Use**: subscribe, send messages, watch events and status
//! 4. **Disconnect**: the session is destroyed on the server; `connect` may
//!    be called again
//!
//! # Cloning
//!
//! `TlcpClient` is cheaply cloneable. All clones drive the same executor,
//! which stops once the last clone is dropped.

use crate::notification::{ClientEvent, NotificationHandler};
use crate::runtime::{Command, Input};
use crate::session_manager::OutgoingMessage;
use crate::ClientMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tlcp_core::{Bandwidth, ClientStatus, Error, ForcedTransport, Frequency, Result, SubscriptionParams};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

struct Inner {
    inputs: mpsc::UnboundedSender<Input>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.inputs.send(Input::Command(Command::Shutdown));
    }
}

/// Client of a TLCP server
#[derive(Clone)]
pub struct TlcpClient {
    inner: Arc<Inner>,
    events: broadcast::Sender<ClientEvent>,
    status: watch::Receiver<ClientStatus>,
    notification_handler: NotificationHandler,
    next_sub_id: Arc<AtomicU32>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl TlcpClient {
    pub(crate) fn new(
        inputs: mpsc::UnboundedSender<Input>,
        events: broadcast::Sender<ClientEvent>,
        status: watch::Receiver<ClientStatus>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let notification_handler = NotificationHandler::new();
        tokio::spawn(Self::dispatch_loop(events.subscribe(), notification_handler.clone()));
        Self {
            inner: Arc::new(Inner { inputs }),
            events,
            status,
            notification_handler,
            next_sub_id: Arc::new(AtomicU32::new(0)),
            metrics,
        }
    }

    async fn dispatch_loop(mut events: broadcast::Receiver<ClientEvent>, handler: NotificationHandler) {
        loop {
            match events.recv().await {
                Ok(event) => handler.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event handlers lagging; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inner
            .inputs
            .send(Input::Command(command))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Open a session; the client then keeps it alive until `disconnect`
    #[tracing::instrument(skip(self))]
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Destroy the session
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Subscribe; returns the id the subscription's events carry
    pub fn subscribe(&self, params: SubscriptionParams) -> Result<u32> {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.command(Command::Subscribe { sub_id, params })?;
        Ok(sub_id)
    }

    pub fn unsubscribe(&self, sub_id: u32) -> Result<()> {
        self.command(Command::Unsubscribe { sub_id })
    }

    pub fn reconfigure_subscription(&self, sub_id: u32, max_frequency: Frequency) -> Result<()> {
        self.command(Command::Reconfigure {
            sub_id,
            max_frequency,
        })
    }

    /// Send a message; resolves to its progressive within its sequence
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<u64> {
        let (reply, prog) = oneshot::channel();
        self.command(Command::SendMessage { message, reply })?;
        prog.await.map_err(|_| Error::ChannelClosed)
    }

    pub fn set_requested_max_bandwidth(&self, bandwidth: Bandwidth) -> Result<()> {
        self.command(Command::SetRequestedMaxBandwidth(bandwidth))
    }

    /// Pin the transport; `None` lets the client choose
    pub fn set_forced_transport(&self, forced: Option<ForcedTransport>) -> Result<()> {
        self.command(Command::SetForcedTransport(forced))
    }

    pub fn set_reverse_heartbeat_interval(&self, interval_ms: u64) -> Result<()> {
        self.command(Command::SetReverseHeartbeatInterval(interval_ms))
    }

    /// Issue an MPN operation with caller-built parameters; resolves to the
    /// request id its [`ClientEvent::MpnResponse`] carries
    pub async fn mpn(&self, op: impl Into<String>, params: Vec<(String, String)>) -> Result<u64> {
        let (reply, req_id) = oneshot::channel();
        self.command(Command::Mpn {
            op: op.into(),
            params,
            reply,
        })?;
        req_id.await.map_err(|_| Error::ChannelClosed)
    }

    /// Current status
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Wait until the status satisfies `wanted`
    pub async fn wait_for_status(&self, wanted: impl FnMut(&ClientStatus) -> bool) -> Result<ClientStatus> {
        let mut status = self.status.clone();
        let reached = status.wait_for(wanted).await.map_err(|_| Error::ChannelClosed)?;
        Ok(*reached)
    }

    /// Receiver of every event from now on
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Register an async handler for events named `name`
    /// (see [`ClientEvent::name`])
    pub async fn on_event<F, Fut>(&self, name: &'static str, handler: F)
    where
        F: Fn(ClientEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notification_handler.register(name, handler).await;
    }

    pub fn metrics(&self) -> Option<&Arc<ClientMetrics>> {
        self.metrics.as_ref()
    }

    /// Stop the executor without destroying the session on the server
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached() -> (TlcpClient, mpsc::UnboundedReceiver<Input>, watch::Sender<ClientStatus>) {
        let (inputs, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let (status_tx, status) = watch::channel(ClientStatus::Disconnected);
        (TlcpClient::new(inputs, events, status, None), rx, status_tx)
    }

    #[tokio::test]
    async fn test_subscription_ids_are_assigned() {
        let (client, mut rx, _status) = detached();
        let params = SubscriptionParams::new(tlcp_core::SubscriptionMode::Merge, "item1", "last_price");
        assert_eq!(client.subscribe(params.clone()).unwrap(), 1);
        assert_eq!(client.subscribe(params).unwrap(), 2);
        assert!(matches!(
            rx.recv().await,
            Some(Input::Command(Command::Subscribe { sub_id: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_closed_executor() {
        let (client, rx, _status) = detached();
        drop(rx);
        assert!(matches!(client.connect(), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_last_clone_shuts_down() {
        let (client, mut rx, _status) = detached();
        let clone = client.clone();
        drop(client);
        assert!(rx.try_recv().is_err());
        drop(clone);
        assert!(matches!(rx.recv().await, Some(Input::Command(Command::Shutdown))));
    }

    #[tokio::test]
    async fn test_status_watch() {
        let (client, _rx, status) = detached();
        assert_eq!(client.status(), ClientStatus::Disconnected);
        status.send_replace(ClientStatus::Connecting);
        let reached = client
            .wait_for_status(|s| *s == ClientStatus::Connecting)
            .await
            .unwrap();
        assert_eq!(reached, ClientStatus::Connecting);
    }
}
