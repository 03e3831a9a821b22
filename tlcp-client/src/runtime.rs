//! Session executor
//!
//! A single tokio task owns the [`SessionManager`] and its [`Environment`]
//! and is the only place where session, protocol and request manager state
//! changes. Commands from [`TlcpClient`](crate::TlcpClient), transport
//! events and fired timers all reach it as [`Input`]s on one unbounded
//! channel, which serialises them.
//!
//! Notifications leave through a broadcast channel; the latest status is
//! also kept in a watch channel so it can be read without subscribing.

use crate::environment::Environment;
use crate::notification::ClientEvent;
use crate::scheduler::{Scheduler, TimerTask};
use crate::session_manager::{OutgoingMessage, SessionManager};
use crate::transport::{ConnId, TransportEvent, TransportEventKind};
use std::time::Duration;
use tlcp_core::{Bandwidth, ClientStatus, ForcedTransport, Frequency, SubscriptionParams};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Request from the application
#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect,
    Subscribe {
        sub_id: u32,
        params: SubscriptionParams,
    },
    Unsubscribe {
        sub_id: u32,
    },
    Reconfigure {
        sub_id: u32,
        max_frequency: Frequency,
    },
    SendMessage {
        message: OutgoingMessage,
        reply: oneshot::Sender<u64>,
    },
    SetRequestedMaxBandwidth(Bandwidth),
    SetForcedTransport(Option<ForcedTransport>),
    SetReverseHeartbeatInterval(u64),
    Mpn {
        op: String,
        params: Vec<(String, String)>,
        reply: oneshot::Sender<u64>,
    },
    /// Stop the executor without contacting the server
    Shutdown,
}

/// Everything the executor reacts to
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Transport(TransportEvent),
    Timer(TimerTask),
}

/// Handle transports use to post their events to the executor
#[derive(Debug, Clone)]
pub struct EventSink {
    inputs: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    pub fn new(inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { inputs }
    }

    pub fn post(&self, conn: ConnId, kind: TransportEventKind) {
        if self
            .inputs
            .send(Input::Transport(TransportEvent::new(conn, kind)))
            .is_err()
        {
            tracing::trace!(conn, "executor gone; transport event dropped");
        }
    }
}

/// Timers as spawned sleeps posting back to the executor
pub struct TokioScheduler {
    inputs: mpsc::UnboundedSender<Input>,
}

impl TokioScheduler {
    pub fn new(inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { inputs }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&mut self, delay: Duration, task: TimerTask) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The executor may be gone
            let _ = inputs.send(Input::Timer(task));
        });
    }
}

/// Owner of the session state
pub struct Executor {
    env: Environment,
    manager: SessionManager,
    inputs: mpsc::UnboundedReceiver<Input>,
    events: broadcast::Sender<ClientEvent>,
    status: watch::Sender<ClientStatus>,
}

impl Executor {
    pub fn new(
        env: Environment,
        inputs: mpsc::UnboundedReceiver<Input>,
        events: broadcast::Sender<ClientEvent>,
        status: watch::Sender<ClientStatus>,
    ) -> Self {
        Self {
            env,
            manager: SessionManager::new(),
            inputs,
            events,
            status,
        }
    }

    /// Process inputs until shutdown or until every sender is gone
    pub async fn run(mut self) {
        tracing::debug!("session executor started");
        while let Some(input) = self.inputs.recv().await {
            if !self.step(input) {
                break;
            }
        }
        self.manager.shutdown(&mut self.env);
        tracing::debug!("session executor stopped");
    }

    /// Process one input; returns `false` on shutdown
    pub fn step(&mut self, input: Input) -> bool {
        let mut out = Vec::new();
        let env = &mut self.env;
        match input {
            Input::Transport(event) => self.manager.on_transport(env, &event, &mut out),
            Input::Timer(task) => self.manager.on_timer(env, task, &mut out),
            Input::Command(command) => match command {
                Command::Connect => self.manager.connect(env, &mut out),
                Command::Disconnect => self.manager.disconnect(env, &mut out),
                Command::Subscribe { sub_id, params } => {
                    self.manager.subscribe(env, sub_id, params, &mut out);
                }
                Command::Unsubscribe { sub_id } => self.manager.unsubscribe(env, sub_id, &mut out),
                Command::Reconfigure {
                    sub_id,
                    max_frequency,
                } => self.manager.reconfigure(env, sub_id, max_frequency, &mut out),
                Command::SendMessage { message, reply } => {
                    let prog = self.manager.send_message(env, message, &mut out);
                    let _ = reply.send(prog);
                }
                Command::SetRequestedMaxBandwidth(bandwidth) => {
                    self.manager.set_requested_max_bandwidth(env, bandwidth, &mut out);
                }
                Command::SetForcedTransport(forced) => {
                    self.manager.set_forced_transport(env, forced, &mut out);
                }
                Command::SetReverseHeartbeatInterval(interval_ms) => {
                    self.manager.set_reverse_heartbeat_interval(env, interval_ms);
                }
                Command::Mpn { op, params, reply } => {
                    let req_id = self.manager.mpn(env, op, params, &mut out);
                    let _ = reply.send(req_id);
                }
                Command::Shutdown => {
                    self.manager.shutdown(env);
                    self.publish(out);
                    return false;
                }
            },
        }
        self.publish(out);
        true
    }

    fn publish(&self, out: Vec<ClientEvent>) {
        for event in out {
            if let ClientEvent::StatusChanged(status) = event {
                self.status.send_replace(status);
            }
            // No subscriber is not an error
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TimerKind;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_posts_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let task = TimerTask {
            session: 3,
            kind: TimerKind::Heartbeat { phase: 1 },
        };
        scheduler.schedule(Duration::from_secs(5), task);
        match rx.recv().await {
            Some(Input::Timer(fired)) => assert_eq!(fired, task),
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_sink_after_executor_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        EventSink::new(tx).post(1, TransportEventKind::Closed);
    }
}
