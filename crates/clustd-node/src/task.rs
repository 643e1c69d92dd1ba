//! Machine actor.
//!
//! Each [`Machine`] lives in its own task. The task is the only place the
//! machine is touched: handle commands, socket events and handler results
//! all arrive as messages and are applied one at a time, and every
//! [`MachineAction`] the machine returns is executed before the next message
//! is read.
//!
//! Handshake verdicts are awaited inline rather than spawned. A peer may send
//! its first request immediately after its own verdict, and that request has
//! to find the channel already bound on this side.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use clustd_core::{
    AttemptId, ChannelId, Environment, HandlerError, Machine, MachineAction, MachineError,
    MachineEvent, RequestError, RequestHandler, SecureChannel, Verdict, transport::Transport,
};
use clustd_proto::{Frame, RequestId};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{MissedTickBehavior, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    handle::MachineStatus,
    socket::{Outbound, SocketEvent, drive, framed, write_frame},
};

/// Requests from a [`crate::MachineHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop {
        done: oneshot::Sender<()>,
    },
    Connect {
        reject_on_fail: bool,
        reply: oneshot::Sender<Result<(), MachineError>>,
    },
    Send {
        method: String,
        params: Option<Value>,
        reply: oneshot::Sender<Result<Option<Value>, RequestError>>,
    },
}

/// Everything else the actor reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    Socket(SocketEvent),
    /// An accepted socket whose metadata header was already read
    Attach {
        channel: SecureChannel,
        outbound: mpsc::UnboundedSender<Outbound>,
        client_only: bool,
    },
    /// A spawned handler finished
    Handled {
        channel: Option<ChannelId>,
        req_id: RequestId,
        result: Result<Value, HandlerError>,
    },
}

pub(crate) struct MachineTask<E, T> {
    pub env: E,
    pub machine: Machine,
    pub transport: Arc<T>,
    pub handler: Arc<dyn RequestHandler>,
    pub commands: mpsc::Receiver<Command>,
    pub inputs: mpsc::UnboundedReceiver<Input>,
    pub input_tx: mpsc::UnboundedSender<Input>,
    pub events: broadcast::Sender<MachineEvent>,
    pub status: watch::Sender<MachineStatus>,
    pub sockets: HashMap<ChannelId, mpsc::UnboundedSender<Outbound>>,
    pub requests: HashMap<RequestId, oneshot::Sender<Result<Option<Value>, RequestError>>>,
    pub attempts: HashMap<AttemptId, oneshot::Sender<Result<(), MachineError>>>,
}

impl<E: Environment, T: Transport> MachineTask<E, T> {
    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.machine.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.on_command(command).await;
                },
                Some(input) = self.inputs.recv() => self.on_input(input).await,
                _ = ticker.tick() => {
                    let actions = self.machine.tick(&self.env);
                    self.execute(actions).await;
                },
            }
            self.publish();
        }

        let actions = self.machine.stop();
        self.execute(actions).await;
        self.publish();
        debug!(machine = %self.machine.label(), "Machine task exited");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => self.machine.start(self.env.now()),
            Command::Stop { done } => {
                let actions = self.machine.stop();
                self.execute(actions).await;
                let _ = done.send(());
            },
            Command::Connect { reject_on_fail, reply } => {
                match self.machine.connect(self.env.now(), reject_on_fail) {
                    Ok((attempt, mut actions)) => {
                        self.attempts.insert(attempt, reply);
                        // Fire now instead of waiting for the ticker.
                        actions.extend(self.machine.tick(&self.env));
                        self.execute(actions).await;
                    },
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    },
                }
            },
            Command::Send { method, params, reply } => {
                match self.machine.send(&self.env, method, params) {
                    Ok((req_id, actions)) => {
                        self.requests.insert(req_id, reply);
                        self.execute(actions).await;
                    },
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    },
                }
            },
        }
    }

    async fn on_input(&mut self, input: Input) {
        let actions = match input {
            Input::Socket(event) => self.on_socket(event),
            Input::Attach { channel, outbound, client_only } => {
                self.sockets.insert(channel.id(), outbound);
                self.machine.attach_inbound(&self.env, channel, client_only)
            },
            Input::Handled { channel, req_id, result } => {
                self.machine.respond(&self.env, channel, req_id, result)
            },
        };
        self.execute(actions).await;
    }

    fn on_socket(&mut self, event: SocketEvent) -> Vec<MachineAction> {
        let now = self.env.now();
        match event {
            SocketEvent::Opened { channel, outbound } => {
                if !self.machine.owns_channel(channel) {
                    // Dropping `outbound` releases the socket.
                    debug!(machine = %self.machine.label(), %channel, "Dropping stale socket");
                    return Vec::new();
                }
                self.sockets.insert(channel, outbound);
                self.machine.on_socket_open(&self.env, channel)
            },
            SocketEvent::ConnectFailed { channel, reason } => {
                self.machine.on_connect_failed(now, channel, &reason)
            },
            SocketEvent::Message { channel, envelope } => {
                self.machine.on_frame(&self.env, channel, &envelope)
            },
            SocketEvent::Ping { channel } => {
                self.machine.on_ping(now, channel);
                Vec::new()
            },
            SocketEvent::Pong { channel } => {
                self.machine.on_pong(now, channel);
                Vec::new()
            },
            SocketEvent::Closed { channel } => {
                self.sockets.remove(&channel);
                self.machine.on_socket_closed(now, channel)
            },
            SocketEvent::WriteFailed { request, reason, .. } => {
                self.machine.transmit_failed(request, &reason)
            },
        }
    }

    async fn execute(&mut self, actions: Vec<MachineAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                MachineAction::Connect { channel, host, metadata } => {
                    self.spawn_connect(channel, host, metadata);
                },
                MachineAction::Transmit { channel, envelope, request } => {
                    if !self.queue_frame(channel, Frame::message(envelope), request) {
                        queue.extend(self.machine.transmit_failed(request, "connection closed"));
                    }
                },
                MachineAction::Ping { channel } => {
                    self.queue_frame(channel, Frame::ping(), None);
                },
                MachineAction::CloseSocket { channel } => {
                    self.sockets.remove(&channel);
                },
                MachineAction::VerifyHandshake { channel, peer } => {
                    let limit = self.machine.config().verdict_timeout;
                    let verdict = timeout(limit, self.handler.verdict(&peer))
                        .await
                        .unwrap_or(Verdict::Undetermined);
                    queue.extend(self.machine.handshake_verdict(self.env.now(), channel, verdict));
                },
                MachineAction::HandleRequest { channel, req_id, method, params } => {
                    self.spawn_handler(channel, req_id, method, params);
                },
                MachineAction::CompleteRequest { req_id, result } => {
                    if let Some(reply) = self.requests.remove(&req_id) {
                        let _ = reply.send(result);
                    }
                },
                MachineAction::ConnectionSettled { attempt, result } => {
                    if let Some(reply) = self.attempts.remove(&attempt) {
                        let _ = reply.send(result);
                    }
                },
                MachineAction::Emit(event) => {
                    info!(machine = %self.machine.label(), ?event, "Machine event");
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                },
            }
        }
    }

    /// Hand a frame to the socket task. False if the socket is gone.
    fn queue_frame(&self, channel: ChannelId, frame: Frame, request: Option<RequestId>) -> bool {
        self.sockets
            .get(&channel)
            .is_some_and(|socket| socket.send(Outbound { frame, request }).is_ok())
    }

    fn spawn_connect(&self, channel: ChannelId, host: String, metadata: String) {
        let transport = Arc::clone(&self.transport);
        let events = self.input_tx.clone();
        let limit = self.machine.config().connect_timeout;

        tokio::spawn(async move {
            let report = |event: SocketEvent| {
                let _ = events.send(Input::Socket(event));
            };

            let stream = match timeout(limit, transport.connect(&host)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return report(SocketEvent::ConnectFailed { channel, reason: e.to_string() });
                },
                Err(_) => {
                    return report(SocketEvent::ConnectFailed {
                        channel,
                        reason: "ETIMEDOUT".to_string(),
                    });
                },
            };

            let mut socket = framed(stream);
            if let Err(e) = write_frame(&mut socket, &Frame::metadata(&metadata)).await {
                warn!(%host, error = %e, "Failed to write connection metadata");
                return report(SocketEvent::ConnectFailed { channel, reason: e.to_string() });
            }

            let (outbound, queue) = mpsc::unbounded_channel();
            report(SocketEvent::Opened { channel, outbound });
            drive(channel, socket, queue, events).await;
        });
    }

    fn spawn_handler(
        &self,
        channel: Option<ChannelId>,
        req_id: RequestId,
        method: String,
        params: Option<Value>,
    ) {
        let handler = Arc::clone(&self.handler);
        let inputs = self.input_tx.clone();
        tokio::spawn(async move {
            let result = handler.handle(&method, params).await;
            let _ = inputs.send(Input::Handled { channel, req_id, result });
        });
    }

    fn publish(&self) {
        let next = MachineStatus::of(&self.machine);
        self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });
    }
}
