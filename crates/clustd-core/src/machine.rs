//! Machine state machine: one peer relationship.
//!
//! A machine owns at most one bound [`SecureChannel`], any number of channels
//! still negotiating their handshake, the table of in-flight RPCs, and the
//! heartbeat and reconnect deadlines.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Operations take time (`now`) or an [`Environment`] as a parameter
//! - Operations return `Vec<MachineAction>` for the driver to execute
//! - The driver reports socket events back by [`ChannelId`]
//!
//! Every timer is a deadline in machine state and is evaluated by
//! [`Machine::tick`]. [`Machine::stop`] clears them, so nothing scheduled
//! before a stop can fire after it.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────────┐  start()  ┌────────────────┐  verdict=Accept  ┌──────────────┐
//! │ Inactive │──────────>│ Active, no     │─────────────────>│ Active,      │
//! └──────────┘           │ bound channel  │<─────────────────│ bound        │
//!      ^                 └────────────────┘  connection lost └──────────────┘
//!      │        stop()           │                                  │
//!      └─────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! While active without a bound channel, a reconnect is scheduled after
//! every failure except an explicit handshake rejection.
//!
//! # Timeouts
//!
//! See [`MachineConfig`]: heartbeat 1500ms with a 2x staleness window,
//! reconnect 5000ms, RPC 3000ms, handshake 5000ms, acceptance verdict 3000ms.

use std::{
    collections::BTreeMap,
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use clustd_proto::{Hello, MachineType, Message, Request, RequestId, Response};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelId, Inbound, Role, SecureChannel},
    config::MachineConfig,
    env::Environment,
    error::{HandshakeError, MachineError, RequestError},
    handler::{HandlerError, PeerInfo, Verdict},
    identity::LocalIdentity,
};

/// Identifies one connection attempt so its outcome can be reported once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

/// Observer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    /// A channel was bound to the peer
    Connected {
        /// Peer id adopted from its hello
        peer_id: String,
    },
    /// The bound channel went away
    ConnectionLost,
    /// A handshake did not complete
    HandshakeRejected {
        /// Whether this suppresses reconnection
        kind: HandshakeError,
    },
    /// The machine was stopped
    Stopped,
}

/// Actions returned by the machine.
///
/// The driver executes them in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineAction {
    /// Open an outbound socket to `host` and send `metadata` as its first
    /// frame. Report `on_socket_open` or `on_connect_failed`.
    Connect {
        /// Channel the socket belongs to
        channel: ChannelId,
        /// `address:port`
        host: String,
        /// Encrypted connection metadata header
        metadata: String,
    },

    /// Write an encrypted envelope to the socket.
    Transmit {
        /// Target channel
        channel: ChannelId,
        /// AEAD envelope
        envelope: Bytes,
        /// Request carried by this envelope, reported back through
        /// `transmit_failed` if the write fails
        request: Option<RequestId>,
    },

    /// Send a transport-level ping.
    Ping {
        /// Target channel
        channel: ChannelId,
    },

    /// Close the socket. No further events for this channel are expected.
    CloseSocket {
        /// Target channel
        channel: ChannelId,
    },

    /// Ask the application whether to accept the peer, then report
    /// `handshake_verdict`.
    VerifyHandshake {
        /// Channel under negotiation
        channel: ChannelId,
        /// What the peer declared
        peer: PeerInfo,
    },

    /// Run the request handler, then report `respond`.
    HandleRequest {
        /// Channel the request arrived on; `None` for a local dispatch
        channel: Option<ChannelId>,
        /// Request id to answer
        req_id: RequestId,
        /// Method name
        method: String,
        /// Method parameters
        params: Option<Value>,
    },

    /// An RPC started with `send` has its outcome.
    CompleteRequest {
        /// Request id returned by `send`
        req_id: RequestId,
        /// Response data or failure
        result: Result<Option<Value>, RequestError>,
    },

    /// A connection attempt from `schedule_connection` has its outcome.
    ConnectionSettled {
        /// Attempt id returned by `schedule_connection`
        attempt: AttemptId,
        /// Failures only surface when the attempt was scheduled with
        /// `reject_on_fail`
        result: Result<(), MachineError>,
    },

    /// Deliver an event to observers.
    Emit(MachineEvent),
}

#[derive(Debug, Clone, Copy)]
struct ConnectAttempt {
    id: AttemptId,
    reject_on_fail: bool,
}

#[derive(Debug)]
struct ScheduledConnect {
    at: Instant,
    attempt: ConnectAttempt,
}

#[derive(Debug)]
struct Handshake {
    channel: SecureChannel,
    client_only: bool,
    /// Set for outbound sockets opened by a scheduled connection
    attempt: Option<ConnectAttempt>,
    verdict_deadline: Option<Instant>,
    peer: Option<PeerInfo>,
}

/// Connection lifecycle, heartbeat and RPC correlation for one peer.
#[derive(Debug)]
pub struct Machine {
    machine_type: MachineType,
    identity: Arc<LocalIdentity>,
    config: MachineConfig,
    host: String,
    peer_id: Option<String>,
    local: bool,
    active: bool,
    diag_id: u64,

    channel: Option<SecureChannel>,
    bound_client_only: bool,
    handshakes: BTreeMap<ChannelId, Handshake>,

    pending: BTreeMap<RequestId, Instant>,
    next_request_id: RequestId,

    last_pong: Option<Instant>,
    heartbeat_at: Option<Instant>,
    reconnect: Option<ScheduledConnect>,
}

impl Machine {
    /// Create a machine for `host`.
    ///
    /// When `host` equals the identity's remote address this is the local
    /// machine: always active, always open, never connects.
    pub fn new(
        machine_type: MachineType,
        identity: Arc<LocalIdentity>,
        host: impl Into<String>,
        config: MachineConfig,
    ) -> Self {
        static NEXT_DIAG_ID: AtomicU64 = AtomicU64::new(0);

        let host = host.into();
        let local = identity.remote_address() == host;
        let machine = Self {
            machine_type,
            peer_id: local.then(|| identity.id().to_string()),
            identity,
            config,
            host,
            local,
            active: local,
            diag_id: NEXT_DIAG_ID.fetch_add(1, Ordering::Relaxed),
            channel: None,
            bound_client_only: false,
            handshakes: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_request_id: 0,
            last_pong: None,
            heartbeat_at: None,
            reconnect: None,
        };
        if local {
            info!(machine = %machine.label(), "Initialized local machine");
        }
        machine
    }

    /// Machine type.
    pub fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    /// Current reconnection target.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Peer id, once a handshake was accepted (or the local id).
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Whether this is the process's own machine.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Whether `start` was called and `stop` was not.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether `send` can succeed.
    pub fn is_open(&self) -> bool {
        self.local || (self.active && self.channel.as_ref().is_some_and(SecureChannel::is_open))
    }

    /// Id of the bound channel.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(SecureChannel::id)
    }

    /// Whether `channel` is bound or negotiating on this machine.
    pub fn owns_channel(&self, channel: ChannelId) -> bool {
        self.channel_id() == Some(channel) || self.handshakes.contains_key(&channel)
    }

    /// Number of RPCs awaiting an outcome.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Number of channels still negotiating.
    pub fn handshakes_in_flight(&self) -> usize {
        self.handshakes.len()
    }

    /// When the next scheduled connection fires.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect.as_ref().map(|scheduled| scheduled.at)
    }

    /// Timing configuration.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// `<peer id or host> (<diagnostic id>)`, used as the log prefix.
    pub fn label(&self) -> String {
        format!("{} ({})", self.peer_id.as_deref().unwrap_or(&self.host), self.diag_id)
    }

    /// Activate a remote machine and arm its heartbeat.
    pub fn start(&mut self, now: Instant) {
        if self.active || self.local {
            return;
        }
        self.active = true;
        self.heartbeat_at = Some(now + self.config.heartbeat_interval);
    }

    /// Deactivate: close every socket, clear every deadline, fail every
    /// pending RPC with [`RequestError::Stopped`].
    ///
    /// Idempotent. A second call returns no actions.
    pub fn stop(&mut self) -> Vec<MachineAction> {
        if self.local {
            return Vec::new();
        }

        let was_active = mem::replace(&mut self.active, false);
        let mut actions = Vec::new();

        if let Some(mut channel) = self.channel.take() {
            channel.close();
            actions.push(MachineAction::CloseSocket { channel: channel.id() });
        }
        for (id, mut handshake) in mem::take(&mut self.handshakes) {
            handshake.channel.close();
            actions.push(MachineAction::CloseSocket { channel: id });
            if let Some(attempt) = handshake.attempt {
                actions.push(settle(attempt, Err(MachineError::Stopped)));
            }
        }
        if let Some(scheduled) = self.reconnect.take() {
            actions.push(settle(scheduled.attempt, Err(MachineError::Stopped)));
        }

        self.heartbeat_at = None;
        self.last_pong = None;

        for req_id in mem::take(&mut self.pending).into_keys() {
            actions.push(MachineAction::CompleteRequest {
                req_id,
                result: Err(RequestError::Stopped),
            });
        }

        if was_active || !actions.is_empty() {
            info!(machine = %self.label(), "Machine stopped");
            actions.push(MachineAction::Emit(MachineEvent::Stopped));
        }
        actions
    }

    /// Schedule a connection attempt `delay` from `now`.
    ///
    /// Replaces any attempt already scheduled; the replaced attempt settles
    /// successfully. When it fires, the attempt is a no-op if the machine is
    /// inactive or already open.
    ///
    /// # Errors
    ///
    /// [`MachineError::LocalMachine`] for the local machine.
    pub fn schedule_connection(
        &mut self,
        now: Instant,
        delay: Duration,
        reject_on_fail: bool,
    ) -> Result<(AttemptId, Vec<MachineAction>), MachineError> {
        if self.local {
            return Err(MachineError::LocalMachine);
        }

        let attempt = ConnectAttempt { id: AttemptId::next(), reject_on_fail };
        let mut actions = Vec::new();
        if let Some(previous) = self.reconnect.replace(ScheduledConnect { at: now + delay, attempt })
        {
            actions.push(settle(previous.attempt, Ok(())));
        }
        Ok((attempt.id, actions))
    }

    /// Connect on the next tick.
    pub fn connect(
        &mut self,
        now: Instant,
        reject_on_fail: bool,
    ) -> Result<(AttemptId, Vec<MachineAction>), MachineError> {
        self.schedule_connection(now, Duration::ZERO, reject_on_fail)
    }

    /// Evaluate every deadline.
    pub fn tick<E: Environment>(&mut self, env: &E) -> Vec<MachineAction> {
        let now = env.now();
        let mut actions = Vec::new();

        self.expire_handshakes(now, &mut actions);
        self.expire_requests(now, &mut actions);

        if self.reconnect.as_ref().is_some_and(|scheduled| scheduled.at <= now)
            && let Some(scheduled) = self.reconnect.take()
        {
            self.fire_connect(env, scheduled.attempt, &mut actions);
        }

        self.heartbeat(now, &mut actions);
        actions
    }

    /// Outbound socket for `channel` opened.
    pub fn on_socket_open<E: Environment>(
        &mut self,
        env: &E,
        channel: ChannelId,
    ) -> Vec<MachineAction> {
        let mut actions = Vec::new();
        let Some(handshake) = self.handshakes.get_mut(&channel) else {
            return actions;
        };

        match handshake.channel.mark_open(env) {
            Ok(Some(envelope)) => {
                actions.push(MachineAction::Transmit { channel, envelope, request: None });
            },
            Ok(None) => {},
            Err(e) => self.fail_handshake(env.now(), channel, &e.to_string(), &mut actions),
        }
        actions
    }

    /// Outbound socket for `channel` could not be opened.
    pub fn on_connect_failed(
        &mut self,
        now: Instant,
        channel: ChannelId,
        reason: &str,
    ) -> Vec<MachineAction> {
        let mut actions = Vec::new();
        if let Some(handshake) = self.handshakes.remove(&channel) {
            self.attempt_failed(now, handshake.attempt, reason, &mut actions);
        }
        actions
    }

    /// Take ownership of an accepted socket's channel.
    ///
    /// The channel must be server-role and already open at the transport
    /// level; its hello is returned for transmission. The local machine
    /// refuses inbound sockets.
    pub fn attach_inbound<E: Environment>(
        &mut self,
        env: &E,
        channel: SecureChannel,
        client_only: bool,
    ) -> Vec<MachineAction> {
        let id = channel.id();
        if self.local {
            warn!(machine = %self.label(), "Local machine refused an inbound socket");
            return vec![MachineAction::CloseSocket { channel: id }];
        }

        self.handshakes.insert(id, Handshake {
            channel,
            client_only,
            attempt: None,
            verdict_deadline: None,
            peer: None,
        });
        self.on_socket_open(env, id)
    }

    /// An envelope arrived on `channel`.
    pub fn on_frame<E: Environment>(
        &mut self,
        env: &E,
        channel: ChannelId,
        bytes: &[u8],
    ) -> Vec<MachineAction> {
        let mut actions = Vec::new();
        if self.channel_id() == Some(channel) {
            self.on_bound_frame(env, channel, bytes, &mut actions);
        } else if self.handshakes.contains_key(&channel) {
            self.on_handshake_frame(env, channel, bytes, &mut actions);
        }
        actions
    }

    /// The application's answer to a [`MachineAction::VerifyHandshake`].
    pub fn handshake_verdict(
        &mut self,
        now: Instant,
        channel: ChannelId,
        verdict: Verdict,
    ) -> Vec<MachineAction> {
        let mut actions = Vec::new();
        let Some(peer) = self.handshakes.get(&channel).and_then(|handshake| handshake.peer.clone())
        else {
            return actions;
        };

        match verdict {
            Verdict::Accept => self.accept_handshake(now, channel, peer, &mut actions),
            Verdict::Reject => self.reject_handshake(channel, "peer declined", &mut actions),
            Verdict::Undetermined => self.reject_handshake(
                channel,
                "unable to determine handshake acceptance",
                &mut actions,
            ),
            Verdict::Retry => self.fail_handshake(now, channel, "declined for now", &mut actions),
        }
        actions
    }

    /// The socket for `channel` closed.
    pub fn on_socket_closed(&mut self, now: Instant, channel: ChannelId) -> Vec<MachineAction> {
        let mut actions = Vec::new();
        if self.channel_id() == Some(channel) {
            if let Some(bound) = self.channel.as_mut() {
                bound.close();
            }
            self.channel_lost(now, &mut actions);
        } else if self.handshakes.contains_key(&channel) {
            self.fail_handshake(now, channel, "socket closed during handshake", &mut actions);
        }
        actions
    }

    /// Transport-level ping received on `channel`.
    pub fn on_ping(&mut self, now: Instant, channel: ChannelId) {
        if self.channel_id() == Some(channel) {
            debug!(machine = %self.label(), "Received ping request");
            self.last_pong = Some(now);
        }
    }

    /// Transport-level pong received on `channel`.
    pub fn on_pong(&mut self, now: Instant, channel: ChannelId) {
        if self.channel_id() == Some(channel) {
            debug!(machine = %self.label(), "Received pong response");
            self.last_pong = Some(now);
        }
    }

    /// Start an RPC. The outcome arrives later as a
    /// [`MachineAction::CompleteRequest`] for the returned id.
    ///
    /// # Errors
    ///
    /// [`RequestError::Disconnected`] when the machine is not open, and
    /// [`RequestError::Transport`] when the request cannot be encrypted.
    pub fn send<E: Environment>(
        &mut self,
        env: &E,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(RequestId, Vec<MachineAction>), RequestError> {
        if !self.is_open() {
            return Err(RequestError::Disconnected);
        }

        let req_id = self.next_request_id;
        let method = method.into();
        let deadline = env.now() + self.config.request_timeout;

        if self.local {
            self.next_request_id += 1;
            self.pending.insert(req_id, deadline);
            return Ok((req_id, vec![MachineAction::HandleRequest {
                channel: None,
                req_id,
                method,
                params,
            }]));
        }

        let Some(channel) = self.channel.as_mut() else {
            return Err(RequestError::Disconnected);
        };
        let message = Message::Request(Request { req_id, method, params });
        let envelope = channel
            .send(env, &message, false)
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        self.next_request_id += 1;
        self.pending.insert(req_id, deadline);
        Ok((req_id, vec![MachineAction::Transmit {
            channel: channel.id(),
            envelope,
            request: Some(req_id),
        }]))
    }

    /// Answer a [`MachineAction::HandleRequest`].
    ///
    /// A failure to send the response is logged; the requester will time out.
    pub fn respond<E: Environment>(
        &mut self,
        env: &E,
        channel: Option<ChannelId>,
        req_id: RequestId,
        result: Result<Value, HandlerError>,
    ) -> Vec<MachineAction> {
        if let Err(HandlerError::Failed(detail)) = &result {
            error!(machine = %self.label(), req_id, "Failed to process message: {detail}");
        }

        let Some(channel_id) = channel else {
            if self.pending.remove(&req_id).is_none() {
                return Vec::new();
            }
            let result = result
                .map(Some)
                .map_err(|e| RequestError::Remote(e.wire_message().to_string()));
            return vec![MachineAction::CompleteRequest { req_id, result }];
        };

        let response = match result {
            Ok(data) => Response::ok(req_id, data),
            Err(e) => Response::err(req_id, e.wire_message()),
        };

        let label = self.label();
        let Some(bound) = self.channel.as_mut().filter(|bound| bound.id() == channel_id) else {
            error!(machine = %label, req_id, "Failed to send response: connection closed");
            return Vec::new();
        };
        match bound.send(env, &Message::Response(response), false) {
            Ok(envelope) => {
                vec![MachineAction::Transmit { channel: channel_id, envelope, request: None }]
            },
            Err(e) => {
                error!(machine = %label, req_id, "Failed to send response: {e}");
                Vec::new()
            },
        }
    }

    /// A [`MachineAction::Transmit`] could not be written.
    pub fn transmit_failed(
        &mut self,
        request: Option<RequestId>,
        reason: &str,
    ) -> Vec<MachineAction> {
        match request {
            Some(req_id) if self.pending.remove(&req_id).is_some() => {
                vec![MachineAction::CompleteRequest {
                    req_id,
                    result: Err(RequestError::Transport(reason.to_string())),
                }]
            },
            _ => Vec::new(),
        }
    }

    fn fire_connect<E: Environment>(
        &mut self,
        env: &E,
        attempt: ConnectAttempt,
        actions: &mut Vec<MachineAction>,
    ) {
        if !self.active || self.is_open() {
            actions.push(settle(attempt, Ok(())));
            return;
        }

        let mut channel = SecureChannel::new(Arc::clone(&self.identity), Role::Client, env.now());
        match channel.encode_metadata(env, self.machine_type) {
            Ok(metadata) => {
                let id = channel.id();
                debug!(machine = %self.label(), channel = %id, host = %self.host, "Connecting");
                actions.push(MachineAction::Connect { channel: id, host: self.host.clone(), metadata });
                self.handshakes.insert(id, Handshake {
                    channel,
                    client_only: false,
                    attempt: Some(attempt),
                    verdict_deadline: None,
                    peer: None,
                });
            },
            Err(e) => self.attempt_failed(env.now(), Some(attempt), &e.to_string(), actions),
        }
    }

    fn expire_handshakes(&mut self, now: Instant, actions: &mut Vec<MachineAction>) {
        let expired: Vec<(ChannelId, HandshakeError)> = self
            .handshakes
            .iter()
            .filter_map(|(id, handshake)| {
                if handshake.verdict_deadline.is_some_and(|deadline| now >= deadline) {
                    Some((*id, HandshakeError::Rejected))
                } else if handshake.channel.handshake_expired(now, self.config.handshake_timeout) {
                    Some((*id, HandshakeError::GenericFailure))
                } else {
                    None
                }
            })
            .collect();

        for (id, kind) in expired {
            match kind {
                HandshakeError::Rejected => {
                    self.reject_handshake(id, "unable to determine handshake acceptance", actions);
                },
                HandshakeError::GenericFailure => {
                    self.fail_handshake(now, id, "handshake timed out", actions);
                },
            }
        }
    }

    fn expire_requests(&mut self, now: Instant, actions: &mut Vec<MachineAction>) {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|&(_, &deadline)| now >= deadline)
            .map(|(&req_id, _)| req_id)
            .collect();

        for req_id in expired {
            self.pending.remove(&req_id);
            debug!(machine = %self.label(), req_id, "Request timed out");
            actions.push(MachineAction::CompleteRequest { req_id, result: Err(RequestError::Timeout) });
        }
    }

    fn heartbeat(&mut self, now: Instant, actions: &mut Vec<MachineAction>) {
        let Some(at) = self.heartbeat_at else {
            return;
        };
        if now < at {
            return;
        }
        if !self.active {
            self.heartbeat_at = None;
            return;
        }

        let interval = self.config.heartbeat_interval;
        let next = at + interval;
        self.heartbeat_at = Some(if next > now { next } else { now + interval });

        let (id, open) = match &self.channel {
            Some(channel) => (channel.id(), channel.is_open()),
            None => return,
        };
        if !open {
            warn!(machine = %self.label(), "Attempting to ping a closed machine");
            return;
        }

        let stale = self
            .last_pong
            .is_some_and(|last| now.saturating_duration_since(last) > self.config.stale_after());
        if stale {
            debug!(machine = %self.label(), "Pong delta is too great, closing connection");
            if let Some(channel) = self.channel.as_mut() {
                channel.close();
            }
            actions.push(MachineAction::CloseSocket { channel: id });
            self.channel_lost(now, actions);
            return;
        }

        debug!(machine = %self.label(), "Sent ping request");
        actions.push(MachineAction::Ping { channel: id });
    }

    fn on_bound_frame<E: Environment>(
        &mut self,
        env: &E,
        id: ChannelId,
        bytes: &[u8],
        actions: &mut Vec<MachineAction>,
    ) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        match channel.receive(env, bytes) {
            Ok(Inbound::Message(message)) => self.dispatch(id, message, actions),
            Ok(Inbound::Handshake { .. }) => {
                warn!(machine = %self.label(), "Unexpected handshake on a bound channel");
            },
            Err(e) if e.is_fatal() => {
                error!(machine = %self.label(), error = %e, "Failed to process message");
                actions.push(MachineAction::CloseSocket { channel: id });
                self.channel_lost(env.now(), actions);
            },
            Err(e) => warn!(machine = %self.label(), error = %e, "Message dropped"),
        }
    }

    fn on_handshake_frame<E: Environment>(
        &mut self,
        env: &E,
        id: ChannelId,
        bytes: &[u8],
        actions: &mut Vec<MachineAction>,
    ) {
        let Some(handshake) = self.handshakes.get_mut(&id) else {
            return;
        };

        match handshake.channel.receive(env, bytes) {
            Ok(Inbound::Handshake { hello, reply }) => {
                if let Some(envelope) = reply {
                    actions.push(MachineAction::Transmit { channel: id, envelope, request: None });
                }
                self.verify_peer(env.now(), id, hello, actions);
            },
            Ok(Inbound::Message(message)) => {
                warn!(machine = %self.label(), kind = message.kind(), "Message dropped during handshake");
            },
            Err(e) if e.is_fatal() => {
                error!(machine = %self.label(), error = %e, "Failed to process message");
                self.fail_handshake(env.now(), id, &e.to_string(), actions);
            },
            Err(e) => warn!(machine = %self.label(), error = %e, "Message dropped"),
        }
    }

    fn dispatch(&mut self, id: ChannelId, message: Message, actions: &mut Vec<MachineAction>) {
        match message {
            Message::Request(request) => actions.push(MachineAction::HandleRequest {
                channel: Some(id),
                req_id: request.req_id,
                method: request.method,
                params: request.params,
            }),
            Message::Response(response) => {
                let req_id = response.res_id;
                if self.pending.remove(&req_id).is_none() {
                    debug!(machine = %self.label(), req_id, "Dropping response for unknown request");
                    return;
                }
                actions.push(MachineAction::CompleteRequest {
                    req_id,
                    result: response.into_result().map_err(RequestError::Remote),
                });
            },
            Message::Unknown(fields) => {
                warn!(machine = %self.label(), ?fields, "Message dropped");
            },
            Message::Hello(_) => {
                warn!(machine = %self.label(), "Unexpected handshake on a bound channel");
            },
        }
    }

    fn verify_peer(
        &mut self,
        now: Instant,
        id: ChannelId,
        hello: Hello,
        actions: &mut Vec<MachineAction>,
    ) {
        let client_only = self.handshakes.get(&id).is_some_and(|handshake| handshake.client_only);

        if hello.id.is_empty() {
            return self.reject_handshake(id, "handshake missing id", actions);
        }
        if let Some(known) = self.peer_id.as_deref()
            && known != hello.id
        {
            let reason = format!("id mismatch: {known} -> {}", hello.id);
            return self.reject_handshake(id, &reason, actions);
        }
        if !client_only && hello.remote_address.is_empty() {
            return self.reject_handshake(id, "handshake missing remote address", actions);
        }

        let peer = PeerInfo {
            machine_type: self.machine_type,
            peer_id: hello.id,
            remote_address: hello.remote_address,
            client_only,
        };
        if let Some(handshake) = self.handshakes.get_mut(&id) {
            handshake.verdict_deadline = Some(now + self.config.verdict_timeout);
            handshake.peer = Some(peer.clone());
        }
        actions.push(MachineAction::VerifyHandshake { channel: id, peer });
    }

    fn accept_handshake(
        &mut self,
        now: Instant,
        id: ChannelId,
        peer: PeerInfo,
        actions: &mut Vec<MachineAction>,
    ) {
        if !self.active {
            return self.reject_handshake(id, "machine must be considered active", actions);
        }
        if self.channel.as_ref().is_some_and(SecureChannel::is_open) {
            return self.reject_handshake(id, "failed to set client", actions);
        }
        let Some(mut handshake) = self.handshakes.remove(&id) else {
            return;
        };

        handshake.channel.complete_handshake(true);
        if let Some(mut old) = self.channel.take() {
            old.close();
            actions.push(MachineAction::CloseSocket { channel: old.id() });
        }

        self.peer_id = Some(peer.peer_id.clone());
        if !handshake.client_only {
            self.host = peer.remote_address;
        }
        self.bound_client_only = handshake.client_only;
        self.last_pong = Some(now);
        self.channel = Some(handshake.channel);

        info!(machine = %self.label(), channel = %id, "Successfully connected");
        actions.push(MachineAction::Emit(MachineEvent::Connected { peer_id: peer.peer_id }));
        if let Some(attempt) = handshake.attempt {
            actions.push(settle(attempt, Ok(())));
        }
    }

    /// Explicit rejection: close the socket, never reschedule.
    fn reject_handshake(&mut self, id: ChannelId, reason: &str, actions: &mut Vec<MachineAction>) {
        let Some(mut handshake) = self.handshakes.remove(&id) else {
            return;
        };
        error!(machine = %self.label(), channel = %id, "Handshake failed: {reason}");

        handshake.channel.complete_handshake(false);
        handshake.channel.close();
        actions.push(MachineAction::CloseSocket { channel: id });
        actions.push(MachineAction::Emit(MachineEvent::HandshakeRejected {
            kind: HandshakeError::Rejected,
        }));
        if let Some(attempt) = handshake.attempt {
            actions.push(settle(attempt, Ok(())));
        }
    }

    /// Generic failure: close the socket, reschedule outbound attempts.
    fn fail_handshake(
        &mut self,
        now: Instant,
        id: ChannelId,
        reason: &str,
        actions: &mut Vec<MachineAction>,
    ) {
        let Some(mut handshake) = self.handshakes.remove(&id) else {
            return;
        };
        warn!(machine = %self.label(), channel = %id, "Handshake failed: {reason}");

        handshake.channel.close();
        actions.push(MachineAction::CloseSocket { channel: id });
        actions.push(MachineAction::Emit(MachineEvent::HandshakeRejected {
            kind: HandshakeError::GenericFailure,
        }));
        self.attempt_failed(now, handshake.attempt, reason, actions);
    }

    fn attempt_failed(
        &mut self,
        now: Instant,
        attempt: Option<ConnectAttempt>,
        reason: &str,
        actions: &mut Vec<MachineAction>,
    ) {
        let Some(attempt) = attempt else {
            return;
        };
        let error = MachineError::Connect(reason.to_string());
        error!(machine = %self.label(), "{error}");
        self.reschedule(now, actions);
        actions.push(settle(attempt, Err(error)));
    }

    fn channel_lost(&mut self, now: Instant, actions: &mut Vec<MachineAction>) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        warn!(machine = %self.label(), channel = %channel.id(), "Connection lost");
        actions.push(MachineAction::Emit(MachineEvent::ConnectionLost));

        if !self.bound_client_only || channel.role() == Role::Client {
            self.reschedule(now, actions);
        }
    }

    fn reschedule(&mut self, now: Instant, actions: &mut Vec<MachineAction>) {
        if !self.active || self.local {
            return;
        }
        if let Ok((_, superseded)) =
            self.schedule_connection(now, self.config.reconnect_delay, false)
        {
            actions.extend(superseded);
        }
    }
}

fn settle(attempt: ConnectAttempt, result: Result<(), MachineError>) -> MachineAction {
    let result = if attempt.reject_on_fail { result } else { Ok(()) };
    MachineAction::ConnectionSettled { attempt: attempt.id, result }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::ManualEnv;

    const A_ADDR: &str = "10.0.0.1:4000";
    const B_ADDR: &str = "10.0.0.2:4000";

    fn identity(id: &str, address: &str) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity::new("shared", id, address))
    }

    fn transmits(actions: &[MachineAction]) -> Vec<Bytes> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::Transmit { envelope, .. } => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    fn single_transmit(actions: &[MachineAction]) -> Bytes {
        let mut sent = transmits(actions);
        assert_eq!(sent.len(), 1, "expected one transmit in {actions:?}");
        sent.remove(0)
    }

    fn connects(actions: &[MachineAction]) -> Vec<(ChannelId, String)> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::Connect { channel, metadata, .. } => {
                    Some((*channel, metadata.clone()))
                },
                _ => None,
            })
            .collect()
    }

    fn verify_of(actions: &[MachineAction]) -> Option<PeerInfo> {
        actions.iter().find_map(|action| match action {
            MachineAction::VerifyHandshake { peer, .. } => Some(peer.clone()),
            _ => None,
        })
    }

    fn events(actions: &[MachineAction]) -> Vec<MachineEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn settlements(actions: &[MachineAction]) -> Vec<Result<(), MachineError>> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::ConnectionSettled { result, .. } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn completions(
        actions: &[MachineAction],
    ) -> Vec<(RequestId, Result<Option<Value>, RequestError>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::CompleteRequest { req_id, result } => Some((*req_id, result.clone())),
                _ => None,
            })
            .collect()
    }

    fn closes(actions: &[MachineAction]) -> Vec<ChannelId> {
        actions
            .iter()
            .filter_map(|action| match action {
                MachineAction::CloseSocket { channel } => Some(*channel),
                _ => None,
            })
            .collect()
    }

    /// `a` is node-1's inbound machine, `b` is node-2's configured machine
    /// dialing node-1.
    struct Link {
        a: Machine,
        b: Machine,
        a_channel: ChannelId,
        b_channel: ChannelId,
        b_settled: Vec<Result<(), MachineError>>,
    }

    fn dial(env: &ManualEnv) -> (Machine, ChannelId, String) {
        let mut b =
            Machine::new(MachineType::Cluster, identity("node-2", B_ADDR), A_ADDR, MachineConfig::default());
        b.start(env.now());
        b.connect(env.now(), true).unwrap();
        let mut dialed = connects(&b.tick(env));
        assert_eq!(dialed.len(), 1);
        let (channel, metadata) = dialed.remove(0);
        (b, channel, metadata)
    }

    fn accept_inbound(env: &ManualEnv, metadata: &str, client_only: bool) -> (Machine, ChannelId, Bytes) {
        let a_identity = identity("node-1", A_ADDR);
        let mut server = SecureChannel::new(Arc::clone(&a_identity), Role::Server, env.now());
        assert_eq!(server.decode_metadata(metadata).unwrap().machine_type, MachineType::Cluster);

        let mut a =
            Machine::new(MachineType::Cluster, a_identity, "10.0.0.2:51234", MachineConfig::default());
        a.start(env.now());
        let channel = server.id();
        let hello = single_transmit(&a.attach_inbound(env, server, client_only));
        (a, channel, hello)
    }

    fn linked(env: &ManualEnv) -> Link {
        let (mut b, b_channel, metadata) = dial(env);
        let (mut a, a_channel, hello) = accept_inbound(env, &metadata, false);

        assert!(b.on_socket_open(env, b_channel).is_empty());
        let b_actions = b.on_frame(env, b_channel, &hello);
        let reply = single_transmit(&b_actions);
        assert_eq!(verify_of(&b_actions).unwrap().peer_id, "node-1");

        let a_actions = a.on_frame(env, a_channel, &reply);
        assert_eq!(verify_of(&a_actions).unwrap().peer_id, "node-2");

        let a_actions = a.handshake_verdict(env.now(), a_channel, Verdict::Accept);
        assert_eq!(events(&a_actions), vec![MachineEvent::Connected { peer_id: "node-2".into() }]);
        let b_actions = b.handshake_verdict(env.now(), b_channel, Verdict::Accept);
        assert_eq!(events(&b_actions), vec![MachineEvent::Connected { peer_id: "node-1".into() }]);

        Link { a, b, a_channel, b_channel, b_settled: settlements(&b_actions) }
    }

    #[test]
    fn local_machine_is_open_and_never_connects() {
        let env = ManualEnv::new(1);
        let mut machine =
            Machine::new(MachineType::Cluster, identity("node-1", A_ADDR), A_ADDR, MachineConfig::default());

        assert!(machine.is_local());
        assert!(machine.is_open());
        assert_eq!(machine.peer_id(), Some("node-1"));
        assert_eq!(machine.connect(env.now(), true).unwrap_err(), MachineError::LocalMachine);

        let channel = SecureChannel::new(identity("node-1", A_ADDR), Role::Server, env.now());
        let id = channel.id();
        assert_eq!(machine.attach_inbound(&env, channel, false), vec![MachineAction::CloseSocket {
            channel: id
        }]);
        assert!(machine.stop().is_empty());
        assert!(machine.is_open());
    }

    #[test]
    fn owns_negotiating_and_bound_channels_only() {
        let env = ManualEnv::new(21);
        let (mut b, b_channel, metadata) = dial(&env);
        assert!(b.owns_channel(b_channel));
        assert!(!b.owns_channel(ChannelId::next()));

        let (_, a_channel, _) = accept_inbound(&env, &metadata, false);
        assert!(!b.owns_channel(a_channel));

        b.stop();
        assert!(!b.owns_channel(b_channel));

        let link = linked(&env);
        assert!(link.a.owns_channel(link.a_channel));
        assert!(link.b.owns_channel(link.b_channel));
    }

    #[test]
    fn local_send_dispatches_to_own_handler() {
        let env = ManualEnv::new(2);
        let mut machine =
            Machine::new(MachineType::Cluster, identity("node-1", A_ADDR), A_ADDR, MachineConfig::default());

        let (req_id, actions) = machine.send(&env, "get_master", None).unwrap();
        assert_eq!(actions, vec![MachineAction::HandleRequest {
            channel: None,
            req_id,
            method: "get_master".into(),
            params: None,
        }]);

        let actions = machine.respond(&env, None, req_id, Ok(json!({"master": "node-1"})));
        assert_eq!(completions(&actions), vec![(req_id, Ok(Some(json!({"master": "node-1"}))))]);
        assert_eq!(machine.pending_requests(), 0);
    }

    #[test]
    fn handshake_binds_both_sides() {
        let env = ManualEnv::new(3);
        let link = linked(&env);

        assert!(link.a.is_open());
        assert!(link.b.is_open());
        assert_eq!(link.a.peer_id(), Some("node-2"));
        assert_eq!(link.b.peer_id(), Some("node-1"));
        assert_eq!(link.a.channel_id(), Some(link.a_channel));
        assert_eq!(link.b.channel_id(), Some(link.b_channel));
        assert_eq!(link.b_settled, vec![Ok(())]);

        // Inbound side adopts the declared address for reconnection.
        assert_eq!(link.a.host(), B_ADDR);
        assert_eq!(link.a.handshakes_in_flight(), 0);
    }

    #[test]
    fn send_before_handshake_is_disconnected() {
        let env = ManualEnv::new(4);
        let (mut b, b_channel, _) = dial(&env);
        b.on_socket_open(&env, b_channel);

        assert_eq!(b.send(&env, "ping-app", None).unwrap_err(), RequestError::Disconnected);

        let mut idle =
            Machine::new(MachineType::Driver, identity("node-2", B_ADDR), A_ADDR, MachineConfig::default());
        assert_eq!(idle.send(&env, "start", None).unwrap_err(), RequestError::Disconnected);
    }

    #[test]
    fn request_response_round_trip() {
        let env = ManualEnv::new(5);
        let mut link = linked(&env);

        let (req_id, actions) = link.b.send(&env, "ping-app", Some(json!({}))).unwrap();
        assert_eq!(req_id, 0);
        let request = single_transmit(&actions);

        let actions = link.a.on_frame(&env, link.a_channel, &request);
        assert_eq!(actions, vec![MachineAction::HandleRequest {
            channel: Some(link.a_channel),
            req_id,
            method: "ping-app".into(),
            params: Some(json!({})),
        }]);

        let actions = link.a.respond(&env, Some(link.a_channel), req_id, Ok(json!({"pong": true})));
        let response = single_transmit(&actions);

        let actions = link.b.on_frame(&env, link.b_channel, &response);
        assert_eq!(completions(&actions), vec![(req_id, Ok(Some(json!({"pong": true}))))]);
        assert_eq!(link.b.pending_requests(), 0);
    }

    #[test]
    fn request_ids_increase() {
        let env = ManualEnv::new(6);
        let mut link = linked(&env);

        let ids: Vec<RequestId> =
            (0..3).map(|_| link.b.send(&env, "ping-app", None).unwrap().0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn handler_errors_travel_as_wire_messages() {
        let env = ManualEnv::new(7);
        let mut link = linked(&env);

        let (unknown, actions) = link.b.send(&env, "bogus", None).unwrap();
        link.a.on_frame(&env, link.a_channel, &single_transmit(&actions));
        let (failing, actions) = link.b.send(&env, "get_master", None).unwrap();
        link.a.on_frame(&env, link.a_channel, &single_transmit(&actions));

        let first = single_transmit(&link.a.respond(
            &env,
            Some(link.a_channel),
            unknown,
            Err(HandlerError::Unrecognized),
        ));
        let second = single_transmit(&link.a.respond(
            &env,
            Some(link.a_channel),
            failing,
            Err(HandlerError::Failed("master ID must be present".into())),
        ));

        let mut done = completions(&link.b.on_frame(&env, link.b_channel, &first));
        done.extend(completions(&link.b.on_frame(&env, link.b_channel, &second)));
        assert_eq!(done, vec![
            (unknown, Err(RequestError::Remote("unrecognized method for this machine".into()))),
            (failing, Err(RequestError::Remote("failed to process message".into()))),
        ]);
    }

    #[test]
    fn request_times_out_and_late_response_is_dropped() {
        let env = ManualEnv::new(8);
        let mut link = linked(&env);

        let (req_id, actions) = link.b.send(&env, "ping-app", None).unwrap();
        link.a.on_frame(&env, link.a_channel, &single_transmit(&actions));

        env.advance(Duration::from_millis(2999));
        assert!(completions(&link.b.tick(&env)).is_empty());

        env.advance(Duration::from_millis(1));
        assert_eq!(completions(&link.b.tick(&env)), vec![(req_id, Err(RequestError::Timeout))]);
        assert_eq!(link.b.pending_requests(), 0);

        let late = single_transmit(&link.a.respond(&env, Some(link.a_channel), req_id, Ok(json!(1))));
        assert!(link.b.on_frame(&env, link.b_channel, &late).is_empty());
        assert!(link.b.is_open());
    }

    #[test]
    fn stop_rejects_each_pending_once_and_is_idempotent() {
        let env = ManualEnv::new(9);
        let mut link = linked(&env);

        let ids: Vec<RequestId> =
            (0..4).map(|_| link.b.send(&env, "ping-app", None).unwrap().0).collect();

        let actions = link.b.stop();
        let stopped: Vec<RequestId> = completions(&actions)
            .into_iter()
            .map(|(req_id, result)| {
                assert_eq!(result, Err(RequestError::Stopped));
                req_id
            })
            .collect();
        assert_eq!(stopped, ids);
        assert_eq!(closes(&actions), vec![link.b_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::Stopped]);
        assert!(!link.b.is_open());

        assert!(link.b.stop().is_empty());

        // Nothing scheduled before the stop fires afterwards.
        env.advance(Duration::from_secs(30));
        assert!(link.b.tick(&env).is_empty());
    }

    #[test]
    fn heartbeat_pings_bound_channel() {
        let env = ManualEnv::new(10);
        let mut link = linked(&env);

        env.advance(Duration::from_millis(1499));
        assert!(link.b.tick(&env).is_empty());

        env.advance(Duration::from_millis(1));
        assert_eq!(link.b.tick(&env), vec![MachineAction::Ping { channel: link.b_channel }]);
    }

    #[test]
    fn stale_heartbeat_closes_exactly_once() {
        let env = ManualEnv::new(11);
        let mut link = linked(&env);

        env.advance(Duration::from_millis(3100));
        let actions = link.b.tick(&env);
        assert_eq!(closes(&actions), vec![link.b_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::ConnectionLost]);
        assert!(!link.b.is_open());

        // The driver reports the close it executed; nothing new happens.
        assert!(link.b.on_socket_closed(env.now(), link.b_channel).is_empty());
        let actions = link.b.tick(&env);
        assert!(events(&actions).is_empty());
        assert!(closes(&actions).is_empty());
    }

    #[test]
    fn pong_keeps_channel_alive() {
        let env = ManualEnv::new(12);
        let mut link = linked(&env);

        for _ in 0..4 {
            env.advance(Duration::from_millis(1500));
            assert_eq!(link.b.tick(&env), vec![MachineAction::Ping { channel: link.b_channel }]);
            link.b.on_pong(env.now(), link.b_channel);
        }
        assert!(link.b.is_open());
    }

    #[test]
    fn connection_loss_reschedules_both_sides() {
        let env = ManualEnv::new(13);
        let mut link = linked(&env);

        let actions = link.b.on_socket_closed(env.now(), link.b_channel);
        assert_eq!(events(&actions), vec![MachineEvent::ConnectionLost]);
        assert_eq!(link.b.reconnect_at(), Some(env.now() + Duration::from_millis(5000)));

        link.a.on_socket_closed(env.now(), link.a_channel);
        assert_eq!(link.a.reconnect_at(), Some(env.now() + Duration::from_millis(5000)));

        env.advance(Duration::from_millis(5000));
        let dialed = connects(&link.a.tick(&env));
        assert_eq!(dialed.len(), 1);
    }

    #[test]
    fn client_only_inbound_does_not_reconnect() {
        let env = ManualEnv::new(14);
        let (mut b, b_channel, metadata) = dial(&env);
        let (mut a, a_channel, hello) = accept_inbound(&env, &metadata, true);

        b.on_socket_open(&env, b_channel);
        let reply = single_transmit(&b.on_frame(&env, b_channel, &hello));
        let peer = verify_of(&a.on_frame(&env, a_channel, &reply)).unwrap();
        assert!(peer.client_only);
        a.handshake_verdict(env.now(), a_channel, Verdict::Accept);

        assert_eq!(a.host(), "10.0.0.2:51234");
        a.on_socket_closed(env.now(), a_channel);
        assert_eq!(a.reconnect_at(), None);
    }

    #[test]
    fn rejected_handshake_does_not_reschedule() {
        let env = ManualEnv::new(15);
        let (mut b, b_channel, metadata) = dial(&env);
        let (_a, _, hello) = accept_inbound(&env, &metadata, false);
        b.on_socket_open(&env, b_channel);
        assert!(verify_of(&b.on_frame(&env, b_channel, &hello)).is_some());

        let actions = b.handshake_verdict(env.now(), b_channel, Verdict::Reject);
        assert_eq!(closes(&actions), vec![b_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::HandshakeRejected {
            kind: HandshakeError::Rejected
        }]);
        assert_eq!(settlements(&actions), vec![Ok(())]);
        assert_eq!(b.reconnect_at(), None);

        env.advance(Duration::from_secs(30));
        assert!(connects(&b.tick(&env)).is_empty());
    }

    #[test]
    fn retry_verdict_keeps_reconnecting() {
        let env = ManualEnv::new(23);
        let (mut b, b_channel, metadata) = dial(&env);
        let (_a, _, hello) = accept_inbound(&env, &metadata, false);
        b.on_socket_open(&env, b_channel);
        assert!(verify_of(&b.on_frame(&env, b_channel, &hello)).is_some());

        let actions = b.handshake_verdict(env.now(), b_channel, Verdict::Retry);
        assert_eq!(closes(&actions), vec![b_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::HandshakeRejected {
            kind: HandshakeError::GenericFailure
        }]);
        assert_eq!(settlements(&actions), vec![Err(MachineError::Connect("declined for now".into()))]);
        assert!(!b.is_open());

        env.advance(Duration::from_millis(5000));
        assert_eq!(connects(&b.tick(&env)).len(), 1);
    }

    #[test]
    fn connect_failure_reschedules_once_after_delay() {
        let env = ManualEnv::new(16);
        let (mut b, b_channel, _) = dial(&env);

        let actions = b.on_connect_failed(env.now(), b_channel, "connection refused");
        assert_eq!(settlements(&actions), vec![Err(MachineError::Connect(
            "connection refused".into()
        ))]);

        env.advance(Duration::from_millis(4999));
        assert!(connects(&b.tick(&env)).is_empty());

        env.advance(Duration::from_millis(1));
        assert_eq!(connects(&b.tick(&env)).len(), 1);

        env.advance(Duration::from_millis(100));
        assert!(connects(&b.tick(&env)).is_empty());
    }

    #[test]
    fn background_attempts_settle_ok_on_failure() {
        let env = ManualEnv::new(17);
        let mut b =
            Machine::new(MachineType::Cluster, identity("node-2", B_ADDR), A_ADDR, MachineConfig::default());
        b.start(env.now());
        b.connect(env.now(), false).unwrap();
        let (channel, _) = connects(&b.tick(&env)).remove(0);

        let actions = b.on_connect_failed(env.now(), channel, "connection refused");
        assert_eq!(settlements(&actions), vec![Ok(())]);
    }

    #[test]
    fn handshake_timeout_is_generic_and_reschedules() {
        let env = ManualEnv::new(18);
        let (mut b, b_channel, _) = dial(&env);
        b.on_socket_open(&env, b_channel);

        env.advance(Duration::from_millis(5001));
        let actions = b.tick(&env);
        assert_eq!(closes(&actions), vec![b_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::HandshakeRejected {
            kind: HandshakeError::GenericFailure
        }]);
        assert!(b.reconnect_at().is_some());
    }

    #[test]
    fn missing_verdict_rejects() {
        let env = ManualEnv::new(19);
        let (mut b, b_channel, metadata) = dial(&env);
        let (_a, _, hello) = accept_inbound(&env, &metadata, false);
        b.on_socket_open(&env, b_channel);
        assert!(verify_of(&b.on_frame(&env, b_channel, &hello)).is_some());

        env.advance(Duration::from_millis(3000));
        let actions = b.tick(&env);
        assert_eq!(events(&actions), vec![MachineEvent::HandshakeRejected {
            kind: HandshakeError::Rejected
        }]);
        assert_eq!(b.reconnect_at(), None);

        // Verdict arriving after the deadline is ignored.
        assert!(b.handshake_verdict(env.now(), b_channel, Verdict::Accept).is_empty());
    }

    /// Run a handshake from a bare client channel into `a`, returning the
    /// inbound channel id and `a`'s actions after the hello exchange.
    fn extra_inbound(
        env: &ManualEnv,
        a: &mut Machine,
        client: Arc<LocalIdentity>,
    ) -> (ChannelId, Vec<MachineAction>) {
        let mut dialer = SecureChannel::new(client, Role::Client, env.now());
        let metadata = dialer.encode_metadata(env, MachineType::Cluster).unwrap();
        let mut server = SecureChannel::new(identity("node-1", A_ADDR), Role::Server, env.now());
        server.decode_metadata(&metadata).unwrap();
        let id = server.id();

        let hello = single_transmit(&a.attach_inbound(env, server, false));
        dialer.mark_open(env).unwrap();
        let Inbound::Handshake { reply, .. } = dialer.receive(env, &hello).unwrap() else {
            panic!("expected handshake");
        };
        (id, a.on_frame(env, id, &reply.unwrap()))
    }

    #[test]
    fn second_channel_to_open_machine_is_refused() {
        let env = ManualEnv::new(20);
        let mut link = linked(&env);

        let (extra, actions) = extra_inbound(&env, &mut link.a, identity("node-2", B_ADDR));
        assert!(verify_of(&actions).is_some());

        let actions = link.a.handshake_verdict(env.now(), extra, Verdict::Accept);
        assert_eq!(closes(&actions), vec![extra]);
        assert_eq!(events(&actions), vec![MachineEvent::HandshakeRejected {
            kind: HandshakeError::Rejected
        }]);
        assert_eq!(link.a.channel_id(), Some(link.a_channel));
        assert!(link.a.is_open());
    }

    #[test]
    fn peer_id_mismatch_rejects() {
        let env = ManualEnv::new(21);
        let mut link = linked(&env);

        let (extra, actions) = extra_inbound(&env, &mut link.a, identity("node-3", "10.0.0.3:4000"));
        assert!(verify_of(&actions).is_none());
        assert_eq!(closes(&actions), vec![extra]);
        assert_eq!(link.a.peer_id(), Some("node-2"));
    }

    #[test]
    fn empty_peer_id_rejects() {
        let env = ManualEnv::new(22);
        let (mut a, _, _) = accept_inbound(&env, &dial(&env).2, false);

        let (extra, actions) = extra_inbound(&env, &mut a, identity("", B_ADDR));
        assert!(verify_of(&actions).is_none());
        assert_eq!(closes(&actions), vec![extra]);
    }

    #[test]
    fn tampered_frame_drops_bound_channel() {
        let env = ManualEnv::new(23);
        let mut link = linked(&env);

        let (_, actions) = link.b.send(&env, "ping-app", None).unwrap();
        let mut tampered = single_transmit(&actions).to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;

        let actions = link.a.on_frame(&env, link.a_channel, &tampered);
        assert_eq!(closes(&actions), vec![link.a_channel]);
        assert_eq!(events(&actions), vec![MachineEvent::ConnectionLost]);
        assert!(!link.a.is_open());
    }

    #[test]
    fn events_for_unknown_channels_are_ignored() {
        let env = ManualEnv::new(24);
        let mut link = linked(&env);
        let stranger = SecureChannel::new(identity("x", "y"), Role::Client, env.now()).id();

        assert!(link.b.on_frame(&env, stranger, b"junk").is_empty());
        assert!(link.b.on_socket_closed(env.now(), stranger).is_empty());
        assert!(link.b.handshake_verdict(env.now(), stranger, Verdict::Accept).is_empty());
        assert!(link.b.is_open());
    }

    #[test]
    fn superseded_attempt_settles() {
        let env = ManualEnv::new(25);
        let mut b =
            Machine::new(MachineType::Cluster, identity("node-2", B_ADDR), A_ADDR, MachineConfig::default());
        b.start(env.now());

        let (first, _) = b.schedule_connection(env.now(), Duration::from_secs(5), true).unwrap();
        let (_, actions) = b.connect(env.now(), true).unwrap();
        assert_eq!(actions, vec![MachineAction::ConnectionSettled { attempt: first, result: Ok(()) }]);
    }

    #[test]
    fn inactive_machine_attempt_is_noop() {
        let env = ManualEnv::new(26);
        let mut b =
            Machine::new(MachineType::Cluster, identity("node-2", B_ADDR), A_ADDR, MachineConfig::default());

        let (attempt, _) = b.connect(env.now(), true).unwrap();
        assert_eq!(b.tick(&env), vec![MachineAction::ConnectionSettled { attempt, result: Ok(()) }]);
    }
}
