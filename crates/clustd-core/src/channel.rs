//! Secure channel: authenticated encryption and handshake over one socket.
//!
//! # Key schedule
//!
//! Each direction keeps its own counter. Before every encrypt or decrypt the
//! counter is incremented, so the first message in a direction uses counter 1.
//! The key for counter `n` is derived from the shared secret and `n`, plus the
//! session ticket once the handshake is complete. Both ends must agree on
//! exactly which messages were sent before and after that switch, which is
//! why the handshake ordering below is strict.
//!
//! # Handshake
//!
//! ```text
//!  server role                                   client role
//!  ───────────                                   ───────────
//!  (socket open) ticket T = random u32
//!  hello_world{T, id, remote_address}  ───────>  records T
//!                                      <───────  hello_world{T, id, remote_address}
//!  records T                                     verify peer ─> verdict
//!  verify peer ─> verdict
//!  Initialized                                   Initialized
//! ```
//!
//! The client echoes the ticket it received so both ends fold the same value
//! into the key schedule. A second `hello_world`, or any payload before
//! `Initialized`, is a protocol violation: the channel closes.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────────────┐ hello_world ┌───────────┐ verdict=true ┌─────────────┐
//! │ AwaitingHandshake │────────────>│ Verifying │─────────────>│ Initialized │
//! └───────────────────┘             └───────────┘              └─────────────┘
//!                                         │ verdict=false
//!                                         ↓
//!                                    ┌────────┐
//!                                    │ Failed │
//!                                    └────────┘
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use clustd_crypto::{derive_message_key, open, seal};
use clustd_proto::{
    ConnectionMetadata, Envelope, Hello, MachineType, Message,
    envelope::IV_LEN,
    metadata::{decode_header, encode_header},
};

use crate::{env::Environment, error::ChannelError, identity::LocalIdentity};

/// Process-unique channel identifier.
///
/// Drivers key sockets by it; a machine ignores events for ids it no longer
/// holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Which side of the socket this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the socket; speaks first
    Server,
    /// Opened the socket; answers the server's hello
    Client,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No `hello_world` received yet
    AwaitingHandshake,
    /// Peer hello received, waiting for the owning machine's verdict
    Verifying,
    /// Handshake complete; payload traffic allowed
    Initialized,
    /// Peer declined
    Failed,
}

/// A successfully decrypted inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Peer hello. `reply` is our own hello, already encrypted, when this
    /// channel still owed one.
    Handshake {
        /// What the peer declared
        hello: Hello,
        /// Hello to transmit back (client role only)
        reply: Option<Bytes>,
    },
    /// Request, response, or unknown shape after the handshake
    Message(Message),
}

/// Authenticated framing for one socket.
pub struct SecureChannel {
    id: ChannelId,
    role: Role,
    identity: Arc<LocalIdentity>,
    incoming_counter: u32,
    outgoing_counter: u32,
    ticket: Option<u32>,
    state: HandshakeState,
    open: bool,
    hello_sent: bool,
    created_at: Instant,
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("open", &self.open)
            .field("incoming_counter", &self.incoming_counter)
            .field("outgoing_counter", &self.outgoing_counter)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Create a channel. The handshake clock starts at `now`.
    pub fn new(identity: Arc<LocalIdentity>, role: Role, now: Instant) -> Self {
        Self {
            id: ChannelId::next(),
            role,
            identity,
            incoming_counter: 0,
            outgoing_counter: 0,
            ticket: None,
            state: HandshakeState::AwaitingHandshake,
            open: false,
            hello_sent: false,
            created_at: now,
        }
    }

    /// Channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Server or client role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Handshake progress.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether payload traffic is allowed.
    pub fn is_initialized(&self) -> bool {
        self.state == HandshakeState::Initialized
    }

    /// Whether the socket is believed open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Session ticket, once a hello was seen or sent.
    pub fn ticket(&self) -> Option<u32> {
        self.ticket
    }

    /// Messages decrypted so far.
    pub fn incoming_counter(&self) -> u32 {
        self.incoming_counter
    }

    /// Messages encrypted so far.
    pub fn outgoing_counter(&self) -> u32 {
        self.outgoing_counter
    }

    /// True once the handshake is overdue.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_initialized() && now.saturating_duration_since(self.created_at) > timeout
    }

    /// Socket opened. A server-role channel picks its ticket and returns its
    /// hello for transmission.
    pub fn mark_open<E: Environment>(&mut self, env: &E) -> Result<Option<Bytes>, ChannelError> {
        self.open = true;
        if self.role == Role::Server && !self.hello_sent {
            self.ticket = Some(env.random_u32());
            return self.hello(env).map(Some);
        }
        Ok(None)
    }

    /// Mark the socket closed. The driver is expected to drop the socket.
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Encrypt raw plaintext into an envelope, consuming one outgoing counter.
    pub fn encrypt<E: Environment>(
        &mut self,
        env: &E,
        plaintext: &[u8],
    ) -> Result<Bytes, ChannelError> {
        let counter = self.outgoing_counter.checked_add(1).ok_or(ChannelError::CounterExhausted)?;
        self.outgoing_counter = counter;

        let key = derive_message_key(self.identity.secret(), counter, self.key_ticket());
        let mut iv = [0u8; IV_LEN];
        env.random_bytes(&mut iv);
        let (tag, ciphertext) =
            seal(&key, &iv, plaintext).map_err(|_| ChannelError::Encryption)?;

        Ok(Envelope { iv, tag, ciphertext }.encode())
    }

    /// Authenticate and decrypt an envelope, consuming one incoming counter.
    ///
    /// Any failure is fatal: the channel is marked closed.
    pub fn decrypt(&mut self, bytes: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let Some(counter) = self.incoming_counter.checked_add(1) else {
            self.close();
            return Err(ChannelError::CounterExhausted);
        };
        self.incoming_counter = counter;

        let key = derive_message_key(self.identity.secret(), counter, self.key_ticket());
        let opened = Envelope::decode(bytes)
            .ok()
            .and_then(|envelope| open(&key, &envelope.iv, &envelope.tag, &envelope.ciphertext).ok());

        match opened {
            Some(plaintext) => Ok(plaintext),
            None => {
                self.close();
                Err(ChannelError::Decryption)
            },
        }
    }

    /// Encrypt a control message for transmission.
    ///
    /// Fails unless the handshake completed, except when `force` is set
    /// (the hello itself).
    pub fn send<E: Environment>(
        &mut self,
        env: &E,
        message: &Message,
        force: bool,
    ) -> Result<Bytes, ChannelError> {
        if !(self.is_initialized() || force) {
            return Err(ChannelError::NotInitialized);
        }
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let plaintext = message.to_vec()?;
        self.encrypt(env, &plaintext)
    }

    /// Decrypt and classify an inbound envelope, enforcing handshake order.
    ///
    /// Nothing is consumed while the socket is not open, so the same
    /// envelope can be delivered again once it is.
    pub fn receive<E: Environment>(
        &mut self,
        env: &E,
        bytes: &[u8],
    ) -> Result<Inbound, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let plaintext = self.decrypt(bytes)?;
        let message = Message::from_slice(&plaintext)?;

        match message {
            Message::Hello(hello) => {
                if self.state != HandshakeState::AwaitingHandshake {
                    self.close();
                    let reason = if self.is_initialized() {
                        "Socket handshake already initialized"
                    } else {
                        "duplicate handshake"
                    };
                    return Err(ChannelError::ProtocolViolation(reason.to_string()));
                }

                self.ticket = Some(hello.hello_world);
                let reply = if self.role == Role::Client && !self.hello_sent {
                    Some(self.hello(env)?)
                } else {
                    None
                };
                self.state = HandshakeState::Verifying;
                Ok(Inbound::Handshake { hello, reply })
            },
            other => {
                if !self.is_initialized() {
                    self.close();
                    return Err(ChannelError::ProtocolViolation(
                        "Receiving a message before handshake is complete".to_string(),
                    ));
                }
                Ok(Inbound::Message(other))
            },
        }
    }

    /// Apply the owning machine's verdict on the peer hello.
    pub fn complete_handshake(&mut self, success: bool) {
        if self.state != HandshakeState::Verifying {
            return;
        }
        if success {
            self.state = HandshakeState::Initialized;
        } else {
            self.state = HandshakeState::Failed;
            self.close();
        }
    }

    /// Encrypt the connection metadata header (outbound sockets, before
    /// anything else is sent).
    pub fn encode_metadata<E: Environment>(
        &mut self,
        env: &E,
        machine_type: MachineType,
    ) -> Result<String, ChannelError> {
        let plaintext = ConnectionMetadata { machine_type }.to_vec()?;
        let envelope = self.encrypt(env, &plaintext)?;
        Ok(encode_header(&envelope))
    }

    /// Decrypt an inbound metadata header (inbound sockets, before the hello).
    pub fn decode_metadata(&mut self, header: &str) -> Result<ConnectionMetadata, ChannelError> {
        let envelope = decode_header(header)?;
        let plaintext = self.decrypt(&envelope)?;
        Ok(ConnectionMetadata::from_slice(&plaintext)?)
    }

    fn hello<E: Environment>(&mut self, env: &E) -> Result<Bytes, ChannelError> {
        let ticket = self.ticket.ok_or_else(|| {
            ChannelError::ProtocolViolation("hello without a ticket".to_string())
        })?;
        let hello = Message::Hello(Hello {
            hello_world: ticket,
            id: self.identity.id().to_string(),
            remote_address: self.identity.remote_address().to_string(),
        });
        let frame = self.send(env, &hello, true)?;
        self.hello_sent = true;
        Ok(frame)
    }

    fn key_ticket(&self) -> Option<u32> {
        if self.is_initialized() { self.ticket } else { None }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::ManualEnv;

    fn identity(secret: &str, id: &str, address: &str) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity::new(secret, id, address))
    }

    /// Server channel for node-1 and client channel for node-2, both open.
    fn pair(env: &ManualEnv) -> (SecureChannel, SecureChannel) {
        let server =
            SecureChannel::new(identity("shared", "node-1", "10.0.0.1:4000"), Role::Server, env.now());
        let client =
            SecureChannel::new(identity("shared", "node-2", "10.0.0.2:4000"), Role::Client, env.now());
        (server, client)
    }

    /// Run the handshake to completion and return both channels initialized.
    fn handshaken(env: &ManualEnv) -> (SecureChannel, SecureChannel) {
        let (mut server, mut client) = pair(env);
        client.mark_open(env).unwrap();
        let server_hello = server.mark_open(env).unwrap().unwrap();

        let Inbound::Handshake { reply, .. } = client.receive(env, &server_hello).unwrap() else {
            panic!("expected handshake");
        };
        let client_hello = reply.unwrap();
        let Inbound::Handshake { .. } = server.receive(env, &client_hello).unwrap() else {
            panic!("expected handshake");
        };

        server.complete_handshake(true);
        client.complete_handshake(true);
        (server, client)
    }

    fn request(id: u64) -> Message {
        Message::Request(clustd_proto::Request {
            req_id: id,
            method: "ping-app".into(),
            params: Some(json!({})),
        })
    }

    #[test]
    fn first_message_uses_counter_one() {
        let env = ManualEnv::new(1);
        let (mut server, mut client) = pair(&env);
        client.mark_open(&env).unwrap();

        let hello = server.mark_open(&env).unwrap().unwrap();
        assert_eq!(server.outgoing_counter(), 1);

        client.receive(&env, &hello).unwrap();
        assert_eq!(client.incoming_counter(), 1);
    }

    #[test]
    fn server_speaks_first_client_only_replies() {
        let env = ManualEnv::new(2);
        let (mut server, mut client) = pair(&env);

        // Client-role open sends nothing.
        assert_eq!(client.mark_open(&env).unwrap(), None);
        assert_eq!(client.outgoing_counter(), 0);

        let server_hello = server.mark_open(&env).unwrap().unwrap();
        let ticket = server.ticket().unwrap();

        let Inbound::Handshake { hello, reply } = client.receive(&env, &server_hello).unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(hello.hello_world, ticket);
        assert_eq!(hello.id, "node-1");
        let reply = reply.unwrap();

        // The server owes no second hello.
        let Inbound::Handshake { hello, reply: server_reply } =
            server.receive(&env, &reply).unwrap()
        else {
            panic!("expected handshake");
        };
        assert!(server_reply.is_none());
        assert_eq!(hello.hello_world, ticket);
        assert_eq!(hello.id, "node-2");
        assert_eq!(hello.remote_address, "10.0.0.2:4000");
    }

    #[test]
    fn payload_round_trips_after_handshake() {
        let env = ManualEnv::new(3);
        let (mut server, mut client) = handshaken(&env);

        let frame = client.send(&env, &request(0), false).unwrap();
        let Inbound::Message(received) = server.receive(&env, &frame).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(received, request(0));
    }

    #[test]
    fn send_before_handshake_rejected_without_force() {
        let env = ManualEnv::new(4);
        let (_, mut client) = pair(&env);
        client.mark_open(&env).unwrap();

        assert_eq!(client.send(&env, &request(0), false), Err(ChannelError::NotInitialized));
        assert!(client.send(&env, &request(0), true).is_ok());
    }

    #[test]
    fn send_on_closed_socket_rejected() {
        let env = ManualEnv::new(5);
        let (_, mut client) = pair(&env);
        assert_eq!(client.send(&env, &request(0), true), Err(ChannelError::Closed));
    }

    #[test]
    fn hello_before_open_leaves_counters_untouched() {
        let env = ManualEnv::new(17);
        let (mut server, mut client) = pair(&env);
        let hello = server.mark_open(&env).unwrap().unwrap();

        let err = client.receive(&env, &hello).unwrap_err();
        assert_eq!(err, ChannelError::Closed);
        assert!(!err.is_fatal());
        assert_eq!(client.incoming_counter(), 0);
        assert_eq!(client.state(), HandshakeState::AwaitingHandshake);

        client.mark_open(&env).unwrap();
        let Inbound::Handshake { reply, .. } = client.receive(&env, &hello).unwrap() else {
            panic!("expected handshake");
        };
        assert!(reply.is_some());
        assert_eq!(client.incoming_counter(), 1);
    }

    #[test]
    fn wrong_secret_is_fatal() {
        let env = ManualEnv::new(6);
        let mut server =
            SecureChannel::new(identity("shared", "node-1", "a:1"), Role::Server, env.now());
        let mut client =
            SecureChannel::new(identity("not-shared", "node-2", "b:1"), Role::Client, env.now());
        client.mark_open(&env).unwrap();

        let hello = server.mark_open(&env).unwrap().unwrap();
        assert_eq!(client.receive(&env, &hello), Err(ChannelError::Decryption));
        assert!(!client.is_open());
    }

    #[test]
    fn tampered_envelope_is_fatal() {
        let env = ManualEnv::new(7);
        let (mut server, mut client) = handshaken(&env);

        let frame = client.send(&env, &request(1), false).unwrap();
        let mut tampered = frame.to_vec();
        tampered[IV_LEN] ^= 0x01;

        assert_eq!(server.receive(&env, &tampered), Err(ChannelError::Decryption));
        assert!(!server.is_open());
    }

    #[test]
    fn truncated_envelope_is_fatal() {
        let env = ManualEnv::new(8);
        let (mut server, _) = handshaken(&env);
        assert_eq!(server.receive(&env, &[0u8; 10]), Err(ChannelError::Decryption));
    }

    #[test]
    fn payload_before_handshake_is_violation() {
        let env = ManualEnv::new(9);
        let (mut server, mut client) = pair(&env);
        client.mark_open(&env).unwrap();
        server.mark_open(&env).unwrap();

        // Client forces a payload out before any hello arrives.
        let frame = client.send(&env, &request(0), true).unwrap();
        // Server has sent one message and consumed none; counters line up.
        let result = server.receive(&env, &frame);
        assert!(matches!(result, Err(ChannelError::ProtocolViolation(_))));
        assert!(!server.is_open());
    }

    #[test]
    fn second_hello_after_initialized_is_violation() {
        let env = ManualEnv::new(10);
        let (mut server, mut client) = handshaken(&env);

        let hello = Message::Hello(Hello {
            hello_world: 1,
            id: "node-2".into(),
            remote_address: "b:1".into(),
        });
        let frame = client.send(&env, &hello, true).unwrap();
        let result = server.receive(&env, &frame);
        assert!(matches!(result, Err(ChannelError::ProtocolViolation(_))));
        assert!(!server.is_open());
    }

    #[test]
    fn key_schedule_switches_at_initialization() {
        let env = ManualEnv::new(11);
        let (mut server, mut client) = pair(&env);
        client.mark_open(&env).unwrap();
        let server_hello = server.mark_open(&env).unwrap().unwrap();
        let Inbound::Handshake { reply, .. } = client.receive(&env, &server_hello).unwrap() else {
            panic!("expected handshake");
        };
        server.receive(&env, &reply.unwrap()).unwrap();

        // Only the client completes; its post-handshake keys include the ticket
        // while the server still derives without it.
        client.complete_handshake(true);
        let frame = client.send(&env, &request(0), false).unwrap();
        assert_eq!(server.receive(&env, &frame), Err(ChannelError::Decryption));
    }

    #[test]
    fn rejected_verdict_closes_channel() {
        let env = ManualEnv::new(12);
        let (mut server, mut client) = pair(&env);
        client.mark_open(&env).unwrap();
        let hello = server.mark_open(&env).unwrap().unwrap();
        client.receive(&env, &hello).unwrap();

        client.complete_handshake(false);
        assert_eq!(client.state(), HandshakeState::Failed);
        assert!(!client.is_open());
    }

    #[test]
    fn handshake_expiry_tracks_creation_time() {
        let env = ManualEnv::new(13);
        let (server, _) = pair(&env);
        let timeout = Duration::from_millis(5000);

        assert!(!server.handshake_expired(env.now() + Duration::from_millis(5000), timeout));
        assert!(server.handshake_expired(env.now() + Duration::from_millis(5001), timeout));
    }

    #[test]
    fn metadata_consumes_first_counter_on_both_ends() {
        let env = ManualEnv::new(14);
        let (mut server, mut client) = pair(&env);

        let header = client.encode_metadata(&env, MachineType::Driver).unwrap();
        let meta = server.decode_metadata(&header).unwrap();
        assert_eq!(meta.machine_type, MachineType::Driver);
        assert_eq!(client.outgoing_counter(), 1);
        assert_eq!(server.incoming_counter(), 1);

        // Handshake still lines up afterwards.
        client.mark_open(&env).unwrap();
        let hello = server.mark_open(&env).unwrap().unwrap();
        let Inbound::Handshake { reply, .. } = client.receive(&env, &hello).unwrap() else {
            panic!("expected handshake");
        };
        assert!(server.receive(&env, &reply.unwrap()).is_ok());
    }

    #[test]
    fn unknown_shape_passes_through_after_handshake() {
        let env = ManualEnv::new(15);
        let (mut server, mut client) = handshaken(&env);

        let frame = client.encrypt(&env, br#"{"foo":1}"#).unwrap();
        let Inbound::Message(msg) = server.receive(&env, &frame).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(msg.kind(), "unknown");
    }

    proptest::proptest! {
        #[test]
        fn interleaved_traffic_stays_in_step(
            seed in proptest::prelude::any::<u64>(),
            directions in proptest::collection::vec(proptest::prelude::any::<bool>(), 1..40),
        ) {
            let env = ManualEnv::new(seed);
            let (mut server, mut client) = handshaken(&env);

            for (i, to_server) in directions.into_iter().enumerate() {
                let (sender, receiver) =
                    if to_server { (&mut client, &mut server) } else { (&mut server, &mut client) };
                let frame = sender.send(&env, &request(i as u64), false).unwrap();
                let Inbound::Message(received) = receiver.receive(&env, &frame).unwrap() else {
                    panic!("expected message");
                };
                proptest::prop_assert_eq!(received, request(i as u64));
            }
            proptest::prop_assert_eq!(server.outgoing_counter(), client.incoming_counter());
            proptest::prop_assert_eq!(client.outgoing_counter(), server.incoming_counter());
        }
    }

    #[test]
    fn malformed_json_is_not_fatal() {
        let env = ManualEnv::new(16);
        let (mut server, mut client) = handshaken(&env);

        let frame = client.encrypt(&env, b"not json").unwrap();
        let err = server.receive(&env, &frame).unwrap_err();
        assert!(!err.is_fatal());
        assert!(server.is_open());
    }
}
