//! clustd core logic
//!
//! Pure state machines for the clustd fabric, decoupled from sockets, clocks
//! and schedulers.
//!
//! # Architecture
//!
//! Two layers, both Sans-IO:
//!
//! - [`channel::SecureChannel`] owns one socket's worth of crypto state:
//!   direction counters, session ticket, and the handshake state. It turns
//!   control messages into AEAD envelopes and back.
//! - [`machine::Machine`] owns one peer relationship: which channel is bound,
//!   which handshakes are in flight, which RPCs are pending, and when the next
//!   heartbeat / reconnect is due.
//!
//! Operations take an [`env::Environment`] for time and randomness and return
//! [`machine::MachineAction`]s. A driver (the `clustd-node` runtime or a test)
//! executes them and feeds socket events back in. Every timer is a deadline
//! checked by [`machine::Machine::tick`], so `stop()` cancels all of them by
//! clearing state.
//!
//! # Components
//!
//! - [`channel`]: secure channel and handshake negotiation
//! - [`machine`]: connection lifecycle, heartbeat, RPC correlation
//! - [`handler`]: application request handler capability
//! - [`config`]: timing constants
//! - [`identity`]: local identity and shared secret
//! - [`mod@env`]: environment abstraction (time, RNG)
//! - [`transport`]: transport abstraction (byte streams)
//! - [`error`]: error types

pub mod channel;
pub mod config;
pub mod env;
pub mod error;
pub mod handler;
pub mod identity;
pub mod machine;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelId, HandshakeState, Inbound, Role, SecureChannel};
pub use config::MachineConfig;
pub use env::Environment;
pub use error::{ChannelError, HandshakeError, MachineError, RequestError};
pub use handler::{HandlerError, PeerInfo, RequestHandler, Verdict};
pub use identity::LocalIdentity;
pub use machine::{AttemptId, Machine, MachineAction, MachineEvent};
