//! Wire format for the clustd control-plane fabric.
//!
//! Three layers sit on top of a length-delimited byte stream:
//!
//! - [`Frame`]: one opcode byte plus a body. Carries the connection metadata
//!   header, encrypted messages, and transport-level ping/pong/close.
//! - [`Envelope`]: the AEAD framing of a [`Opcode::Message`] body,
//!   `[12-byte IV][16-byte tag][ciphertext]`.
//! - [`Message`]: the JSON control messages inside an envelope (handshake,
//!   request, response).
//!
//! Nothing in this crate touches keys. Encryption lives in `clustd-crypto` and
//! the per-channel counters in `clustd-core`.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod errors;
pub mod frame;
pub mod message;
pub mod metadata;
pub mod opcodes;

pub use envelope::Envelope;
pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use message::{Hello, Message, Request, RequestId, Response};
pub use metadata::{ConnectionMetadata, MachineType};
pub use opcodes::Opcode;
