//! Transport frame opcodes.

use crate::errors::{ProtocolError, Result};

/// Kind of a transport frame.
///
/// `Metadata` only ever appears as the first frame an outbound connector
/// writes. `Ping`/`Pong`/`Close` have empty bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Base64 connection metadata header (routes the socket to a machine type)
    Metadata = 0x01,
    /// AEAD envelope carrying a control message
    Message = 0x02,
    /// Liveness probe
    Ping = 0x03,
    /// Liveness probe answer
    Pong = 0x04,
    /// Orderly close
    Close = 0x05,
}

impl Opcode {
    /// Wire representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Metadata),
            0x02 => Ok(Self::Message),
            0x03 => Ok(Self::Ping),
            0x04 => Ok(Self::Pong),
            0x05 => Ok(Self::Close),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// Control frames carry no body.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Close)
    }
}
