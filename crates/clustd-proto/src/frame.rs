//! Transport frames.
//!
//! A frame is the unit the socket layer moves: `[opcode: u8][body]`. Record
//! boundaries come from the length-delimited codec underneath, so the frame
//! itself carries no length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    opcodes::Opcode,
};

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub opcode: Opcode,
    /// Opaque body (empty for control frames)
    pub body: Bytes,
}

impl Frame {
    /// Largest body we accept (16 MiB).
    pub const MAX_SIZE: usize = 16 * 1024 * 1024;

    /// Create a frame from parts.
    pub fn new(opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self { opcode, body: body.into() }
    }

    /// Metadata header frame. The body is the base64 text itself.
    pub fn metadata(header: &str) -> Self {
        Self::new(Opcode::Metadata, Bytes::copy_from_slice(header.as_bytes()))
    }

    /// Encrypted message frame.
    pub fn message(envelope: Bytes) -> Self {
        Self::new(Opcode::Message, envelope)
    }

    /// Ping control frame.
    pub fn ping() -> Self {
        Self::new(Opcode::Ping, Bytes::new())
    }

    /// Pong control frame.
    pub fn pong() -> Self {
        Self::new(Opcode::Pong, Bytes::new())
    }

    /// Close control frame.
    pub fn close() -> Self {
        Self::new(Opcode::Close, Bytes::new())
    }

    /// Serialize into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.body.len() > Self::MAX_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: self.body.len(), max: Self::MAX_SIZE });
        }
        dst.reserve(1 + self.body.len());
        dst.put_u8(self.opcode.to_u8());
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse one record produced by the length-delimited codec.
    pub fn decode(mut record: Bytes) -> Result<Self> {
        if record.is_empty() {
            return Err(ProtocolError::TooShort { expected: 1, actual: 0 });
        }
        let opcode = Opcode::from_u8(record[0])?;
        let body = record.split_off(1);
        if body.len() > Self::MAX_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: body.len(), max: Self::MAX_SIZE });
        }
        Ok(Self { opcode, body })
    }

    /// Body as UTF-8, for metadata frames.
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
    }
}
