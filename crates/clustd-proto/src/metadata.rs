//! Connection metadata header.
//!
//! An outbound connector tells the acceptor which machine type the socket
//! belongs to before any handshake happens. The header travels as the body
//! of the first [`crate::Opcode::Metadata`] frame: base64 text of an
//! encrypted `{"type": "<machine type>"}` envelope.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Logical role a machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Cluster coordination peer
    Cluster,
    /// External controllable subsystem
    Driver,
}

impl MachineType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Driver => "driver",
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cluster" => Ok(Self::Cluster),
            "driver" => Ok(Self::Driver),
            other => Err(ProtocolError::UnknownMachineType(other.to_string())),
        }
    }
}

/// Plaintext of the metadata header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Machine type the connecting side wants to reach
    #[serde(rename = "type")]
    pub machine_type: MachineType,
}

impl ConnectionMetadata {
    /// Plaintext JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse plaintext JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Base64-encode an encrypted envelope for the header.
pub fn encode_header(envelope: &[u8]) -> String {
    STANDARD.encode(envelope)
}

/// Decode header text back to envelope bytes.
pub fn decode_header(header: &str) -> Result<Vec<u8>> {
    STANDARD.decode(header.trim()).map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
}
