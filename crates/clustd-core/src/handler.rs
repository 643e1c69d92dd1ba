//! Application request handler capability.
//!
//! A machine does not know what its methods mean. It hands inbound requests
//! and handshake decisions to a [`RequestHandler`]; the cluster and driver
//! behaviors in `clustd-app` are two implementations of it.

use async_trait::async_trait;
use clustd_proto::MachineType;
use serde_json::Value;
use thiserror::Error;

/// Failure of a request handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Method is not served by this machine
    #[error("unrecognized method for this machine")]
    Unrecognized,

    /// Handler ran and failed
    #[error("failed to process message: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Text placed in the response `error` field. Failure details stay local.
    pub fn wire_message(&self) -> &'static str {
        match self {
            Self::Unrecognized => "unrecognized method for this machine",
            Self::Failed(_) => "failed to process message",
        }
    }
}

/// What a peer declared in its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Machine type of the channel
    pub machine_type: MachineType,
    /// Declared node id
    pub peer_id: String,
    /// Declared reconnection address
    pub remote_address: String,
    /// Inbound connection from a peer that cannot be dialed back
    pub client_only: bool,
}

/// Answer to "should this handshake be accepted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Bind the channel
    Accept,
    /// Decline the peer
    Reject,
    /// No answer in time; treated as a rejection
    Undetermined,
    /// Decline this channel only; the dialing side keeps its retry schedule
    Retry,
}

impl From<bool> for Verdict {
    fn from(accept: bool) -> Self {
        if accept { Self::Accept } else { Self::Reject }
    }
}

/// Application behavior behind a machine.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Serve one inbound request.
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError>;

    /// Decide whether to accept a peer's handshake. Accepts by default.
    async fn should_accept(&self, peer: &PeerInfo) -> bool {
        let _ = peer;
        true
    }

    /// Full handshake verdict. Defaults to [`Self::should_accept`]; override
    /// to answer [`Verdict::Retry`].
    async fn verdict(&self, peer: &PeerInfo) -> Verdict {
        Verdict::from(self.should_accept(peer).await)
    }
}
