//! Node configuration and command-line arguments.

use std::time::Duration;

use clap::Parser;
use clustd_core::{LocalIdentity, MachineConfig};
use clustd_proto::MachineType;

use crate::error::NodeError;

/// Runtime settings shared by every machine of a node.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Timing for machines and channels
    pub machine: MachineConfig,
    /// Mark accepted sockets as coming from peers that cannot be dialed
    /// back, so their machines never reconnect on their own
    pub client_only_inbound: bool,
}

/// clustd node.
#[derive(Debug, Clone, Parser)]
#[command(name = "clustd", version, about = "Encrypted control-plane fabric node")]
pub struct Args {
    /// Address to accept peer sockets on
    #[arg(long, default_value = "0.0.0.0:4000")]
    pub listen: String,

    /// Node id announced to peers
    #[arg(long)]
    pub id: String,

    /// Address peers should dial to reach this node
    #[arg(long)]
    pub remote_address: String,

    /// Cluster-wide pre-shared secret
    #[arg(long, env = "CLUSTD_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Peer address to keep a machine connected to (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Machine type used for configured peers
    #[arg(long, default_value = "cluster")]
    pub machine_type: MachineType,

    /// Master id reported by `get_master`
    #[arg(long)]
    pub master: Option<String>,

    /// Treat accepted sockets as client-only
    #[arg(long)]
    pub accept_client_only: bool,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value_t = 1500)]
    pub heartbeat_ms: u64,

    /// Delay between connection attempts in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub reconnect_ms: u64,

    /// RPC timeout in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub request_timeout_ms: u64,
}

impl Args {
    /// Check values clap cannot.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.id.trim().is_empty() {
            return Err(NodeError::Config("--id must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(NodeError::Config("secret must not be empty".into()));
        }
        for address in std::iter::once(&self.remote_address).chain(&self.peers) {
            if address.rsplit_once(':').is_none_or(|(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(NodeError::Config(format!("{address:?} is not address:port")));
            }
        }
        if self.heartbeat_ms == 0 || self.request_timeout_ms == 0 {
            return Err(NodeError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Identity announced in handshakes.
    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity::new(self.secret.as_bytes(), self.id.clone(), self.remote_address.clone())
    }

    /// Node settings from the timing flags.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            machine: MachineConfig {
                heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
                reconnect_delay: Duration::from_millis(self.reconnect_ms),
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                ..MachineConfig::default()
            },
            client_only_inbound: self.accept_client_only,
        }
    }
}
