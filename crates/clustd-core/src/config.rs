//! Timing configuration.

use std::time::Duration;

/// Timing constants for a machine and its channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// A channel is dead once no ping/pong was seen for
    /// `heartbeat_interval * stale_factor`
    pub stale_factor: u32,
    /// Delay before retrying a failed connection (constant, no backoff)
    pub reconnect_delay: Duration,
    /// How long an RPC waits for its response
    pub request_timeout: Duration,
    /// How long a channel may take to finish its handshake
    pub handshake_timeout: Duration,
    /// How long the application has to accept or reject a peer
    pub verdict_timeout: Duration,
    /// How long an outbound socket may take to open
    pub connect_timeout: Duration,
    /// How often the driver calls `tick`
    pub tick_interval: Duration,
}

impl MachineConfig {
    /// Silence longer than this closes the channel.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * self.stale_factor
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1500),
            stale_factor: 2,
            reconnect_delay: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(3000),
            handshake_timeout: Duration::from_millis(5000),
            verdict_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(3000),
            tick_interval: Duration::from_millis(100),
        }
    }
}
