//! clustd node runtime
//!
//! Drives the Sans-IO machines from `clustd-core` on tokio.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────┐   commands    ┌──────────────┐
//!  caller ──>│ MachineHandle│──────────────>│ machine task │──> RequestHandler
//!            └──────────────┘<── events ────└──────────────┘
//!                                              ^        │ frames
//!                                   socket     │        v
//!                                   events     └── socket tasks (one per channel)
//! ```
//!
//! - [`Node`] accepts sockets, reads their metadata header and routes each
//!   one to a fresh machine of the declared type. It also keeps the
//!   `(machine type, peer id)` registry used to decline duplicate links.
//! - [`MachineHandle`] is the async surface of one machine task: start,
//!   stop, connect, send, and lifecycle event subscription.
//! - Each socket is owned by a task speaking length-delimited [`Frame`]s.
//!
//! [`Frame`]: clustd_proto::Frame

pub mod config;
pub mod env;
pub mod error;
pub mod handle;
pub mod node;
pub mod socket;
pub mod tcp;

mod task;

pub use config::{Args, NodeConfig};
pub use env::SystemEnv;
pub use error::NodeError;
pub use handle::{MachineHandle, MachineStatus};
pub use node::Node;
pub use socket::{FramedSocket, framed, read_frame, write_frame};
pub use tcp::{TcpAcceptor, TcpTransport};
