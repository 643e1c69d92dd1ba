//! Deterministic simulation harness for clustd.
//!
//! Turmoil-based implementations of the Environment and Transport traits so
//! whole nodes can run against a simulated network with virtual time and a
//! seeded RNG.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_node;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_node::{PORT, SECRET, SimNode, build_node, serve};
pub use sim_transport::{SimAcceptor, SimTransport};
