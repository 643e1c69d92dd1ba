//! Application layer for clustd
//!
//! Concrete behaviors plugged into a machine through
//! [`clustd_core::RequestHandler`]. The core routes inbound requests to
//! them and sends back whatever they return.
//!
//! # Components
//!
//! - [`ClusterHandler`]: answers `get_master` from a [`MasterSource`]
//! - [`DriverHandler`]: maps `start` / `stop` / `trigger` onto a [`Driver`]
//! - [`StateDriver`]: in-memory [`Driver`] that tracks a running flag

mod cluster;
mod driver;

pub use cluster::{ClusterHandler, MasterSource, StaticMaster};
pub use driver::{Driver, DriverHandler, StateDriver};
