//! Node wiring for simulation hosts.

use std::sync::Arc;

use clustd_app::{ClusterHandler, DriverHandler, StateDriver, StaticMaster};
use clustd_core::LocalIdentity;
use clustd_node::{Node, NodeConfig, NodeError};
use clustd_proto::MachineType;
use tracing::info;

use crate::{SimAcceptor, SimEnv, SimTransport};

/// Port every simulated node listens on.
pub const PORT: u16 = 4000;

/// Secret shared by simulated nodes.
pub const SECRET: &str = "simulated-cluster-secret";

/// A node on the simulated network.
pub type SimNode = Node<SimEnv, SimTransport>;

/// Node named `id`, reachable at `id:PORT`, serving both machine types.
///
/// `get_master` reports `master`; the driver is an in-memory
/// [`StateDriver`].
pub fn build_node(id: &str, master: Option<&str>, seed: u64) -> SimNode {
    let identity = LocalIdentity::new(SECRET, id, format!("{id}:{PORT}"));
    let node = Node::new(SimEnv::with_seed(seed), identity, SimTransport, NodeConfig::default());
    node.register_handler(
        MachineType::Cluster,
        Arc::new(ClusterHandler::new(StaticMaster::new(master.map(String::from)))),
    );
    node.register_handler(MachineType::Driver, Arc::new(DriverHandler::new(StateDriver::default())));
    node
}

/// Accept sockets on `0.0.0.0:PORT` until the host shuts down.
pub async fn serve(node: SimNode) -> Result<(), NodeError> {
    let acceptor = SimAcceptor::bind(&format!("0.0.0.0:{PORT}")).await?;
    info!(id = node.identity().id(), "Simulated node listening");
    node.serve(acceptor).await
}
