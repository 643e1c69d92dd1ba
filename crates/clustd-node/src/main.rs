//! clustd node binary.

use std::sync::Arc;

use clap::Parser;
use clustd_app::{ClusterHandler, DriverHandler, StateDriver, StaticMaster};
use clustd_node::{Args, Node, NodeError, SystemEnv, TcpAcceptor, TcpTransport};
use clustd_proto::MachineType;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %e, "clustd exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), NodeError> {
    args.validate()?;

    let node = Node::new(SystemEnv, args.identity(), TcpTransport, args.node_config());
    node.register_handler(
        MachineType::Cluster,
        Arc::new(ClusterHandler::new(StaticMaster::new(args.master.clone()))),
    );
    node.register_handler(MachineType::Driver, Arc::new(DriverHandler::new(StateDriver::default())));

    let acceptor = TcpAcceptor::bind(&args.listen).await?;
    info!(
        id = %args.id,
        listen = %acceptor.local_addr()?,
        remote_address = %args.remote_address,
        "clustd listening"
    );

    // The local machine answers in-process for this node's own address.
    node.spawn_machine(args.machine_type, args.remote_address.clone())?;

    for peer in &args.peers {
        let machine = node.spawn_machine(args.machine_type, peer.clone())?;
        machine.start().await;
        tokio::spawn(async move {
            if let Err(e) = machine.connect(false).await {
                warn!(error = %e, "Peer connection not scheduled");
            }
        });
    }

    let result = tokio::select! {
        result = node.serve(acceptor) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        },
    };
    node.stop_all().await;
    result
}
