//! Node: machine registry and inbound routing.
//!
//! A node owns one [`MachineHandle`] per configured peer plus one per
//! accepted socket. Inbound sockets are routed by the machine type in their
//! metadata header to a fresh machine; once its handshake is accepted the
//! machine is registered under `(machine type, peer id)`.
//!
//! A handshake from a peer that already has an open machine of the same
//! type is declined on either end with [`Verdict::Retry`], so each pair of
//! nodes converges on one channel per machine type. The declined dialer keeps
//! retrying and takes over once the surviving channel is lost. Two handshakes
//! verified at the same instant can both pass; the pair then keeps two
//! channels until one is lost.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use clustd_core::{
    Environment, HandlerError, LocalIdentity, Machine, MachineConfig, MachineEvent, PeerInfo,
    RequestHandler, Role, SecureChannel, Verdict,
    transport::{Acceptor, Transport},
};
use clustd_proto::{MachineType, Opcode};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::error::RecvError,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::NodeConfig,
    error::NodeError,
    handle::MachineHandle,
    socket::{framed, read_frame},
};

type PeerKey = (MachineType, String);

#[derive(Debug, Default)]
struct Registry {
    peers: Mutex<HashMap<PeerKey, MachineHandle>>,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerKey, MachineHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self, machine_type: MachineType, peer_id: &str) -> bool {
        self.lock()
            .get(&(machine_type, peer_id.to_string()))
            .is_some_and(MachineHandle::is_open)
    }

    fn insert(&self, key: PeerKey, handle: MachineHandle) {
        self.lock().insert(key, handle);
    }

    fn remove(&self, key: &PeerKey, handle: &MachineHandle) {
        let mut peers = self.lock();
        if peers.get(key).is_some_and(|current| current.same_machine(handle)) {
            peers.remove(key);
        }
    }

    fn get(&self, machine_type: MachineType, peer_id: &str) -> Option<MachineHandle> {
        self.lock().get(&(machine_type, peer_id.to_string())).cloned()
    }
}

/// Declines a peer that already has an open machine of the same type, then
/// defers to the application handler.
struct Gate {
    inner: Arc<dyn RequestHandler>,
    registry: Arc<Registry>,
}

#[async_trait]
impl RequestHandler for Gate {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, HandlerError> {
        self.inner.handle(method, params).await
    }

    async fn should_accept(&self, peer: &PeerInfo) -> bool {
        self.inner.should_accept(peer).await
    }

    async fn verdict(&self, peer: &PeerInfo) -> Verdict {
        if self.registry.is_open(peer.machine_type, &peer.peer_id) {
            info!(peer_id = %peer.peer_id, machine_type = %peer.machine_type, "Already connected to peer");
            return Verdict::Retry;
        }
        self.inner.verdict(peer).await
    }
}

struct Inner<E, T> {
    env: E,
    identity: Arc<LocalIdentity>,
    transport: Arc<T>,
    config: NodeConfig,
    handlers: RwLock<HashMap<MachineType, Arc<dyn RequestHandler>>>,
    registry: Arc<Registry>,
    machines: Mutex<Vec<MachineHandle>>,
}

/// One clustd process.
pub struct Node<E, T> {
    inner: Arc<Inner<E, T>>,
}

impl<E, T> Clone for Node<E, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment, T: Transport> Node<E, T> {
    /// Create a node with no handlers and no machines.
    pub fn new(env: E, identity: LocalIdentity, transport: T, config: NodeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                identity: Arc::new(identity),
                transport: Arc::new(transport),
                config,
                handlers: RwLock::new(HashMap::new()),
                registry: Arc::new(Registry::default()),
                machines: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This node's identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Timing used for every machine.
    pub fn machine_config(&self) -> &MachineConfig {
        &self.inner.config.machine
    }

    /// Serve `machine_type` with `handler`. Replaces any previous handler;
    /// machines already spawned keep theirs.
    pub fn register_handler(&self, machine_type: MachineType, handler: Arc<dyn RequestHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine_type, handler);
    }

    /// Spawn an inactive machine dialing `host`.
    ///
    /// A host equal to the identity's remote address yields the local
    /// machine, which is always open and serves requests in-process.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoHandler`] if `machine_type` has no handler.
    pub fn spawn_machine(
        &self,
        machine_type: MachineType,
        host: impl Into<String>,
    ) -> Result<MachineHandle, NodeError> {
        self.spawn(machine_type, host.into(), false)
    }

    /// Registered machine bound to `peer_id`, if any.
    pub fn machine(&self, machine_type: MachineType, peer_id: &str) -> Option<MachineHandle> {
        self.inner.registry.get(machine_type, peer_id)
    }

    /// Accept sockets until the acceptor fails.
    ///
    /// # Errors
    ///
    /// The acceptor's I/O error.
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> Result<(), NodeError> {
        loop {
            let (stream, peer) = acceptor.accept().await?;
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.accept(stream, &peer).await {
                    warn!(%peer, error = %e, "Dropping inbound socket");
                }
            });
        }
    }

    /// Stop every machine this node spawned.
    pub async fn stop_all(&self) {
        let machines = self.machines();
        for machine in &machines {
            machine.stop().await;
        }
        info!(count = machines.len(), "All machines stopped");
    }

    /// Every machine currently tracked.
    pub fn machines(&self) -> Vec<MachineHandle> {
        self.inner.machines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Read the metadata header, then hand the socket to a new machine.
    async fn accept<S>(&self, stream: S, peer: &str) -> Result<(), NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut socket = framed(stream);
        let limit = self.inner.config.machine.handshake_timeout;
        let frame = match timeout(limit, read_frame(&mut socket)).await {
            Err(_) => return Err(NodeError::MetadataTimeout),
            Ok(None) => return Err(NodeError::ClosedEarly),
            Ok(Some(frame)) => frame?,
        };
        if frame.opcode != Opcode::Metadata {
            return Err(NodeError::UnexpectedFrame(frame.opcode));
        }

        let mut channel =
            SecureChannel::new(Arc::clone(&self.inner.identity), Role::Server, self.inner.env.now());
        let metadata = channel.decode_metadata(frame.body_str()?)?;
        let handle = self.spawn(metadata.machine_type, peer.to_string(), true)?;
        handle.start().await;
        handle.attach(channel, socket, self.inner.config.client_only_inbound);

        debug!(%peer, machine_type = %metadata.machine_type, "Routed inbound socket");
        Ok(())
    }

    fn spawn(
        &self,
        machine_type: MachineType,
        host: String,
        inbound: bool,
    ) -> Result<MachineHandle, NodeError> {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&machine_type)
            .cloned()
            .ok_or(NodeError::NoHandler(machine_type))?;
        let gate = Gate { inner: handler, registry: Arc::clone(&self.inner.registry) };

        let machine = Machine::new(
            machine_type,
            Arc::clone(&self.inner.identity),
            host,
            self.inner.config.machine.clone(),
        );
        let handle = MachineHandle::spawn(
            self.inner.env.clone(),
            machine,
            Arc::clone(&self.inner.transport),
            Arc::new(gate),
        );

        self.track(&handle, inbound);
        self.inner.machines.lock().unwrap_or_else(PoisonError::into_inner).push(handle.clone());
        Ok(handle)
    }

    /// Keep the registry in step with `handle`'s lifecycle.
    ///
    /// Inbound machines live for one socket: one that fails its handshake or
    /// loses its channel is stopped, and a stopped one is forgotten. Only
    /// machines spawned with [`Node::spawn_machine`] reconnect.
    fn track(&self, handle: &MachineHandle, inbound: bool) {
        let node = self.clone();
        let handle = handle.clone();
        let mut events = handle.subscribe();

        tokio::spawn(async move {
            let mut key: Option<PeerKey> = None;
            loop {
                match events.recv().await {
                    Ok(MachineEvent::Connected { peer_id }) => {
                        let peer = (handle.machine_type(), peer_id);
                        node.inner.registry.insert(peer.clone(), handle.clone());
                        key = Some(peer);
                    },
                    Ok(MachineEvent::HandshakeRejected { .. }) if inbound && key.is_none() => {
                        handle.stop().await;
                    },
                    Ok(MachineEvent::ConnectionLost) if inbound => {
                        // The dialing side owns reconnection.
                        handle.stop().await;
                    },
                    Ok(MachineEvent::Stopped) => {
                        if let Some(peer) = key.take() {
                            node.inner.registry.remove(&peer, &handle);
                        }
                        if inbound {
                            node.forget(&handle);
                            break;
                        }
                    },
                    Ok(_) | Err(RecvError::Lagged(_)) => {},
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn forget(&self, handle: &MachineHandle) {
        self.inner
            .machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|machine| !machine.same_machine(handle));
    }
}
