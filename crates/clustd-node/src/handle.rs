//! Handle to a running machine task.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use clustd_core::{
    Environment, Machine, MachineError, MachineEvent, RequestError, RequestHandler,
    SecureChannel, transport::Transport,
};
use clustd_proto::MachineType;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot, watch},
};

use crate::{
    socket::{FramedSocket, drive},
    task::{Command, Input, MachineTask},
};

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;

/// Snapshot of a machine, refreshed after every step of its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    /// Accepting connections and requests
    pub active: bool,
    /// A handshaked channel is bound (always true for the local machine)
    pub open: bool,
    /// Peer id from the last accepted handshake
    pub peer_id: Option<String>,
    /// `address:port` this machine dials
    pub host: String,
    /// RPCs awaiting a response
    pub pending_requests: usize,
}

impl MachineStatus {
    pub(crate) fn of(machine: &Machine) -> Self {
        Self {
            active: machine.is_active(),
            open: machine.is_open(),
            peer_id: machine.peer_id().map(str::to_string),
            host: machine.host().to_string(),
            pending_requests: machine.pending_requests(),
        }
    }
}

/// Cheap, cloneable control surface for one machine.
///
/// The task behind it exits once every clone is dropped; a final stop runs
/// first so pending requests are answered.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    id: u64,
    machine_type: MachineType,
    commands: mpsc::Sender<Command>,
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<MachineEvent>,
    status: watch::Receiver<MachineStatus>,
}

impl MachineHandle {
    /// Spawn the task owning `machine`.
    pub(crate) fn spawn<E: Environment, T: Transport>(
        env: E,
        machine: Machine,
        transport: Arc<T>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (status_tx, status) = watch::channel(MachineStatus::of(&machine));
        let machine_type = machine.machine_type();

        let task = MachineTask {
            env,
            machine,
            transport,
            handler,
            commands: command_rx,
            inputs: input_rx,
            input_tx: inputs.clone(),
            events: events.clone(),
            status: status_tx,
            sockets: HashMap::new(),
            requests: HashMap::new(),
            attempts: HashMap::new(),
        };
        tokio::spawn(task.run());

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            machine_type,
            commands,
            inputs,
            events,
            status,
        }
    }

    /// Machine type served.
    pub fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    /// Latest status snapshot.
    pub fn status(&self) -> MachineStatus {
        self.status.borrow().clone()
    }

    /// Whether a channel is bound.
    pub fn is_open(&self) -> bool {
        self.status.borrow().open
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<MachineStatus> {
        self.status.clone()
    }

    /// Observe lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    /// Activate the machine.
    pub async fn start(&self) {
        let _ = self.commands.send(Command::Start).await;
    }

    /// Deactivate the machine and wait until its sockets are released and
    /// pending requests answered.
    pub async fn stop(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Dial the peer now.
    ///
    /// With `reject_on_fail` the first attempt's failure is returned;
    /// otherwise this resolves once the first attempt settles and retries
    /// continue in the background. An explicit handshake rejection resolves
    /// `Ok` either way and is reported as a
    /// [`MachineEvent::HandshakeRejected`] event.
    ///
    /// # Errors
    ///
    /// [`MachineError::LocalMachine`] for the local machine,
    /// [`MachineError::Stopped`] if the machine stops or its task is gone,
    /// and [`MachineError::Connect`] for other failures when
    /// `reject_on_fail` is set.
    pub async fn connect(&self, reject_on_fail: bool) -> Result<(), MachineError> {
        let (reply, wait) = oneshot::channel();
        self.commands
            .send(Command::Connect { reject_on_fail, reply })
            .await
            .map_err(|_| MachineError::Stopped)?;
        wait.await.map_err(|_| MachineError::Stopped)?
    }

    /// Call `method` on the peer.
    ///
    /// # Errors
    ///
    /// See [`RequestError`]. A vanished task reports
    /// [`RequestError::Stopped`].
    pub async fn send(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Option<Value>, RequestError> {
        let (reply, wait) = oneshot::channel();
        self.commands
            .send(Command::Send { method: method.into(), params, reply })
            .await
            .map_err(|_| RequestError::Stopped)?;
        wait.await.map_err(|_| RequestError::Stopped)?
    }

    /// Hand an accepted socket to the machine.
    ///
    /// The attach is queued before the socket task starts, so the machine
    /// knows the channel before any of its frames arrive.
    pub(crate) fn attach<S>(&self, channel: SecureChannel, socket: FramedSocket<S>, client_only: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = channel.id();
        let (outbound, queue) = mpsc::unbounded_channel();
        if self.inputs.send(Input::Attach { channel, outbound, client_only }).is_err() {
            return;
        }
        tokio::spawn(drive(id, socket, queue, self.inputs.clone()));
    }

    /// Whether both handles drive the same task.
    pub fn same_machine(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
