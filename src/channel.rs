//! The connection manager used to send/receive messages to/from other (privacy) peers.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{self, mpsc, watch},
    time::timeout,
};
use tracing::{debug, trace};

use crate::message::{PeerId, Role};

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug, thiserror::Error)]
#[error("{reason} (during {phase})")]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the connection.
    #[error("receive failed: {0}")]
    RecvError(String),
    /// The (serialized) message could not be sent over the connection.
    #[error("send failed: {0}")]
    SendError(String),
    /// The message could not be (de-)serialized.
    #[error("(de-)serialization failed: {0}")]
    SerdeError(String),
    /// Waiting for the minimum number of connections failed.
    #[error("waiting for connections failed: {0}")]
    ConnectError(String),
}

/// Whether a message reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message was handed to the counterpart's connection.
    Delivered,
    /// The counterpart is no longer connected, the message was dropped.
    Disconnected,
}

/// Establishes links to the other participants and moves bytes over them.
///
/// A disconnected counterpart is not an error: sending reports
/// [`Delivery::Disconnected`] and receiving returns `None`.
pub trait ConnectionManager: Send + Sync + 'static {
    /// The error that can occur using the connections.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The identity of the participant owning this connection manager.
    fn me(&self) -> &PeerId;

    /// Sends a message to the given participant.
    fn send_bytes_to(
        &self,
        peer: &PeerId,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<Delivery, Self::Error>> + Send;

    /// Awaits the next message from the given participant, `None` if it is disconnected.
    fn recv_bytes_from(
        &self,
        peer: &PeerId,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// The currently connected participants with the given role, sorted and excluding self.
    fn active_peers(&self, role: Role) -> Vec<PeerId>;

    /// The number of currently connected participants with the given role, excluding self.
    fn connected_count(&self, role: Role) -> usize {
        self.active_peers(role).len()
    }

    /// Waits until at least `min_peers` Peers and `min_privacy_peers` Privacy Peers
    /// (both counts including self) are connected.
    fn wait_for_connections(
        &self,
        min_peers: usize,
        min_privacy_peers: usize,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Serializes and sends a message to the given participant.
pub async fn send_to<C: ConnectionManager>(
    conn: &C,
    peer: &PeerId,
    phase: &str,
    msg: &impl Serialize,
) -> Result<Delivery, Error> {
    let msg = bincode::serialize(msg).map_err(|e| Error {
        phase: format!("sending {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })?;
    trace!(%peer, phase, bytes = msg.len(), "sending message");
    conn.send_bytes_to(peer, msg).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::SendError(e.to_string()),
    })
}

/// Receives and deserializes a message from the given participant.
///
/// Returns `None` if the participant is disconnected.
pub async fn recv_from<T: DeserializeOwned>(
    conn: &impl ConnectionManager,
    peer: &PeerId,
    phase: &str,
) -> Result<Option<T>, Error> {
    let msg = conn.recv_bytes_from(peer).await.map_err(|e| Error {
        phase: phase.to_string(),
        reason: ErrorKind::RecvError(e.to_string()),
    })?;
    let Some(msg) = msg else {
        return Ok(None);
    };
    bincode::deserialize(&msg).map(Some).map_err(|e| Error {
        phase: format!("receiving {phase}"),
        reason: ErrorKind::SerdeError(format!("{e:?}")),
    })
}

/// Waits for the minimum number of connections, wrapping the connection manager's error.
pub async fn wait_for_connections(
    conn: &impl ConnectionManager,
    min_peers: usize,
    min_privacy_peers: usize,
) -> Result<(), Error> {
    conn.wait_for_connections(min_peers, min_privacy_peers)
        .await
        .map_err(|e| Error {
            phase: "awaiting connections".to_string(),
            reason: ErrorKind::ConnectError(e.to_string()),
        })
}

/// The error raised by a [`LocalEndpoint`].
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    /// There is no link to the given participant.
    #[error("no link to participant {0}")]
    UnknownPeer(PeerId),
    /// This endpoint was disconnected.
    #[error("endpoint {0} is disconnected")]
    NotConnected(PeerId),
    /// Nothing was received before the timeout.
    #[error("timeout elapsed waiting for {0}")]
    TimeoutElapsed(String),
    /// The network registry is gone.
    #[error("network registry closed")]
    RegistryClosed,
}

type Registry = watch::Sender<BTreeMap<PeerId, Role>>;

/// An in-memory network connecting the participants of one process with bounded channels.
#[derive(Debug)]
pub struct LocalNetwork;

impl LocalNetwork {
    /// The time a receive may block before it fails.
    pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    /// Creates connected endpoints for all given participants.
    pub fn connect(parties: impl IntoIterator<Item = (PeerId, Role)>) -> Vec<LocalEndpoint> {
        Self::connect_with_timeout(parties, Self::DEFAULT_RECV_TIMEOUT)
    }

    /// Creates connected endpoints whose receives fail after `recv_timeout`.
    pub fn connect_with_timeout(
        parties: impl IntoIterator<Item = (PeerId, Role)>,
        recv_timeout: Duration,
    ) -> Vec<LocalEndpoint> {
        let buffer_capacity = 1024;
        let parties: Vec<(PeerId, Role)> = parties.into_iter().collect();
        let (registry, _) = watch::channel(parties.iter().cloned().collect::<BTreeMap<_, _>>());
        let registry = Arc::new(registry);
        let mut senders: Vec<HashMap<PeerId, mpsc::Sender<Vec<u8>>>> =
            vec![HashMap::new(); parties.len()];
        let mut receivers: Vec<HashMap<PeerId, sync::Mutex<mpsc::Receiver<Vec<u8>>>>> =
            parties.iter().map(|_| HashMap::new()).collect();
        for (a, (id_a, _)) in parties.iter().enumerate() {
            for (b, (id_b, _)) in parties.iter().enumerate() {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = mpsc::channel(buffer_capacity);
                senders[a].insert(id_b.clone(), send_a_to_b);
                receivers[b].insert(id_a.clone(), sync::Mutex::new(recv_a_to_b));
            }
        }
        parties
            .into_iter()
            .zip(senders)
            .zip(receivers)
            .map(|(((id, role), senders), receivers)| LocalEndpoint {
                id,
                role,
                registry: Arc::clone(&registry),
                senders: Mutex::new(senders),
                receivers,
                recv_timeout,
            })
            .collect()
    }
}

/// One participant's view of a [`LocalNetwork`].
///
/// Dropping the endpoint (or calling [`LocalEndpoint::disconnect`]) closes all of its
/// links, which the counterparts observe as a disconnection.
#[derive(Debug)]
pub struct LocalEndpoint {
    id: PeerId,
    role: Role,
    registry: Arc<Registry>,
    senders: Mutex<HashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
    receivers: HashMap<PeerId, sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    recv_timeout: Duration,
}

impl LocalEndpoint {
    /// The role this endpoint was registered with.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Closes all outgoing links and removes this endpoint from the active participants.
    pub fn disconnect(&self) {
        let closed = {
            let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
            let closed = senders.len();
            senders.clear();
            closed
        };
        self.registry.send_modify(|registry| {
            registry.remove(&self.id);
        });
        debug!(peer = %self.id, links = closed, "disconnected");
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.registry.borrow().contains_key(peer)
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        if self.is_connected(&self.id) {
            self.disconnect();
        }
    }
}

impl ConnectionManager for LocalEndpoint {
    type Error = LocalError;

    fn me(&self) -> &PeerId {
        &self.id
    }

    async fn send_bytes_to(&self, peer: &PeerId, msg: Vec<u8>) -> Result<Delivery, LocalError> {
        if !self.is_connected(&self.id) {
            return Err(LocalError::NotConnected(self.id.clone()));
        }
        if !self.is_connected(peer) {
            return Ok(Delivery::Disconnected);
        }
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .ok_or_else(|| LocalError::UnknownPeer(peer.clone()))?;
        match sender.send(msg).await {
            Ok(()) => Ok(Delivery::Delivered),
            Err(_) => Ok(Delivery::Disconnected),
        }
    }

    async fn recv_bytes_from(&self, peer: &PeerId) -> Result<Option<Vec<u8>>, LocalError> {
        let receiver = self
            .receivers
            .get(peer)
            .ok_or_else(|| LocalError::UnknownPeer(peer.clone()))?;
        let mut receiver = receiver.lock().await;
        match timeout(self.recv_timeout, receiver.recv()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Err(LocalError::TimeoutElapsed(format!("a message from {peer}"))),
        }
    }

    fn active_peers(&self, role: Role) -> Vec<PeerId> {
        self.registry
            .borrow()
            .iter()
            .filter(|(id, r)| **r == role && **id != self.id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn wait_for_connections(
        &self,
        min_peers: usize,
        min_privacy_peers: usize,
    ) -> Result<(), LocalError> {
        let mut registry = self.registry.subscribe();
        let enough = registry.wait_for(|registry| {
            let privacy_peers = registry
                .values()
                .filter(|r| **r == Role::PrivacyPeer)
                .count();
            let peers = registry.len() - privacy_peers;
            peers >= min_peers && privacy_peers >= min_privacy_peers
        });
        match timeout(self.recv_timeout, enough).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(LocalError::RegistryClosed),
            Err(_) => Err(LocalError::TimeoutElapsed("connections".to_string())),
        }
    }
}
