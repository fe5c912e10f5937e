//! Runs a whole group of Peers and Privacy Peers in one process.

use std::{sync::Arc, time::Duration};

use futures::future::{try_join, try_join_all};
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    Error, Peer, PrivacyPeer,
    channel::LocalNetwork,
    config::ProtocolConfig,
    engine::ShamirEngineBuilder,
    event::Notification,
    io::{InputSource, OutputSink},
    message::{PeerId, Role},
};

/// A Peer of a simulated group with its input and output.
#[derive(Debug)]
pub struct SimulatedPeer<I, O> {
    /// The Peer's id.
    pub id: PeerId,
    /// Where the Peer reads its records from.
    pub input: I,
    /// Where the Peer writes its results to.
    pub output: O,
}

/// Connects all participants over a [`LocalNetwork`] and runs all rounds.
///
/// Returns the notifications of all participants, or the first error. Privacy Peers use
/// the [`crate::engine::ShamirEngine`].
pub async fn simulate_group<I: InputSource, O: OutputSink>(
    config: &ProtocolConfig,
    peers: Vec<SimulatedPeer<I, O>>,
    privacy_peers: Vec<PeerId>,
    recv_timeout: Duration,
) -> Result<Vec<Notification>, Error> {
    config.validate()?;
    info!(
        peers = peers.len(),
        privacy_peers = privacy_peers.len(),
        rounds = config.time_slot_count,
        "simulating group"
    );
    let parties = peers
        .iter()
        .map(|p| (p.id.clone(), Role::Peer))
        .chain(privacy_peers.iter().map(|id| (id.clone(), Role::PrivacyPeer)));
    let mut endpoints = LocalNetwork::connect_with_timeout(parties, recv_timeout).into_iter();

    let mut receivers: Vec<mpsc::UnboundedReceiver<Notification>> = vec![];
    let mut peer_runs = vec![];
    for (peer, endpoint) in peers.into_iter().zip(&mut endpoints) {
        let mut peer = Peer::new(Arc::new(endpoint), config.clone(), peer.input, peer.output);
        receivers.push(peer.subscribe());
        peer_runs.push(peer.run());
    }
    let mut privacy_peer_runs = vec![];
    for endpoint in endpoints {
        let endpoint = Arc::new(endpoint);
        let builder = ShamirEngineBuilder::new(Arc::clone(&endpoint));
        let mut privacy_peer = PrivacyPeer::new(endpoint, config.clone(), builder);
        receivers.push(privacy_peer.subscribe());
        privacy_peer_runs.push(privacy_peer.run());
    }

    try_join(try_join_all(peer_runs), try_join_all(privacy_peer_runs)).await?;

    let mut notifications = vec![];
    for mut receiver in receivers {
        while let Ok(notification) = receiver.try_recv() {
            notifications.push(notification);
        }
    }
    Ok(notifications)
}
