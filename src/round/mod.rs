//! Round orchestration for both roles.
//!
//! A round moves every participant through the same phases: the Peers send shares of
//! their input, the Privacy Peers collect them, compute on them together, reconstruct the
//! result and send it back. [`Peer`] and [`PrivacyPeer`] are actors consuming the events
//! of their workers, one worker per counterpart.

use std::{collections::BTreeMap, fmt};

use crate::message::PeerId;

mod peer;
mod privacy_peer;

pub use peer::Peer;
pub use privacy_peer::PrivacyPeer;

/// The phase a participant is in, as reported in diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for the minimum number of counterparts.
    #[default]
    AwaitingConnections,
    /// Encoding the input and sending the shares (Peer).
    GeneratingShares,
    /// Waiting for the final result (Peer).
    AwaitingResult,
    /// Handing the result to the output sink (Peer).
    WritingOutput,
    /// Receiving the shares of all Peers (Privacy Peer).
    CollectingShares,
    /// Running the secure computation (Privacy Peer).
    SecureCompute,
    /// Reconstructing the result (Privacy Peer).
    Finalizing,
    /// Sending the result to the Peers (Privacy Peer).
    DistributingResult,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AwaitingConnections => "awaiting connections",
            Phase::GeneratingShares => "generating shares",
            Phase::AwaitingResult => "awaiting result",
            Phase::WritingOutput => "writing output",
            Phase::CollectingShares => "collecting shares",
            Phase::SecureCompute => "secure compute",
            Phase::Finalizing => "finalizing",
            Phase::DistributingResult => "distributing result",
        };
        f.write_str(name)
    }
}

/// Assigns indices `0..n` to the participants in lexicographic order of their ids.
///
/// The result only depends on the set of ids, so all Privacy Peers agree on it.
pub fn index_map(ids: impl IntoIterator<Item = PeerId>) -> BTreeMap<PeerId, usize> {
    let mut ids: Vec<PeerId> = ids.into_iter().collect();
    ids.sort();
    ids.dedup();
    ids.into_iter().enumerate().map(|(i, id)| (id, i)).collect()
}

/// The outcome of [`Countdown::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    /// The counter was decremented and is still positive.
    Pending(usize),
    /// The counter was decremented to zero by this tick.
    ReachedZero,
    /// The counter was already zero, nothing changed.
    AlreadyZero,
}

/// A counter owned by one orchestrator that reports reaching zero exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Countdown {
    remaining: usize,
}

impl Countdown {
    /// Starts counting down from `n`.
    pub fn new(n: usize) -> Self {
        Self { remaining: n }
    }

    /// The number of ticks until zero.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Decrements the counter.
    pub fn tick(&mut self) -> CountdownStep {
        match self.remaining {
            0 => CountdownStep::AlreadyZero,
            1 => {
                self.remaining = 0;
                CountdownStep::ReachedZero
            }
            n => {
                self.remaining = n - 1;
                CountdownStep::Pending(n - 1)
            }
        }
    }
}
