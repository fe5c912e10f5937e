//! Participant identities and the messages exchanged between Peers and Privacy Peers.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// The identity of a (privacy) peer, as known to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Creates a new id from anything string-like.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// The role a participant plays in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Owns private input, secret-shares it and receives the aggregate.
    Peer,
    /// Holds shares and jointly runs the secure computation.
    PrivacyPeer,
}

/// The content of a [`Message`].
///
/// Exactly one kind of content is carried at a time, so a share message always has shares
/// and a result message always has a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Announces a participant.
    Hello,
    /// Announces that a participant leaves.
    Goodbye,
    /// Synthesized locally for a counterpart that could not be reached. Never sent.
    Dummy,
    /// This round's shares of a Peer's input, one entry per item.
    InitialShares(Vec<u64>),
    /// The reconstructed aggregate of this round.
    FinalResult(Vec<u64>),
}

impl Payload {
    /// A short name of the payload kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello => "hello",
            Payload::Goodbye => "goodbye",
            Payload::Dummy => "dummy",
            Payload::InitialShares(_) => "initial shares",
            Payload::FinalResult(_) => "final result",
        }
    }
}

/// A round message between a Peer and a Privacy Peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The sender of the message.
    pub sender: PeerId,
    /// The sender's index in the round: its evaluation point for Privacy Peers, 0 for Peers.
    pub sender_index: usize,
    /// The round (time slot) this message belongs to.
    pub round: u32,
    /// The content.
    pub payload: Payload,
}

impl Message {
    /// Creates a message sent by `sender` in `round`.
    pub fn new(sender: PeerId, sender_index: usize, round: u32, payload: Payload) -> Self {
        Self {
            sender,
            sender_index,
            round,
            payload,
        }
    }

    /// The stand-in for a message of a counterpart that is no longer connected.
    pub fn dummy(sender: PeerId, sender_index: usize, round: u32) -> Self {
        Self::new(sender, sender_index, round, Payload::Dummy)
    }

    /// Whether this message was synthesized for an unreachable counterpart.
    pub fn is_dummy(&self) -> bool {
        matches!(self.payload, Payload::Dummy)
    }
}

/// What a (privacy) peer knows about one of its counterparts during a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    /// The counterpart's identity.
    pub id: PeerId,
    /// The counterpart's structural index in this round.
    pub index: usize,
    /// The shares received from the counterpart, `None` if it was offline.
    pub initial_shares: Option<Vec<u64>>,
    /// Whether a (real or dummy) share message was processed for the counterpart.
    pub received: bool,
}

impl ParticipantInfo {
    pub(crate) fn new(id: PeerId, index: usize) -> Self {
        Self {
            id,
            index,
            initial_shares: None,
            received: false,
        }
    }
}
