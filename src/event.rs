//! Events from workers to their orchestrator and notifications to the application.

use tokio::sync::mpsc;

use crate::{
    channel::Delivery,
    message::{Message, PeerId},
    round::Phase,
    worker::WorkerError,
};

/// A worker event, tagged with the round and the worker's counterpart.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub(crate) round: u32,
    pub(crate) counterpart: PeerId,
    pub(crate) kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    /// A real or dummy message was received from the counterpart.
    Received(Message),
    /// The leading compute worker reached the given phase.
    Progress(Phase),
    /// The leading compute worker reconstructed the round's result.
    ResultReady(Vec<u64>),
    /// The final result was handed to the connection manager.
    FinalResultSent(Delivery),
    /// The worker gave up.
    Failed { phase: Phase, error: WorkerError },
}

/// Reported to the application by a [`crate::Peer`] or [`crate::PrivacyPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A round started with the given counterparts.
    RoundStarted {
        /// The participant that started the round.
        peer: PeerId,
        /// The round.
        round: u32,
        /// The active counterparts the round is run with.
        counterparts: Vec<PeerId>,
    },
    /// The final result of a round is known.
    FinalResult(FinalResultEvent),
    /// The protocol was stopped because of an error.
    Exception(ExceptionEvent),
}

/// The final result of a round.
///
/// For a Peer, `originator` is the Privacy Peer whose result was kept. For a Privacy Peer
/// both ids are its own and the event signals that the result was distributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResultEvent {
    /// The round.
    pub round: u32,
    /// The participant that received the result.
    pub receiver: PeerId,
    /// The participant that computed the result.
    pub originator: PeerId,
    /// The reconstructed aggregate.
    pub result: Vec<u64>,
}

/// Diagnostics of an error that stopped the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEvent {
    /// The participant that stopped.
    pub peer: PeerId,
    /// The round in which the error occurred.
    pub round: u32,
    /// The phase in which the error occurred.
    pub phase: Phase,
    /// The counterpart involved, if any.
    pub counterpart: Option<PeerId>,
    /// A human-readable description.
    pub diagnostic: String,
}

/// The subscribers of an orchestrator's notifications.
#[derive(Debug, Default)]
pub(crate) struct Listeners(Vec<mpsc::UnboundedSender<Notification>>);

impl Listeners {
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.push(tx);
        rx
    }

    /// Sends the notification to every listener, forgetting those that went away.
    pub(crate) fn notify(&mut self, notification: Notification) {
        self.0.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}
