use crate::{
    barrier::BarrierError,
    bloom::BloomError,
    channel,
    config::ConfigError,
    engine::EngineError,
    io::{InputError, OutputError},
    message::PeerId,
    round::Phase,
    worker::WorkerError,
};

/// Errors that stop a [`crate::Peer`] or [`crate::PrivacyPeer`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A counterpart sent a message that does not fit the protocol.
    #[error("protocol violation by {counterpart} in round {round}: {reason}")]
    ProtocolViolation {
        /// The round.
        round: u32,
        /// The counterpart the message came from.
        counterpart: PeerId,
        /// What was wrong with the message.
        reason: String,
    },
    /// The secure computation failed.
    #[error("computation failed in round {round}: {source}")]
    Computation {
        /// The round.
        round: u32,
        /// The engine error.
        source: EngineError,
    },
    /// A worker failed for a reason other than a disconnected counterpart.
    #[error("worker for {counterpart} failed in round {round} during {phase}: {source}")]
    Worker {
        /// The round.
        round: u32,
        /// The worker's counterpart.
        counterpart: PeerId,
        /// The phase the worker was in.
        phase: Phase,
        /// The worker error.
        source: WorkerError,
    },
    /// No Privacy Peer delivered a result.
    #[error("no privacy peer delivered a result in round {0}")]
    NoResult(u32),
    /// No Peer delivered shares, so there is nothing to compute on.
    #[error("no peer delivered shares in round {0}")]
    NoInput(u32),
    /// The connection manager failed outside of a worker.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// A barrier failed outside of a worker.
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    /// The configuration does not fit the group.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The input could not be encoded.
    #[error(transparent)]
    Bloom(#[from] BloomError),
    /// The input could not be read.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The output could not be written.
    #[error(transparent)]
    Output(#[from] OutputError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_include_the_cause() {
        let err = Error::Computation {
            round: 2,
            source: EngineError::UnknownOperation(7),
        };
        assert_eq!(
            err.to_string(),
            "computation failed in round 2: unknown operation 7"
        );
        let err = Error::Worker {
            round: 1,
            counterpart: PeerId::new("pp2"),
            phase: Phase::SecureCompute,
            source: WorkerError::Missing("compute input"),
        };
        assert!(
            err.to_string()
                .ends_with(": no compute input was published for this round")
        );
    }
}
