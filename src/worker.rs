//! One task per remote counterpart, driven by its orchestrator through barriers.
//!
//! Workers never interpret the messages they receive, they report them as events to the
//! orchestrator. A counterpart that disconnected is replaced by a dummy message, any other
//! failure ends the worker and is reported, unless the protocol was stopped.

use std::{
    future::Future,
    sync::{Arc, OnceLock},
};

use tokio::sync::mpsc;
use tracing::{Level, debug, instrument, warn};

use crate::{
    barrier::{BarrierError, CountingBarrier, PhaseBarrier},
    channel::{self, ConnectionManager, Delivery, recv_from, send_to},
    config::Computation,
    engine::{EngineError, OpId, PrimitivesEngine},
    event::{WorkerEvent, WorkerEventKind},
    message::{Message, Payload, PeerId},
    round::Phase,
    stop::Stopper,
};

/// Errors that end a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Sending or receiving a message failed.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// A barrier was aborted or broken.
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    /// The secure computation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The orchestrator opened a barrier without publishing the data behind it.
    #[error("no {0} was published for this round")]
    Missing(&'static str),
}

#[derive(Debug)]
pub(crate) struct Failure {
    phase: Phase,
    error: WorkerError,
}

/// A worker's capabilities towards its counterpart in one round.
#[derive(Debug)]
pub(crate) struct Link<C> {
    conn: Arc<C>,
    me: PeerId,
    my_index: usize,
    counterpart: PeerId,
    counterpart_index: usize,
    round: u32,
    stopper: Stopper,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl<C: ConnectionManager> Link<C> {
    pub(crate) fn new(
        conn: Arc<C>,
        my_index: usize,
        counterpart: PeerId,
        counterpart_index: usize,
        round: u32,
        stopper: Stopper,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            me: conn.me().clone(),
            conn,
            my_index,
            counterpart,
            counterpart_index,
            round,
            stopper,
            events,
        }
    }

    /// Sends a round message with the given payload to the counterpart.
    pub(crate) async fn send_round_message(
        &self,
        payload: Payload,
    ) -> Result<Delivery, channel::Error> {
        let kind = payload.kind();
        let msg = Message::new(self.me.clone(), self.my_index, self.round, payload);
        let delivery = send_to(self.conn.as_ref(), &self.counterpart, kind, &msg).await?;
        if delivery == Delivery::Disconnected {
            warn!(counterpart = %self.counterpart, "counterpart disconnected, {kind} not delivered");
        }
        Ok(delivery)
    }

    /// Receives the next round message, or a dummy if the counterpart disconnected.
    pub(crate) async fn receive_round_message(&self) -> Result<Message, channel::Error> {
        match recv_from(self.conn.as_ref(), &self.counterpart, "round message").await? {
            Some(msg) => Ok(msg),
            None => {
                warn!(counterpart = %self.counterpart, "counterpart disconnected, using dummy message");
                Ok(Message::dummy(
                    self.counterpart.clone(),
                    self.counterpart_index,
                    self.round,
                ))
            }
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopper.is_stopped()
    }

    fn report(&self, kind: WorkerEventKind) {
        // the orchestrator is gone once it returned, nobody is left to tell
        let _ = self.events.send(WorkerEvent {
            round: self.round,
            counterpart: self.counterpart.clone(),
            kind,
        });
    }

    /// Runs a blocking step unless the protocol is stopped before or during it.
    async fn step<T, E: Into<WorkerError>>(
        &self,
        phase: Phase,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<Option<T>, Failure> {
        let out = self.stopper.run_until_stopped(fut).await;
        if self.is_stopped() {
            return Ok(None);
        }
        match out {
            None => Ok(None),
            Some(Ok(v)) => Ok(Some(v)),
            Some(Err(e)) => Err(Failure {
                phase,
                error: e.into(),
            }),
        }
    }

    fn finish(&self, outcome: Result<(), Failure>) {
        match outcome {
            Ok(()) => debug!("worker done"),
            Err(_) if self.is_stopped() => debug!("worker stopped"),
            Err(Failure { phase, error }) => {
                warn!(%phase, %error, "worker failed");
                self.report(WorkerEventKind::Failed { phase, error });
            }
        }
    }
}

macro_rules! step {
    ($link:expr, $phase:expr, $fut:expr) => {
        match $link.step($phase, $fut).await? {
            Some(v) => v,
            None => return Ok(()),
        }
    };
}

/// Peer side: sends this round's shares, then awaits the final result.
#[instrument(level = Level::DEBUG, skip_all, fields(peer = %link.me, counterpart = %link.counterpart, round = link.round))]
pub(crate) async fn peer_worker<C: ConnectionManager>(link: Link<C>, shares: Vec<u64>) {
    let outcome = async {
        step!(
            link,
            Phase::GeneratingShares,
            link.send_round_message(Payload::InitialShares(shares))
        );
        let message = step!(link, Phase::AwaitingResult, link.receive_round_message());
        link.report(WorkerEventKind::Received(message));
        Ok::<_, Failure>(())
    }
    .await;
    link.finish(outcome);
}

/// The data a Privacy Peer's orchestrator publishes to its workers during a round.
#[derive(Debug, Default)]
pub(crate) struct RoundSlot {
    compute_input: OnceLock<ComputeInput>,
    final_result: OnceLock<Vec<u64>>,
}

/// The share vectors of the active Peers, in Peer index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComputeInput {
    pub(crate) shares: Vec<Vec<u64>>,
}

impl ComputeInput {
    fn slots(&self) -> usize {
        self.shares.first().map_or(0, Vec::len)
    }

    fn column(&self, slot: usize) -> Vec<u64> {
        self.shares.iter().map(|s| s[slot]).collect()
    }
}

impl RoundSlot {
    /// Publishes the compute input, returns `false` if it was already published.
    pub(crate) fn publish_input(&self, input: ComputeInput) -> bool {
        self.compute_input.set(input).is_ok()
    }

    /// Publishes the final result, returns `false` if it was already published.
    pub(crate) fn publish_result(&self, result: Vec<u64>) -> bool {
        self.final_result.set(result).is_ok()
    }

    pub(crate) fn final_result(&self) -> Option<&Vec<u64>> {
        self.final_result.get()
    }
}

/// Privacy Peer side: receives a Peer's shares and, once the result is known, sends it.
#[instrument(level = Level::DEBUG, skip_all, fields(peer = %link.me, counterpart = %link.counterpart, round = link.round))]
pub(crate) async fn share_collector<C: ConnectionManager>(
    link: Link<C>,
    slot: Arc<RoundSlot>,
    results_barrier: Arc<CountingBarrier>,
) {
    let outcome = async {
        let message = step!(link, Phase::CollectingShares, link.receive_round_message());
        link.report(WorkerEventKind::Received(message));
        step!(link, Phase::DistributingResult, results_barrier.block());
        let result = slot.final_result().cloned().ok_or(Failure {
            phase: Phase::DistributingResult,
            error: WorkerError::Missing("final result"),
        })?;
        let delivery = step!(
            link,
            Phase::DistributingResult,
            link.send_round_message(Payload::FinalResult(result))
        );
        link.report(WorkerEventKind::FinalResultSent(delivery));
        Ok::<_, Failure>(())
    }
    .await;
    link.finish(outcome);
}

/// What the compute workers of a round share.
#[derive(Debug)]
pub(crate) struct ComputeContext<E> {
    pub(crate) engine: Arc<E>,
    pub(crate) computation: Computation,
    pub(crate) slot: Arc<RoundSlot>,
    pub(crate) start: Arc<CountingBarrier>,
    pub(crate) phases: Arc<PhaseBarrier>,
}

impl<E: PrimitivesEngine> ComputeContext<E> {
    fn input(&self) -> Result<&ComputeInput, WorkerError> {
        self.slot
            .compute_input
            .get()
            .ok_or(WorkerError::Missing("compute input"))
    }

    fn single(&self, op: OpId) -> Result<u64, WorkerError> {
        let result = self.engine.result(op)?;
        result.first().copied().ok_or_else(|| {
            EngineError::InvalidArguments {
                op,
                reason: "operation has an empty result".to_string(),
            }
            .into()
        })
    }

    fn submit_computation(&self) -> Result<(), WorkerError> {
        let input = self.input()?;
        self.engine.new_operation_set();
        match self.computation {
            Computation::Intersection => {
                for slot in 0..input.slots() {
                    self.engine.product(slot, input.column(slot))?;
                }
            }
            Computation::ThresholdUnion {
                threshold,
                learn_weights,
            } => {
                self.engine
                    .bf_threshold_union(0, input.shares.clone(), threshold, learn_weights)?;
            }
            Computation::WeightedIntersection {
                key_threshold,
                learn_weights,
                max_weight,
            } => {
                let slots = self.result_slots()?;
                let (presence, weights): (Vec<_>, Vec<_>) = input
                    .shares
                    .iter()
                    .map(|shares| {
                        let (presence, weights) = shares.split_at(slots);
                        (presence.to_vec(), weights.to_vec())
                    })
                    .unzip();
                self.engine.bf_weighted_intersection(
                    0,
                    presence,
                    weights,
                    key_threshold,
                    learn_weights,
                    max_weight,
                )?;
            }
        }
        Ok(())
    }

    fn submit_reconstruction(&self) -> Result<(), WorkerError> {
        let input = self.input()?;
        let shares = match self.computation {
            Computation::Intersection => (0..input.slots())
                .map(|slot| self.single(slot))
                .collect::<Result<Vec<_>, _>>()?,
            Computation::ThresholdUnion { .. } | Computation::WeightedIntersection { .. } => {
                self.engine.result(0)?
            }
        };
        self.engine.new_operation_set();
        for (op, share) in shares.into_iter().enumerate() {
            self.engine.reconstruct(op, share)?;
        }
        Ok(())
    }

    /// The number of Bloom filter slots, each one sent as `values_per_slot` shares.
    fn result_slots(&self) -> Result<usize, WorkerError> {
        Ok(self.input()?.slots() / self.computation.values_per_slot())
    }

    fn collect_result(&self) -> Result<Vec<u64>, WorkerError> {
        (0..self.result_slots()?)
            .map(|op| self.single(op))
            .collect()
    }

    /// Runs `lead` if this worker leads the cycle, breaking the barrier if it fails.
    fn lead<T>(
        &self,
        is_leader: bool,
        phase: Phase,
        lead: impl FnOnce() -> Result<T, WorkerError>,
    ) -> Result<Option<T>, Failure> {
        if !is_leader {
            return Ok(None);
        }
        lead().map(Some).map_err(|error| {
            self.phases.break_barrier();
            Failure { phase, error }
        })
    }
}

/// Privacy Peer side: runs the secure computation together with another Privacy Peer.
#[instrument(level = Level::DEBUG, skip_all, fields(peer = %link.me, counterpart = %link.counterpart, round = link.round))]
pub(crate) async fn compute_worker<C: ConnectionManager, E: PrimitivesEngine>(
    link: Link<C>,
    ctx: ComputeContext<E>,
) {
    let outcome = async {
        step!(link, Phase::CollectingShares, ctx.start.block());

        let phase = Phase::SecureCompute;
        let rank = step!(link, phase, ctx.phases.wait());
        ctx.lead(rank.is_leader(), phase, || ctx.submit_computation())?;
        step!(link, phase, ctx.phases.wait());
        step!(link, phase, ctx.engine.run_pending_operations(&link.counterpart));

        let phase = Phase::Finalizing;
        let rank = step!(link, phase, ctx.phases.wait());
        if ctx
            .lead(rank.is_leader(), phase, || ctx.submit_reconstruction())?
            .is_some()
        {
            link.report(WorkerEventKind::Progress(phase));
        }
        step!(link, phase, ctx.phases.wait());
        step!(link, phase, ctx.engine.run_pending_operations(&link.counterpart));

        let rank = step!(link, phase, ctx.phases.wait());
        if let Some(result) = ctx.lead(rank.is_leader(), phase, || ctx.collect_result())? {
            debug!(len = result.len(), "result reconstructed");
            link.report(WorkerEventKind::ResultReady(result));
        }
        Ok::<_, Failure>(())
    }
    .await;
    link.finish(outcome);
}
