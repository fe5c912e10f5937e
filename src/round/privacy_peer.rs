use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{Level, debug, error, info, instrument, warn};

use super::{Countdown, CountdownStep, Phase, index_map};
use crate::{
    barrier::{CountingBarrier, PhaseBarrier},
    channel::{ConnectionManager, Delivery, wait_for_connections},
    config::ProtocolConfig,
    engine::{EngineBuilder, EngineSetup},
    error::Error,
    event::{
        ExceptionEvent, FinalResultEvent, Listeners, Notification, WorkerEvent, WorkerEventKind,
    },
    message::{Message, ParticipantInfo, Payload, PeerId, Role},
    stop::Stopper,
    worker::{
        ComputeContext, ComputeInput, Link, RoundSlot, WorkerError, compute_worker,
        share_collector,
    },
};

/// Holds shares of the Peers' inputs and computes the aggregate together with the other
/// Privacy Peers.
pub struct PrivacyPeer<C, B> {
    conn: Arc<C>,
    config: ProtocolConfig,
    builder: B,
    stopper: Stopper,
    listeners: Listeners,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    workers: JoinSet<()>,
    round: PrivacyRound,
}

#[derive(Debug, Default)]
struct PrivacyRound {
    number: u32,
    phase: Phase,
    peers: BTreeMap<PeerId, ParticipantInfo>,
    initial_shares_to_receive: Countdown,
    final_results_to_do: Countdown,
    slot: Arc<RoundSlot>,
    compute_barrier: Option<Arc<CountingBarrier>>,
    results_barrier: Option<Arc<CountingBarrier>>,
    phases: Option<Arc<PhaseBarrier>>,
}

impl PrivacyRound {
    fn abort_barriers(&self) {
        if let Some(barrier) = &self.compute_barrier {
            barrier.abort();
        }
        if let Some(barrier) = &self.results_barrier {
            barrier.abort();
        }
        if let Some(barrier) = &self.phases {
            barrier.break_barrier();
        }
    }
}

impl<C, B> PrivacyPeer<C, B>
where
    C: ConnectionManager,
    B: EngineBuilder,
{
    /// Creates a Privacy Peer that creates the engine of every round with `builder`.
    pub fn new(conn: Arc<C>, config: ProtocolConfig, builder: B) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            config,
            builder,
            stopper: Stopper::new(),
            listeners: Listeners::default(),
            events_tx,
            events_rx,
            workers: JoinSet::new(),
            round: PrivacyRound::default(),
        }
    }

    /// Subscribes to the notifications of this Privacy Peer.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        self.listeners.subscribe()
    }

    /// The stopper of this Privacy Peer.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    fn me(&self) -> &PeerId {
        self.conn.me()
    }

    /// Runs all rounds, returns once the last round is done or the protocol is stopped.
    pub async fn run(mut self) -> Result<(), Error> {
        info!(peer = %self.me(), config = ?self.config, "starting privacy peer");
        if let Err(err) = self.start_round(1).await {
            return self.fail(None, err).await;
        }
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stopper.stopped() => None,
                event = self.events_rx.recv() => event,
            };
            let Some(event) = event else {
                info!(peer = %self.me(), round = self.round.number, "privacy peer stopped");
                self.round.abort_barriers();
                self.workers.shutdown().await;
                return Ok(());
            };
            self = match self.handle_event(event).await {
                ControlFlow::Continue(this) => this,
                ControlFlow::Break(result) => return result,
            }
        }
    }

    #[instrument(level = Level::DEBUG, skip(self), fields(peer = %self.me()), err)]
    async fn start_round(&mut self, number: u32) -> Result<(), Error> {
        self.round = PrivacyRound {
            number,
            ..Default::default()
        };
        let waited = self
            .stopper
            .run_until_stopped(wait_for_connections(
                self.conn.as_ref(),
                self.config.min_peers,
                self.config.min_privacy_peers,
            ))
            .await;
        match waited {
            None => return Ok(()),
            Some(result) => result?,
        }

        let me = self.me().clone();
        let peers = index_map(self.conn.active_peers(Role::Peer));
        let others = self.conn.active_peers(Role::PrivacyPeer);
        let privacy_peers = index_map(others.iter().cloned().chain([me.clone()]));
        let degree = self.config.round_degree(privacy_peers.len(), peers.len())?;
        let my_index = privacy_peers[&me];
        let engine = self
            .builder
            .new_engine(EngineSetup {
                round: number,
                me: me.clone(),
                privacy_peers: privacy_peers.clone(),
                degree,
                field: self.config.field_order,
                rng: self.config.rng(&me, number),
            })
            .map_err(|source| Error::Computation {
                round: number,
                source,
            })?;
        let engine = Arc::new(engine);

        let slot = Arc::new(RoundSlot::default());
        let compute_barrier = Arc::new(CountingBarrier::new(others.len()));
        let results_barrier = Arc::new(CountingBarrier::new(peers.len()));
        let phases = Arc::new(PhaseBarrier::new(others.len()));

        for (peer, &index) in &peers {
            let link = self.link(my_index, peer, index, number);
            self.workers.spawn(share_collector(
                link,
                Arc::clone(&slot),
                Arc::clone(&results_barrier),
            ));
        }
        for other in &others {
            let link = self.link(my_index, other, privacy_peers[other], number);
            let ctx = ComputeContext {
                engine: Arc::clone(&engine),
                computation: self.config.computation,
                slot: Arc::clone(&slot),
                start: Arc::clone(&compute_barrier),
                phases: Arc::clone(&phases),
            };
            self.workers.spawn(compute_worker(link, ctx));
        }

        self.round = PrivacyRound {
            number,
            phase: Phase::CollectingShares,
            peers: peers
                .iter()
                .map(|(id, &index)| (id.clone(), ParticipantInfo::new(id.clone(), index)))
                .collect(),
            initial_shares_to_receive: Countdown::new(peers.len()),
            final_results_to_do: Countdown::new(peers.len()),
            slot,
            compute_barrier: Some(compute_barrier),
            results_barrier: Some(results_barrier),
            phases: Some(phases),
        };
        info!(
            round = number,
            index = my_index,
            peers = peers.len(),
            privacy_peers = others.len() + 1,
            degree,
            "round started"
        );
        self.listeners.notify(Notification::RoundStarted {
            peer: me,
            round: number,
            counterparts: peers.into_keys().chain(others).collect(),
        });
        Ok(())
    }

    fn link(&self, my_index: usize, counterpart: &PeerId, index: usize, round: u32) -> Link<C> {
        Link::new(
            Arc::clone(&self.conn),
            my_index,
            counterpart.clone(),
            index,
            round,
            self.stopper.clone(),
            self.events_tx.clone(),
        )
    }

    async fn handle_event(mut self, event: WorkerEvent) -> ControlFlow<Result<(), Error>, Self> {
        if event.round != self.round.number {
            debug!(round = event.round, current = self.round.number, "discarding stale event");
            return ControlFlow::Continue(self);
        }
        let counterpart = event.counterpart;
        let outcome = match event.kind {
            WorkerEventKind::Received(message) => self.handle_shares(&counterpart, message),
            WorkerEventKind::Progress(phase) => {
                debug!(%phase, "computation progressed");
                self.round.phase = phase;
                Ok(())
            }
            WorkerEventKind::ResultReady(result) => self.handle_result(&counterpart, result),
            WorkerEventKind::FinalResultSent(delivery) => {
                match self.handle_result_sent(&counterpart, delivery) {
                    Ok(CountdownStep::ReachedZero) => {
                        return self.finish_round().await;
                    }
                    other => other.map(|_| ()),
                }
            }
            WorkerEventKind::Failed { phase, error } => {
                Err(self.worker_error(&counterpart, phase, error))
            }
        };
        match outcome {
            Ok(()) => ControlFlow::Continue(self),
            Err(err) => ControlFlow::Break(self.fail(Some(counterpart), err).await),
        }
    }

    fn worker_error(&self, counterpart: &PeerId, phase: Phase, error: WorkerError) -> Error {
        match error {
            WorkerError::Engine(source) => Error::Computation {
                round: self.round.number,
                source,
            },
            source => Error::Worker {
                round: self.round.number,
                counterpart: counterpart.clone(),
                phase,
                source,
            },
        }
    }

    fn violation(&self, counterpart: &PeerId, reason: String) -> Error {
        Error::ProtocolViolation {
            round: self.round.number,
            counterpart: counterpart.clone(),
            reason,
        }
    }

    fn handle_shares(&mut self, counterpart: &PeerId, message: Message) -> Result<(), Error> {
        if self.round.phase != Phase::CollectingShares {
            return Err(self.violation(
                counterpart,
                format!("{} message during {}", message.payload.kind(), self.round.phase),
            ));
        }
        if message.sender != *counterpart || message.round != self.round.number {
            return Err(self.violation(
                counterpart,
                format!(
                    "message from {} for round {} on this link",
                    message.sender, message.round
                ),
            ));
        }
        let expected_len = self.config.shares_per_peer();
        let shares = match message.payload {
            Payload::InitialShares(shares) if shares.len() == expected_len => Some(shares),
            Payload::InitialShares(shares) => {
                return Err(self.violation(
                    counterpart,
                    format!("{} shares, expected {expected_len}", shares.len()),
                ));
            }
            Payload::Dummy => None,
            other => {
                return Err(self.violation(
                    counterpart,
                    format!("unexpected {} message", other.kind()),
                ));
            }
        };
        let Some(info) = self.round.peers.get_mut(counterpart) else {
            return Err(self.violation(counterpart, "not a peer of this round".into()));
        };
        if info.received {
            return Err(self.violation(counterpart, "sent shares twice".into()));
        }
        info.received = true;
        match &shares {
            Some(_) => debug!(%counterpart, "received shares"),
            None => warn!(%counterpart, "peer is offline, excluding it from the computation"),
        }
        info.initial_shares = shares;
        match self.round.initial_shares_to_receive.tick() {
            CountdownStep::ReachedZero => self.start_computation(),
            _ => Ok(()),
        }
    }

    fn start_computation(&mut self) -> Result<(), Error> {
        let shares: Vec<Vec<u64>> = self
            .round
            .peers
            .values()
            .filter_map(|info| info.initial_shares.clone())
            .collect();
        if shares.is_empty() {
            return Err(Error::NoInput(self.round.number));
        }
        info!(
            round = self.round.number,
            active_peers = shares.len(),
            "all shares collected"
        );
        self.round.slot.publish_input(ComputeInput { shares });
        self.round.phase = Phase::SecureCompute;
        if let Some(barrier) = &self.round.compute_barrier {
            let barrier = Arc::clone(barrier);
            self.workers.spawn(async move {
                // aborted only when the protocol is stopped
                let _ = barrier.open_barrier().await;
            });
        }
        Ok(())
    }

    fn handle_result(&mut self, counterpart: &PeerId, result: Vec<u64>) -> Result<(), Error> {
        if !matches!(self.round.phase, Phase::SecureCompute | Phase::Finalizing) {
            return Err(self.violation(
                counterpart,
                format!("result reported during {}", self.round.phase),
            ));
        }
        if !self.round.slot.publish_result(result) {
            return Err(self.violation(counterpart, "result reported twice".into()));
        }
        info!(round = self.round.number, "result reconstructed");
        self.round.phase = Phase::DistributingResult;
        if let Some(barrier) = &self.round.results_barrier {
            let barrier = Arc::clone(barrier);
            self.workers.spawn(async move {
                let _ = barrier.open_barrier().await;
            });
        }
        Ok(())
    }

    fn handle_result_sent(
        &mut self,
        counterpart: &PeerId,
        delivery: Delivery,
    ) -> Result<CountdownStep, Error> {
        if self.round.phase != Phase::DistributingResult {
            return Err(self.violation(
                counterpart,
                format!("result sent during {}", self.round.phase),
            ));
        }
        if delivery == Delivery::Disconnected {
            warn!(%counterpart, "final result not delivered");
        }
        Ok(self.round.final_results_to_do.tick())
    }

    async fn finish_round(mut self) -> ControlFlow<Result<(), Error>, Self> {
        let number = self.round.number;
        while self.workers.join_next().await.is_some() {}
        let result = self.round.slot.final_result().cloned().unwrap_or_default();
        info!(round = number, "final results distributed");
        let me = self.me().clone();
        self.listeners
            .notify(Notification::FinalResult(FinalResultEvent {
                round: number,
                receiver: me.clone(),
                originator: me,
                result,
            }));
        if number >= self.config.time_slot_count {
            info!(peer = %self.me(), rounds = number, "all rounds done");
            self.stopper.stop();
            return ControlFlow::Break(Ok(()));
        }
        if let Err(err) = self.start_round(number + 1).await {
            return ControlFlow::Break(self.fail(None, err).await);
        }
        ControlFlow::Continue(self)
    }

    async fn fail(&mut self, counterpart: Option<PeerId>, err: Error) -> Result<(), Error> {
        error!(peer = %self.me(), round = self.round.number, phase = %self.round.phase, ?counterpart, "{err}");
        let peer = self.me().clone();
        self.listeners.notify(Notification::Exception(ExceptionEvent {
            peer,
            round: self.round.number,
            phase: self.round.phase,
            counterpart,
            diagnostic: err.to_string(),
        }));
        self.stopper.stop();
        self.round.abort_barriers();
        self.workers.shutdown().await;
        Err(err)
    }
}
