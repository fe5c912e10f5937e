use std::{collections::BTreeMap, mem, ops::ControlFlow, sync::Arc};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{Level, debug, error, info, instrument, warn};

use super::{Countdown, CountdownStep, Phase, index_map};
use crate::{
    bloom::BloomFilter,
    channel::{ConnectionManager, wait_for_connections},
    config::{Computation, ProtocolConfig},
    error::Error,
    event::{
        ExceptionEvent, FinalResultEvent, Listeners, Notification, WorkerEvent, WorkerEventKind,
    },
    io::{InputSource, OutputSink, RoundOutput},
    message::{Message, ParticipantInfo, Payload, PeerId, Role},
    shamir,
    stop::Stopper,
    worker::{Link, peer_worker},
};

/// A data owner: secret-shares its input to the Privacy Peers every round and receives
/// the aggregate.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use roundmpc::{Peer, channel::LocalEndpoint, config::ProtocolConfig, io::{MemoryInput, MemoryOutput}};
/// # async fn run(endpoint: LocalEndpoint, config: ProtocolConfig) -> Result<(), roundmpc::Error> {
/// let mut peer = Peer::new(Arc::new(endpoint), config, MemoryInput::new([["a", "b"]]), MemoryOutput::new());
/// let mut notifications = peer.subscribe();
/// peer.run().await?;
/// while let Ok(notification) = notifications.try_recv() {
///     println!("{notification:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Peer<C, I, O> {
    conn: Arc<C>,
    config: ProtocolConfig,
    input: I,
    output: O,
    stopper: Stopper,
    listeners: Listeners,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    workers: JoinSet<()>,
    round: PeerRound,
}

#[derive(Debug, Default)]
struct PeerRound {
    number: u32,
    phase: Phase,
    privacy_peers: BTreeMap<PeerId, ParticipantInfo>,
    final_results_to_do: Countdown,
    items: Vec<String>,
    shares: Option<Vec<Vec<u64>>>,
    result: Option<(PeerId, Vec<u64>)>,
}

impl<C, I, O> Peer<C, I, O>
where
    C: ConnectionManager,
    I: InputSource,
    O: OutputSink,
{
    /// Creates a Peer reading its records from `input` and handing results to `output`.
    pub fn new(conn: Arc<C>, config: ProtocolConfig, input: I, output: O) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            conn,
            config,
            input,
            output,
            stopper: Stopper::new(),
            listeners: Listeners::default(),
            events_tx,
            events_rx,
            workers: JoinSet::new(),
            round: PeerRound::default(),
        }
    }

    /// Subscribes to the notifications of this Peer.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        self.listeners.subscribe()
    }

    /// The stopper of this Peer, stopping it ends [`Peer::run`] after the current step.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    fn me(&self) -> &PeerId {
        self.conn.me()
    }

    /// Runs all rounds, returns once the last round is done or the protocol is stopped.
    pub async fn run(mut self) -> Result<(), Error> {
        info!(peer = %self.me(), config = ?self.config, "starting peer");
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
                info!(peer = %self.me(), round = self.round.number, "peer stopped");
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
        self.round = PeerRound {
            number,
            ..Default::default()
        };
        let waited = self
            .stopper
            .run_until_stopped(wait_for_connections(
                self.conn.as_ref(),
                1,
                self.config.min_privacy_peers,
            ))
            .await;
        match waited {
            None => return Ok(()),
            Some(result) => result?,
        }

        self.round.phase = Phase::GeneratingShares;
        let privacy_peers = index_map(self.conn.active_peers(Role::PrivacyPeer));
        let degree = self.config.round_degree(privacy_peers.len(), 1)?;
        let Some(items) = self
            .stopper
            .run_until_stopped(self.input.next_input(number))
            .await
        else {
            return Ok(());
        };
        let mut items = items?;
        let secrets = self.encode_input(&items)?;
        items.sort();
        items.dedup();
        self.round.items = items;
        let shares = self
            .generate_shares(&secrets, degree, privacy_peers.len())
            .to_vec();

        for (pp, &index) in &privacy_peers {
            self.round
                .privacy_peers
                .insert(pp.clone(), ParticipantInfo::new(pp.clone(), index));
            let link = Link::new(
                Arc::clone(&self.conn),
                0,
                pp.clone(),
                index,
                number,
                self.stopper.clone(),
                self.events_tx.clone(),
            );
            self.workers.spawn(peer_worker(link, shares[index].clone()));
        }
        self.round.final_results_to_do = Countdown::new(privacy_peers.len());
        self.round.phase = Phase::AwaitingResult;
        info!(round = number, privacy_peers = privacy_peers.len(), "round started");
        let peer = self.me().clone();
        self.listeners.notify(Notification::RoundStarted {
            peer,
            round: number,
            counterparts: privacy_peers.into_keys().collect(),
        });
        Ok(())
    }

    /// The values to share: the filter entries, or for a weighted intersection the
    /// presence bits followed by the capped weights.
    fn encode_input(&self, items: &[String]) -> Result<Vec<u64>, Error> {
        let bloom = self.config.bloom_filter;
        match self.config.computation {
            Computation::WeightedIntersection { max_weight, .. } => {
                let filter = BloomFilter::counting(bloom.size, bloom.hash_count, items)?;
                let entries = filter.entries();
                let presence = entries.iter().map(|&e| u64::from(e != 0));
                let weights = entries.iter().map(|&e| e.min(max_weight));
                Ok(presence.chain(weights).collect())
            }
            _ => Ok(BloomFilter::with_items(bloom.size, bloom.hash_count, items)?.into_entries()),
        }
    }

    /// Shares the input among the Privacy Peers, at most once per round.
    fn generate_shares(&mut self, secrets: &[u64], degree: usize, n: usize) -> &[Vec<u64>] {
        let (config, me, number) = (&self.config, self.conn.me(), self.round.number);
        self.round.shares.get_or_insert_with(|| {
            let mut rng = config.rng(me, number);
            shamir::share_all(config.field_order, secrets, degree, n, &mut rng)
        })
    }

    async fn handle_event(mut self, event: WorkerEvent) -> ControlFlow<Result<(), Error>, Self> {
        if event.round != self.round.number {
            debug!(round = event.round, current = self.round.number, "discarding stale event");
            return ControlFlow::Continue(self);
        }
        let counterpart = event.counterpart;
        let outcome = match event.kind {
            WorkerEventKind::Received(message) => self.handle_message(&counterpart, message),
            WorkerEventKind::Failed { phase, error } => Err(Error::Worker {
                round: self.round.number,
                counterpart: counterpart.clone(),
                phase,
                source: error,
            }),
            other => Err(self.violation(&counterpart, format!("unexpected event {other:?}"))),
        };
        match outcome {
            Ok(CountdownStep::ReachedZero) => {}
            Ok(_) => return ControlFlow::Continue(self),
            Err(err) => return ControlFlow::Break(self.fail(Some(counterpart), err).await),
        }
        if let Err(err) = self.finish_round().await {
            return ControlFlow::Break(self.fail(None, err).await);
        }
        if self.round.number >= self.config.time_slot_count {
            info!(peer = %self.me(), rounds = self.round.number, "all rounds done");
            self.stopper.stop();
            return ControlFlow::Break(Ok(()));
        }
        let next = self.round.number + 1;
        if let Err(err) = self.start_round(next).await {
            return ControlFlow::Break(self.fail(None, err).await);
        }
        ControlFlow::Continue(self)
    }

    fn violation(&self, counterpart: &PeerId, reason: String) -> Error {
        Error::ProtocolViolation {
            round: self.round.number,
            counterpart: counterpart.clone(),
            reason,
        }
    }

    fn handle_message(
        &mut self,
        counterpart: &PeerId,
        message: Message,
    ) -> Result<CountdownStep, Error> {
        if message.sender != *counterpart {
            return Err(self.violation(
                counterpart,
                format!("message claims to be sent by {}", message.sender),
            ));
        }
        if message.round != self.round.number {
            return Err(self.violation(
                counterpart,
                format!("message belongs to round {}", message.round),
            ));
        }
        let expected_len = self.config.bloom_filter.size.next_power_of_two();
        let result = match message.payload {
            Payload::FinalResult(result) if result.len() == expected_len => Some(result),
            Payload::FinalResult(result) => {
                return Err(self.violation(
                    counterpart,
                    format!("result has {} entries, expected {expected_len}", result.len()),
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
        let Some(info) = self.round.privacy_peers.get_mut(counterpart) else {
            return Err(self.violation(counterpart, "not a privacy peer of this round".into()));
        };
        if info.received {
            return Err(self.violation(counterpart, "sent a second result".into()));
        }
        info.received = true;
        match result {
            Some(result) => {
                debug!(%counterpart, "received final result");
                if self.round.result.is_none() {
                    self.round.result = Some((counterpart.clone(), result));
                }
            }
            None => warn!(%counterpart, "no result from disconnected privacy peer"),
        }
        Ok(self.round.final_results_to_do.tick())
    }

    async fn finish_round(&mut self) -> Result<(), Error> {
        let number = self.round.number;
        let Some((originator, result)) = self.round.result.take() else {
            return Err(Error::NoResult(number));
        };
        info!(round = number, %originator, "final result received");
        let receiver = self.me().clone();
        self.listeners
            .notify(Notification::FinalResult(FinalResultEvent {
                round: number,
                receiver,
                originator,
                result: result.clone(),
            }));
        self.round.phase = Phase::WritingOutput;
        let output = RoundOutput {
            peer: self.me().clone(),
            round: number,
            computation: self.config.computation,
            items: mem::take(&mut self.round.items),
            result: BloomFilter::from_entries(result, self.config.bloom_filter.hash_count)?,
        };
        self.output.write_round(&output).await?;
        while self.workers.join_next().await.is_some() {}
        Ok(())
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
        self.workers.shutdown().await;
        Err(err)
    }
}
