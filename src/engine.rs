//! The secure computation primitives run jointly by the Privacy Peers.
//!
//! Operations are submitted by one worker (the leader of a phase) and then executed by
//! all compute workers in parallel, each one exchanging messages with its counterpart.
//! [`ShamirEngine`] implements the primitives on Shamir shares: multiplications use the
//! degree reduction of Gennaro, Rabin and Rabin, openings interpolate at zero.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument, trace};

use crate::{
    barrier::{BarrierError, PhaseBarrier},
    channel::{self, ConnectionManager, Delivery, recv_from, send_to},
    field::{Field, FieldError},
    message::PeerId,
    shamir,
};

/// Identifies an operation within one operation set.
pub type OpId = usize;

/// Errors raised by a [`PrimitivesEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation was submitted with malformed input.
    #[error("invalid arguments for operation {op}: {reason}")]
    InvalidArguments {
        /// The operation.
        op: OpId,
        /// What is wrong with the input.
        reason: String,
    },
    /// No operation with this id was submitted.
    #[error("unknown operation {0}")]
    UnknownOperation(OpId),
    /// The operation has not been run yet.
    #[error("operation {0} is not finished")]
    NotFinished(OpId),
    /// The counterpart does not take part in this computation.
    #[error("{0} is not a privacy peer of this computation")]
    UnknownCounterpart(PeerId),
    /// The counterpart disconnected while operations were running.
    #[error("lost connection to {0} during the computation")]
    CounterpartLost(PeerId),
    /// The counterpart sent a message that does not fit the current step.
    #[error("unexpected message from {from}: {reason}")]
    UnexpectedMessage {
        /// The counterpart.
        from: PeerId,
        /// What did not match.
        reason: String,
    },
    /// The engine's internal barrier failed, usually because another worker failed.
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    /// A message could not be sent or received.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// The field arithmetic failed.
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Secure computation on secret shares, shared by all compute workers of a round.
///
/// Operations are collected in an operation set and executed by
/// [`PrimitivesEngine::run_pending_operations`], which every compute worker calls
/// concurrently with its own counterpart.
pub trait PrimitivesEngine: Send + Sync + 'static {
    /// Discards all submitted operations and their results.
    fn new_operation_set(&self);

    /// Submits the product of all factors. The result has one element.
    fn product(&self, op: OpId, factors: Vec<u64>) -> Result<(), EngineError>;

    /// Submits a threshold union over Bloom filter shares, `filters[peer][slot]`.
    ///
    /// Slot `i` of the result is `1` (or the count itself if `learn_weights` is set) if at
    /// least `threshold` filters have a `1` in slot `i`, and `0` otherwise.
    fn bf_threshold_union(
        &self,
        op: OpId,
        filters: Vec<Vec<u64>>,
        threshold: u64,
        learn_weights: bool,
    ) -> Result<(), EngineError>;

    /// Submits a weighted intersection over Bloom filter shares.
    ///
    /// `presence[peer][slot]` is `1` if the Peer's filter has slot `slot` set, and
    /// `weights[peer][slot]` is the Peer's count for the slot, at most `max_weight`. Slot
    /// `i` of the result is non-zero only if every Peer has it set and the summed weight
    /// reaches `key_threshold`; it is then `1`, or the summed weight if `learn_weights`
    /// is set.
    fn bf_weighted_intersection(
        &self,
        op: OpId,
        presence: Vec<Vec<u64>>,
        weights: Vec<Vec<u64>>,
        key_threshold: u64,
        learn_weights: bool,
        max_weight: u64,
    ) -> Result<(), EngineError>;

    /// Submits the reconstruction of a shared value. The result has one element.
    fn reconstruct(&self, op: OpId, share: u64) -> Result<(), EngineError>;

    /// The result of a finished operation.
    fn result(&self, op: OpId) -> Result<Vec<u64>, EngineError>;

    /// Runs all pending operations together with the given counterpart.
    fn run_pending_operations(
        &self,
        counterpart: &PeerId,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Everything an engine needs to know about a round.
#[derive(Debug, Clone)]
pub struct EngineSetup {
    /// The round, used to tag engine messages.
    pub round: u32,
    /// The Privacy Peer running the engine.
    pub me: PeerId,
    /// All active Privacy Peers including `me`, mapped to their index.
    pub privacy_peers: BTreeMap<PeerId, usize>,
    /// The degree of the sharing polynomials.
    pub degree: usize,
    /// The field the shares live in.
    pub field: Field,
    /// Randomness for re-sharing.
    pub rng: ChaCha20Rng,
}

/// Creates a fresh engine for every round.
pub trait EngineBuilder: Send + Sync + 'static {
    /// The engine type created by this builder.
    type Engine: PrimitivesEngine;

    /// Creates the engine for the round described by `setup`.
    fn new_engine(&self, setup: EngineSetup) -> Result<Self::Engine, EngineError>;
}

/// Builds [`ShamirEngine`]s communicating over a shared connection manager.
#[derive(Debug)]
pub struct ShamirEngineBuilder<C> {
    conn: Arc<C>,
}

impl<C> ShamirEngineBuilder<C> {
    /// Creates a builder whose engines use `conn`.
    pub fn new(conn: Arc<C>) -> Self {
        Self { conn }
    }
}

impl<C: ConnectionManager> EngineBuilder for ShamirEngineBuilder<C> {
    type Engine = ShamirEngine<C>;

    fn new_engine(&self, setup: EngineSetup) -> Result<ShamirEngine<C>, EngineError> {
        ShamirEngine::new(Arc::clone(&self.conn), setup)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EngineMsg {
    round: u32,
    step: u64,
    contributions: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Multiply(u64, u64),
    Open(u64),
}

/// Evaluates a public polynomial on shared values, one power per step.
#[derive(Debug)]
struct Polynomial {
    values: Vec<u64>,
    power: Vec<u64>,
    acc: Vec<u64>,
    coefficients: Vec<u64>,
    exponent: usize,
}

impl Polynomial {
    /// Interpolates the polynomial through `(v, targets[v])` and starts evaluating it.
    fn new(field: Field, values: Vec<u64>, targets: &[u64]) -> Result<Self, FieldError> {
        let coefficients = field.interpolate(targets)?;
        let c = |k: usize| coefficients.get(k).copied().unwrap_or(0);
        let acc = values
            .iter()
            .map(|&v| field.add(c(0), field.mul(c(1), v)))
            .collect();
        Ok(Self {
            power: values.clone(),
            values,
            acc,
            coefficients,
            exponent: 1,
        })
    }

    fn is_done(&self) -> bool {
        self.exponent + 1 >= self.coefficients.len()
    }

    fn requests(&self) -> Vec<Request> {
        if self.is_done() {
            return vec![];
        }
        self.power
            .iter()
            .zip(&self.values)
            .map(|(&p, &v)| Request::Multiply(p, v))
            .collect()
    }

    fn absorb(&mut self, field: Field, results: &[u64]) {
        self.exponent += 1;
        let c = self.coefficients[self.exponent];
        self.power.copy_from_slice(results);
        for (a, &p) in self.acc.iter_mut().zip(self.power.iter()) {
            *a = field.add(*a, field.mul(c, p));
        }
    }
}

/// The next level of a tree product: one multiplication per pair of values.
fn pairs(values: &[u64]) -> impl Iterator<Item = Request> + '_ {
    values
        .chunks_exact(2)
        .map(|pair| Request::Multiply(pair[0], pair[1]))
}

fn fold_pairs(values: &mut Vec<u64>, results: &[u64]) {
    let leftover = (values.len() % 2 == 1).then(|| values[values.len() - 1]);
    *values = results.iter().copied().chain(leftover).collect();
}

#[derive(Debug)]
enum Operation {
    /// Multiplies pairs of values until a single value is left.
    Product { values: Vec<u64> },
    ThresholdUnion(Polynomial),
    /// Per-slot presence products and the weight polynomial run side by side, then the
    /// two are multiplied.
    WeightedIntersection {
        presence: Vec<Vec<u64>>,
        weights: Polynomial,
        combined: Option<Vec<u64>>,
    },
    Reconstruct { share: u64, value: Option<u64> },
}

impl Operation {
    fn requests(&self) -> Vec<Request> {
        match self {
            Operation::Product { values } => pairs(values).collect(),
            Operation::ThresholdUnion(polynomial) => polynomial.requests(),
            Operation::WeightedIntersection {
                presence,
                weights,
                combined,
            } => {
                if combined.is_some() {
                    return vec![];
                }
                let mut requests: Vec<Request> =
                    presence.iter().flat_map(|slot| pairs(slot)).collect();
                requests.extend(weights.requests());
                if requests.is_empty() {
                    requests = presence
                        .iter()
                        .zip(&weights.acc)
                        .map(|(slot, &w)| Request::Multiply(slot[0], w))
                        .collect();
                }
                requests
            }
            Operation::Reconstruct { share, value } => match value {
                Some(_) => vec![],
                None => vec![Request::Open(*share)],
            },
        }
    }

    fn absorb(&mut self, field: Field, results: &[u64]) {
        match self {
            Operation::Product { values } => fold_pairs(values, results),
            Operation::ThresholdUnion(polynomial) => polynomial.absorb(field, results),
            Operation::WeightedIntersection {
                presence,
                weights,
                combined,
            } => {
                let multiplying = presence.iter().any(|slot| slot.len() > 1);
                if !multiplying && weights.is_done() {
                    *combined = Some(results.to_vec());
                    return;
                }
                let mut offset = 0;
                for slot in presence.iter_mut() {
                    let count = slot.len() / 2;
                    fold_pairs(slot, &results[offset..offset + count]);
                    offset += count;
                }
                if !weights.is_done() {
                    weights.absorb(field, &results[offset..]);
                }
            }
            Operation::Reconstruct { value, .. } => *value = results.first().copied(),
        }
    }

    fn finish(self) -> Vec<u64> {
        match self {
            Operation::Product { values } => values,
            Operation::ThresholdUnion(polynomial) => polynomial.acc,
            Operation::WeightedIntersection { combined, .. } => combined.unwrap_or_default(),
            Operation::Reconstruct { value, .. } => value.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
struct EngineState {
    rng: ChaCha20Rng,
    pending: BTreeMap<OpId, Operation>,
    results: BTreeMap<OpId, Vec<u64>>,
    requests: Vec<(OpId, usize)>,
    own: Vec<u64>,
    outgoing: BTreeMap<PeerId, Vec<u64>>,
    incoming: BTreeMap<PeerId, Vec<u64>>,
    step: u64,
    exchanging: bool,
}

/// A [`PrimitivesEngine`] on Shamir shares of degree `t` among `n > 2t` Privacy Peers.
#[derive(Debug)]
pub struct ShamirEngine<C> {
    conn: Arc<C>,
    round: u32,
    me: PeerId,
    my_index: usize,
    counterparts: BTreeMap<PeerId, usize>,
    degree: usize,
    field: Field,
    lambdas: Vec<u64>,
    barrier: PhaseBarrier,
    state: Mutex<EngineState>,
}

impl<C: ConnectionManager> ShamirEngine<C> {
    /// Creates the engine of one Privacy Peer for one round.
    pub fn new(conn: Arc<C>, setup: EngineSetup) -> Result<Self, EngineError> {
        let EngineSetup {
            round,
            me,
            mut privacy_peers,
            degree,
            field,
            rng,
        } = setup;
        let n = privacy_peers.len();
        let Some(my_index) = privacy_peers.remove(&me) else {
            return Err(EngineError::UnknownCounterpart(me));
        };
        if n < 2 || 2 * degree >= n {
            return Err(EngineError::InvalidArguments {
                op: 0,
                reason: format!("degree {degree} is too large for {n} privacy peers"),
            });
        }
        let mut indices: Vec<usize> = privacy_peers.values().copied().collect();
        indices.push(my_index);
        indices.sort_unstable();
        if indices != (0..n).collect::<Vec<_>>() {
            return Err(EngineError::InvalidArguments {
                op: 0,
                reason: "privacy peer indices must be 0..n".to_string(),
            });
        }
        let points: Vec<u64> = (1..=n as u64).collect();
        let lambdas = field.lagrange_at_zero(&points)?;
        Ok(Self {
            conn,
            round,
            me,
            my_index,
            barrier: PhaseBarrier::new(privacy_peers.len()),
            counterparts: privacy_peers,
            degree,
            field,
            lambdas,
            state: Mutex::new(EngineState {
                rng,
                pending: BTreeMap::new(),
                results: BTreeMap::new(),
                requests: vec![],
                own: vec![],
                outgoing: BTreeMap::new(),
                incoming: BTreeMap::new(),
                step: 0,
                exchanging: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, op: OpId, operation: Operation) -> Result<(), EngineError> {
        let mut state = self.state();
        if state.pending.contains_key(&op) || state.results.contains_key(&op) {
            return Err(EngineError::InvalidArguments {
                op,
                reason: "operation id is already in use".to_string(),
            });
        }
        state.pending.insert(op, operation);
        Ok(())
    }

    /// Combines the contributions of the last step and prepares the next one.
    fn advance(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let field = self.field;
        if state.exchanging {
            let mut combined: Vec<u64> = state
                .own
                .iter()
                .map(|&c| field.mul(self.lambdas[self.my_index], c))
                .collect();
            for (peer, contributions) in &state.incoming {
                let lambda = self.lambdas[self.counterparts[peer]];
                for (v, &c) in combined.iter_mut().zip(contributions) {
                    *v = field.add(*v, field.mul(lambda, c));
                }
            }
            if state.incoming.len() != self.counterparts.len() {
                return Err(EngineError::UnexpectedMessage {
                    from: self.me.clone(),
                    reason: format!(
                        "step {} has {} of {} contributions",
                        state.step,
                        state.incoming.len(),
                        self.counterparts.len()
                    ),
                });
            }
            let mut offset = 0;
            for (op, count) in std::mem::take(&mut state.requests) {
                if let Some(operation) = state.pending.get_mut(&op) {
                    operation.absorb(field, &combined[offset..offset + count]);
                }
                offset += count;
            }
            state.incoming.clear();
            state.exchanging = false;
        }

        let mut finished = vec![];
        let mut requests = vec![];
        for (&op, operation) in &state.pending {
            let op_requests = operation.requests();
            if op_requests.is_empty() {
                finished.push(op);
            } else {
                state.requests.push((op, op_requests.len()));
                requests.extend(op_requests);
            }
        }
        for op in finished {
            if let Some(operation) = state.pending.remove(&op) {
                state.results.insert(op, operation.finish());
            }
        }
        if requests.is_empty() {
            return Ok(());
        }

        let n = self.counterparts.len() + 1;
        state.step += 1;
        state.own.clear();
        state.outgoing = self
            .counterparts
            .keys()
            .map(|peer| (peer.clone(), Vec::with_capacity(requests.len())))
            .collect();
        for request in requests {
            let contributions = match request {
                Request::Multiply(a, b) => shamir::share(
                    field,
                    field.mul(a, b),
                    self.degree,
                    n,
                    &mut state.rng,
                ),
                Request::Open(share) => vec![share; n],
            };
            state.own.push(contributions[self.my_index]);
            for (peer, &index) in &self.counterparts {
                if let Some(batch) = state.outgoing.get_mut(peer) {
                    batch.push(contributions[index]);
                }
            }
        }
        state.exchanging = true;
        trace!(step = state.step, requests = state.own.len(), "prepared step");
        Ok(())
    }

    async fn run_steps(&self, counterpart: &PeerId) -> Result<(), EngineError> {
        loop {
            if self.barrier.wait().await?.is_leader() {
                let mut state = self.state();
                self.advance(&mut state)?;
            }
            self.barrier.wait().await?;
            let (step, contributions) = {
                let state = self.state();
                if !state.exchanging {
                    return Ok(());
                }
                let batch = state.outgoing.get(counterpart).cloned().unwrap_or_default();
                (state.step, batch)
            };
            let expected = contributions.len();
            let msg = EngineMsg {
                round: self.round,
                step,
                contributions,
            };
            if send_to(self.conn.as_ref(), counterpart, "engine step", &msg).await?
                == Delivery::Disconnected
            {
                return Err(EngineError::CounterpartLost(counterpart.clone()));
            }
            let Some(msg): Option<EngineMsg> =
                recv_from(self.conn.as_ref(), counterpart, "engine step").await?
            else {
                return Err(EngineError::CounterpartLost(counterpart.clone()));
            };
            if msg.round != self.round || msg.step != step || msg.contributions.len() != expected {
                return Err(EngineError::UnexpectedMessage {
                    from: counterpart.clone(),
                    reason: format!(
                        "expected round {}, step {step} with {expected} values, got round {}, step {} with {} values",
                        self.round,
                        msg.round,
                        msg.step,
                        msg.contributions.len()
                    ),
                });
            }
            self.state()
                .incoming
                .insert(counterpart.clone(), msg.contributions);
        }
    }
}

impl<C: ConnectionManager> PrimitivesEngine for ShamirEngine<C> {
    fn new_operation_set(&self) {
        let mut state = self.state();
        state.pending.clear();
        state.results.clear();
        state.requests.clear();
    }

    fn product(&self, op: OpId, factors: Vec<u64>) -> Result<(), EngineError> {
        if factors.is_empty() {
            return Err(EngineError::InvalidArguments {
                op,
                reason: "a product needs at least one factor".to_string(),
            });
        }
        self.submit(op, Operation::Product { values: factors })
    }

    fn bf_threshold_union(
        &self,
        op: OpId,
        filters: Vec<Vec<u64>>,
        threshold: u64,
        learn_weights: bool,
    ) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidArguments {
            op,
            reason: reason.to_string(),
        };
        let Some(size) = filters.first().map(Vec::len) else {
            return Err(invalid("no filters"));
        };
        if size == 0 || filters.iter().any(|f| f.len() != size) {
            return Err(invalid("filters must be non-empty and of equal size"));
        }
        if threshold == 0 {
            return Err(invalid("threshold must be at least 1"));
        }
        let rows = filters.len() as u64;
        if rows >= self.field.order() {
            return Err(invalid("more filters than field elements"));
        }
        let field = self.field;
        let step: Vec<u64> = (0..=rows)
            .map(|v| match (v >= threshold, learn_weights) {
                (false, _) => 0,
                (true, false) => 1,
                (true, true) => v,
            })
            .collect();
        let sums = column_sums(field, &filters, size);
        let polynomial = Polynomial::new(field, sums, &step)?;
        self.submit(op, Operation::ThresholdUnion(polynomial))
    }

    fn bf_weighted_intersection(
        &self,
        op: OpId,
        presence: Vec<Vec<u64>>,
        weights: Vec<Vec<u64>>,
        key_threshold: u64,
        learn_weights: bool,
        max_weight: u64,
    ) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidArguments {
            op,
            reason: reason.to_string(),
        };
        let Some(size) = presence.first().map(Vec::len) else {
            return Err(invalid("no filters"));
        };
        if presence.len() != weights.len() {
            return Err(invalid("every peer needs presence and weight shares"));
        }
        if size == 0 || presence.iter().chain(&weights).any(|f| f.len() != size) {
            return Err(invalid("filters must be non-empty and of equal size"));
        }
        if max_weight == 0 {
            return Err(invalid("max_weight must be at least 1"));
        }
        let largest = (presence.len() as u64).saturating_mul(max_weight);
        if largest >= self.field.order() {
            return Err(invalid("summed weights exceed the field"));
        }
        let field = self.field;
        let step: Vec<u64> = (0..=largest)
            .map(|v| match (v >= key_threshold, learn_weights) {
                (false, _) => 0,
                (true, false) => 1,
                (true, true) => v,
            })
            .collect();
        let sums = column_sums(field, &weights, size);
        let polynomial = Polynomial::new(field, sums, &step)?;
        let presence = (0..size)
            .map(|slot| presence.iter().map(|f| field.reduce(f[slot])).collect())
            .collect();
        self.submit(
            op,
            Operation::WeightedIntersection {
                presence,
                weights: polynomial,
                combined: None,
            },
        )
    }

    fn reconstruct(&self, op: OpId, share: u64) -> Result<(), EngineError> {
        self.submit(
            op,
            Operation::Reconstruct {
                share: self.field.reduce(share),
                value: None,
            },
        )
    }

    fn result(&self, op: OpId) -> Result<Vec<u64>, EngineError> {
        let state = self.state();
        if let Some(result) = state.results.get(&op) {
            Ok(result.clone())
        } else if state.pending.contains_key(&op) {
            Err(EngineError::NotFinished(op))
        } else {
            Err(EngineError::UnknownOperation(op))
        }
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(me = %self.me, %counterpart, round = self.round), err)]
    async fn run_pending_operations(&self, counterpart: &PeerId) -> Result<(), EngineError> {
        if !self.counterparts.contains_key(counterpart) {
            return Err(EngineError::UnknownCounterpart(counterpart.clone()));
        }
        let result = self.run_steps(counterpart).await;
        if result.is_err() {
            self.barrier.break_barrier();
        } else {
            debug!("pending operations done");
        }
        result
    }
}

fn column_sums(field: Field, filters: &[Vec<u64>], size: usize) -> Vec<u64> {
    (0..size)
        .map(|slot| field.sum(filters.iter().map(|f| field.reduce(f[slot]))))
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        channel::{LocalEndpoint, LocalNetwork},
        message::Role,
        round::index_map,
    };

    fn engines(n: usize) -> Vec<(PeerId, Vec<PeerId>, Arc<ShamirEngine<LocalEndpoint>>)> {
        let ids: Vec<PeerId> = (0..n).map(|i| PeerId::new(format!("pp{i}"))).collect();
        let endpoints =
            LocalNetwork::connect(ids.iter().map(|id| (id.clone(), Role::PrivacyPeer)));
        let privacy_peers = index_map(ids.clone());
        endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| {
                let me = ids[i].clone();
                let setup = EngineSetup {
                    round: 1,
                    me: me.clone(),
                    privacy_peers: privacy_peers.clone(),
                    degree: shamir::default_degree(n),
                    field: Field::default(),
                    rng: ChaCha20Rng::seed_from_u64(i as u64),
                };
                let engine = ShamirEngine::new(Arc::new(endpoint), setup).unwrap();
                let others = ids.iter().filter(|id| **id != me).cloned().collect();
                (me, others, Arc::new(engine))
            })
            .collect()
    }

    async fn run_all(parties: &[(PeerId, Vec<PeerId>, Arc<ShamirEngine<LocalEndpoint>>)]) {
        let mut tasks = tokio::task::JoinSet::new();
        for (_, others, engine) in parties {
            for other in others.clone() {
                let engine = Arc::clone(engine);
                tasks.spawn(async move { engine.run_pending_operations(&other).await });
            }
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
    }

    fn shares_of(field: Field, secrets: &[u64], n: usize) -> Vec<Vec<u64>> {
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        shamir::share_all(field, secrets, shamir::default_degree(n), n, &mut rng)
    }

    #[tokio::test]
    async fn product_and_reconstruct() {
        let n = 3;
        let field = Field::default();
        let parties = engines(n);
        let factors = [3, 5, 7, 11];
        let shares: Vec<Vec<u64>> = factors
            .iter()
            .map(|&f| shares_of(field, &[f], n).into_iter().flatten().collect())
            .collect();
        for (i, (_, _, engine)) in parties.iter().enumerate() {
            engine.new_operation_set();
            engine
                .product(0, shares.iter().map(|s| s[i]).collect())
                .unwrap();
        }
        run_all(&parties).await;
        for (_, _, engine) in &parties {
            let product = engine.result(0).unwrap();
            engine.new_operation_set();
            engine.reconstruct(0, product[0]).unwrap();
        }
        run_all(&parties).await;
        for (_, _, engine) in &parties {
            assert_eq!(engine.result(0).unwrap(), vec![3 * 5 * 7 * 11]);
        }
    }

    #[tokio::test]
    async fn threshold_union_counts_peers() {
        let n = 3;
        let field = Field::default();
        let parties = engines(n);
        // three peers, four slots
        let filters = [[1, 1, 0, 0], [1, 0, 1, 0], [1, 1, 0, 0]];
        let shared: Vec<Vec<Vec<u64>>> = filters
            .iter()
            .map(|f| shares_of(field, f, n))
            .collect();
        for learn_weights in [false, true] {
            for (i, (_, _, engine)) in parties.iter().enumerate() {
                engine.new_operation_set();
                let mine = shared.iter().map(|peer| peer[i].clone()).collect();
                engine.bf_threshold_union(0, mine, 2, learn_weights).unwrap();
            }
            run_all(&parties).await;
            for (_, _, engine) in &parties {
                let slots = engine.result(0).unwrap();
                engine.new_operation_set();
                for (op, share) in slots.into_iter().enumerate() {
                    engine.reconstruct(op, share).unwrap();
                }
            }
            run_all(&parties).await;
            let expected = if learn_weights {
                [3, 2, 0, 0]
            } else {
                [1, 1, 0, 0]
            };
            for (_, _, engine) in &parties {
                let opened: Vec<u64> = (0..4).map(|op| engine.result(op).unwrap()[0]).collect();
                assert_eq!(opened, expected);
            }
        }
    }

    #[tokio::test]
    async fn weighted_intersection_keeps_common_heavy_slots() {
        let n = 3;
        let field = Field::default();
        let parties = engines(n);
        // two peers, four slots
        let presence = [[1, 1, 0, 1], [1, 1, 1, 0]];
        let weights = [[2, 1, 0, 3], [3, 1, 2, 0]];
        let shared = |filters: &[[u64; 4]]| -> Vec<Vec<Vec<u64>>> {
            filters.iter().map(|f| shares_of(field, f, n)).collect()
        };
        let (presence, weights) = (shared(&presence), shared(&weights));
        for learn_weights in [false, true] {
            for (i, (_, _, engine)) in parties.iter().enumerate() {
                engine.new_operation_set();
                let mine = |filters: &[Vec<Vec<u64>>]| -> Vec<Vec<u64>> {
                    filters.iter().map(|peer| peer[i].clone()).collect()
                };
                engine
                    .bf_weighted_intersection(
                        0,
                        mine(&presence),
                        mine(&weights),
                        3,
                        learn_weights,
                        4,
                    )
                    .unwrap();
            }
            run_all(&parties).await;
            for (_, _, engine) in &parties {
                let slots = engine.result(0).unwrap();
                engine.new_operation_set();
                for (op, share) in slots.into_iter().enumerate() {
                    engine.reconstruct(op, share).unwrap();
                }
            }
            run_all(&parties).await;
            let expected = if learn_weights { [5, 0, 0, 0] } else { [1, 0, 0, 0] };
            for (_, _, engine) in &parties {
                let opened: Vec<u64> = (0..4).map(|op| engine.result(op).unwrap()[0]).collect();
                assert_eq!(opened, expected);
            }
        }
    }

    #[tokio::test]
    async fn malformed_submissions_are_rejected() {
        let parties = engines(2);
        let engine = &parties[0].2;
        assert!(matches!(
            engine.product(0, vec![]),
            Err(EngineError::InvalidArguments { op: 0, .. })
        ));
        assert!(matches!(
            engine.bf_threshold_union(1, vec![vec![1, 2], vec![3]], 1, false),
            Err(EngineError::InvalidArguments { op: 1, .. })
        ));
        assert!(matches!(
            engine.bf_weighted_intersection(1, vec![vec![1, 0]], vec![], 1, false, 4),
            Err(EngineError::InvalidArguments { op: 1, .. })
        ));
        engine.reconstruct(2, 5).unwrap();
        assert!(matches!(
            engine.reconstruct(2, 5),
            Err(EngineError::InvalidArguments { op: 2, .. })
        ));
        assert!(matches!(engine.result(2), Err(EngineError::NotFinished(2))));
        assert!(matches!(engine.result(3), Err(EngineError::UnknownOperation(3))));
        assert!(matches!(
            engine.run_pending_operations(&PeerId::new("stranger")).await,
            Err(EngineError::UnknownCounterpart(_))
        ));
    }

    #[test]
    fn rejects_dishonest_majority() {
        let ids: Vec<PeerId> = ["a", "b"].into_iter().map(PeerId::new).collect();
        let mut endpoints =
            LocalNetwork::connect(ids.iter().map(|id| (id.clone(), Role::PrivacyPeer)));
        let setup = EngineSetup {
            round: 1,
            me: ids[0].clone(),
            privacy_peers: index_map(ids.clone()),
            degree: 1,
            field: Field::default(),
            rng: ChaCha20Rng::seed_from_u64(0),
        };
        let endpoint = Arc::new(endpoints.remove(0));
        assert!(matches!(
            ShamirEngine::new(endpoint, setup),
            Err(EngineError::InvalidArguments { .. })
        ));
    }
}
