use std::{future::Future, sync::Arc, time::Duration};

use futures::future::try_join_all;
use roundmpc::{
    Error, Peer, PrivacyPeer,
    channel::{LocalEndpoint, LocalNetwork, send_to},
    config::{BloomConfig, Computation, ProtocolConfig},
    engine::{
        EngineBuilder, EngineError, EngineSetup, OpId, PrimitivesEngine, ShamirEngineBuilder,
    },
    event::{FinalResultEvent, Notification},
    field::Field,
    io::{MemoryInput, MemoryOutput},
    message::{Message, Payload, PeerId, Role},
    round::Phase,
    simulate::{SimulatedPeer, simulate_group},
    stop::Stopper,
};
use tokio::sync::mpsc;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

const TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

fn config(computation: Computation, rounds: u32) -> ProtocolConfig {
    ProtocolConfig {
        time_slot_count: rounds,
        min_peers: 1,
        min_privacy_peers: 3,
        computation,
        bloom_filter: BloomConfig {
            size: 1024,
            hash_count: 3,
        },
        field_order: Field::default(),
        degree: None,
        seed: Some(7),
    }
}

fn union(threshold: u64, learn_weights: bool) -> Computation {
    Computation::ThresholdUnion {
        threshold,
        learn_weights,
    }
}

fn privacy_peers(n: usize) -> Vec<PeerId> {
    (1..=n).map(|i| PeerId::new(format!("pp{i}"))).collect()
}

fn simulated(id: &str, rounds: &[&[&str]]) -> SimulatedPeer<MemoryInput, MemoryOutput> {
    SimulatedPeer {
        id: PeerId::new(id),
        input: MemoryInput::new(rounds.iter().map(|items| items.iter().copied())),
        output: MemoryOutput::new(),
    }
}

fn found(output: &MemoryOutput, round: usize) -> Vec<String> {
    output.outputs()[round]
        .found_items()
        .into_iter()
        .map(|(item, _)| item.to_string())
        .collect()
}

fn final_results<'a>(
    notifications: &'a [Notification],
    receiver: &str,
) -> Vec<&'a FinalResultEvent> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::FinalResult(event) if event.receiver.as_str() == receiver => Some(event),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn threshold_union_of_three_peers() -> Result<(), Error> {
    let _g = init_tracing();
    let peers = vec![
        simulated("peer1", &[&["a", "b"]]),
        simulated("peer2", &[&["b", "c"]]),
        simulated("peer3", &[&["b", "c", "d"]]),
    ];
    let outputs: Vec<MemoryOutput> = peers.iter().map(|p| p.output.clone()).collect();

    let notifications =
        simulate_group(&config(union(2, false), 1), peers, privacy_peers(3), TIMEOUT).await?;

    assert!(
        !notifications
            .iter()
            .any(|n| matches!(n, Notification::Exception(_)))
    );
    assert_eq!(found(&outputs[0], 0), vec!["b"]);
    assert_eq!(found(&outputs[1], 0), vec!["b", "c"]);
    assert_eq!(found(&outputs[2], 0), vec!["b", "c"]);

    let peer1_results = final_results(&notifications, "peer1");
    assert_eq!(peer1_results.len(), 1);
    for pp in privacy_peers(3) {
        let pp_results = final_results(&notifications, pp.as_str());
        assert_eq!(pp_results.len(), 1);
        assert_eq!(pp_results[0].originator, pp);
        assert_eq!(pp_results[0].result, peer1_results[0].result);
    }
    Ok(())
}

#[tokio::test]
async fn two_privacy_peers_compute_the_union() -> Result<(), Error> {
    let _g = init_tracing();
    let mut config = config(union(1, false), 1);
    config.min_privacy_peers = 2;
    let peers = vec![
        simulated("peer1", &[&["a", "b"]]),
        simulated("peer2", &[&["b", "c"]]),
    ];
    let outputs: Vec<MemoryOutput> = peers.iter().map(|p| p.output.clone()).collect();

    simulate_group(&config, peers, privacy_peers(2), TIMEOUT).await?;

    for output in &outputs {
        let result = &output.outputs()[0].result;
        for item in ["a", "b", "c"] {
            assert!(result.contains(item), "{item} missing from the union");
        }
    }
    assert_eq!(found(&outputs[0], 0), vec!["a", "b"]);
    assert_eq!(found(&outputs[1], 0), vec!["b", "c"]);
    Ok(())
}

#[tokio::test]
async fn threshold_union_learns_weights() -> Result<(), Error> {
    let _g = init_tracing();
    let peers = vec![
        simulated("peer1", &[&["a", "b"]]),
        simulated("peer2", &[&["b", "c"]]),
        simulated("peer3", &[&["b", "c", "d"]]),
    ];
    let outputs: Vec<MemoryOutput> = peers.iter().map(|p| p.output.clone()).collect();

    simulate_group(&config(union(1, true), 1), peers, privacy_peers(3), TIMEOUT).await?;

    let peer1 = &outputs[0].outputs()[0];
    assert_eq!(peer1.found_items(), vec![("a", Some(1)), ("b", Some(3))]);
    let peer3 = &outputs[2].outputs()[0];
    assert_eq!(
        peer3.found_items(),
        vec![("b", Some(3)), ("c", Some(2)), ("d", Some(1))]
    );
    Ok(())
}

fn group(peers: &[&str], privacy_peers: &[PeerId]) -> Vec<LocalEndpoint> {
    let parties = peers
        .iter()
        .map(|id| (PeerId::new(id), Role::Peer))
        .chain(privacy_peers.iter().map(|id| (id.clone(), Role::PrivacyPeer)));
    LocalNetwork::connect_with_timeout(parties, TIMEOUT)
}

type LocalPrivacyPeer = PrivacyPeer<LocalEndpoint, ShamirEngineBuilder<LocalEndpoint>>;

fn privacy_peer(endpoint: LocalEndpoint, config: &ProtocolConfig) -> LocalPrivacyPeer {
    let endpoint = Arc::new(endpoint);
    let builder = ShamirEngineBuilder::new(Arc::clone(&endpoint));
    PrivacyPeer::new(endpoint, config.clone(), builder)
}

fn drain(receivers: &mut [mpsc::UnboundedReceiver<Notification>]) -> Vec<Notification> {
    let mut notifications = vec![];
    for receiver in receivers {
        while let Ok(notification) = receiver.try_recv() {
            notifications.push(notification);
        }
    }
    notifications
}

async fn round_started(notifications: &mut mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        if let Notification::RoundStarted { .. } = notification {
            return;
        }
    }
    panic!("privacy peer stopped before starting a round");
}

#[tokio::test]
async fn offline_peer_is_excluded_from_the_intersection() {
    let _g = init_tracing();
    let mut config = config(Computation::Intersection, 1);
    config.min_peers = 2;
    let pps = privacy_peers(3);
    let mut endpoints = group(&["peer1", "peer2"], &pps).into_iter();
    let (Some(peer1), Some(peer2)) = (endpoints.next(), endpoints.next()) else {
        panic!("endpoints for both peers");
    };

    let output = MemoryOutput::new();
    let mut peer1 = Peer::new(
        Arc::new(peer1),
        config.clone(),
        MemoryInput::new([["a", "b", "c"]]),
        output.clone(),
    );
    let stopper = peer1.stopper();
    let mut peer1_notifications = peer1.subscribe();

    let mut pp_notifications = vec![];
    let mut pp_runs = vec![];
    for endpoint in endpoints {
        let mut pp = privacy_peer(endpoint, &config);
        pp_notifications.push(pp.subscribe());
        pp_runs.push(pp.run());
    }

    // peer2 is registered but never runs, it goes offline once every round has started
    let disconnect = async {
        for notifications in &mut pp_notifications {
            round_started(notifications).await;
        }
        peer2.disconnect();
    };
    let (peer1_result, pp_results, ()) =
        tokio::join!(peer1.run(), try_join_all(pp_runs), disconnect);
    peer1_result.unwrap();
    pp_results.unwrap();

    assert!(stopper.is_stopped());
    assert_eq!(found(&output, 0), vec!["a", "b", "c"]);
    let mut received = vec![];
    while let Ok(notification) = peer1_notifications.try_recv() {
        received.push(notification);
    }
    assert_eq!(final_results(&received, "peer1").len(), 1);
}

#[tokio::test]
async fn malformed_shares_stop_the_privacy_peers() {
    let _g = init_tracing();
    let mut config = config(union(1, false), 1);
    config.min_privacy_peers = 2;
    let pps = privacy_peers(2);
    let mut endpoints = group(&["mallory"], &pps).into_iter();
    let Some(mallory) = endpoints.next() else {
        panic!("endpoint for mallory");
    };

    let mut notifications = vec![];
    let mut pp_runs = vec![];
    for endpoint in endpoints {
        let mut pp = privacy_peer(endpoint, &config);
        notifications.push(pp.subscribe());
        pp_runs.push(pp.run());
    }
    for pp in &pps {
        let msg = Message::new(
            PeerId::new("mallory"),
            0,
            1,
            Payload::InitialShares(vec![1, 2, 3]),
        );
        send_to(&mallory, pp, "shares", &msg).await.unwrap();
    }

    for result in futures::future::join_all(pp_runs).await {
        assert!(matches!(result, Err(Error::ProtocolViolation { round: 1, .. })));
    }
    for notifications in &mut notifications {
        let mut exception = None;
        while let Ok(notification) = notifications.try_recv() {
            if let Notification::Exception(event) = notification {
                exception = Some(event);
            }
        }
        let exception = exception.expect("an exception notification");
        assert_eq!(exception.phase, Phase::CollectingShares);
        assert_eq!(exception.counterpart, Some(PeerId::new("mallory")));
    }
    drop(mallory);
}

#[tokio::test]
async fn intersection_over_several_rounds() -> Result<(), Error> {
    let _g = init_tracing();
    let config = config(Computation::Intersection, 3);
    let pps = privacy_peers(5);
    let peers = vec![
        simulated("peer1", &[&["x", "y"], &["x"], &["z", "x"]]),
        simulated("peer2", &[&["y", "z"], &["x", "z"], &["z"]]),
    ];
    let mut endpoints = group(&["peer1", "peer2"], &pps).into_iter();

    let mut stoppers: Vec<Stopper> = vec![];
    let mut receivers = vec![];
    let mut outputs = vec![];
    let mut peer_runs = vec![];
    for (member, endpoint) in peers.into_iter().zip(&mut endpoints) {
        let mut peer = Peer::new(
            Arc::new(endpoint),
            config.clone(),
            member.input,
            member.output.clone(),
        );
        stoppers.push(peer.stopper());
        receivers.push(peer.subscribe());
        outputs.push(member.output);
        peer_runs.push(peer.run());
    }
    let mut pp_runs = vec![];
    for endpoint in endpoints {
        let mut pp = privacy_peer(endpoint, &config);
        stoppers.push(pp.stopper());
        receivers.push(pp.subscribe());
        pp_runs.push(pp.run());
    }
    let (peer_results, pp_results) = tokio::join!(try_join_all(peer_runs), try_join_all(pp_runs));
    peer_results?;
    pp_results?;

    assert_eq!(stoppers.len(), 7);
    assert!(stoppers.iter().all(Stopper::is_stopped));
    for output in &outputs {
        let rounds: Vec<u32> = output.outputs().iter().map(|o| o.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }
    assert_eq!(found(&outputs[0], 0), vec!["y"]);
    assert_eq!(found(&outputs[0], 1), vec!["x"]);
    assert_eq!(found(&outputs[0], 2), vec!["z"]);
    assert_eq!(found(&outputs[1], 0), vec!["y"]);
    assert_eq!(found(&outputs[1], 1), vec!["x"]);
    assert_eq!(found(&outputs[1], 2), vec!["z"]);

    let notifications = drain(&mut receivers);
    let rounds: Vec<u32> = final_results(&notifications, "peer2")
        .iter()
        .map(|event| event.round)
        .collect();
    assert_eq!(rounds, vec![1, 2, 3]);
    let started = notifications
        .iter()
        .filter(|n| matches!(n, Notification::RoundStarted { peer, .. } if peer.as_str() == "pp1"))
        .count();
    assert_eq!(started, 3);
    Ok(())
}

#[tokio::test]
async fn weighted_intersection_sums_repeated_items() -> Result<(), Error> {
    let _g = init_tracing();
    let weighted = |key_threshold, learn_weights| Computation::WeightedIntersection {
        key_threshold,
        learn_weights,
        max_weight: 4,
    };
    let inputs: [&[&str]; 2] = [&["a", "a", "b", "c", "c", "c"], &["a", "b", "c", "d"]];
    let run = |computation| {
        let peers = vec![
            simulated("peer1", &[inputs[0]]),
            simulated("peer2", &[inputs[1]]),
        ];
        let outputs: Vec<MemoryOutput> = peers.iter().map(|p| p.output.clone()).collect();
        let config = config(computation, 1);
        async move {
            simulate_group(&config, peers, privacy_peers(3), TIMEOUT).await?;
            Ok::<_, Error>(outputs)
        }
    };

    let outputs = run(weighted(0, true)).await?;
    assert_eq!(
        outputs[0].outputs()[0].found_items(),
        vec![("a", Some(3)), ("b", Some(2)), ("c", Some(4))]
    );
    assert_eq!(
        outputs[1].outputs()[0].found_items(),
        vec![("a", Some(3)), ("b", Some(2)), ("c", Some(4))]
    );

    let outputs = run(weighted(3, false)).await?;
    assert_eq!(found(&outputs[0], 0), vec!["a", "c"]);
    assert_eq!(outputs[1].outputs()[0].found_items(), vec![("a", None), ("c", None)]);
    Ok(())
}

/// Delegates to another engine but rejects every threshold union.
struct RejectingUnion<E>(E);

impl<E: PrimitivesEngine> PrimitivesEngine for RejectingUnion<E> {
    fn new_operation_set(&self) {
        self.0.new_operation_set();
    }

    fn product(&self, op: OpId, factors: Vec<u64>) -> Result<(), EngineError> {
        self.0.product(op, factors)
    }

    fn bf_threshold_union(
        &self,
        op: OpId,
        _filters: Vec<Vec<u64>>,
        _threshold: u64,
        _learn_weights: bool,
    ) -> Result<(), EngineError> {
        Err(EngineError::InvalidArguments {
            op,
            reason: "threshold unions are disabled".to_string(),
        })
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
        self.0.bf_weighted_intersection(
            op,
            presence,
            weights,
            key_threshold,
            learn_weights,
            max_weight,
        )
    }

    fn reconstruct(&self, op: OpId, share: u64) -> Result<(), EngineError> {
        self.0.reconstruct(op, share)
    }

    fn result(&self, op: OpId) -> Result<Vec<u64>, EngineError> {
        self.0.result(op)
    }

    fn run_pending_operations(
        &self,
        counterpart: &PeerId,
    ) -> impl Future<Output = Result<(), EngineError>> + Send {
        self.0.run_pending_operations(counterpart)
    }
}

struct RejectingBuilder<B>(B);

impl<B: EngineBuilder> EngineBuilder for RejectingBuilder<B> {
    type Engine = RejectingUnion<B::Engine>;

    fn new_engine(&self, setup: EngineSetup) -> Result<Self::Engine, EngineError> {
        self.0.new_engine(setup).map(RejectingUnion)
    }
}

#[tokio::test]
async fn failed_computation_is_reported_as_exception() {
    let _g = init_tracing();
    let config = config(union(2, false), 1);
    let pps = privacy_peers(3);
    let mut endpoints = group(&["peer1"], &pps).into_iter();
    let Some(peer1) = endpoints.next() else {
        panic!("endpoint for peer1");
    };
    let peer1 = Peer::new(
        Arc::new(peer1),
        config.clone(),
        MemoryInput::new([["a", "b"]]),
        MemoryOutput::new(),
    );

    let mut receivers = vec![];
    let mut pp_runs = vec![];
    for endpoint in endpoints {
        let endpoint = Arc::new(endpoint);
        let builder = RejectingBuilder(ShamirEngineBuilder::new(Arc::clone(&endpoint)));
        let mut pp = PrivacyPeer::new(endpoint, config.clone(), builder);
        receivers.push(pp.subscribe());
        pp_runs.push(pp.run());
    }
    let (peer_result, pp_results) =
        tokio::join!(peer1.run(), futures::future::join_all(pp_runs));

    assert!(matches!(peer_result, Err(Error::NoResult(1))));
    for result in pp_results {
        assert!(matches!(result, Err(Error::Computation { round: 1, .. })));
    }
    let exceptions: Vec<_> = drain(&mut receivers)
        .into_iter()
        .filter_map(|n| match n {
            Notification::Exception(event) => Some(event),
            _ => None,
        })
        .collect();
    assert_eq!(exceptions.len(), 3);
    for exception in exceptions {
        assert_eq!(exception.phase, Phase::SecureCompute);
        assert!(
            exception.diagnostic.contains("threshold unions are disabled"),
            "{}",
            exception.diagnostic
        );
    }
}
