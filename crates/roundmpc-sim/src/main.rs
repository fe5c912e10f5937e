//! Simulates a group of Peers and Privacy Peers over an in-memory network.
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use roundmpc::{
    event::Notification,
    io::{DirectoryInput, FileOutput},
    simulate::{SimulatedPeer, simulate_group},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use crate::scenario::ScenarioConfig;

mod scenario;

/// Runs every round of a scenario and writes each Peer's results to the output directory.
///
/// Logging can be controlled with an EnvFilter via the `ROUNDMPC_LOG` environment
/// variable.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The scenario JSON file.
    scenario: PathBuf,
    /// Overrides the output directory of the scenario.
    #[arg(long, short)]
    output_dir: Option<PathBuf>,
    /// Overrides the number of rounds of the scenario.
    #[arg(long)]
    rounds: Option<u32>,
    /// Seeds all randomness, for reproducible runs only.
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().context("tracing initialization")?;

    let cli = Cli::parse();
    let mut scenario = ScenarioConfig::from_path(&cli.scenario)?;
    if let Some(output_dir) = cli.output_dir {
        scenario.output_dir = output_dir;
    }
    if let Some(rounds) = cli.rounds {
        scenario.protocol.time_slot_count = rounds;
    }
    if cli.seed.is_some() {
        scenario.protocol.seed = cli.seed;
    }

    let input_timeout = scenario.input_timeout();
    let peers = scenario
        .peers
        .iter()
        .map(|peer| SimulatedPeer {
            id: peer.id.clone(),
            input: DirectoryInput::new(&peer.input_dir, input_timeout),
            output: FileOutput::new(&scenario.output_dir),
        })
        .collect();
    info!(scenario = %cli.scenario.display(), "running scenario");
    let notifications = simulate_group(
        &scenario.protocol,
        peers,
        scenario.privacy_peers.clone(),
        scenario.recv_timeout(),
    )
    .await
    .context("simulation failed")?;

    for notification in notifications {
        let Notification::FinalResult(event) = notification else {
            continue;
        };
        if scenario.privacy_peers.contains(&event.receiver) {
            continue;
        }
        let set = event.result.iter().filter(|&&slot| slot != 0).count();
        println!(
            "round {}: {} received the result from {} ({set} of {} slots set)",
            event.round,
            event.receiver,
            event.originator,
            event.result.len()
        );
    }
    println!("outputs written to {}", scenario.output_dir.display());
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var("ROUNDMPC_LOG")
        .with_default_directive("roundmpc=info".parse()?)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .init();

    Ok(())
}
