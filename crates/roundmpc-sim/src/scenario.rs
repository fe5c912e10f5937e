//! The scenario file describing a simulated group.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, ensure};
use roundmpc::{config::ProtocolConfig, message::PeerId};
use serde::Deserialize;

/// A group of Peers and Privacy Peers and the protocol they run.
///
/// Relative paths are resolved against the directory of the scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    pub protocol: ProtocolConfig,
    pub peers: Vec<PeerScenario>,
    pub privacy_peers: Vec<PeerId>,
    pub output_dir: PathBuf,
    /// How long a Peer waits for the input file of a round.
    #[serde(default = "default_input_timeout_secs")]
    pub input_timeout_secs: u64,
    /// How long a receive may block before a participant gives up.
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerScenario {
    pub id: PeerId,
    /// One file per round, consumed in file name order.
    pub input_dir: PathBuf,
}

fn default_input_timeout_secs() -> u64 {
    10
}

fn default_recv_timeout_secs() -> u64 {
    600
}

impl ScenarioConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let mut scenario: Self = serde_json::from_str(&json)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        scenario.resolve(base);
        scenario.validate()?;
        Ok(scenario)
    }

    fn resolve(&mut self, base: &Path) {
        self.output_dir = base.join(&self.output_dir);
        for peer in &mut self.peers {
            peer.input_dir = base.join(&peer.input_dir);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.protocol.validate().context("invalid protocol")?;
        ensure!(!self.peers.is_empty(), "the scenario has no peers");
        ensure!(
            self.privacy_peers.len() >= self.protocol.min_privacy_peers,
            "{} privacy peers configured, but the protocol waits for {}",
            self.privacy_peers.len(),
            self.protocol.min_privacy_peers
        );
        ensure!(
            self.peers.len() >= self.protocol.min_peers,
            "{} peers configured, but the protocol waits for {}",
            self.peers.len(),
            self.protocol.min_peers
        );
        let mut ids: Vec<&PeerId> = self
            .peers
            .iter()
            .map(|p| &p.id)
            .chain(&self.privacy_peers)
            .collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            anyhow::bail!("participant id {} is used twice", pair[0]);
        }
        Ok(())
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout_secs)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "protocol": {
            "time_slot_count": 2,
            "computation": {"kind": "intersection"},
            "bloom_filter": {"size": 64, "hash_count": 2}
        },
        "peers": [
            {"id": "peer1", "input_dir": "peer1"},
            {"id": "peer2", "input_dir": "/data/peer2"}
        ],
        "privacy_peers": ["pp1", "pp2", "pp3"],
        "output_dir": "out"
    }"#;

    #[test]
    fn paths_are_resolved_against_the_scenario() {
        let mut scenario: ScenarioConfig = serde_json::from_str(SCENARIO).unwrap();
        scenario.resolve(Path::new("/scenarios/a"));
        scenario.validate().unwrap();
        assert_eq!(scenario.output_dir, Path::new("/scenarios/a/out"));
        assert_eq!(scenario.peers[0].input_dir, Path::new("/scenarios/a/peer1"));
        assert_eq!(scenario.peers[1].input_dir, Path::new("/data/peer2"));
        assert_eq!(scenario.input_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut scenario: ScenarioConfig = serde_json::from_str(SCENARIO).unwrap();
        scenario.privacy_peers.push(PeerId::new("peer1"));
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("peer1"));
    }
}
