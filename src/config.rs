//! Protocol parameters shared by all Peers and Privacy Peers of a group.

use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::{field::Field, message::PeerId, shamir::default_degree};

/// Errors of an invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid JSON for [`ProtocolConfig`].
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// A parameter is out of range.
    #[error("invalid parameter {name}: {reason}")]
    Invalid {
        /// The name of the parameter.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// The degree is too large for the number of Privacy Peers.
    #[error("degree {degree} is too large for {privacy_peers} privacy peers")]
    Degree {
        /// The polynomial degree.
        degree: usize,
        /// The number of active Privacy Peers (including self).
        privacy_peers: usize,
    },
    /// Too few counterparts are active to run a round.
    #[error("need at least {required} active {role}, got {actual}")]
    TooFewParticipants {
        /// Which kind of counterpart is missing.
        role: &'static str,
        /// The minimum.
        required: usize,
        /// The actual number.
        actual: usize,
    },
}

/// The aggregate computed in each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Computation {
    /// The items contained in at least `threshold` of the Peers' sets.
    ThresholdUnion {
        /// The minimum number of Peers holding an item.
        threshold: u64,
        /// Whether the result reveals how many Peers hold each item.
        #[serde(default)]
        learn_weights: bool,
    },
    /// The items contained in the sets of all active Peers.
    Intersection,
    /// The items contained in the sets of all active Peers, weighted by how often each
    /// Peer lists them.
    ///
    /// An item is reported if its total weight over all Peers reaches `key_threshold`.
    /// Every Peer's weight of a Bloom filter slot is capped at `max_weight`.
    WeightedIntersection {
        /// The minimum total weight of a reported item.
        #[serde(default)]
        key_threshold: u64,
        /// Whether the result reveals the total weight of each item.
        #[serde(default)]
        learn_weights: bool,
        /// The largest weight a single Peer contributes to a slot.
        #[serde(default = "default_max_weight")]
        max_weight: u64,
    },
}

fn default_max_weight() -> u64 {
    8
}

impl Computation {
    /// A short name, used in output file names.
    pub fn name(&self) -> &'static str {
        match self {
            Computation::ThresholdUnion { .. } => "threshold_union",
            Computation::Intersection => "intersection",
            Computation::WeightedIntersection { .. } => "weighted_intersection",
        }
    }

    /// Whether the reconstructed result carries weights instead of `0`/`1` entries.
    pub fn learns_weights(&self) -> bool {
        match self {
            Computation::ThresholdUnion { learn_weights, .. }
            | Computation::WeightedIntersection { learn_weights, .. } => *learn_weights,
            Computation::Intersection => false,
        }
    }

    /// The number of shared values per Bloom filter slot a Peer sends.
    ///
    /// A weighted intersection shares the presence bit and the capped weight of every slot.
    pub fn values_per_slot(&self) -> usize {
        match self {
            Computation::WeightedIntersection { .. } => 2,
            _ => 1,
        }
    }
}

/// The shape of the Bloom filters encoding the item sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BloomConfig {
    /// The number of slots, rounded up to the next power of two.
    pub size: usize,
    /// The number of hash functions.
    pub hash_count: usize,
}

/// The parameters of a protocol run.
///
/// ```
/// let config = roundmpc::config::ProtocolConfig::from_json(r#"{
///     "time_slot_count": 3,
///     "computation": {"kind": "threshold_union", "threshold": 2},
///     "bloom_filter": {"size": 1024, "hash_count": 4}
/// }"#).unwrap();
/// assert_eq!(config.min_privacy_peers, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// The number of rounds to run.
    pub time_slot_count: u32,
    /// The number of Peers a Privacy Peer waits for before a round.
    #[serde(default = "default_min_peers")]
    pub min_peers: usize,
    /// The number of Privacy Peers (including self) everyone waits for before a round.
    #[serde(default = "default_min_privacy_peers")]
    pub min_privacy_peers: usize,
    /// What to compute.
    pub computation: Computation,
    /// The Bloom filter encoding.
    pub bloom_filter: BloomConfig,
    /// The prime field, defaults to `2^61 - 1`.
    #[serde(default)]
    pub field_order: Field,
    /// The sharing polynomial degree, defaults to `(n - 1) / 2` for `n` Privacy Peers.
    #[serde(default)]
    pub degree: Option<usize>,
    /// Seed for reproducible randomness. Never set this outside of tests.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_min_peers() -> usize {
    1
}

fn default_min_privacy_peers() -> usize {
    2
}

impl ProtocolConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Checks the parameters that do not depend on the group size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_slot_count == 0 {
            return Err(invalid("time_slot_count", "must be at least 1"));
        }
        if self.bloom_filter.size == 0 {
            return Err(invalid("bloom_filter.size", "must be positive"));
        }
        if self.bloom_filter.hash_count == 0 {
            return Err(invalid("bloom_filter.hash_count", "must be positive"));
        }
        if self.min_privacy_peers < 2 {
            return Err(invalid("min_privacy_peers", "must be at least 2"));
        }
        if let Computation::ThresholdUnion { threshold: 0, .. } = self.computation {
            return Err(invalid("computation.threshold", "must be at least 1"));
        }
        if let Computation::WeightedIntersection { max_weight: 0, .. } = self.computation {
            return Err(invalid("computation.max_weight", "must be at least 1"));
        }
        Ok(())
    }

    /// Checks the parameters against the active group of a round and returns the degree.
    pub fn round_degree(&self, privacy_peers: usize, peers: usize) -> Result<usize, ConfigError> {
        if privacy_peers < 2 {
            return Err(ConfigError::TooFewParticipants {
                role: "privacy peers",
                required: 2,
                actual: privacy_peers,
            });
        }
        if peers < 1 {
            return Err(ConfigError::TooFewParticipants {
                role: "peers",
                required: 1,
                actual: peers,
            });
        }
        let degree = self.sharing_degree(privacy_peers);
        if 2 * degree >= privacy_peers {
            return Err(ConfigError::Degree {
                degree,
                privacy_peers,
            });
        }
        let largest_sum = match self.computation {
            Computation::WeightedIntersection { max_weight, .. } => {
                (peers as u64).saturating_mul(max_weight)
            }
            _ => peers as u64,
        };
        if largest_sum >= self.field_order.order() {
            return Err(invalid(
                "field_order",
                format!("must exceed the largest slot sum ({largest_sum})"),
            ));
        }
        Ok(degree)
    }

    /// The number of shared values a Peer sends per round.
    pub fn shares_per_peer(&self) -> usize {
        self.bloom_filter.size.next_power_of_two() * self.computation.values_per_slot()
    }

    /// The sharing degree a Peer uses for `privacy_peers` share holders.
    pub fn sharing_degree(&self, privacy_peers: usize) -> usize {
        self.degree.unwrap_or_else(|| default_degree(privacy_peers))
    }

    /// A random generator for the given participant and round.
    pub fn rng(&self, id: &PeerId, round: u32) -> ChaCha20Rng {
        match self.seed {
            Some(seed) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&seed.to_le_bytes());
                hasher.update(&round.to_le_bytes());
                hasher.update(id.as_str().as_bytes());
                ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
            }
            None => ChaCha20Rng::from_rng(&mut rand::rng()),
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}
