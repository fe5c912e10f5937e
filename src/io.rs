//! Where a Peer's per-round input comes from and where its results go.

use std::{
    collections::{BTreeSet, VecDeque},
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::{bloom::BloomFilter, config::Computation, message::PeerId};

/// Errors raised while reading input.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// No input appeared in time.
    #[error("no input for round {round} in {} after {waited:?}", dir.display())]
    Timeout {
        /// The round waiting for input.
        round: u32,
        /// The polled directory.
        dir: PathBuf,
        /// How long the source waited.
        waited: Duration,
    },
    /// An input file could not be read.
    #[error("could not read {}: {source}", path.display())]
    Io {
        /// The file or directory.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The source has no more records.
    #[error("no input left for round {0}")]
    Exhausted(u32),
}

/// Errors raised while writing output.
#[derive(Debug, thiserror::Error)]
#[error("could not write {}: {source}", path.display())]
pub struct OutputError {
    /// The file or directory.
    pub path: PathBuf,
    /// The underlying error.
    pub source: std::io::Error,
}

/// Provides one record (a set of items) per round.
pub trait InputSource: Send + 'static {
    /// The items of the given round.
    fn next_input(
        &mut self,
        round: u32,
    ) -> impl Future<Output = Result<Vec<String>, InputError>> + Send;
}

/// Receives the result of every round.
pub trait OutputSink: Send + 'static {
    /// Handles the output of one round.
    fn write_round(
        &mut self,
        output: &RoundOutput,
    ) -> impl Future<Output = Result<(), OutputError>> + Send;
}

/// The reconstructed aggregate of a round, as seen by one Peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutput {
    /// The Peer.
    pub peer: PeerId,
    /// The round.
    pub round: u32,
    /// What was computed.
    pub computation: Computation,
    /// The Peer's own input items of the round.
    pub items: Vec<String>,
    /// The aggregate Bloom filter.
    pub result: BloomFilter,
}

impl RoundOutput {
    /// The Peer's own items contained in the aggregate, with their weight if it was learned.
    pub fn found_items(&self) -> Vec<(&str, Option<u64>)> {
        let learn_weights = self.computation.learns_weights();
        self.items
            .iter()
            .filter(|item| self.result.contains(item))
            .map(|item| {
                let weight = learn_weights.then(|| self.result.weight(item));
                (item.as_str(), weight)
            })
            .collect()
    }
}

/// Input held in memory, one record per round in order.
#[derive(Debug, Clone, Default)]
pub struct MemoryInput {
    rounds: VecDeque<Vec<String>>,
}

impl MemoryInput {
    /// Creates a source yielding the given records in order.
    pub fn new<R, S>(rounds: impl IntoIterator<Item = R>) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rounds: rounds
                .into_iter()
                .map(|r| r.into_iter().map(Into::into).collect())
                .collect(),
        }
    }
}

impl InputSource for MemoryInput {
    async fn next_input(&mut self, round: u32) -> Result<Vec<String>, InputError> {
        self.rounds.pop_front().ok_or(InputError::Exhausted(round))
    }
}

/// Polls a directory and consumes one file per round, in file name order.
///
/// Every non-empty line of a file is an item, lines starting with `#` are ignored.
#[derive(Debug, Clone)]
pub struct DirectoryInput {
    dir: PathBuf,
    poll_interval: Duration,
    timeout: Duration,
    consumed: BTreeSet<PathBuf>,
}

impl DirectoryInput {
    /// Polls `dir` every 100ms for up to `timeout` per round.
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(100),
            timeout,
            consumed: BTreeSet::new(),
        }
    }

    /// Sets the time between two directory listings.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn next_file(&self) -> Result<Option<PathBuf>, InputError> {
        let io_err = |source| InputError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut candidates = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.'));
            if !hidden && path.is_file() && !self.consumed.contains(&path) {
                candidates.insert(path);
            }
        }
        Ok(candidates.into_iter().next())
    }
}

impl InputSource for DirectoryInput {
    async fn next_input(&mut self, round: u32) -> Result<Vec<String>, InputError> {
        let started = Instant::now();
        loop {
            if let Some(path) = self.next_file().await? {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| InputError::Io {
                        path: path.clone(),
                        source,
                    })?;
                debug!(round, path = %path.display(), "read input");
                self.consumed.insert(path);
                return Ok(parse_items(&content));
            }
            if started.elapsed() >= self.timeout {
                return Err(InputError::Timeout {
                    round,
                    dir: self.dir.clone(),
                    waited: started.elapsed(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}

fn parse_items(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Writes one CSV file per round listing the Peer's own items found in the result.
#[derive(Debug, Clone)]
pub struct FileOutput {
    dir: PathBuf,
}

impl FileOutput {
    /// Writes into `dir`, which is created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The file the output of a round is written to.
    pub fn path_for(&self, output: &RoundOutput) -> PathBuf {
        file_path(&self.dir, output)
    }
}

fn file_path(dir: &Path, output: &RoundOutput) -> PathBuf {
    // ids are often `host:port`
    let peer = output.peer.as_str().replace(':', "_");
    dir.join(format!(
        "{}_{peer}_round{}.csv",
        output.computation.name(),
        output.round
    ))
}

impl OutputSink for FileOutput {
    async fn write_round(&mut self, output: &RoundOutput) -> Result<(), OutputError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| OutputError {
                path: self.dir.clone(),
                source,
            })?;
        let mut csv = String::new();
        for (item, weight) in output.found_items() {
            csv.push_str(item);
            if let Some(weight) = weight {
                csv.push(',');
                csv.push_str(&weight.to_string());
            }
            csv.push('\n');
        }
        let path = self.path_for(output);
        tokio::fs::write(&path, csv)
            .await
            .map_err(|source| OutputError {
                path: path.clone(),
                source,
            })?;
        info!(round = output.round, path = %path.display(), "wrote output");
        Ok(())
    }
}

/// Collects the outputs in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    rounds: Arc<Mutex<Vec<RoundOutput>>>,
}

impl MemoryOutput {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// All outputs written so far.
    pub fn outputs(&self) -> Vec<RoundOutput> {
        self.rounds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for MemoryOutput {
    async fn write_round(&mut self, output: &RoundOutput) -> Result<(), OutputError> {
        self.rounds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output.clone());
        Ok(())
    }
}
