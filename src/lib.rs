//! A round-based coordination engine for secure multi-party computation on secret shares.
//!
//! A group of data-holding **Peers** and computing **Privacy Peers** repeatedly computes an
//! aggregate over the Peers' private item sets (threshold set-union, set intersection or
//! weighted set intersection), without any Privacy Peer learning a Peer's input. Every
//! round, each Peer encodes its items as a Bloom filter and secret-shares it among the
//! Privacy Peers, the Privacy Peers compute the aggregate on the shares and send the
//! reconstructed result back.
//!
//! ## Main Components
//!
//! * [`Peer`] and [`PrivacyPeer`]: the round orchestrators of both roles. Each one runs one
//!   worker task per counterpart and drives them through the phases of a round.
//! * [`channel`]: the [`channel::ConnectionManager`] abstraction and an in-memory network.
//! * [`engine`]: the [`engine::PrimitivesEngine`] abstraction and a Shamir-sharing engine.
//! * [`barrier`]: the rendezvous points that keep the workers of a round in lockstep.
//! * [`io`]: per-round input records and output sinks.
//!
//! Counterparts that disconnect do not stall a round: a Peer that drops out before sending
//! its shares is excluded from the computation, and a Privacy Peer that cannot be reached
//! is skipped when results are collected.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//!
//! use roundmpc::{
//!     config::ProtocolConfig,
//!     event::Notification,
//!     io::{MemoryInput, MemoryOutput},
//!     message::PeerId,
//!     simulate::{SimulatedPeer, simulate_group},
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), roundmpc::Error> {
//! let config = ProtocolConfig::from_json(r#"{
//!     "time_slot_count": 1,
//!     "computation": {"kind": "threshold_union", "threshold": 2},
//!     "bloom_filter": {"size": 256, "hash_count": 3}
//! }"#)?;
//! let peers = [("peer1", ["10.0.0.1", "10.0.0.2"]), ("peer2", ["10.0.0.2", "10.0.0.3"])]
//!     .into_iter()
//!     .map(|(id, items)| SimulatedPeer {
//!         id: PeerId::new(id),
//!         input: MemoryInput::new([items]),
//!         output: MemoryOutput::new(),
//!     })
//!     .collect();
//! let privacy_peers = vec![PeerId::new("pp1"), PeerId::new("pp2"), PeerId::new("pp3")];
//! let notifications =
//!     simulate_group(&config, peers, privacy_peers, Duration::from_secs(10)).await?;
//! assert!(notifications.iter().any(|n| matches!(n, Notification::FinalResult(_))));
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod barrier;
pub mod bloom;
pub mod channel;
pub mod config;
pub mod engine;
pub mod event;
pub mod field;
pub mod io;
pub mod message;
pub mod round;
pub mod shamir;
pub mod simulate;
pub mod stop;

mod error;
mod worker;

pub use error::Error;
pub use round::{Peer, PrivacyPeer};
pub use worker::WorkerError;
