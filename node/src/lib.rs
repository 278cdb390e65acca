//! The shroud full-node core.
//!
//! Orchestrates the peer sessions, the congestion/task scheduler, the
//! two-phase macroblock bootstrap, the dandelion transaction pipeline,
//! the miner and verifier pools, the bulletin board, and the LAN beacon
//! around an injected chain processor.

pub mod bbs;
pub mod beacon;
pub mod config;
pub mod error;
pub mod miner;
pub mod net;
pub mod node;
pub mod peer;
pub mod processor;
pub mod scheduler;
pub mod sync;
pub mod txpool;
pub mod verifier;
pub mod wanted;

pub use config::NodeConfig;
pub use error::NodeError;
pub use miner::{MinedSolution, Miner};
pub use node::{Effect, NodeCore, Stores};
pub use peer::{PeerFlags, PeerRef};
pub use processor::{BlockPlan, ChainProcessor, DataStatus, HeaderChain, TxContext};
pub use scheduler::{TaskId, TaskScheduler};
pub use verifier::{Summary, VerifierPool, VerifyJob};
