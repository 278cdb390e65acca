//! Fundamental types for the shroud protocol.
//!
//! This crate defines the core types shared across every other crate in the
//! workspace: hashes, peer identities, chain state descriptors, chainwork,
//! confidential transactions, and timestamps.

pub mod hash;
pub mod keys;
pub mod peer;
pub mod state;
pub mod time;
pub mod tx;

pub use hash::{BlockHash, KernelId, MsgKey, TxKey};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use peer::PeerId;
pub use state::{ChainWork, Difficulty, StateDescriptor, StateId};
pub use time::Timestamp;
pub use tx::{Transaction, TxInput, TxKernel, TxOutput};
