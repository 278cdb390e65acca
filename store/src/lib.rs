//! Abstract storage traits for the shroud node.
//!
//! Every storage backend (LMDB, in-memory for testing) implements these
//! traits. The rest of the codebase depends only on the traits.

pub mod bbs;
pub mod dummy;
pub mod error;
pub mod mined;
pub mod param;
pub mod peer;

pub use bbs::{BbsRecord, BbsStore};
pub use dummy::DummyStore;
pub use error::StoreError;
pub use mined::{MinedEntry, MinedStore};
pub use param::ParamStore;
pub use peer::{PeerRecord, PeerStore};
