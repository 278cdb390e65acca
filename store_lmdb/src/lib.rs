//! LMDB (heed) implementations of the shroud storage traits.

pub mod bbs;
pub mod chain;
pub mod dummy;
pub mod environment;
pub mod error;
pub mod mined;
pub mod param;
pub mod peer;

pub use bbs::LmdbBbsStore;
pub use chain::LmdbChainKv;
pub use dummy::LmdbDummyStore;
pub use environment::LmdbEnvironment;
pub use error::LmdbError;
pub use mined::LmdbMinedStore;
pub use param::LmdbParamStore;
pub use peer::LmdbPeerStore;
