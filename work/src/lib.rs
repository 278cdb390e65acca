//! Proof-of-work for the shroud chain.
//!
//! A state hash meets its difficulty when it carries at least
//! `difficulty` leading zero bits. The solver iterates nonces and polls a
//! cancellation callback so miner threads can be stopped or soft-restarted
//! without being killed.

pub mod error;
pub mod generator;
pub mod validator;

pub use error::WorkError;
pub use generator::solve;
pub use validator::{leading_zero_bits, meets_difficulty, validate};
