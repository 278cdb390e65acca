//! Cryptographic primitives for the shroud node.
//!
//! - **Ed25519** for node identity, auth challenges, and signature checks
//! - **Blake2b** for hashing (message keys, kernel ids, proof-of-work)
//! - A deterministic nonce chain seeded from the wallet key, used for
//!   dandelion coin flips, dummy blinding factors, and miner nonce seeds

pub mod hash;
pub mod keys;
pub mod nonce;
pub mod sign;

pub use hash::{blake2b_256, blake2b_256_multi};
pub use keys::{generate_keypair, keypair_from_seed, public_from_private};
pub use nonce::NonceChain;
pub use sign::{sign_message, verify_signature};
