//! Peer bookkeeping for the shroud node.
//!
//! Hosts the peer database (ratings, bans, activation policy,
//! persistence) and the identity challenge-response used during the
//! session handshake.

pub mod addr;
pub mod auth;
pub mod error;
pub mod peer_manager;

pub use addr::{pack_addr, unpack_addr};
pub use auth::{issue_challenge, prove_identity, verify_identity};
pub use error::NetworkError;
pub use peer_manager::{InfoRef, PeerInfo, PeerManager, Rating, SessionRef};
