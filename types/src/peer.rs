//! Peer identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A peer's identity: its 32-byte Ed25519 public key.
///
/// The all-zero value is the anonymous identity: peers we only know by
/// address, before authentication. The duplicate-connection tiebreak
/// compares ids lexicographically, so `Ord` matters here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// The anonymous (not-yet-authenticated) identity.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_zero() {
        assert!(PeerId::ZERO.is_zero());
        assert!(!PeerId::new([1u8; 32]).is_zero());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = PeerId::new([1u8; 32]);
        let mut b_bytes = [1u8; 32];
        b_bytes[31] = 2;
        let b = PeerId::new(b_bytes);
        assert!(a < b);
    }
}
