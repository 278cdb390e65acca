//! Ed25519 key generation.

use ed25519_dalek::SigningKey;
use shroud_types::{KeyPair, PrivateKey, PublicKey};

/// Generate a new Ed25519 key pair from a secure random source.
pub fn generate_keypair() -> KeyPair {
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).expect("OS random source unavailable");
    keypair_from_seed(&seed)
}

/// Derive a key pair deterministically from a 32-byte seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(seed);
    let public = PublicKey(signing_key.verifying_key().to_bytes());
    KeyPair {
        public,
        private: PrivateKey(*seed),
    }
}

/// Derive the public key from a private key.
pub fn public_from_private(private: &PrivateKey) -> PublicKey {
    let signing_key = SigningKey::from_bytes(&private.0);
    PublicKey(signing_key.verifying_key().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_deterministic() {
        let a = keypair_from_seed(&[7u8; 32]);
        let b = keypair_from_seed(&[7u8; 32]);
        assert_eq!(a.public, b.public);
    }

    #[test]
    fn different_seeds_differ() {
        let a = keypair_from_seed(&[1u8; 32]);
        let b = keypair_from_seed(&[2u8; 32]);
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn public_matches_pair() {
        let kp = keypair_from_seed(&[5u8; 32]);
        assert_eq!(public_from_private(&kp.private), kp.public);
    }
}
