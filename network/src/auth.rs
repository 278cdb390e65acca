//! Identity challenge-response.
//!
//! On connect each side issues a fresh 32-byte nonce; the remote proves
//! ownership of its claimed id by signing that nonce with the matching
//! Ed25519 key. A peer id *is* the public key, so verification needs no
//! lookup.

use shroud_types::{PeerId, PrivateKey, PublicKey, Signature};

/// Generate a fresh challenge nonce for a new connection.
pub fn issue_challenge() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).expect("OS random source unavailable");
    nonce
}

/// Sign a received challenge with our identity key.
pub fn prove_identity(challenge: &[u8; 32], key: &PrivateKey) -> Signature {
    shroud_crypto::sign_message(challenge, key)
}

/// Verify a peer's authentication response against the challenge we issued.
pub fn verify_identity(challenge: &[u8; 32], claimed: &PeerId, signature: &Signature) -> bool {
    shroud_crypto::verify_signature(challenge, signature, &PublicKey(claimed.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_crypto::generate_keypair;

    #[test]
    fn prove_then_verify() {
        let kp = generate_keypair();
        let id = PeerId::new(kp.public.0);
        let challenge = issue_challenge();
        let sig = prove_identity(&challenge, &kp.private);
        assert!(verify_identity(&challenge, &id, &sig));
    }

    #[test]
    fn wrong_identity_fails() {
        let kp = generate_keypair();
        let other = generate_keypair();
        let challenge = issue_challenge();
        let sig = prove_identity(&challenge, &kp.private);
        assert!(!verify_identity(&challenge, &PeerId::new(other.public.0), &sig));
    }

    #[test]
    fn wrong_challenge_fails() {
        let kp = generate_keypair();
        let id = PeerId::new(kp.public.0);
        let sig = prove_identity(&issue_challenge(), &kp.private);
        assert!(!verify_identity(&issue_challenge(), &id, &sig));
    }

    #[test]
    fn challenges_are_unique() {
        assert_ne!(issue_challenge(), issue_challenge());
    }
}
