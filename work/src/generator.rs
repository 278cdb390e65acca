//! Proof-of-work generation (CPU).

use crate::validator::meets_difficulty;
use crate::WorkError;
use shroud_types::StateDescriptor;

/// How many nonces to try between cheap cancellation probes.
const CANCEL_PROBE_INTERVAL: u64 = 64;

/// How many nonces to try between `retrying` probes, the expensive check
/// a soft restart uses to notice the miner task was replaced.
const RETRY_PROBE_INTERVAL: u64 = 1 << 16;

/// Search for a nonce satisfying `descriptor.difficulty`, starting from
/// `nonce0`.
///
/// `cancel(retrying)` is polled throughout: with `retrying == false` every
/// [`CANCEL_PROBE_INTERVAL`] nonces, and with `retrying == true` every
/// [`RETRY_PROBE_INTERVAL`] nonces. Returning `true` from either aborts
/// the search with [`WorkError::Cancelled`].
///
/// On success the satisfying nonce is left in `descriptor.nonce`.
pub fn solve<F>(descriptor: &mut StateDescriptor, nonce0: u64, mut cancel: F) -> Result<(), WorkError>
where
    F: FnMut(bool) -> bool,
{
    descriptor.nonce = nonce0;
    let mut since_retry_probe = 0u64;

    loop {
        for _ in 0..CANCEL_PROBE_INTERVAL {
            if meets_difficulty(&descriptor.hash(), descriptor.difficulty) {
                return Ok(());
            }
            descriptor.nonce = descriptor.nonce.wrapping_add(1);
        }

        if cancel(false) {
            return Err(WorkError::Cancelled);
        }

        since_retry_probe += CANCEL_PROBE_INTERVAL;
        if since_retry_probe >= RETRY_PROBE_INTERVAL {
            since_retry_probe = 0;
            if cancel(true) {
                return Err(WorkError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate;
    use shroud_types::{BlockHash, ChainWork, Difficulty, Timestamp};

    fn descriptor(difficulty: u32) -> StateDescriptor {
        StateDescriptor {
            height: 1,
            prev: BlockHash::new([1u8; 32]),
            definition: BlockHash::new([2u8; 32]),
            timestamp: Timestamp::new(1_700_000_000),
            difficulty: Difficulty(difficulty),
            chainwork: ChainWork::ZERO,
            nonce: 0,
        }
    }

    #[test]
    fn solves_low_difficulty() {
        let mut d = descriptor(8);
        solve(&mut d, 0, |_| false).expect("solvable");
        assert!(validate(&d));
    }

    #[test]
    fn cancel_aborts_search() {
        // Difficulty 255 is unreachable; the first probe cancels.
        let mut d = descriptor(255);
        let result = solve(&mut d, 0, |_| true);
        assert_eq!(result, Err(WorkError::Cancelled));
    }

    #[test]
    fn retrying_probe_fires_eventually() {
        let mut d = descriptor(255);
        let mut saw_retrying = false;
        let result = solve(&mut d, 0, |retrying| {
            if retrying {
                saw_retrying = true;
            }
            saw_retrying
        });
        assert_eq!(result, Err(WorkError::Cancelled));
        assert!(saw_retrying);
    }

    #[test]
    fn nonce_seed_is_respected() {
        let mut d = descriptor(0);
        solve(&mut d, 777, |_| false).expect("difficulty 0");
        assert_eq!(d.nonce, 777);
    }
}
