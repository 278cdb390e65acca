//! Chain state identity, headers, difficulty, and cumulative chainwork.

use crate::hash::BlockHash;
use crate::time::Timestamp;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Uniquely identifies a chain state: `(height, hash)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub height: u64,
    pub hash: BlockHash,
}

impl StateId {
    pub const ZERO: Self = Self {
        height: 0,
        hash: BlockHash::ZERO,
    };

    pub fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    pub fn is_zero(&self) -> bool {
        self.height == 0 && self.hash.is_zero()
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.height, self.hash)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

/// Proof-of-work difficulty: the number of leading zero bits the state
/// hash must carry. Each unit doubles the expected work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Difficulty(pub u32);

impl Difficulty {
    /// Work contributed by one state at this difficulty: `2^bits`, as a
    /// 256-bit big-endian value.
    pub fn work(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let bit = self.0.min(255) as usize;
        out[31 - bit / 8] = 1 << (bit % 8);
        out
    }
}

/// Cumulative proof-of-work. Totally orders competing chains.
///
/// Stored big-endian, so the derived lexicographic ordering is numeric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainWork(pub [u8; 32]);

impl ChainWork {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Add the work of one state at `difficulty`, saturating on overflow.
    pub fn plus(&self, difficulty: Difficulty) -> Self {
        let mut out = self.0;
        let add = difficulty.work();
        let mut carry = 0u16;
        for i in (0..32).rev() {
            let sum = out[i] as u16 + add[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        if carry != 0 {
            return Self([0xFF; 32]);
        }
        Self(out)
    }
}

impl fmt::Debug for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainWork(")?;
        for b in &self.0[24..] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A full chain-state descriptor: the block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub height: u64,
    pub prev: BlockHash,
    /// Commitment to the UTXO and kernel trees at this state.
    pub definition: BlockHash,
    pub timestamp: Timestamp,
    pub difficulty: Difficulty,
    /// Cumulative work including this state.
    pub chainwork: ChainWork,
    pub nonce: u64,
}

impl StateDescriptor {
    /// Hash of the descriptor over all fields, nonce included.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Blake2b256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.prev.as_bytes());
        hasher.update(self.definition.as_bytes());
        hasher.update(self.timestamp.as_secs().to_be_bytes());
        hasher.update(self.difficulty.0.to_be_bytes());
        hasher.update(self.chainwork.0);
        hasher.update(self.nonce.to_be_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        BlockHash::new(out)
    }

    pub fn id(&self) -> StateId {
        StateId::new(self.height, self.hash())
    }

    /// A zeroed descriptor, the "no tip" sentinel.
    pub fn zero() -> Self {
        Self {
            height: 0,
            prev: BlockHash::ZERO,
            definition: BlockHash::ZERO,
            timestamp: Timestamp::EPOCH,
            difficulty: Difficulty(0),
            chainwork: ChainWork::ZERO,
            nonce: 0,
        }
    }
}
