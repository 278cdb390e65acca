//! Confidential transactions: inputs, outputs, kernels.

use crate::hash::{KernelId, TxKey};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

type Blake2b256 = Blake2b<U32>;

/// A transaction input: a reference to an unspent output by its commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxInput {
    pub commitment: [u8; 32],
}

/// A confidential transaction output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxOutput {
    pub commitment: [u8; 32],
    /// Extra maturity delay before the output can be spent.
    pub incubation: u64,
}

/// A transaction kernel: the signed commitment to a value transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKernel {
    pub excess: [u8; 32],
    pub fee: u64,
}

impl TxKernel {
    pub fn id(&self) -> KernelId {
        let mut hasher = Blake2b256::new();
        hasher.update(self.excess);
        hasher.update(self.fee.to_be_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        KernelId::new(out)
    }
}

/// A confidential transaction.
///
/// Kernels survive aggregation unchanged, so the kernel-id set identifies
/// the value transfers regardless of how transactions were merged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub kernels: Vec<TxKernel>,
    /// Aggregate blinding offset.
    pub offset: [u8; 32],
}

impl Transaction {
    /// Pool deduplication key: hash of the sorted kernel-id multiset.
    pub fn key(&self) -> TxKey {
        let mut ids = self.kernel_ids();
        ids.sort();
        let mut hasher = Blake2b256::new();
        for id in &ids {
            hasher.update(id.as_bytes());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        TxKey::new(out)
    }

    pub fn kernel_ids(&self) -> Vec<KernelId> {
        self.kernels.iter().map(TxKernel::id).collect()
    }

    /// Total fee across all kernels.
    pub fn fee(&self) -> u64 {
        self.kernels.iter().map(|k| k.fee).sum()
    }

    /// Canonical ordering of all element lists.
    pub fn sort(&mut self) {
        self.inputs.sort();
        self.outputs.sort();
        self.kernels.sort();
    }

    /// Serialized size, used for fee-per-byte profit comparison.
    pub fn serialized_size(&self) -> usize {
        32 + self.inputs.len() * 32 + self.outputs.len() * 40 + self.kernels.len() * 40
    }

    /// Merge `other` into `self`, folding the blinding offsets.
    pub fn merge(&mut self, other: Transaction) {
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
        self.kernels.extend(other.kernels);
        for (a, b) in self.offset.iter_mut().zip(other.offset.iter()) {
            *a = a.wrapping_add(*b);
        }
        self.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(kernel_seeds: &[u8]) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                commitment: [9u8; 32],
            }],
            outputs: vec![TxOutput {
                commitment: [8u8; 32],
                incubation: 0,
            }],
            kernels: kernel_seeds
                .iter()
                .map(|&s| TxKernel {
                    excess: [s; 32],
                    fee: 10,
                })
                .collect(),
            offset: [0u8; 32],
        }
    }

    #[test]
    fn key_ignores_kernel_order() {
        let a = tx(&[1, 2, 3]);
        let b = tx(&[3, 1, 2]);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_differs_for_different_kernels() {
        assert_ne!(tx(&[1]).key(), tx(&[2]).key());
    }

    #[test]
    fn merge_concatenates_and_sorts() {
        let mut a = tx(&[2]);
        let b = tx(&[1]);
        a.merge(b);
        assert_eq!(a.kernels.len(), 2);
        assert!(a.kernels[0].excess[0] <= a.kernels[1].excess[0]);
        assert_eq!(a.inputs.len(), 2);
        assert_eq!(a.outputs.len(), 2);
    }

    #[test]
    fn fee_sums_kernels() {
        assert_eq!(tx(&[1, 2]).fee(), 20);
    }
}
