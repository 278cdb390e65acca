//! Transaction pools and the dandelion privacy pipeline.
//!
//! Two pools coexist. The **fluff** pool holds transactions ready to be
//! broadcast and mined, keyed by the kernel-multiset hash and bounded by
//! profit-ordered eviction. The **stem** pool holds transactions still in
//! the anonymity phase: indexed by kernel id for merge detection, by
//! profit for aggregation partner choice, and by deadline for the stem
//! timers.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use shroud_messages::{
    GetTransactionMsg, HaveTransactionMsg, NewTransactionMsg, TxStatusMsg, WireMessage,
};
use shroud_types::{KernelId, Transaction, TxInput, TxKey, TxOutput};

use crate::error::Violation;
use crate::node::NodeCore;
use crate::peer::PeerRef;

// ---------------------------------------------------------------------------
// Profit ordering
// ---------------------------------------------------------------------------

/// Fee-per-byte, compared exactly via cross multiplication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Profit {
    pub fee: u64,
    pub size: u64,
}

impl Profit {
    fn cmp_ratio(&self, other: &Profit) -> Ordering {
        let lhs = self.fee as u128 * other.size.max(1) as u128;
        let rhs = other.fee as u128 * self.size.max(1) as u128;
        lhs.cmp(&rhs)
    }
}

/// Profit plus a disambiguating key, totally ordered for the index sets.
#[derive(Clone, Copy, Debug)]
struct ProfitEntry<K> {
    profit: Profit,
    key: K,
}

impl<K: Ord> PartialEq for ProfitEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for ProfitEntry<K> {}

impl<K: Ord> PartialOrd for ProfitEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for ProfitEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.profit
            .cmp_ratio(&other.profit)
            .then_with(|| self.key.cmp(&other.key))
    }
}

// ---------------------------------------------------------------------------
// Fluff pool
// ---------------------------------------------------------------------------

pub struct FluffEntry {
    pub tx: Transaction,
    pub profit: Profit,
}

/// The ready-to-mine pool.
#[derive(Default)]
pub struct FluffPool {
    by_key: HashMap<TxKey, FluffEntry>,
    order: BTreeSet<ProfitEntry<TxKey>>,
}

impl FluffPool {
    pub fn contains(&self, key: &TxKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &TxKey) -> Option<&FluffEntry> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn keys(&self) -> Vec<TxKey> {
        self.by_key.keys().copied().collect()
    }

    pub fn insert(&mut self, key: TxKey, tx: Transaction, profit: Profit) {
        self.order.insert(ProfitEntry { profit, key });
        self.by_key.insert(key, FluffEntry { tx, profit });
    }

    /// Evict lowest fee-per-byte entries until at most `max` remain.
    pub fn shrink_to(&mut self, max: usize) {
        while self.by_key.len() > max {
            let worst = *self.order.iter().next().expect("order tracks by_key");
            self.order.remove(&worst);
            self.by_key.remove(&worst.key);
        }
    }

    /// Transactions best-profit first, for block construction.
    pub fn txs_by_profit(&self) -> Vec<&Transaction> {
        self.order
            .iter()
            .rev()
            .map(|entry| &self.by_key[&entry.key].tx)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Stem pool
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StemRef(pub u32);

pub struct StemElement {
    pub tx: Transaction,
    pub profit: Profit,
    pub deadline_ms: Option<u64>,
    pub aggregating: bool,
}

/// The pre-fluff pool.
#[derive(Default)]
pub struct StemPool {
    slots: Vec<Option<StemElement>>,
    free: Vec<u32>,
    by_kernel: HashMap<KernelId, StemRef>,
    /// Profit index over aggregating elements only.
    by_profit: BTreeSet<ProfitEntry<StemRef>>,
    by_time: BTreeSet<(u64, StemRef)>,
}

impl StemPool {
    pub fn get(&self, e: StemRef) -> &StemElement {
        self.slots[e.0 as usize].as_ref().expect("stale StemRef")
    }

    pub fn tx_mut(&mut self, e: StemRef) -> &mut Transaction {
        &mut self.slots[e.0 as usize].as_mut().expect("stale StemRef").tx
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_kernel(&self, id: &KernelId) -> Option<StemRef> {
        self.by_kernel.get(id).copied()
    }

    pub fn insert(&mut self, tx: Transaction, profit: Profit) -> StemRef {
        let kernel_ids = tx.kernel_ids();
        let element = StemElement {
            tx,
            profit,
            deadline_ms: None,
            aggregating: false,
        };
        let e = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(element);
                StemRef(slot)
            }
            None => {
                self.slots.push(Some(element));
                StemRef((self.slots.len() - 1) as u32)
            }
        };
        for id in kernel_ids {
            self.by_kernel.insert(id, e);
        }
        e
    }

    /// Remove an element from every index, returning its transaction.
    pub fn delete(&mut self, e: StemRef) -> Transaction {
        let element = self.slots[e.0 as usize].take().expect("stale StemRef");
        for id in element.tx.kernel_ids() {
            self.by_kernel.remove(&id);
        }
        if element.aggregating {
            self.by_profit.remove(&ProfitEntry {
                profit: element.profit,
                key: e,
            });
        }
        if let Some(deadline) = element.deadline_ms {
            self.by_time.remove(&(deadline, e));
        }
        self.free.push(e.0);
        element.tx
    }

    /// Enter the aggregation index.
    pub fn insert_aggr(&mut self, e: StemRef) {
        let (profit, already) = {
            let element = self.slots[e.0 as usize].as_mut().expect("stale StemRef");
            let already = element.aggregating;
            element.aggregating = true;
            (element.profit, already)
        };
        if !already {
            self.by_profit.insert(ProfitEntry { profit, key: e });
        }
    }

    /// Leave the aggregation index.
    pub fn delete_aggr(&mut self, e: StemRef) {
        let element = self.slots[e.0 as usize].as_mut().expect("stale StemRef");
        if element.aggregating {
            let profit = element.profit;
            element.aggregating = false;
            self.by_profit.remove(&ProfitEntry { profit, key: e });
        }
    }

    /// Replace an element's transaction after a merge, refreshing the
    /// kernel and profit indexes.
    pub fn replace_tx(&mut self, e: StemRef, tx: Transaction, profit: Profit) {
        let (old_profit, aggregating) = {
            let element = self.slots[e.0 as usize].as_ref().expect("stale StemRef");
            (element.profit, element.aggregating)
        };
        if aggregating {
            self.by_profit.remove(&ProfitEntry {
                profit: old_profit,
                key: e,
            });
            self.by_profit.insert(ProfitEntry { profit, key: e });
        }
        for id in tx.kernel_ids() {
            self.by_kernel.insert(id, e);
        }
        let element = self.slots[e.0 as usize].as_mut().expect("stale StemRef");
        element.tx = tx;
        element.profit = profit;
    }

    pub fn set_timer(&mut self, e: StemRef, deadline_ms: u64) {
        let element = self.slots[e.0 as usize].as_mut().expect("stale StemRef");
        if let Some(old) = element.deadline_ms.replace(deadline_ms) {
            self.by_time.remove(&(old, e));
        }
        self.by_time.insert((deadline_ms, e));
    }

    /// Elements whose deadline has passed, earliest first.
    pub fn expired(&mut self, now_ms: u64) -> Vec<StemRef> {
        let due: Vec<(u64, StemRef)> = self
            .by_time
            .iter()
            .take_while(|(deadline, _)| *deadline <= now_ms)
            .copied()
            .collect();
        for (deadline, e) in &due {
            self.by_time.remove(&(*deadline, *e));
            if let Some(element) = self.slots[e.0 as usize].as_mut() {
                element.deadline_ms = None;
            }
        }
        due.into_iter().map(|(_, e)| e).collect()
    }

    /// Aggregating elements ordered worst profit to best.
    pub fn aggregating_by_profit(&self) -> Vec<StemRef> {
        self.by_profit.iter().map(|entry| entry.key).collect()
    }
}

// ---------------------------------------------------------------------------
// Dandelion pipeline
// ---------------------------------------------------------------------------

impl NodeCore {
    pub(crate) fn on_new_transaction(
        &mut self,
        p: PeerRef,
        msg: NewTransactionMsg,
    ) -> Result<(), Violation> {
        if msg.fluff {
            self.on_transaction_fluff(msg.tx, Some(p), None);
        } else {
            let accepted = self.on_transaction_stem(msg.tx, Some(p));
            self.send(p, WireMessage::TxStatus(TxStatusMsg { accepted }));
        }
        Ok(())
    }

    pub(crate) fn on_have_transaction(
        &mut self,
        p: PeerRef,
        msg: HaveTransactionMsg,
    ) -> Result<(), Violation> {
        if self.fluff.contains(&msg.id) {
            return Ok(()); // already have it
        }
        if !self.wanted_tx.add(msg.id, self.now_ms) {
            return Ok(()); // already waiting for it
        }
        self.send(p, WireMessage::GetTransaction(GetTransactionMsg { id: msg.id }));
        Ok(())
    }

    pub(crate) fn on_get_transaction(
        &mut self,
        p: PeerRef,
        msg: GetTransactionMsg,
    ) -> Result<(), Violation> {
        if let Some(entry) = self.fluff.get(&msg.id) {
            let tx = entry.tx.clone();
            self.send(
                p,
                WireMessage::NewTransaction(NewTransactionMsg { tx, fluff: true }),
            );
        }
        Ok(())
    }

    /// Stem-phase entry point. Returns whether the transaction was taken.
    pub fn on_transaction_stem(&mut self, mut tx: Transaction, _from: Option<PeerRef>) -> bool {
        if tx.inputs.is_empty() || tx.kernels.is_empty() {
            return false;
        }

        let new_ids: Vec<KernelId> = tx.kernel_ids();
        let mut tested = false;
        let mut fee = 0u64;
        let mut dup: Option<StemRef> = None;

        // Find matches by kernel.
        for kid in &new_ids {
            let Some(e) = self.stem.find_kernel(kid) else {
                continue;
            };
            if dup == Some(e) {
                continue;
            }

            let elem_ids = self.stem.get(e).tx.kernel_ids();
            let elem_covers = is_kernel_subset(&new_ids, &elem_ids);
            let new_covers = is_kernel_subset(&elem_ids, &new_ids);

            if !new_covers {
                return false; // the new tx is a reduction, drop it
            }
            if elem_covers {
                dup = Some(e); // exact match
                if self.stem.get(e).aggregating {
                    return true; // already known, ignore
                }
                break;
            }

            if !tested {
                match self.processor.validate_tx(&tx) {
                    Some(ctx) => fee = ctx.fee,
                    None => return false,
                }
                tested = true;
            }
            self.stem.delete(e);
        }

        let e = match dup {
            Some(e) => e,
            None => {
                if !tested {
                    match self.processor.validate_tx(&tx) {
                        Some(ctx) => fee = ctx.fee,
                        None => return false,
                    }
                }
                self.add_dummy_inputs(&mut tx);
                let profit = Profit {
                    fee,
                    size: tx.serialized_size() as u64,
                };
                self.stem.insert(tx, profit)
            }
        };

        debug_assert!(!self.stem.get(e).aggregating);

        if self.stem.get(e).tx.outputs.len() > self.cfg.dandelion.outputs_max {
            self.on_transaction_aggregated(e);
        } else {
            self.stem.insert_aggr(e);
            self.perform_aggregation(e);
        }
        true
    }

    /// Merge profit-neighbours into `x` until it reaches the target
    /// output count or candidates run out.
    pub fn perform_aggregation(&mut self, x: StemRef) {
        debug_assert!(self.stem.get(x).aggregating);

        // Worse-profit candidates first, then better.
        let order = self.stem.aggregating_by_profit();
        let pos = order
            .iter()
            .position(|&e| e == x)
            .expect("x is aggregating");

        let mut candidates: Vec<StemRef> = Vec::new();
        candidates.extend(order[..pos].iter().rev()); // worse
        candidates.extend(order[pos + 1..].iter()); // better

        for src in candidates {
            if self.stem.get(x).tx.outputs.len() > self.cfg.dandelion.outputs_max {
                break;
            }
            self.try_merge(x, src);
        }

        if self.stem.get(x).tx.outputs.len() >= self.cfg.dandelion.outputs_min {
            self.stem.delete_aggr(x);
            self.on_transaction_aggregated(x);
        } else {
            let deadline = self.now_ms + self.cfg.dandelion.aggregation_time_ms;
            self.stem.set_timer(x, deadline);
        }
    }

    /// Merge `src` into `dst` when the result fits and validates.
    fn try_merge(&mut self, dst: StemRef, src: StemRef) -> bool {
        let dst_outputs = self.stem.get(dst).tx.outputs.len();
        let src_outputs = self.stem.get(src).tx.outputs.len();
        if dst_outputs + src_outputs > self.cfg.dandelion.outputs_max {
            return false;
        }

        let mut merged = self.stem.get(dst).tx.clone();
        merged.merge(self.stem.get(src).tx.clone());

        let Some(ctx) = self.processor.validate_tx(&merged) else {
            return false;
        };

        self.stem.delete(src);
        let profit = Profit {
            fee: ctx.fee,
            size: merged.serialized_size() as u64,
        };
        self.stem.replace_tx(dst, merged, profit);
        true
    }

    /// An entry finished aggregating: coin-flip between another stem hop
    /// and going public.
    pub fn on_transaction_aggregated(&mut self, x: StemRef) {
        // Must have at least one stem peer to continue the stem phase.
        let stem_peers: Vec<PeerRef> = self
            .peers
            .refs()
            .into_iter()
            .filter(|&p| self.peers.get(p).config.spreading_transactions)
            .collect();

        if !stem_peers.is_empty() {
            let draw = u32::from_be_bytes(
                self.nonce.next()[..4].try_into().expect("4 bytes"),
            );
            if self.cfg.dandelion.fluff_probability < draw {
                // Relay to one random stem peer.
                let k = self.nonce.next_u32_below(stem_peers.len() as u32) as usize;
                let target = stem_peers[k];
                let tx = self.stem.get(x).tx.clone();
                self.send(
                    target,
                    WireMessage::NewTransaction(NewTransactionMsg { tx, fluff: false }),
                );

                let span = self
                    .cfg
                    .dandelion
                    .timeout_max_ms
                    .saturating_sub(self.cfg.dandelion.timeout_min_ms);
                let jitter = if span > 0 {
                    self.nonce.next_u32_below(span.min(u32::MAX as u64) as u32) as u64
                } else {
                    0
                };
                let deadline = self.now_ms + self.cfg.dandelion.timeout_min_ms + jitter;
                self.stem.set_timer(x, deadline);
                return;
            }
        }

        self.fluff_from_stem(x);
    }

    /// Promote a stem element to the fluff pool.
    pub fn fluff_from_stem(&mut self, e: StemRef) {
        let fee = self.stem.get(e).profit.fee;
        let tx = self.stem.delete(e);
        self.fluff_transaction(tx, None, Some(fee));
    }

    /// Fluff-phase entry point for transactions received from the network.
    pub fn on_transaction_fluff(
        &mut self,
        tx: Transaction,
        from: Option<PeerRef>,
        stem_elem: Option<StemRef>,
    ) -> bool {
        let known_fee = stem_elem.map(|e| {
            let fee = self.stem.get(e).profit.fee;
            self.stem.delete(e);
            fee
        });
        self.fluff_transaction(tx, from, known_fee)
    }

    fn fluff_transaction(
        &mut self,
        tx: Transaction,
        from: Option<PeerRef>,
        known_fee: Option<u64>,
    ) -> bool {
        if known_fee.is_none() {
            // Delete overlapping stem entries keyed by this tx's kernels.
            for kid in tx.kernel_ids() {
                if let Some(e) = self.stem.find_kernel(&kid) {
                    self.stem.delete(e);
                }
            }
        }

        let key = tx.key();
        if self.fluff.contains(&key) {
            return true; // already have it
        }

        self.wanted_tx.delete(&key);

        let fee = match known_fee {
            Some(fee) => fee,
            None => match self.processor.validate_tx(&tx) {
                Some(ctx) => ctx.fee,
                None => {
                    tracing::info!(%key, "rejected invalid fluff transaction");
                    return false;
                }
            },
        };

        tracing::info!(
            %key,
            inputs = tx.inputs.len(),
            outputs = tx.outputs.len(),
            kernels = tx.kernels.len(),
            fee,
            "tx accepted to fluff pool"
        );

        for p in self.peers.refs() {
            if Some(p) == from {
                continue;
            }
            if !self.peers.get(p).config.spreading_transactions {
                continue;
            }
            self.send(
                p,
                WireMessage::HaveTransaction(HaveTransactionMsg { id: key }),
            );
        }

        let profit = Profit {
            fee,
            size: tx.serialized_size() as u64,
        };
        self.fluff.insert(key, tx, profit);
        let max = self.cfg.max_pool_transactions;
        self.fluff.shrink_to(max);

        self.set_miner_timer(self.cfg.timeout.mining_soft_restart_ms, false);
        true
    }

    // -- Dummy UTXOs ---------------------------------------------------------

    /// Commitment a dummy blinding scalar stands for.
    pub fn dummy_commitment(blinding: &[u8; 32]) -> [u8; 32] {
        shroud_crypto::blake2b_256_multi(&[b"shroud-dummy-utxo", blinding])
    }

    /// Pad a stem transaction's inputs with spendable dummies.
    pub fn add_dummy_inputs(&mut self, tx: &mut Transaction) {
        let tip = self.processor.cursor().height;
        let mut modified = false;
        let mut seen: Vec<[u8; 32]> = Vec::new();

        while tx.inputs.len() < self.cfg.dandelion.outputs_max {
            let picked = match self.stores.dummies.pick_lowest() {
                Ok(Some((blinding, height))) if height <= tip + 1 => (blinding, height),
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "dummy lookup failed");
                    break;
                }
            };
            let (blinding, _) = picked;
            if seen.contains(&blinding) {
                break;
            }
            seen.push(blinding);

            let commitment = Self::dummy_commitment(&blinding);
            if !self.processor.is_dummy_unspent(&commitment) {
                // Already spent, forget it.
                if let Err(e) = self.stores.dummies.delete(&blinding) {
                    tracing::warn!(error = %e, "dummy delete failed");
                    break;
                }
                continue;
            }

            tx.inputs.push(TxInput { commitment });
            for (a, b) in tx.offset.iter_mut().zip(blinding.iter()) {
                *a = a.wrapping_add(*b);
            }
            // If this tx is lost we retry the dummy after the lifetime.
            let retry = tip + 1 + self.cfg.dandelion.dummy_lifetime_lo;
            if let Err(e) = self.stores.dummies.set_height(&blinding, retry) {
                tracing::warn!(error = %e, "dummy height bump failed");
                break;
            }
            modified = true;
        }

        if modified {
            tx.sort();
        }
    }

    /// Pad an expiring stem transaction's outputs with fresh dummies.
    pub fn add_dummy_outputs(&mut self, tx: &mut Transaction) {
        if self.cfg.dandelion.dummy_lifetime_hi == 0 {
            return;
        }
        let tip = self.processor.cursor().height;
        let mut modified = false;

        while tx.outputs.len() < self.cfg.dandelion.outputs_min {
            let blinding = self.nonce.next();

            let lo = self.cfg.dandelion.dummy_lifetime_lo;
            let hi = self.cfg.dandelion.dummy_lifetime_hi;
            let mut height = tip + 1 + lo;
            if hi > lo {
                height += self.nonce.next_u32_below((hi - lo).min(u32::MAX as u64) as u32) as u64;
            }

            if let Err(e) = self.stores.dummies.insert(&blinding, height) {
                tracing::warn!(error = %e, "dummy insert failed");
                break;
            }

            tx.outputs.push(TxOutput {
                commitment: Self::dummy_commitment(&blinding),
                incubation: 0,
            });
            for (a, b) in tx.offset.iter_mut().zip(blinding.iter()) {
                *a = a.wrapping_sub(*b);
            }
            modified = true;
        }

        if modified {
            tx.sort();
        }
    }

    // -- Timers --------------------------------------------------------------

    /// Stem timer expiry: aggregating entries get dummy outputs and move
    /// on; the rest are force-fluffed.
    pub(crate) fn on_stem_timers(&mut self) {
        for e in self.stem.expired(self.now_ms) {
            if self.stem.get(e).aggregating {
                let mut tx = self.stem.get(e).tx.clone();
                self.add_dummy_outputs(&mut tx);
                *self.stem.tx_mut(e) = tx;
                self.on_transaction_aggregated(e);
            } else {
                self.fluff_from_stem(e);
            }
        }
    }
}

/// Whether every kernel id of `subset` occurs in `superset` (both may
/// carry duplicates; counts are respected).
fn is_kernel_subset(subset: &[KernelId], superset: &[KernelId]) -> bool {
    let mut counts: HashMap<KernelId, usize> = HashMap::new();
    for id in superset {
        *counts.entry(*id).or_insert(0) += 1;
    }
    for id in subset {
        match counts.get_mut(id) {
            Some(n) if *n > 0 => *n -= 1,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_types::TxKernel;

    fn tx(seed: u8, fee: u64) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                commitment: [seed; 32],
            }],
            outputs: vec![TxOutput {
                commitment: [seed.wrapping_add(100); 32],
                incubation: 0,
            }],
            kernels: vec![TxKernel {
                excess: [seed; 32],
                fee,
            }],
            offset: [0u8; 32],
        }
    }

    #[test]
    fn fluff_shrink_evicts_worst_profit() {
        let mut pool = FluffPool::default();
        for (seed, fee) in [(1u8, 10u64), (2, 50), (3, 30)] {
            let t = tx(seed, fee);
            let key = t.key();
            let profit = Profit {
                fee,
                size: t.serialized_size() as u64,
            };
            pool.insert(key, t, profit);
        }
        pool.shrink_to(2);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&tx(1, 10).key()));
        assert!(pool.contains(&tx(2, 50).key()));
    }

    #[test]
    fn fluff_dedup_by_key() {
        let mut pool = FluffPool::default();
        let t = tx(1, 10);
        let key = t.key();
        let profit = Profit { fee: 10, size: 1 };
        pool.insert(key, t.clone(), profit);
        assert!(pool.contains(&key));
        pool.insert(key, t, profit);
        pool.shrink_to(10);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stem_kernel_index_follows_elements() {
        let mut pool = StemPool::default();
        let t = tx(1, 10);
        let kid = t.kernels[0].id();
        let e = pool.insert(t, Profit { fee: 10, size: 1 });
        assert_eq!(pool.find_kernel(&kid), Some(e));
        pool.delete(e);
        assert_eq!(pool.find_kernel(&kid), None);
    }

    #[test]
    fn stem_timer_expiry_order() {
        let mut pool = StemPool::default();
        let a = pool.insert(tx(1, 10), Profit { fee: 10, size: 1 });
        let b = pool.insert(tx(2, 10), Profit { fee: 10, size: 1 });
        pool.set_timer(a, 200);
        pool.set_timer(b, 100);
        assert!(pool.expired(50).is_empty());
        assert_eq!(pool.expired(150), vec![b]);
        assert_eq!(pool.expired(250), vec![a]);
    }

    #[test]
    fn aggregating_profit_order_is_worst_first() {
        let mut pool = StemPool::default();
        let low = pool.insert(tx(1, 1), Profit { fee: 1, size: 100 });
        let high = pool.insert(tx(2, 99), Profit { fee: 99, size: 100 });
        pool.insert_aggr(low);
        pool.insert_aggr(high);
        assert_eq!(pool.aggregating_by_profit(), vec![low, high]);
    }

    #[test]
    fn kernel_subset_respects_multiplicity() {
        let a = KernelId::new([1u8; 32]);
        let b = KernelId::new([2u8; 32]);
        assert!(is_kernel_subset(&[a], &[a, b]));
        assert!(!is_kernel_subset(&[a, a], &[a, b]));
        assert!(is_kernel_subset(&[], &[a]));
        assert!(!is_kernel_subset(&[b], &[a]));
    }
}
