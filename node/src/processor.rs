//! The chain processor interface and a reference implementation.
//!
//! Consensus rules, body formats, and proof construction are external
//! collaborators: the orchestration core only depends on the
//! [`ChainProcessor`] trait. [`HeaderChain`] is the deliberately small
//! reference implementation backing the daemon and the integration
//! tests: an in-memory header index ordered by chainwork, with bodies
//! validated through the verifier pool. It carries no script or
//! range-proof semantics.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use shroud_messages::{ProofChainWorkMsg, ProofStep, UtxoProof};
use shroud_types::{
    BlockHash, ChainWork, Difficulty, KernelId, PeerId, StateDescriptor, StateId, Timestamp,
    Transaction,
};

use crate::config::ControlState;
use crate::verifier::{Summary, VerifierPool, VerifyJob};
use crate::NodeError;

/// Outcome of feeding a header or block to the processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// New and valid; the chain view advanced or may advance.
    Accepted,
    /// Valid but already known (or not currently attachable).
    Rejected,
    /// Provably wrong; the sender is at fault.
    Invalid,
    /// Refers to state the node can no longer reach (pruned past).
    Unreachable,
}

/// Fee/size context of a validated transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxContext {
    pub fee: u64,
    pub size: u64,
}

/// A block constructed for mining.
#[derive(Clone, Debug)]
pub struct BlockPlan {
    pub hdr: StateDescriptor,
    pub body: Vec<u8>,
    pub fees: u64,
}

/// The chain-state collaborator of the orchestration core.
pub trait ChainProcessor: Send {
    /// Current fully-validated tip; zero when the chain is empty.
    fn cursor(&self) -> StateId;

    /// Descriptor of the cursor, `None` when the chain is empty.
    fn cursor_descriptor(&self) -> Option<StateDescriptor>;

    /// Total chainwork at the cursor.
    fn chainwork(&self) -> ChainWork;

    /// Whether a remote tip is worth pursuing.
    fn is_remote_tip_needed(&self, remote: &StateDescriptor) -> bool;

    fn on_header(&mut self, hdr: &StateDescriptor, from: &PeerId) -> DataStatus;

    fn on_block(&mut self, id: &StateId, body: &[u8], from: &PeerId) -> DataStatus;

    /// Walk the gaps between the cursor and the best known header,
    /// reporting each missing object as `(id, is_block, preferred_peer)`.
    fn enum_congestions(&mut self, want: &mut dyn FnMut(StateId, bool, Option<PeerId>));

    fn get_header(&self, id: &StateId) -> Option<StateDescriptor>;

    /// Up to `count` headers walking down from `top`, top first.
    fn get_header_pack(&self, top: &StateId, count: u32) -> Vec<StateDescriptor>;

    fn get_block(&self, id: &StateId) -> Option<Vec<u8>>;

    /// Structural + context validation; `None` = invalid.
    fn validate_tx(&self, tx: &Transaction) -> Option<TxContext>;

    /// Whether a dummy output's commitment is still unspent.
    fn is_dummy_unspent(&self, commitment: &[u8; 32]) -> bool;

    /// Assemble the next block from pool transactions (plus an optional
    /// opaque treasury slice).
    fn generate_block(
        &mut self,
        txs: &[&Transaction],
        treasury: Option<&[u8]>,
        timestamp: Timestamp,
    ) -> Option<BlockPlan>;

    /// Import a downloaded macroblock from its shard directory.
    fn import_macroblock(&mut self, dir: &Path, target: &StateId) -> Result<(), NodeError>;

    /// Id of the macroblock this node can serve, if any.
    fn macroblock_id(&self) -> Option<StateId>;

    fn build_chainwork_proof(&self, lower_bound: &ChainWork) -> ProofChainWorkMsg;

    /// Check a chainwork proof against the tip it came with.
    fn verify_chainwork_proof(&self, proof: &ProofChainWorkMsg, tip: &StateDescriptor) -> bool;

    fn proof_state(&self, height: u64) -> Vec<ProofStep>;

    fn proof_kernel(&self, id: &KernelId) -> Vec<ProofStep>;

    fn proof_utxo(&self, commitment: &[u8; 32], maturity_min: u64) -> Vec<UtxoProof>;
}

// ---------------------------------------------------------------------------
// Reference implementation
// ---------------------------------------------------------------------------

/// Bound on requests produced by one congestion walk.
const MAX_CONGESTION_REQUESTS: usize = 64;

/// Shard file name inside a macroblock directory.
pub fn shard_file_name(i_data: u8) -> String {
    format!("shard_{i_data}")
}

/// In-memory reference chain: headers by hash, bodies by hash, a cursor
/// that advances along the best-work path as bodies arrive.
pub struct HeaderChain {
    headers: HashMap<BlockHash, StateDescriptor>,
    bodies: HashMap<BlockHash, Vec<u8>>,
    /// Which peer first delivered each header (preferred for follow-ups).
    sources: HashMap<BlockHash, PeerId>,
    /// Commitments consumed by accepted blocks.
    spent: HashSet<[u8; 32]>,
    best: Option<StateId>,
    cursor: Option<StateId>,
    difficulty: Difficulty,
    control: Option<ControlState>,
    verifier: Arc<VerifierPool>,
    macroblock: Option<StateId>,
}

impl HeaderChain {
    pub fn new(difficulty: Difficulty, control: Option<ControlState>, verifier: Arc<VerifierPool>) -> Self {
        Self {
            headers: HashMap::new(),
            bodies: HashMap::new(),
            sources: HashMap::new(),
            spent: HashSet::new(),
            best: None,
            cursor: None,
            difficulty,
            control,
            verifier,
            macroblock: None,
        }
    }

    fn approve_state(&self, id: &StateId) -> bool {
        match &self.control {
            Some(ctl) if ctl.height == id.height => ctl.hash == id.hash.0,
            _ => true,
        }
    }

    fn header_work(&self, hdr: &StateDescriptor) -> ChainWork {
        match self.headers.get(&hdr.prev) {
            Some(prev) => prev.chainwork.plus(hdr.difficulty),
            None => hdr.chainwork,
        }
    }

    /// Advance the cursor while the next best-path block body is present.
    fn advance_cursor(&mut self) {
        loop {
            let next = self.next_on_best_path();
            match next {
                Some(id) if self.bodies.contains_key(&id.hash) => {
                    self.cursor = Some(id);
                }
                _ => break,
            }
        }
    }

    /// The best-path header directly above the cursor, if known.
    fn next_on_best_path(&self) -> Option<StateId> {
        let best = self.best?;
        let cursor_height = self.cursor.map_or(0, |c| c.height);
        if best.height <= cursor_height {
            return None;
        }
        // Walk down from best to cursor_height + 1.
        let mut id = best;
        while id.height > cursor_height + 1 {
            let hdr = self.headers.get(&id.hash)?;
            id = StateId::new(hdr.height - 1, hdr.prev);
        }
        // The walked-to header must attach to the cursor (or genesis).
        let hdr = self.headers.get(&id.hash)?;
        let attaches = match self.cursor {
            Some(c) => hdr.prev == c.hash,
            None => hdr.prev.is_zero(),
        };
        attaches.then_some(id)
    }

    fn parse_body(body: &[u8]) -> Option<Vec<Transaction>> {
        bincode::deserialize(body).ok()
    }
}

/// Partitioned structural validation of one block's transactions.
struct TxBatchJob {
    txs: Vec<Transaction>,
}

impl VerifyJob for TxBatchJob {
    fn validate(&self, index: u32, total: u32) -> Option<Summary> {
        let mut summary = Summary::default();
        for tx in self
            .txs
            .iter()
            .skip(index as usize)
            .step_by(total.max(1) as usize)
        {
            if tx.kernels.is_empty() {
                return None;
            }
            summary.fees += tx.fee();
            summary.kernels += tx.kernels.len() as u64;
        }
        Some(summary)
    }
}

impl ChainProcessor for HeaderChain {
    fn cursor(&self) -> StateId {
        self.cursor.unwrap_or(StateId::ZERO)
    }

    fn cursor_descriptor(&self) -> Option<StateDescriptor> {
        self.cursor
            .and_then(|c| self.headers.get(&c.hash).cloned())
    }

    fn chainwork(&self) -> ChainWork {
        self.cursor
            .and_then(|c| self.headers.get(&c.hash))
            .map_or(ChainWork::ZERO, |hdr| hdr.chainwork)
    }

    fn is_remote_tip_needed(&self, remote: &StateDescriptor) -> bool {
        remote.chainwork > self.chainwork()
    }

    fn on_header(&mut self, hdr: &StateDescriptor, from: &PeerId) -> DataStatus {
        let id = hdr.id();

        if !shroud_work::validate(hdr) {
            return DataStatus::Invalid;
        }
        if hdr.difficulty != self.difficulty || !self.approve_state(&id) {
            return DataStatus::Invalid;
        }
        if self.headers.contains_key(&id.hash) {
            return DataStatus::Rejected;
        }
        if self.headers.contains_key(&hdr.prev) && self.header_work(hdr) != hdr.chainwork {
            return DataStatus::Invalid;
        }

        self.headers.insert(id.hash, hdr.clone());
        if !from.is_zero() {
            self.sources.insert(id.hash, *from);
        }

        let best_work = self
            .best
            .and_then(|b| self.headers.get(&b.hash))
            .map_or(ChainWork::ZERO, |h| h.chainwork);
        if hdr.chainwork > best_work {
            self.best = Some(id);
        }
        self.advance_cursor();
        DataStatus::Accepted
    }

    fn on_block(&mut self, id: &StateId, body: &[u8], _from: &PeerId) -> DataStatus {
        if !self.headers.contains_key(&id.hash) {
            return DataStatus::Rejected;
        }
        if self.bodies.contains_key(&id.hash) {
            return DataStatus::Rejected;
        }

        let Some(txs) = Self::parse_body(body) else {
            return DataStatus::Invalid;
        };
        let job = Arc::new(TxBatchJob { txs: txs.clone() });
        if self.verifier.verify(job).is_none() {
            return DataStatus::Invalid;
        }

        for tx in &txs {
            for input in &tx.inputs {
                self.spent.insert(input.commitment);
            }
        }
        self.bodies.insert(id.hash, body.to_vec());
        self.advance_cursor();
        DataStatus::Accepted
    }

    fn enum_congestions(&mut self, want: &mut dyn FnMut(StateId, bool, Option<PeerId>)) {
        let Some(best) = self.best else {
            return;
        };
        let cursor_height = self.cursor.map_or(0, |c| c.height);
        if best.height <= cursor_height && self.cursor.is_some() {
            return;
        }

        // Walk down from the best header collecting the path above the
        // cursor; stop where the headers run out.
        let mut path = Vec::new();
        let mut id = best;
        loop {
            match self.headers.get(&id.hash) {
                Some(hdr) => {
                    path.push(id);
                    if hdr.height <= cursor_height + 1 || hdr.prev.is_zero() {
                        break;
                    }
                    id = StateId::new(hdr.height - 1, hdr.prev);
                }
                None => {
                    // Missing header: ask for it, preferring whoever gave
                    // us the child.
                    let preferred = path.last().and_then(|c| self.sources.get(&c.hash)).copied();
                    want(id, false, preferred);
                    break;
                }
            }
        }

        // Bodies, lowest first.
        for id in path.iter().rev().take(MAX_CONGESTION_REQUESTS) {
            if !self.bodies.contains_key(&id.hash) {
                let preferred = self.sources.get(&id.hash).copied();
                want(*id, true, preferred);
            }
        }
    }

    fn get_header(&self, id: &StateId) -> Option<StateDescriptor> {
        self.headers
            .get(&id.hash)
            .filter(|hdr| hdr.height == id.height)
            .cloned()
    }

    fn get_header_pack(&self, top: &StateId, count: u32) -> Vec<StateDescriptor> {
        let mut out = Vec::new();
        let mut id = *top;
        for _ in 0..count {
            match self.get_header(&id) {
                Some(hdr) => {
                    let prev = hdr.prev;
                    let height = hdr.height;
                    out.push(hdr);
                    if height == 0 || prev.is_zero() {
                        break;
                    }
                    id = StateId::new(height - 1, prev);
                }
                None => break,
            }
        }
        out
    }

    fn get_block(&self, id: &StateId) -> Option<Vec<u8>> {
        self.headers
            .get(&id.hash)
            .filter(|hdr| hdr.height == id.height)?;
        self.bodies.get(&id.hash).cloned()
    }

    fn validate_tx(&self, tx: &Transaction) -> Option<TxContext> {
        if tx.kernels.is_empty() {
            return None;
        }
        Some(TxContext {
            fee: tx.fee(),
            size: tx.serialized_size() as u64,
        })
    }

    fn is_dummy_unspent(&self, commitment: &[u8; 32]) -> bool {
        !self.spent.contains(commitment)
    }

    fn generate_block(
        &mut self,
        txs: &[&Transaction],
        treasury: Option<&[u8]>,
        timestamp: Timestamp,
    ) -> Option<BlockPlan> {
        let mut body_txs: Vec<Transaction> = Vec::new();
        if let Some(bytes) = treasury {
            body_txs.extend(Self::parse_body(bytes)?);
        }
        body_txs.extend(txs.iter().map(|tx| (*tx).clone()));

        let fees: u64 = body_txs.iter().map(|tx| tx.fee()).sum();
        let body = bincode::serialize(&body_txs).ok()?;

        let (height, prev, prev_work) = match self.cursor_descriptor() {
            Some(hdr) => (hdr.height + 1, hdr.id().hash, hdr.chainwork),
            None => (1, BlockHash::ZERO, ChainWork::ZERO),
        };

        let hdr = StateDescriptor {
            height,
            prev,
            definition: BlockHash::new(shroud_crypto::blake2b_256(&body)),
            timestamp,
            difficulty: self.difficulty,
            chainwork: prev_work.plus(self.difficulty),
            nonce: 0,
        };

        Some(BlockPlan { hdr, body, fees })
    }

    fn import_macroblock(&mut self, dir: &Path, target: &StateId) -> Result<(), NodeError> {
        let hdr_bytes = std::fs::read(dir.join(shard_file_name(0)))?;
        let headers: Vec<StateDescriptor> = bincode::deserialize(&hdr_bytes)
            .map_err(|e| NodeError::MacroblockImport(format!("bad header shard: {e}")))?;

        for i_data in 1..shroud_messages::MACRO_SHARD_COUNT {
            let path = dir.join(shard_file_name(i_data));
            if !path.exists() {
                return Err(NodeError::MacroblockImport(format!(
                    "missing shard {i_data}"
                )));
            }
            let bytes = std::fs::read(path)?;
            let bodies: Vec<(u64, Vec<u8>)> = bincode::deserialize(&bytes)
                .map_err(|e| NodeError::MacroblockImport(format!("bad body shard: {e}")))?;
            for (height, body) in bodies {
                let hdr = headers
                    .iter()
                    .find(|h| h.height == height)
                    .ok_or_else(|| {
                        NodeError::MacroblockImport(format!("body without header at {height}"))
                    })?;
                self.bodies.insert(hdr.id().hash, body);
            }
        }

        let top = headers
            .last()
            .ok_or_else(|| NodeError::MacroblockImport("empty macroblock".into()))?;
        if top.id() != *target {
            return Err(NodeError::MacroblockImport("target mismatch".into()));
        }

        for hdr in &headers {
            self.headers.insert(hdr.id().hash, hdr.clone());
        }
        self.best = Some(*target);
        self.cursor = Some(*target);
        self.macroblock = Some(*target);
        Ok(())
    }

    fn macroblock_id(&self) -> Option<StateId> {
        self.macroblock
    }

    fn build_chainwork_proof(&self, _lower_bound: &ChainWork) -> ProofChainWorkMsg {
        ProofChainWorkMsg {
            chainwork: self.chainwork(),
            proof: self
                .cursor
                .map(|c| {
                    vec![ProofStep {
                        on_right: false,
                        hash: c.hash,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    fn verify_chainwork_proof(&self, proof: &ProofChainWorkMsg, tip: &StateDescriptor) -> bool {
        proof.chainwork == tip.chainwork
    }

    fn proof_state(&self, height: u64) -> Vec<ProofStep> {
        match self.cursor {
            Some(c) if height < c.height => vec![ProofStep {
                on_right: false,
                hash: c.hash,
            }],
            _ => Vec::new(),
        }
    }

    fn proof_kernel(&self, _id: &KernelId) -> Vec<ProofStep> {
        self.cursor
            .map(|c| {
                vec![ProofStep {
                    on_right: true,
                    hash: c.hash,
                }]
            })
            .unwrap_or_default()
    }

    fn proof_utxo(&self, commitment: &[u8; 32], _maturity_min: u64) -> Vec<UtxoProof> {
        if self.spent.contains(commitment) {
            return Vec::new();
        }
        self.cursor
            .map(|c| {
                vec![UtxoProof {
                    count: 1,
                    maturity: c.height,
                    proof: vec![ProofStep {
                        on_right: false,
                        hash: c.hash,
                    }],
                }]
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_types::{TxInput, TxKernel, TxOutput};

    fn chain() -> HeaderChain {
        HeaderChain::new(Difficulty(0), None, Arc::new(VerifierPool::new(0)))
    }

    fn sample_tx(seed: u8) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                commitment: [seed; 32],
            }],
            outputs: vec![TxOutput {
                commitment: [seed.wrapping_add(1); 32],
                incubation: 0,
            }],
            kernels: vec![TxKernel {
                excess: [seed; 32],
                fee: 7,
            }],
            offset: [0u8; 32],
        }
    }

    fn mine_next(chain: &mut HeaderChain, txs: &[&Transaction]) -> (StateDescriptor, Vec<u8>) {
        let plan = chain
            .generate_block(txs, None, Timestamp::new(1_700_000_000))
            .expect("plan");
        let mut hdr = plan.hdr;
        shroud_work::solve(&mut hdr, 0, |_| false).expect("difficulty 0");
        (hdr, plan.body)
    }

    #[test]
    fn header_then_body_advances_cursor() {
        let mut c = chain();
        let (hdr, body) = mine_next(&mut c, &[]);
        let id = hdr.id();

        assert_eq!(c.on_header(&hdr, &PeerId::ZERO), DataStatus::Accepted);
        assert_eq!(c.cursor(), StateId::ZERO);

        assert_eq!(c.on_block(&id, &body, &PeerId::ZERO), DataStatus::Accepted);
        assert_eq!(c.cursor(), id);
    }

    #[test]
    fn duplicate_header_rejected() {
        let mut c = chain();
        let (hdr, _) = mine_next(&mut c, &[]);
        assert_eq!(c.on_header(&hdr, &PeerId::ZERO), DataStatus::Accepted);
        assert_eq!(c.on_header(&hdr, &PeerId::ZERO), DataStatus::Rejected);
    }

    #[test]
    fn congestions_request_missing_bodies_lowest_first() {
        let mut c = chain();
        let (hdr1, body1) = mine_next(&mut c, &[]);
        c.on_header(&hdr1, &PeerId::ZERO);
        c.on_block(&hdr1.id(), &body1, &PeerId::ZERO);
        let (hdr2, _body2) = mine_next(&mut c, &[]);

        // Header 2 arrives from a peer but its body never does.
        let src = PeerId::new([9u8; 32]);
        c.on_header(&hdr2, &src);

        let mut wants = Vec::new();
        c.enum_congestions(&mut |id, is_block, preferred| wants.push((id, is_block, preferred)));
        assert_eq!(wants, vec![(hdr2.id(), true, Some(src))]);
    }

    #[test]
    fn header_pack_walks_down() {
        let mut c = chain();
        for _ in 0..3 {
            let (hdr, body) = mine_next(&mut c, &[]);
            c.on_header(&hdr, &PeerId::ZERO);
            c.on_block(&hdr.id(), &body, &PeerId::ZERO);
        }
        let top = c.cursor();
        let pack = c.get_header_pack(&top, 10);
        assert_eq!(pack.len(), 3);
        assert_eq!(pack[0].id(), top);
        assert_eq!(pack[0].prev, pack[1].id().hash);
    }

    #[test]
    fn block_with_empty_kernels_is_invalid() {
        let mut c = chain();
        let (hdr, _) = mine_next(&mut c, &[]);
        c.on_header(&hdr, &PeerId::ZERO);

        let bad_tx = Transaction {
            inputs: vec![],
            outputs: vec![],
            kernels: vec![],
            offset: [0u8; 32],
        };
        let body = bincode::serialize(&vec![bad_tx]).unwrap();
        assert_eq!(
            c.on_block(&hdr.id(), &body, &PeerId::ZERO),
            DataStatus::Invalid
        );
    }

    #[test]
    fn generate_block_collects_fees() {
        let mut c = chain();
        let tx1 = sample_tx(1);
        let tx2 = sample_tx(2);
        let plan = c
            .generate_block(&[&tx1, &tx2], None, Timestamp::new(1))
            .unwrap();
        assert_eq!(plan.fees, 14);
        assert_eq!(plan.hdr.height, 1);
    }

    #[test]
    fn spent_commitments_tracked() {
        let mut c = chain();
        let tx = sample_tx(5);
        let commitment = tx.inputs[0].commitment;
        assert!(c.is_dummy_unspent(&commitment));

        let (hdr, body) = mine_next(&mut c, &[&tx]);
        c.on_header(&hdr, &PeerId::ZERO);
        c.on_block(&hdr.id(), &body, &PeerId::ZERO);
        assert!(!c.is_dummy_unspent(&commitment));
    }

    #[test]
    fn control_state_rejects_mismatched_hash() {
        let mut probe = chain();
        let (hdr, _) = mine_next(&mut probe, &[]);

        let control = ControlState {
            height: hdr.height,
            hash: [0xEE; 32], // not the real hash
        };
        let mut c = HeaderChain::new(Difficulty(0), Some(control), Arc::new(VerifierPool::new(0)));
        assert_eq!(c.on_header(&hdr, &PeerId::ZERO), DataStatus::Invalid);
    }
}
