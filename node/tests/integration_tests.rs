//! End-to-end scenarios driven against the synchronous node core with
//! in-memory stores and the reference chain processor. No sockets: the
//! tests play the remote side of the wire protocol and inspect the
//! effect outbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use shroud_messages::{
    AuthenticationMsg, BbsMsgBody, ConfigMsg, HdrPackMsg, IdType, MacroblockGetMsg, MacroblockMsg,
    NewTipMsg, PeerInfoSelfMsg, ProofChainWorkMsg, WireMessage,
};
use shroud_node::{
    Effect, HeaderChain, MinedSolution, NodeConfig, NodeCore, PeerRef, Stores, VerifierPool,
};
use shroud_store::{
    BbsRecord, BbsStore, DummyStore, MinedEntry, MinedStore, ParamStore, PeerRecord, PeerStore,
    StoreError,
};
use shroud_types::{
    BlockHash, ChainWork, Difficulty, MsgKey, PeerId, StateDescriptor, StateId, Timestamp,
    Transaction, TxInput, TxKernel, TxOutput,
};

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MemParams(Arc<Mutex<(Option<[u8; 32]>, Option<StateId>)>>);

impl ParamStore for MemParams {
    fn put_my_id(&self, secret: &[u8; 32]) -> Result<(), StoreError> {
        self.0.lock().unwrap().0 = Some(*secret);
        Ok(())
    }
    fn get_my_id(&self) -> Result<Option<[u8; 32]>, StoreError> {
        Ok(self.0.lock().unwrap().0)
    }
    fn put_sync_target(&self, target: &StateId) -> Result<(), StoreError> {
        self.0.lock().unwrap().1 = Some(*target);
        Ok(())
    }
    fn get_sync_target(&self) -> Result<Option<StateId>, StoreError> {
        Ok(self.0.lock().unwrap().1)
    }
    fn clear_sync_target(&self) -> Result<(), StoreError> {
        self.0.lock().unwrap().1 = None;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemPeers(Arc<Mutex<Vec<PeerRecord>>>);

impl PeerStore for MemPeers {
    fn replace_all(&self, records: &[PeerRecord]) -> Result<(), StoreError> {
        *self.0.lock().unwrap() = records.to_vec();
        Ok(())
    }
    fn load_all(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.0.lock().unwrap().clone())
    }
}

#[derive(Clone, Default)]
struct MemBbs(Arc<Mutex<HashMap<MsgKey, BbsRecord>>>);

impl BbsStore for MemBbs {
    fn insert(&self, record: &BbsRecord) -> Result<bool, StoreError> {
        let mut map = self.0.lock().unwrap();
        if map.contains_key(&record.key) {
            return Ok(false);
        }
        map.insert(record.key, record.clone());
        Ok(true)
    }
    fn contains(&self, key: &MsgKey) -> Result<bool, StoreError> {
        Ok(self.0.lock().unwrap().contains_key(key))
    }
    fn get(&self, key: &MsgKey) -> Result<Option<BbsRecord>, StoreError> {
        Ok(self.0.lock().unwrap().get(key).cloned())
    }
    fn enum_channel(&self, channel: u32, time_from: u64) -> Result<Vec<BbsRecord>, StoreError> {
        let mut out: Vec<BbsRecord> = self
            .0
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.channel == channel && r.time_posted >= time_from)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.time_posted);
        Ok(out)
    }
    fn enum_keys(&self) -> Result<Vec<MsgKey>, StoreError> {
        Ok(self.0.lock().unwrap().keys().copied().collect())
    }
    fn channel_populations(&self) -> Result<Vec<(u32, u32)>, StoreError> {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for record in self.0.lock().unwrap().values() {
            *counts.entry(record.channel).or_insert(0) += 1;
        }
        let mut out: Vec<(u32, u32)> = counts.into_iter().collect();
        out.sort();
        Ok(out)
    }
    fn delete_older_than(&self, cutoff: u64) -> Result<usize, StoreError> {
        let mut map = self.0.lock().unwrap();
        let before = map.len();
        map.retain(|_, r| r.time_posted >= cutoff);
        Ok(before - map.len())
    }
}

#[derive(Clone, Default)]
struct MemDummies(Arc<Mutex<HashMap<[u8; 32], u64>>>);

impl DummyStore for MemDummies {
    fn insert(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError> {
        self.0.lock().unwrap().insert(*blinding, height);
        Ok(())
    }
    fn pick_lowest(&self) -> Result<Option<([u8; 32], u64)>, StoreError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .min_by_key(|(_, h)| **h)
            .map(|(k, h)| (*k, *h)))
    }
    fn set_height(&self, blinding: &[u8; 32], height: u64) -> Result<(), StoreError> {
        self.insert(blinding, height)
    }
    fn delete(&self, blinding: &[u8; 32]) -> Result<(), StoreError> {
        self.0.lock().unwrap().remove(blinding);
        Ok(())
    }
    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.0.lock().unwrap().len())
    }
}

#[derive(Clone, Default)]
struct MemMined(Arc<Mutex<Vec<MinedEntry>>>);

impl MinedStore for MemMined {
    fn insert(&self, id: &StateId, fees: u64) -> Result<(), StoreError> {
        self.0.lock().unwrap().push(MinedEntry {
            id: *id,
            fees,
            active: true,
        });
        Ok(())
    }
    fn enum_from(&self, height_min: u64, limit: usize) -> Result<Vec<MinedEntry>, StoreError> {
        let mut out: Vec<MinedEntry> = self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.id.height >= height_min)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.id.height);
        out.truncate(limit);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MemStoreSet {
    params: MemParams,
    peers: MemPeers,
    bbs: MemBbs,
    dummies: MemDummies,
    mined: MemMined,
}

impl MemStoreSet {
    fn stores(&self) -> Stores {
        Stores {
            params: Box::new(self.params.clone()),
            peers: Box::new(self.peers.clone()),
            bbs: Box::new(self.bbs.clone()),
            dummies: Box::new(self.dummies.clone()),
            mined: Box::new(self.mined.clone()),
        }
    }
}

fn base_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.pow_difficulty = 0;
    cfg.sync.src_peers = 0; // sync off unless a test turns it on
    cfg.mining_threads = 0;
    cfg.listen = Some("127.0.0.1:7770".parse().unwrap());
    cfg
}

fn make_node(cfg: NodeConfig, stores: &MemStoreSet) -> NodeCore {
    let verifier = Arc::new(VerifierPool::new(0));
    let processor = HeaderChain::new(Difficulty(cfg.pow_difficulty), None, verifier);
    // These cores mine with zero threads, so the solution channel is
    // never used; the receiver can be dropped.
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<MinedSolution>();
    NodeCore::new(cfg, Box::new(processor), stores.stores(), tx, 1_000).expect("core")
}

fn remote_keys(seed: u8) -> (PeerId, shroud_types::PrivateKey) {
    let kp = shroud_crypto::keypair_from_seed(&[seed; 32]);
    (PeerId::new(kp.public.0), kp.private)
}

/// Messages the core queued for `p` since the last drain.
fn sent_to(core: &mut NodeCore, p: PeerRef) -> Vec<WireMessage> {
    core.take_effects()
        .into_iter()
        .filter_map(|effect| match effect {
            Effect::Send(target, msg) if target == p => Some(msg),
            _ => None,
        })
        .collect()
}

fn challenge_for(msgs: &[WireMessage]) -> [u8; 32] {
    msgs.iter()
        .find_map(|msg| match msg {
            WireMessage::Challenge(c) => Some(c.nonce),
            _ => None,
        })
        .expect("core sends a challenge on connect")
}

/// Accept an inbound session and complete authentication for `seed`.
fn connect_authenticated(core: &mut NodeCore, seed: u8, port: u16) -> (PeerRef, PeerId) {
    let (id, key) = remote_keys(seed);
    let addr = format!("127.0.0.{seed}:{port}").parse().unwrap();
    let p = core.on_accepted(addr);
    core.on_connected_secure(p);
    let handshake = sent_to(core, p);
    let challenge = challenge_for(&handshake);

    core.on_message(p, WireMessage::PeerInfoSelf(PeerInfoSelfMsg { port }));
    core.on_message(
        p,
        WireMessage::Authentication(AuthenticationMsg {
            id,
            id_type: IdType::Node,
            signature: shroud_network::prove_identity(&challenge, &key),
        }),
    );
    core.on_message(
        p,
        WireMessage::Config(ConfigMsg {
            cfg_checksum: core.cfg.rules_checksum(),
            spreading_transactions: true,
            bbs: true,
            send_peers: false,
        }),
    );
    core.take_effects();
    (p, id)
}

/// A valid difficulty-0 header chain from genesis.
fn build_chain(n: u64) -> Vec<StateDescriptor> {
    let mut out = Vec::new();
    let mut prev = BlockHash::ZERO;
    let mut work = ChainWork::ZERO;
    for height in 1..=n {
        work = work.plus(Difficulty(0));
        let descriptor = StateDescriptor {
            height,
            prev,
            definition: BlockHash::new([7u8; 32]),
            timestamp: Timestamp::new(1_700_000_000 + height),
            difficulty: Difficulty(0),
            chainwork: work,
            nonce: 0,
        };
        prev = descriptor.id().hash;
        out.push(descriptor);
    }
    out
}

fn sample_tx(seed: u8, fee: u64) -> Transaction {
    Transaction {
        inputs: vec![TxInput {
            commitment: [seed; 32],
        }],
        outputs: vec![TxOutput {
            commitment: [seed.wrapping_add(50); 32],
            incubation: 0,
        }],
        kernels: vec![TxKernel {
            excess: [seed; 32],
            fee,
        }],
        offset: [0u8; 32],
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: duplicate connection tiebreak
// ---------------------------------------------------------------------------

/// Find a remote seed whose id compares as requested against ours.
fn seed_with_order(core: &NodeCore, want_remote_larger: bool) -> u8 {
    for seed in 1..=200u8 {
        let (id, _) = remote_keys(seed);
        if (id > core.my_public_id) == want_remote_larger {
            return seed;
        }
    }
    panic!("no suitable seed");
}

#[test]
fn duplicate_connection_local_id_larger_kills_old_session() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    // Remote id smaller than ours: our side keeps the NEW session.
    let seed = seed_with_order(&core, false);
    let (p1, id) = connect_authenticated(&mut core, seed, 7001);
    let (p2, id2) = connect_authenticated(&mut core, seed, 7001);
    assert_eq!(id, id2);

    assert!(!core.peers.contains(p1), "old session must be closed");
    assert!(core.peers.contains(p2), "new session must survive");

    let info = core.peer_man.find(&id).expect("one table entry");
    assert_eq!(core.peer_man.get(info).live, Some(p2.0));
    assert!(!core.peer_man.is_banned(info), "duplicates are not banned");
}

#[test]
fn duplicate_connection_local_id_smaller_kills_new_session() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    // Remote id larger than ours: the NEW session yields.
    let seed = seed_with_order(&core, true);
    let (p1, id) = connect_authenticated(&mut core, seed, 7001);
    let (p2, _) = connect_authenticated(&mut core, seed, 7001);

    assert!(core.peers.contains(p1), "old session must survive");
    assert!(!core.peers.contains(p2), "new session must be closed");

    let info = core.peer_man.find(&id).expect("one table entry");
    assert_eq!(core.peer_man.get(info).live, Some(p1.0));
    assert!(!core.peer_man.is_banned(info));
}

// ---------------------------------------------------------------------------
// Scenario 2: header pack fan-out
// ---------------------------------------------------------------------------

#[test]
fn header_pack_requested_and_rewarded() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(10);
    let tip = chain.last().unwrap().clone();

    let (p, id) = connect_authenticated(&mut core, 1, 7002);
    let info = core.peer_man.find(&id).unwrap();
    let rating_before = core.peer_man.get(info).raw_rating;

    core.on_message(p, WireMessage::NewTip(NewTipMsg { descriptor: tip }));
    let msgs = sent_to(&mut core, p);

    let packs: Vec<_> = msgs
        .iter()
        .filter_map(|msg| match msg {
            WireMessage::GetHdrPack(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(packs.len(), 1, "exactly one pack request");
    assert_eq!(packs[0].count, 9, "the whole gap below the tip");
    assert_eq!(packs[0].top.height, 9);
    assert_eq!(core.sched.pack_hdr_count, 1);

    // Tip acceptance already rewarded one header.
    let reward_header = shroud_network::Rating::REWARD_HEADER;
    assert_eq!(
        core.peer_man.get(info).raw_rating,
        rating_before + reward_header
    );

    // Answer with the 9 chained headers, top first.
    let mut headers: Vec<StateDescriptor> = chain[..9].to_vec();
    headers.reverse();
    core.on_message(p, WireMessage::HdrPack(HdrPackMsg { headers }));
    core.take_effects();

    assert_eq!(core.sched.pack_hdr_count, 0, "pack slot released");
    assert_eq!(
        core.peer_man.get(info).raw_rating,
        rating_before + reward_header * 10,
        "tip + nine pack headers rewarded"
    );
}

// ---------------------------------------------------------------------------
// Scenario 3: task release on peer death
// ---------------------------------------------------------------------------

#[test]
fn task_released_on_peer_death_reassigns_to_eligible_peer() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(3);
    let tip = chain.last().unwrap().clone();

    let (p, _) = connect_authenticated(&mut core, 1, 7003);
    let (q, _) = connect_authenticated(&mut core, 2, 7004);

    // Both peers announce the same tip; P (first in arena order) gets
    // the resulting tasks.
    core.on_message(
        p,
        WireMessage::NewTip(NewTipMsg {
            descriptor: tip.clone(),
        }),
    );
    core.on_message(q, WireMessage::NewTip(NewTipMsg { descriptor: tip }));
    core.take_effects();

    let p_tasks = core.peers.get(p).tasks.len();
    assert!(p_tasks > 0, "first peer holds the requests");

    core.delete_self(p, false, None);

    // Every released task must have moved to Q or the unassigned queue;
    // nothing may still point at P.
    for t in core.sched.task_ids() {
        let task = core.sched.get(t);
        match task.owner {
            Some(owner) => assert_eq!(owner, q),
            None => assert!(core.sched.unassigned.contains(&t)),
        }
    }
    assert!(!core.peers.contains(p));
    assert!(core.peers.get(q).tasks.len() > 0, "eligible peer took over");
}

#[test]
fn irrelevant_task_deleted_on_release() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(2);
    let tip = chain.last().unwrap().clone();
    let (p, _) = connect_authenticated(&mut core, 1, 7005);
    core.on_message(p, WireMessage::NewTip(NewTipMsg { descriptor: tip }));
    core.take_effects();

    let held: Vec<_> = core.peers.get(p).tasks.iter().copied().collect();
    assert!(!held.is_empty());
    for t in &held {
        core.sched.get_mut(*t).relevant = false;
    }

    core.delete_self(p, false, None);
    for t in held {
        assert!(core
            .sched
            .task_ids()
            .iter()
            .all(|&live| live != t || core.sched.get(live).owner.is_none()));
    }
    assert!(core.sched.is_empty(), "irrelevant tasks are deleted");
}

// ---------------------------------------------------------------------------
// Scenario 4: dandelion fluff probability extremes
// ---------------------------------------------------------------------------

fn dandelion_config(fluff_probability: u32) -> NodeConfig {
    let mut cfg = base_config();
    cfg.dandelion.fluff_probability = fluff_probability;
    cfg.dandelion.outputs_min = 1;
    cfg.dandelion.outputs_max = 1;
    cfg
}

#[test]
fn fluff_probability_zero_always_stems() {
    let stores = MemStoreSet::default();
    let mut core = make_node(dandelion_config(0), &stores);
    let (p, _) = connect_authenticated(&mut core, 1, 7006);

    for seed in 10..20u8 {
        assert!(core.on_transaction_stem(sample_tx(seed, 10), None));
        let msgs = sent_to(&mut core, p);
        let stem_sends = msgs
            .iter()
            .filter(|msg| {
                matches!(msg, WireMessage::NewTransaction(m) if !m.fluff)
            })
            .count();
        assert_eq!(stem_sends, 1, "every tx goes out as a stem relay");
        assert!(core.fluff.is_empty(), "nothing reaches the fluff pool");
    }
    assert_eq!(core.stem.len(), 10, "stem entries wait on their timers");
}

#[test]
fn fluff_probability_max_always_fluffs() {
    let stores = MemStoreSet::default();
    let mut core = make_node(dandelion_config(u32::MAX), &stores);
    let (p, _) = connect_authenticated(&mut core, 1, 7007);

    for seed in 10..20u8 {
        let tx = sample_tx(seed, 10);
        let key = tx.key();
        assert!(core.on_transaction_stem(tx, None));
        let msgs = sent_to(&mut core, p);
        assert!(
            msgs.iter().any(|msg| {
                matches!(msg, WireMessage::HaveTransaction(m) if m.id == key)
            }),
            "fluffed txs are announced"
        );
        assert!(core.fluff.contains(&key));
    }
    assert!(core.stem.is_empty(), "nothing lingers in the stem pool");
}

#[test]
fn stem_timer_forces_fluff() {
    let stores = MemStoreSet::default();
    let mut core = make_node(dandelion_config(0), &stores);
    let (_p, _) = connect_authenticated(&mut core, 1, 7008);

    let tx = sample_tx(42, 10);
    let key = tx.key();
    assert!(core.on_transaction_stem(tx, None));
    core.take_effects();
    assert!(core.fluff.is_empty());

    // Jump past the stem window.
    let deadline = core.now_ms + core.cfg.dandelion.timeout_max_ms + 1;
    core.on_tick(deadline);
    core.take_effects();

    assert!(core.fluff.contains(&key), "timer expiry fluffs the entry");
    assert!(core.stem.is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 5: miner soft restart
// ---------------------------------------------------------------------------

#[test]
fn miner_soft_restart_discards_partial_work() {
    use shroud_node::{BlockPlan, Miner};

    let (solution_tx, mut solution_rx) = tokio::sync::mpsc::unbounded_channel();
    let (id, _) = remote_keys(9);
    let miner = Miner::new(1, id, Some(150), solution_tx);

    let chain = build_chain(2);
    let plan_a = BlockPlan {
        hdr: chain[0].clone(),
        body: vec![1],
        fees: 100,
    };
    let plan_b = BlockPlan {
        hdr: chain[1].clone(),
        body: vec![2],
        fees: 200,
    };

    assert!(miner.install(plan_a));
    std::thread::sleep(std::time::Duration::from_millis(30));
    // Soft restart: same stop cell, new block. The worker notices via
    // the retrying probe and starts over without aborting.
    assert!(miner.install(plan_b));

    let solution = wait_for_solution(&mut solution_rx, 3_000);
    assert_eq!(solution.fees, 200, "the replacement block is the one mined");
    assert_eq!(solution.body, vec![2]);

    // The stop cell is latched: a follow-up install is abandoned.
    let plan_c = BlockPlan {
        hdr: chain[0].clone(),
        body: vec![3],
        fees: 300,
    };
    assert!(!miner.install(plan_c), "solved task blocks a new install");
}

#[test]
fn miner_hard_abort_produces_no_solution() {
    use shroud_node::{BlockPlan, Miner};

    let (solution_tx, mut solution_rx) = tokio::sync::mpsc::unbounded_channel();
    let (id, _) = remote_keys(9);
    let miner = Miner::new(1, id, Some(150), solution_tx);

    let chain = build_chain(1);
    miner.install(BlockPlan {
        hdr: chain[0].clone(),
        body: vec![1],
        fees: 100,
    });
    std::thread::sleep(std::time::Duration::from_millis(20));
    miner.hard_abort();

    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(
        solution_rx.try_recv().is_err(),
        "aborted task must not deliver"
    );
}

fn wait_for_solution(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<MinedSolution>,
    timeout_ms: u64,
) -> MinedSolution {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        match rx.try_recv() {
            Ok(solution) => return solution,
            Err(_) => {
                assert!(std::time::Instant::now() < deadline, "no solution in time");
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario 6: sync resume from partial shard
// ---------------------------------------------------------------------------

fn sync_config(data_dir: &std::path::Path) -> NodeConfig {
    let mut cfg = base_config();
    cfg.sync.src_peers = 2;
    cfg.sync.timeout_ms = 5_000;
    cfg.data_dir = data_dir.to_path_buf();
    cfg
}

/// Walk a peer through tip announcement + chainwork proof + probe reply
/// so it becomes an eligible sync source.
fn prove_sync_peer(
    core: &mut NodeCore,
    p: PeerRef,
    tip: &StateDescriptor,
    offer: StateId,
) -> Vec<WireMessage> {
    core.on_message(
        p,
        WireMessage::NewTip(NewTipMsg {
            descriptor: tip.clone(),
        }),
    );
    core.on_message(
        p,
        WireMessage::ProofChainWork(ProofChainWorkMsg {
            chainwork: tip.chainwork,
            proof: vec![],
        }),
    );
    core.on_message(
        p,
        WireMessage::Macroblock(MacroblockMsg {
            id: offer,
            portion: vec![],
        }),
    );
    sent_to(core, p)
}

fn macroblock_requests(msgs: &[WireMessage]) -> Vec<MacroblockGetMsg> {
    msgs.iter()
        .filter_map(|msg| match msg {
            WireMessage::MacroblockGet(m) if m.id.height != 0 => Some(m.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn sync_commits_target_and_resumes_from_offset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stores = MemStoreSet::default();

    let chain = build_chain(50);
    let tip = chain.last().unwrap().clone();
    let target = tip.id();

    // -- First run: detect, commit, download a partial shard. --
    let mut core = make_node(sync_config(dir.path()), &stores);
    assert!(core.sync.is_some(), "empty chain enters sync mode");

    let (p, _) = connect_authenticated(&mut core, 1, 7009);
    prove_sync_peer(&mut core, p, &tip, target);

    // One probe answered out of a quorum of two: the detection deadline
    // is armed; jump past it to commit the target.
    core.on_tick(core.now_ms + core.cfg.sync.timeout_ms + 1);
    let msgs = sent_to(&mut core, p);
    let requests = macroblock_requests(&msgs);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id, target);
    assert_eq!(requests[0].data, 0);
    assert_eq!(requests[0].offset, 0);

    assert_eq!(
        stores.params.get_sync_target().unwrap(),
        Some(target),
        "target persisted for resume"
    );

    // Deliver K bytes of shard 0; the follow-up request resumes at K.
    let portion = vec![0xAB; 1234];
    core.on_message(
        p,
        WireMessage::Macroblock(MacroblockMsg {
            id: target,
            portion: portion.clone(),
        }),
    );
    let msgs = sent_to(&mut core, p);
    let requests = macroblock_requests(&msgs);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].offset, portion.len() as u64);

    drop(core);

    // -- Restart: same stores, same data dir. --
    let mut core = make_node(sync_config(dir.path()), &stores);
    let sync = core.sync.as_ref().expect("sync resumes");
    assert!(!sync.detecting, "persisted target skips detection");
    assert_eq!(sync.target, target);

    let (p, _) = connect_authenticated(&mut core, 2, 7010);
    core.on_message(
        p,
        WireMessage::NewTip(NewTipMsg {
            descriptor: tip.clone(),
        }),
    );
    core.on_message(
        p,
        WireMessage::ProofChainWork(ProofChainWorkMsg {
            chainwork: tip.chainwork,
            proof: vec![],
        }),
    );
    let msgs = sent_to(&mut core, p);
    let requests = macroblock_requests(&msgs);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id, target);
    assert_eq!(requests[0].data, 0);
    assert_eq!(
        requests[0].offset,
        portion.len() as u64,
        "download continues from the partial file"
    );
}

// ---------------------------------------------------------------------------
// Cross-cutting invariants
// ---------------------------------------------------------------------------

#[test]
fn teardown_leaves_no_references() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(3);
    let tip = chain.last().unwrap().clone();
    let (p, id) = connect_authenticated(&mut core, 1, 7011);
    core.on_message(p, WireMessage::NewTip(NewTipMsg { descriptor: tip }));
    core.on_message(
        p,
        WireMessage::BbsSubscribe(shroud_messages::BbsSubscribeMsg {
            channel: 3,
            time_from: 0,
            on: true,
        }),
    );
    core.take_effects();

    core.delete_self(p, false, None);

    assert!(!core.peers.contains(p));
    let info = core.peer_man.find(&id).unwrap();
    assert_eq!(core.peer_man.get(info).live, None);
    for t in core.sched.task_ids() {
        assert_ne!(core.sched.get(t).owner, Some(p));
    }
    assert!(core
        .bbs
        .subscriptions
        .values()
        .all(|subs| !subs.contains(&p)));
}

#[test]
fn bbs_message_relay_is_idempotent() {
    let stores = MemStoreSet::default();
    let mut cfg = base_config();
    cfg.timeout.bbs_message_timeout_s = 10_000;
    let mut core = make_node(cfg, &stores);

    let (p, _) = connect_authenticated(&mut core, 1, 7012);
    let (q, _) = connect_authenticated(&mut core, 2, 7013);

    let msg = BbsMsgBody {
        channel: 5,
        time_posted: core.now_ms / 1000,
        payload: b"hello out there".to_vec(),
    };
    core.on_message(p, WireMessage::BbsMsg(msg.clone()));
    let first_round = sent_to(&mut core, q);
    assert!(
        first_round
            .iter()
            .any(|m| matches!(m, WireMessage::BbsHaveMsg(_))),
        "first delivery is announced"
    );

    core.on_message(p, WireMessage::BbsMsg(msg.clone()));
    let second_round = sent_to(&mut core, q);
    assert!(
        second_round
            .iter()
            .all(|m| !matches!(m, WireMessage::BbsHaveMsg(_))),
        "duplicate delivery is silent"
    );

    let key = shroud_node::bbs::calc_msg_key(&msg.payload, msg.channel);
    assert!(stores.bbs.contains(&key).unwrap());
}

#[test]
fn unauthenticated_peers_get_no_tasks() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(8);
    let tip = chain.last().unwrap().clone();

    // A session that never authenticates, even with a tip on record.
    let addr = "127.0.0.9:7014".parse().unwrap();
    let p = core.on_accepted(addr);
    core.on_connected_secure(p);
    core.take_effects();
    core.peers.get_mut(p).tip = tip;

    core.request_data(StateId::new(1, chain[0].id().hash), false, None);

    assert!(core.peers.get(p).tasks.is_empty());
    let t = core.sched.task_ids()[0];
    assert_eq!(core.sched.get(t).owner, None);
}

#[test]
fn peer_request_timeout_penalizes_and_disconnects() {
    let stores = MemStoreSet::default();
    let mut core = make_node(base_config(), &stores);

    let chain = build_chain(8);
    let tip = chain.last().unwrap().clone();
    let (p, id) = connect_authenticated(&mut core, 1, 7015);
    core.on_message(p, WireMessage::NewTip(NewTipMsg { descriptor: tip }));
    core.take_effects();
    assert!(!core.peers.get(p).tasks.is_empty());

    // Snapshot after the tip reward so only the penalty shows below.
    let info = core.peer_man.find(&id).unwrap();
    let rating_before = core.peer_man.get(info).raw_rating;

    core.on_tick(core.now_ms + core.cfg.timeout.get_block_ms + core.cfg.timeout.get_state_ms);

    assert!(!core.peers.contains(p), "slow peer dropped");
    assert_eq!(
        core.peer_man.get(info).raw_rating,
        rating_before - shroud_network::Rating::PENALTY_TIMEOUT
    );
    assert!(!core.peer_man.is_banned(info), "timeout is not a ban");
}
