//! Wire message types for shroud node-to-node communication.
//!
//! Every message sent between nodes is a [`WireMessage`] variant,
//! bincode-encoded inside a 4-byte big-endian length frame. The peer
//! session deserializes incoming frames and dispatches on the variant;
//! anything that fails to decode is a protocol violation.

pub mod beacon;

use serde::{Deserialize, Serialize};
use shroud_types::{
    BlockHash, ChainWork, KernelId, MsgKey, PeerId, Signature, StateDescriptor, StateId,
    Transaction, TxKey,
};
use std::net::{IpAddr, SocketAddr};

/// Maximum number of headers in one header pack.
pub const HDR_PACK_MAX_SIZE: u32 = 128;

/// Maximum number of entries in enumerating replies (mined report, UTXO proofs).
pub const ENTRIES_MAX: usize = 64;

/// Maximum framed message size (matches the read loop's codec limit).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Number of data shards a macroblock is split into.
pub const MACRO_SHARD_COUNT: u8 = 5;

/// Top-level P2P wire message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    // -- Handshake ----------------------------------------------------------
    /// Announce the port we accept connections on (sent by the dialer).
    PeerInfoSelf(PeerInfoSelfMsg),
    /// A fresh nonce the remote must sign to prove its identity.
    Challenge(ChallengeMsg),
    /// Identity proof: signature over the received challenge.
    Authentication(AuthenticationMsg),

    // -- Session ------------------------------------------------------------
    /// Capability announcement + consensus-rules checksum.
    Config(ConfigMsg),
    /// Polite close with a reason code.
    Bye(ByeMsg),
    Ping,
    Pong,

    // -- Chain --------------------------------------------------------------
    /// Advertise a new best state.
    NewTip(NewTipMsg),
    GetHdr(GetHdrMsg),
    Hdr(HdrMsg),
    GetHdrPack(GetHdrPackMsg),
    HdrPack(HdrPackMsg),
    GetBody(GetBodyMsg),
    Body(BodyMsg),
    /// The peer does not have the object the front request asked for.
    DataMissing,

    // -- Proofs -------------------------------------------------------------
    GetProofState(GetProofStateMsg),
    ProofState(ProofStateMsg),
    GetProofKernel(GetProofKernelMsg),
    ProofKernel(ProofKernelMsg),
    GetProofUtxo(GetProofUtxoMsg),
    ProofUtxo(ProofUtxoMsg),
    GetProofChainWork(GetProofChainWorkMsg),
    ProofChainWork(ProofChainWorkMsg),

    // -- Transactions -------------------------------------------------------
    NewTransaction(NewTransactionMsg),
    /// Stem-phase acceptance reply.
    TxStatus(TxStatusMsg),
    HaveTransaction(HaveTransactionMsg),
    GetTransaction(GetTransactionMsg),

    // -- BBS ----------------------------------------------------------------
    BbsMsg(BbsMsgBody),
    BbsHaveMsg(BbsHaveMsgBody),
    BbsGetMsg(BbsGetMsgBody),
    BbsSubscribe(BbsSubscribeMsg),
    BbsPickChannel,
    BbsPickChannelRes(BbsPickChannelResMsg),

    // -- Macroblock sync ----------------------------------------------------
    MacroblockGet(MacroblockGetMsg),
    Macroblock(MacroblockMsg),

    // -- Peer gossip --------------------------------------------------------
    PeerInfo(PeerInfoMsg),

    // -- Misc ---------------------------------------------------------------
    GetTime,
    Time(TimeMsg),
    GetExternalAddr,
    ExternalAddr(ExternalAddrMsg),
    GetMined(GetMinedMsg),
    Mined(MinedMsg),
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfoSelfMsg {
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeMsg {
    pub nonce: [u8; 32],
}

/// What the authenticating key claims to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    /// The node's network identity.
    Node,
    /// The operator key, unlocking the mined report.
    Owner,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationMsg {
    pub id: PeerId,
    pub id_type: IdType,
    /// Signature over the challenge nonce with the key behind `id`.
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMsg {
    /// Deterministic hash of the consensus rules. A mismatch is fatal.
    pub cfg_checksum: BlockHash,
    pub spreading_transactions: bool,
    pub bbs: bool,
    pub send_peers: bool,
}

impl Default for ConfigMsg {
    fn default() -> Self {
        Self {
            cfg_checksum: BlockHash::ZERO,
            spreading_transactions: false,
            bbs: false,
            send_peers: false,
        }
    }
}

/// Reason codes carried in `Bye`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByeReason {
    Stopping,
    Ban,
    Loopback,
    Duplicate,
    Timeout,
    Incompatible,
    Other,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ByeMsg {
    pub reason: ByeReason,
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTipMsg {
    pub descriptor: StateDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetHdrMsg {
    pub id: StateId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HdrMsg {
    pub descriptor: StateDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetHdrPackMsg {
    pub top: StateId,
    /// Number of headers walking down from `top`; at most [`HDR_PACK_MAX_SIZE`].
    pub count: u32,
}

/// Headers ordered from the requested top downwards, each element's `prev`
/// naming the next element's hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HdrPackMsg {
    pub headers: Vec<StateDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBodyMsg {
    pub id: StateId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BodyMsg {
    pub buffer: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// One step of a Merkle path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub on_right: bool,
    pub hash: BlockHash,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProofStateMsg {
    pub height: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofStateMsg {
    pub proof: Vec<ProofStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProofKernelMsg {
    pub id: KernelId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofKernelMsg {
    pub proof: Vec<ProofStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProofUtxoMsg {
    pub commitment: [u8; 32],
    pub maturity_min: u64,
}

/// Proof for one matching UTXO.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoProof {
    pub count: u64,
    pub maturity: u64,
    pub proof: Vec<ProofStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofUtxoMsg {
    /// At most [`ENTRIES_MAX`] entries.
    pub proofs: Vec<UtxoProof>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProofChainWorkMsg {
    pub lower_bound: ChainWork,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofChainWorkMsg {
    /// The total chainwork the proof asserts.
    pub chainwork: ChainWork,
    pub proof: Vec<ProofStep>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTransactionMsg {
    pub tx: Transaction,
    /// `false` = stem (relay to one peer), `true` = fluff (broadcast).
    pub fluff: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TxStatusMsg {
    pub accepted: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HaveTransactionMsg {
    pub id: TxKey,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GetTransactionMsg {
    pub id: TxKey,
}

// ---------------------------------------------------------------------------
// BBS
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BbsMsgBody {
    pub channel: u32,
    pub time_posted: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BbsHaveMsgBody {
    pub key: MsgKey,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BbsGetMsgBody {
    pub key: MsgKey,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BbsSubscribeMsg {
    pub channel: u32,
    /// Backfill starts at this posting time.
    pub time_from: u64,
    pub on: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BbsPickChannelResMsg {
    pub channel: u32,
}

// ---------------------------------------------------------------------------
// Macroblock sync
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacroblockGetMsg {
    /// Zero id = probe: "what macroblock do you offer?"
    pub id: StateId,
    /// Shard index, `< MACRO_SHARD_COUNT`.
    pub data: u8,
    /// Resume offset into the shard file.
    pub offset: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacroblockMsg {
    pub id: StateId,
    /// Empty portion = shard complete.
    pub portion: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Peer gossip / misc
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeerInfoMsg {
    pub id: PeerId,
    pub last_addr: SocketAddr,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeMsg {
    pub value: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ExternalAddrMsg {
    pub ip: IpAddr,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GetMinedMsg {
    pub height_min: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerMined {
    pub id: StateId,
    pub fees: u64,
    pub active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinedMsg {
    /// At most [`ENTRIES_MAX`] entries.
    pub entries: Vec<PerMined>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_types::{ChainWork, Difficulty, Timestamp};

    fn sample_descriptor() -> StateDescriptor {
        StateDescriptor {
            height: 42,
            prev: BlockHash::new([1u8; 32]),
            definition: BlockHash::new([2u8; 32]),
            timestamp: Timestamp::new(1_700_000_000),
            difficulty: Difficulty(8),
            chainwork: ChainWork::ZERO.plus(Difficulty(8)),
            nonce: 0xDEAD_BEEF,
        }
    }

    fn roundtrip(msg: WireMessage) -> WireMessage {
        let bytes = bincode::serialize(&msg).unwrap();
        bincode::deserialize(&bytes).unwrap()
    }

    #[test]
    fn new_tip_roundtrip() {
        let msg = WireMessage::NewTip(NewTipMsg {
            descriptor: sample_descriptor(),
        });
        match roundtrip(msg) {
            WireMessage::NewTip(m) => assert_eq!(m.descriptor, sample_descriptor()),
            other => panic!("expected NewTip, got {:?}", other),
        }
    }

    #[test]
    fn authentication_roundtrip() {
        let msg = WireMessage::Authentication(AuthenticationMsg {
            id: PeerId::new([7u8; 32]),
            id_type: IdType::Node,
            signature: Signature([0xAB; 64]),
        });
        match roundtrip(msg) {
            WireMessage::Authentication(m) => {
                assert_eq!(m.id, PeerId::new([7u8; 32]));
                assert_eq!(m.id_type, IdType::Node);
                assert_eq!(m.signature.0[0], 0xAB);
            }
            other => panic!("expected Authentication, got {:?}", other),
        }
    }

    #[test]
    fn hdr_pack_roundtrip() {
        let msg = WireMessage::HdrPack(HdrPackMsg {
            headers: vec![sample_descriptor(); 3],
        });
        match roundtrip(msg) {
            WireMessage::HdrPack(m) => assert_eq!(m.headers.len(), 3),
            other => panic!("expected HdrPack, got {:?}", other),
        }
    }

    #[test]
    fn macroblock_get_roundtrip() {
        let msg = WireMessage::MacroblockGet(MacroblockGetMsg {
            id: StateId::new(100, BlockHash::new([5u8; 32])),
            data: 2,
            offset: 8192,
        });
        match roundtrip(msg) {
            WireMessage::MacroblockGet(m) => {
                assert_eq!(m.id.height, 100);
                assert_eq!(m.data, 2);
                assert_eq!(m.offset, 8192);
            }
            other => panic!("expected MacroblockGet, got {:?}", other),
        }
    }

    #[test]
    fn bbs_msg_roundtrip() {
        let msg = WireMessage::BbsMsg(BbsMsgBody {
            channel: 9,
            time_posted: 12345,
            payload: b"out of band".to_vec(),
        });
        match roundtrip(msg) {
            WireMessage::BbsMsg(m) => {
                assert_eq!(m.channel, 9);
                assert_eq!(m.payload, b"out of band");
            }
            other => panic!("expected BbsMsg, got {:?}", other),
        }
    }

    #[test]
    fn peer_info_roundtrip() {
        let msg = WireMessage::PeerInfo(PeerInfoMsg {
            id: PeerId::new([3u8; 32]),
            last_addr: "10.0.0.1:7770".parse().unwrap(),
        });
        match roundtrip(msg) {
            WireMessage::PeerInfo(m) => {
                assert_eq!(m.last_addr.port(), 7770);
            }
            other => panic!("expected PeerInfo, got {:?}", other),
        }
    }

    #[test]
    fn new_transaction_roundtrip() {
        let tx = Transaction {
            inputs: vec![],
            outputs: vec![],
            kernels: vec![shroud_types::TxKernel {
                excess: [1u8; 32],
                fee: 5,
            }],
            offset: [0u8; 32],
        };
        let msg = WireMessage::NewTransaction(NewTransactionMsg { tx, fluff: false });
        match roundtrip(msg) {
            WireMessage::NewTransaction(m) => {
                assert!(!m.fluff);
                assert_eq!(m.tx.kernels.len(), 1);
            }
            other => panic!("expected NewTransaction, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_bytes_rejected_gracefully() {
        let garbage = vec![0xFF, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        assert!(bincode::deserialize::<WireMessage>(&garbage).is_err());
    }

    #[test]
    fn truncated_message_rejected() {
        let msg = WireMessage::NewTip(NewTipMsg {
            descriptor: sample_descriptor(),
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(bincode::deserialize::<WireMessage>(truncated).is_err());
    }

    #[test]
    fn empty_bytes_rejected() {
        assert!(bincode::deserialize::<WireMessage>(&[]).is_err());
    }
}
