//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use shroud_types::BlockHash;

use crate::NodeError;

/// Configuration for a shroud node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network name; folded into the rules checksum.
    #[serde(default = "default_network")]
    pub network: String,

    /// Data directory: LMDB environment and macroblock shard files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address to accept P2P connections on. `None` = outbound only.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Peers to connect to on startup.
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    /// Chain pruning window (blocks kept behind the tip).
    #[serde(default = "default_horizon")]
    pub horizon: u64,

    /// Verifier pool size; negative = `cores - mining_threads - 1`.
    #[serde(default = "default_verification_threads")]
    pub verification_threads: i32,

    /// Number of mining worker threads; 0 disables mining.
    #[serde(default)]
    pub mining_threads: usize,

    /// Fixed proof-of-work difficulty of the reference chain.
    #[serde(default = "default_pow_difficulty")]
    pub pow_difficulty: u32,

    /// Activation quorum: how many peers the manager keeps connected.
    #[serde(default = "default_desired_peers")]
    pub desired_peers: usize,

    /// How many top-rated peers one gossip round sends.
    #[serde(default = "default_top_peers")]
    pub top_peers: usize,

    /// Fluff pool size cap; lowest fee-per-byte entries are evicted.
    #[serde(default = "default_max_pool_transactions")]
    pub max_pool_transactions: usize,

    /// Only the owner key may query the mined report.
    #[serde(default)]
    pub restrict_mined_report_to_owner: bool,

    /// Bytes served per `Macroblock` portion; 0 disables serving.
    #[serde(default = "default_upload_portion")]
    pub history_upload_portion: u32,

    /// Channel population target for `BbsPickChannel`.
    #[serde(default = "default_bbs_ideal_population")]
    pub bbs_ideal_channel_population: u32,

    /// UDP beacon port; 0 = use the listen port.
    #[serde(default)]
    pub beacon_port: u16,

    /// Beacon broadcast period; 0 disables the beacon.
    #[serde(default = "default_beacon_period_ms")]
    pub beacon_period_ms: u64,

    /// Accept a state at this height only if the hash matches (manual
    /// checkpoint override).
    #[serde(default)]
    pub control_state: Option<ControlState>,

    /// Wallet key seed; derives the owner id and the nonce chain.
    #[serde(skip)]
    pub wallet_key: [u8; 32],

    /// Per-height treasury bodies consumed while the subsidy is open.
    #[serde(skip)]
    pub treasury: Vec<Vec<u8>>,

    /// Fake proof-of-work solve time; `Some` replaces the real search in
    /// tests.
    #[serde(default)]
    pub fake_pow_solve_time_ms: Option<u64>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default)]
    pub dandelion: DandelionConfig,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Manual checkpoint: `(height, hash)` a state must match to be approved.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ControlState {
    pub height: u64,
    pub hash: [u8; 32],
}

/// Two-phase bootstrap settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Target-detection quorum: probes answered before committing early.
    #[serde(default = "default_sync_src_peers")]
    pub src_peers: u32,

    /// Total detection-phase timeout.
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,

    /// Discard any persisted sync target and re-detect.
    #[serde(default)]
    pub force_resync: bool,
}

/// Every timer the node arms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Peer must answer a header request within this.
    #[serde(default = "default_get_state_ms")]
    pub get_state_ms: u64,

    /// Peer must answer a block request within this.
    #[serde(default = "default_get_block_ms")]
    pub get_block_ms: u64,

    /// Re-request window for announced transactions.
    #[serde(default = "default_get_tx_ms")]
    pub get_tx_ms: u64,

    /// Re-request window for announced BBS messages.
    #[serde(default = "default_get_bbs_msg_ms")]
    pub get_bbs_msg_ms: u64,

    /// Delay between a pool change and the miner rebuild.
    #[serde(default = "default_mining_soft_restart_ms")]
    pub mining_soft_restart_ms: u64,

    /// BBS messages older than this are rejected and pruned.
    #[serde(default = "default_bbs_message_timeout_s")]
    pub bbs_message_timeout_s: u64,

    /// BBS messages this far in the future are rejected.
    #[serde(default = "default_bbs_message_max_ahead_s")]
    pub bbs_message_max_ahead_s: u64,

    /// Minimum interval between BBS cleanup sweeps.
    #[serde(default = "default_bbs_cleanup_period_ms")]
    pub bbs_cleanup_period_ms: u64,

    /// Interval of the top-peers gossip while `send_peers` is on.
    #[serde(default = "default_top_peers_upd_ms")]
    pub top_peers_upd_ms: u64,

    /// Interval of the activation-policy update.
    #[serde(default = "default_peers_update_ms")]
    pub peers_update_ms: u64,

    /// Interval of the peer-table flush to the store.
    #[serde(default = "default_peers_db_flush_ms")]
    pub peers_db_flush_ms: u64,
}

/// Dandelion privacy pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DandelionConfig {
    /// Fluff threshold in units of `2^-32`: a draw at or below it fluffs.
    #[serde(default = "default_fluff_probability")]
    pub fluff_probability: u32,

    /// Stem relay timer lower bound.
    #[serde(default = "default_dandelion_timeout_min_ms")]
    pub timeout_min_ms: u64,

    /// Stem relay timer upper bound.
    #[serde(default = "default_dandelion_timeout_max_ms")]
    pub timeout_max_ms: u64,

    /// How long an under-filled entry waits for aggregation partners.
    #[serde(default = "default_aggregation_time_ms")]
    pub aggregation_time_ms: u64,

    /// Aggregation target: stop merging at this many outputs.
    #[serde(default = "default_outputs_min")]
    pub outputs_min: usize,

    /// Hard cap on outputs; beyond it an entry skips aggregation.
    #[serde(default = "default_outputs_max")]
    pub outputs_max: usize,

    /// Blocks before a spent dummy is retried.
    #[serde(default = "default_dummy_lifetime_lo")]
    pub dummy_lifetime_lo: u64,

    /// Upper bound for fresh dummy maturity; 0 disables dummy outputs.
    #[serde(default)]
    pub dummy_lifetime_hi: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> String {
    "dev".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./shroud_data")
}

fn default_horizon() -> u64 {
    1440
}

fn default_verification_threads() -> i32 {
    -1
}

fn default_pow_difficulty() -> u32 {
    8
}

fn default_desired_peers() -> usize {
    8
}

fn default_top_peers() -> usize {
    16
}

fn default_max_pool_transactions() -> usize {
    100_000
}

fn default_upload_portion() -> u32 {
    1 << 20
}

fn default_bbs_ideal_population() -> u32 {
    100
}

fn default_beacon_period_ms() -> u64 {
    10_000
}

fn default_sync_src_peers() -> u32 {
    3
}

fn default_sync_timeout_ms() -> u64 {
    10_000
}

fn default_get_state_ms() -> u64 {
    10_000
}

fn default_get_block_ms() -> u64 {
    30_000
}

fn default_get_tx_ms() -> u64 {
    5_000
}

fn default_get_bbs_msg_ms() -> u64 {
    5_000
}

fn default_mining_soft_restart_ms() -> u64 {
    100
}

fn default_bbs_message_timeout_s() -> u64 {
    3600
}

fn default_bbs_message_max_ahead_s() -> u64 {
    120
}

fn default_bbs_cleanup_period_ms() -> u64 {
    3_600_000
}

fn default_top_peers_upd_ms() -> u64 {
    60_000
}

fn default_peers_update_ms() -> u64 {
    1_000
}

fn default_peers_db_flush_ms() -> u64 {
    60_000
}

fn default_fluff_probability() -> u32 {
    // ~10% in units of 2^-32.
    0x1999_999A
}

fn default_dandelion_timeout_min_ms() -> u64 {
    20_000
}

fn default_dandelion_timeout_max_ms() -> u64 {
    50_000
}

fn default_aggregation_time_ms() -> u64 {
    10_000
}

fn default_outputs_min() -> usize {
    5
}

fn default_outputs_max() -> usize {
    10
}

fn default_dummy_lifetime_lo() -> u64 {
    1_000
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("NodeConfig is always serializable to TOML")
    }

    /// Deterministic hash of the consensus rules this node runs.
    /// Peers compare checksums during the handshake; a mismatch is fatal.
    pub fn rules_checksum(&self) -> BlockHash {
        BlockHash::new(shroud_crypto::blake2b_256_multi(&[
            b"shroud-rules-v1",
            self.network.as_bytes(),
            &self.pow_difficulty.to_be_bytes(),
        ]))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            data_dir: default_data_dir(),
            listen: None,
            connect: Vec::new(),
            horizon: default_horizon(),
            verification_threads: default_verification_threads(),
            mining_threads: 0,
            pow_difficulty: default_pow_difficulty(),
            desired_peers: default_desired_peers(),
            top_peers: default_top_peers(),
            max_pool_transactions: default_max_pool_transactions(),
            restrict_mined_report_to_owner: false,
            history_upload_portion: default_upload_portion(),
            bbs_ideal_channel_population: default_bbs_ideal_population(),
            beacon_port: 0,
            beacon_period_ms: default_beacon_period_ms(),
            control_state: None,
            wallet_key: [0u8; 32],
            treasury: Vec::new(),
            fake_pow_solve_time_ms: None,
            sync: SyncConfig::default(),
            timeout: TimeoutConfig::default(),
            dandelion: DandelionConfig::default(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            src_peers: default_sync_src_peers(),
            timeout_ms: default_sync_timeout_ms(),
            force_resync: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            get_state_ms: default_get_state_ms(),
            get_block_ms: default_get_block_ms(),
            get_tx_ms: default_get_tx_ms(),
            get_bbs_msg_ms: default_get_bbs_msg_ms(),
            mining_soft_restart_ms: default_mining_soft_restart_ms(),
            bbs_message_timeout_s: default_bbs_message_timeout_s(),
            bbs_message_max_ahead_s: default_bbs_message_max_ahead_s(),
            bbs_cleanup_period_ms: default_bbs_cleanup_period_ms(),
            top_peers_upd_ms: default_top_peers_upd_ms(),
            peers_update_ms: default_peers_update_ms(),
            peers_db_flush_ms: default_peers_db_flush_ms(),
        }
    }
}

impl Default for DandelionConfig {
    fn default() -> Self {
        Self {
            fluff_probability: default_fluff_probability(),
            timeout_min_ms: default_dandelion_timeout_min_ms(),
            timeout_max_ms: default_dandelion_timeout_max_ms(),
            aggregation_time_ms: default_aggregation_time_ms(),
            outputs_min: default_outputs_min(),
            outputs_max: default_outputs_max(),
            dummy_lifetime_lo: default_dummy_lifetime_lo(),
            dummy_lifetime_hi: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let toml_str = config.to_toml_string();
        let parsed = NodeConfig::from_toml_str(&toml_str).expect("should parse");
        assert_eq!(parsed.desired_peers, config.desired_peers);
        assert_eq!(parsed.timeout.get_block_ms, config.timeout.get_block_ms);
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config = NodeConfig::from_toml_str("").expect("empty toml should use defaults");
        assert_eq!(config.horizon, 1440);
        assert_eq!(config.dandelion.outputs_max, 10);
        assert_eq!(config.log_format, "human");
    }

    #[test]
    fn partial_toml_overrides() {
        let toml = r#"
            mining_threads = 2

            [dandelion]
            fluff_probability = 0
        "#;
        let config = NodeConfig::from_toml_str(toml).expect("should parse");
        assert_eq!(config.mining_threads, 2);
        assert_eq!(config.dandelion.fluff_probability, 0);
        assert_eq!(config.dandelion.outputs_min, 5); // default
    }

    #[test]
    fn missing_file_returns_config_error() {
        let result = NodeConfig::from_toml_file("/nonexistent/shroud.toml");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), NodeError::Config(_)));
    }

    #[test]
    fn checksum_depends_on_network() {
        let mut a = NodeConfig::default();
        let mut b = NodeConfig::default();
        a.network = "dev".into();
        b.network = "test".into();
        assert_ne!(a.rules_checksum(), b.rules_checksum());
    }
}
