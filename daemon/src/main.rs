//! shroud daemon: entry point for running a shroud node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shroud_node::{HeaderChain, NodeConfig, NodeCore, Stores, VerifierPool};
use shroud_store_lmdb::environment::{LmdbEnvironment, DEFAULT_MAP_SIZE};
use shroud_types::Difficulty;

#[derive(Parser)]
#[command(name = "shroud-daemon", about = "shroud full node daemon")]
struct Cli {
    /// Path to a TOML configuration file. If provided, file settings are
    /// used as the base; CLI flags override them.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network name, folded into the rules checksum.
    #[arg(long, env = "SHROUD_NETWORK")]
    network: Option<String>,

    /// Data directory for the store and macroblock files.
    #[arg(long, env = "SHROUD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address to accept P2P connections on, e.g. "0.0.0.0:7770".
    #[arg(long, env = "SHROUD_LISTEN")]
    listen: Option<SocketAddr>,

    /// Peers to connect to on startup (comma-separated).
    #[arg(long, env = "SHROUD_CONNECT", value_delimiter = ',')]
    connect: Vec<SocketAddr>,

    /// Number of mining threads; 0 disables mining.
    #[arg(long, env = "SHROUD_MINING_THREADS")]
    mining_threads: Option<usize>,

    /// Verifier pool size; negative = auto.
    #[arg(long, env = "SHROUD_VERIFICATION_THREADS")]
    verification_threads: Option<i32>,

    /// Discard any persisted sync target and re-detect.
    #[arg(long)]
    force_resync: bool,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[arg(long, default_value = "info", env = "SHROUD_LOG_LEVEL")]
    log_level: String,
}

fn build_config(cli: &Cli) -> Result<NodeConfig, shroud_node::NodeError> {
    let mut cfg = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(&path.to_string_lossy())?,
        None => NodeConfig::default(),
    };

    if let Some(network) = &cli.network {
        cfg.network = network.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        cfg.data_dir = data_dir.clone();
    }
    if cli.listen.is_some() {
        cfg.listen = cli.listen;
    }
    if !cli.connect.is_empty() {
        cfg.connect = cli.connect.clone();
    }
    if let Some(threads) = cli.mining_threads {
        cfg.mining_threads = threads;
    }
    if let Some(threads) = cli.verification_threads {
        cfg.verification_threads = threads;
    }
    if cli.force_resync {
        cfg.sync.force_resync = true;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = build_config(&cli)?;
    tracing::info!(network = %cfg.network, data_dir = %cfg.data_dir.display(), "starting");

    let env = LmdbEnvironment::open(&cfg.data_dir.join("db"), DEFAULT_MAP_SIZE)?;
    let stores = Stores {
        params: Box::new(env.param_store()),
        peers: Box::new(env.peer_store()),
        bbs: Box::new(env.bbs_store()),
        dummies: Box::new(env.dummy_store()),
        mined: Box::new(env.mined_store()),
    };

    let verifier = Arc::new(VerifierPool::new(VerifierPool::resolve_threads(
        cfg.verification_threads,
        cfg.mining_threads,
    )));
    tracing::info!(threads = verifier.thread_count(), "verifier pool");

    let processor = HeaderChain::new(
        Difficulty(cfg.pow_difficulty),
        cfg.control_state,
        Arc::clone(&verifier),
    );

    let (solution_tx, solution_rx) = tokio::sync::mpsc::unbounded_channel();
    let core = NodeCore::new(
        cfg,
        Box::new(processor),
        stores,
        solution_tx,
        shroud_node::net::wall_now_ms(),
    )?;

    shroud_node::net::run(core, solution_rx).await?;

    env.force_sync()?;
    verifier.shutdown();
    Ok(())
}
