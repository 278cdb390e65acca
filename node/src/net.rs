//! Tokio shell: sockets, framing, and the event loop driving the core.
//!
//! The core itself is synchronous; this module owns the listener, one
//! read loop and one writer task per peer, the beacon socket, and the
//! periodic tick. Every event funnels into a single task that calls the
//! core and then executes its effects in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use shroud_messages::{ByeReason, WireMessage, MAX_FRAME_SIZE};

use crate::beacon::{run_beacon, BeaconConfig};
use crate::miner::MinedSolution;
use crate::node::{Effect, NodeCore};
use crate::peer::PeerRef;
use crate::NodeError;

/// Tick granularity of the deadline-driven timers.
const TICK_MS: u64 = 100;

/// Timeout for an outbound TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum ShellEvent {
    Inbound(TcpStream, SocketAddr),
    Dialed(PeerRef, std::io::Result<TcpStream>),
    Frame(PeerRef, WireMessage),
    /// The peer sent bytes that don't decode: protocol violation.
    Garbage(PeerRef),
    Closed(PeerRef),
    Mined(MinedSolution),
    Beacon(shroud_types::PeerId, std::net::SocketAddrV4),
}

struct PeerIo {
    writer_tx: UnboundedSender<WireMessage>,
    reader: Option<JoinHandle<()>>,
}

/// Wall-clock milliseconds, the time base for every core deadline.
pub fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Run the node until ctrl-c. Consumes the core and the miner's solution
/// channel created alongside it.
pub async fn run(
    mut core: NodeCore,
    mut solutions: UnboundedReceiver<MinedSolution>,
) -> Result<(), NodeError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ShellEvent>();
    let mut io: HashMap<u32, PeerIo> = HashMap::new();

    // Listener.
    if let Some(listen) = core.cfg.listen {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!(%listen, "listening");
        let tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if tx.send(ShellEvent::Inbound(stream, addr)).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        });

        // Beacon rides on the listener configuration.
        if core.cfg.beacon_period_ms > 0 {
            let beacon_cfg = BeaconConfig {
                cfg_checksum: core.cfg.rules_checksum(),
                node_id: core.my_public_id,
                listen_port: listen.port(),
                beacon_port: core.cfg.beacon_port,
                period_ms: core.cfg.beacon_period_ms,
            };
            let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                if let Err(e) = run_beacon(beacon_cfg, disc_tx).await {
                    tracing::warn!(error = %e, "beacon stopped");
                }
            });
            let tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some((id, addr)) = disc_rx.recv().await {
                    if tx.send(ShellEvent::Beacon(id, addr)).is_err() {
                        return;
                    }
                }
            });
        }
    }

    // Mined solutions into the event stream.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(solution) = solutions.recv().await {
                if tx.send(ShellEvent::Mined(solution)).is_err() {
                    return;
                }
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    run_effects(&mut core, &mut io, &event_tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c");
                core.shutdown();
                run_effects(&mut core, &mut io, &event_tx);
                return Ok(());
            }
            _ = ticker.tick() => {
                core.on_tick(wall_now_ms());
                run_effects(&mut core, &mut io, &event_tx);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { return Ok(()) };
                handle_event(&mut core, &mut io, &event_tx, event);
                run_effects(&mut core, &mut io, &event_tx);
            }
        }
    }
}

fn handle_event(
    core: &mut NodeCore,
    io: &mut HashMap<u32, PeerIo>,
    event_tx: &UnboundedSender<ShellEvent>,
    event: ShellEvent,
) {
    match event {
        ShellEvent::Inbound(stream, addr) => {
            let p = core.on_accepted(addr);
            attach_stream(io, event_tx, p, stream);
            core.on_connected_secure(p);
        }
        ShellEvent::Dialed(p, Ok(stream)) => {
            if !core.peers.contains(p) {
                return;
            }
            attach_stream(io, event_tx, p, stream);
            core.on_connected_secure(p);
        }
        ShellEvent::Dialed(p, Err(e)) => {
            tracing::debug!(error = %e, "dial failed");
            core.on_io_error(p);
        }
        ShellEvent::Frame(p, msg) => core.on_message(p, msg),
        ShellEvent::Garbage(p) => core.delete_self(p, true, Some(ByeReason::Ban)),
        ShellEvent::Closed(p) => {
            io.remove(&p.0);
            core.on_io_error(p);
        }
        ShellEvent::Mined(solution) => core.on_mined(solution),
        ShellEvent::Beacon(id, addr) => core.on_beacon_peer(id, addr),
    }
}

fn run_effects(
    core: &mut NodeCore,
    io: &mut HashMap<u32, PeerIo>,
    event_tx: &UnboundedSender<ShellEvent>,
) {
    for effect in core.take_effects() {
        match effect {
            Effect::Send(p, msg) => {
                if let Some(peer_io) = io.get(&p.0) {
                    let _ = peer_io.writer_tx.send(msg);
                }
            }
            Effect::Connect(p, addr) => {
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    let result =
                        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "connect timeout",
                            )),
                        };
                    let _ = tx.send(ShellEvent::Dialed(p, result));
                });
            }
            Effect::Disconnect(p) => {
                if let Some(peer_io) = io.remove(&p.0) {
                    // Dropping the writer sender lets the write task drain
                    // pending frames (Bye included) and close the socket.
                    drop(peer_io.writer_tx);
                    if let Some(reader) = peer_io.reader {
                        reader.abort();
                    }
                }
            }
        }
    }
}

fn attach_stream(
    io: &mut HashMap<u32, PeerIo>,
    event_tx: &UnboundedSender<ShellEvent>,
    p: PeerRef,
    stream: TcpStream,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, writer_rx));
    let reader = tokio::spawn(read_loop(p, read_half, event_tx.clone()));

    io.insert(
        p.0,
        PeerIo {
            writer_tx,
            reader: Some(reader),
        },
    );
}

/// Length-prefixed frames: 4-byte big-endian size, then the bincode body.
async fn write_loop(mut half: OwnedWriteHalf, mut rx: UnboundedReceiver<WireMessage>) {
    while let Some(msg) = rx.recv().await {
        let bytes = match bincode::serialize(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "message serialization failed");
                continue;
            }
        };
        if half
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .is_err()
        {
            return;
        }
        if half.write_all(&bytes).await.is_err() {
            return;
        }
        if half.flush().await.is_err() {
            return;
        }
    }
}

async fn read_loop(p: PeerRef, mut half: OwnedReadHalf, tx: UnboundedSender<ShellEvent>) {
    loop {
        let mut len_buf = [0u8; 4];
        if half.read_exact(&mut len_buf).await.is_err() {
            let _ = tx.send(ShellEvent::Closed(p));
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            tracing::warn!(size = len, "oversized frame");
            let _ = tx.send(ShellEvent::Garbage(p));
            return;
        }
        let mut body = vec![0u8; len];
        if half.read_exact(&mut body).await.is_err() {
            let _ = tx.send(ShellEvent::Closed(p));
            return;
        }
        match bincode::deserialize::<WireMessage>(&body) {
            Ok(msg) => {
                if tx.send(ShellEvent::Frame(p, msg)).is_err() {
                    return;
                }
            }
            Err(_) => {
                let _ = tx.send(ShellEvent::Garbage(p));
                return;
            }
        }
    }
}
