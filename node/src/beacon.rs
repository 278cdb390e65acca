//! LAN discovery beacon over UDP broadcast.
//!
//! Periodically announces `(rules checksum, node id, listen port)` on the
//! beacon port and feeds every valid foreign announcement to the core.
//! Sends are awaited, so a new broadcast never starts while the previous
//! one is still in flight.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

use shroud_messages::beacon::{BeaconPacket, BEACON_PACKET_LEN};
use shroud_types::{BlockHash, PeerId};

pub struct BeaconConfig {
    pub cfg_checksum: BlockHash,
    pub node_id: PeerId,
    /// Port we accept TCP connections on (announced in the packet).
    pub listen_port: u16,
    /// UDP port to bind and broadcast to; 0 = use `listen_port`.
    pub beacon_port: u16,
    pub period_ms: u64,
}

impl BeaconConfig {
    fn port(&self) -> u16 {
        if self.beacon_port != 0 {
            self.beacon_port
        } else {
            self.listen_port
        }
    }
}

/// Run the beacon until the discovery channel closes.
pub async fn run_beacon(
    cfg: BeaconConfig,
    discovered: UnboundedSender<(PeerId, SocketAddrV4)>,
) -> std::io::Result<()> {
    let port = cfg.port();
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    socket.set_broadcast(true)?;

    let broadcast = SocketAddr::from((Ipv4Addr::BROADCAST, port));
    let packet = BeaconPacket {
        cfg_checksum: cfg.cfg_checksum,
        node_id: cfg.node_id,
        port: cfg.listen_port,
    }
    .encode();

    let mut interval = tokio::time::interval(Duration::from_millis(cfg.period_ms.max(1)));
    let mut buf = [0u8; BEACON_PACKET_LEN + 1];

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&packet, broadcast).await {
                    tracing::debug!(error = %e, "beacon send failed");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = recv else {
                    continue;
                };
                let Some(heard) = BeaconPacket::decode(&buf[..len]) else {
                    continue;
                };
                if heard.cfg_checksum != cfg.cfg_checksum || heard.node_id == cfg.node_id {
                    continue;
                }
                let SocketAddr::V4(from) = from else {
                    continue;
                };
                let addr = SocketAddrV4::new(*from.ip(), heard.port);
                if discovered.send((heard.node_id, addr)).is_err() {
                    return Ok(());
                }
            }
        }
    }
}
