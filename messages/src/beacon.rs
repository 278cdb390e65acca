//! LAN discovery beacon packet.
//!
//! Fixed layout, exactly 66 bytes:
//! `cfg_checksum(32) || node_id(32) || port(2, network byte order)`.
//! Anything of a different length or with a foreign checksum is ignored.

use shroud_types::{BlockHash, PeerId};

/// Exact on-wire size of a beacon packet.
pub const BEACON_PACKET_LEN: usize = 66;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconPacket {
    pub cfg_checksum: BlockHash,
    pub node_id: PeerId,
    pub port: u16,
}

impl BeaconPacket {
    pub fn encode(&self) -> [u8; BEACON_PACKET_LEN] {
        let mut out = [0u8; BEACON_PACKET_LEN];
        out[..32].copy_from_slice(self.cfg_checksum.as_bytes());
        out[32..64].copy_from_slice(self.node_id.as_bytes());
        out[64..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Decode a packet. Returns `None` unless the length is exactly
    /// [`BEACON_PACKET_LEN`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BEACON_PACKET_LEN {
            return None;
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[..32]);
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes[32..64]);
        let port = u16::from_be_bytes(bytes[64..].try_into().expect("2 bytes"));
        Some(Self {
            cfg_checksum: BlockHash::new(checksum),
            node_id: PeerId::new(id),
            port,
        })
    }
}
