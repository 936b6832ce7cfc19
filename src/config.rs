use crate::identity::Identity;
use crate::packet::{PACKET_HEADER_LEN, SIGNATURE_LEN, STREAMING_MTU};
use anyhow::bail;
use std::path::PathBuf;

pub struct StreamingConfig {
    /// Maximum size of an outbound streaming packet, header and options included. This is
    ///  what gets advertised in the MAX_PACKET_SIZE option of a SYN packet.
    ///
    /// The value must leave room for the SYN option block (identity, advertised MTU and
    ///  signature) plus at least some payload - `validate` enforces that.
    pub streaming_mtu: usize,

    /// Number of hops for the tunnel pool that is created per local destination.
    pub tunnel_hop_count: usize,

    /// Directory scanned for persisted destination key files on startup.
    pub data_dir: PathBuf,

    /// Extension of key files inside `data_dir`. Each matching file holds one serialized
    ///  `PrivateKeys` blob.
    pub keys_file_extension: String,
}

impl StreamingConfig {
    pub fn new(data_dir: PathBuf) -> StreamingConfig {
        StreamingConfig {
            streaming_mtu: STREAMING_MTU,
            tunnel_hop_count: 3,
            data_dir,
            keys_file_extension: "dat".to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let syn_overhead = PACKET_HEADER_LEN + Identity::SERIALIZED_LEN + 2 + SIGNATURE_LEN;
        if self.streaming_mtu <= syn_overhead {
            bail!("streaming MTU of {} cannot hold a SYN packet ({} bytes of header and options)", self.streaming_mtu, syn_overhead);
        }
        if self.streaming_mtu > crate::packet::MAX_PACKET_SIZE || self.streaming_mtu > u16::MAX as usize {
            bail!("streaming MTU of {} cannot be advertised on the wire", self.streaming_mtu);
        }
        if self.tunnel_hop_count == 0 {
            bail!("tunnel hop count must be at least 1");
        }
        Ok(())
    }
}
