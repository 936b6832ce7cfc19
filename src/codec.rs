use crate::i2np::{I2npMessage, I2npMessageKind};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::warn;

/// Protocol id of streaming payloads inside a data message.
pub const PROTOCOL_STREAMING: u8 = 6;

/// The source and destination ports and the protocol id are stuffed into the gzip header
///  of the compressed block: the ports into the four MTIME bytes, the protocol id into
///  the OS byte. Decompressors ignore both fields, so the bytes ride along for free.
const GZIP_PORTS_OFFSET: usize = 4;
const GZIP_PROTOCOL_OFFSET: usize = 9;

/// Wraps a streaming packet into a data message: deflate at the minimum level, prefixed
///  with the compressed length.
pub fn create_data_message(packet_buf: &[u8]) -> anyhow::Result<I2npMessage> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::none());
    encoder.write_all(packet_buf)?;
    let mut compressed = encoder.finish()?;

    // TODO fill in the source and destination ports once the socket API surfaces them
    compressed[GZIP_PORTS_OFFSET..GZIP_PORTS_OFFSET + 4].fill(0);
    compressed[GZIP_PROTOCOL_OFFSET] = PROTOCOL_STREAMING;

    let mut buf = BytesMut::with_capacity(4 + compressed.len());
    buf.put_u32(compressed.len() as u32);
    buf.put_slice(&compressed);
    Ok(I2npMessage::new(I2npMessageKind::Data, buf.to_vec()))
}

/// Unwraps an inbound data message into a streaming packet. Payloads that inflate beyond
///  `MAX_PACKET_SIZE` are clamped, not rejected.
pub fn parse_data_message(buf: &[u8]) -> anyhow::Result<Packet> {
    if buf.len() < 4 {
        bail!("data message of {} bytes is too short for the length prefix", buf.len());
    }
    let declared = u32::from_be_bytes(buf[..4].try_into()?) as usize;
    let data = &buf[4..];
    if data.len() < declared {
        bail!("data message declares {} bytes but carries only {}", declared, data.len());
    }
    let data = &data[..declared];

    if data.len() <= GZIP_PROTOCOL_OFFSET {
        bail!("compressed block of {} bytes is too short", data.len());
    }
    if data[GZIP_PROTOCOL_OFFSET] != PROTOCOL_STREAMING {
        bail!("payload protocol {} is not supported", data[GZIP_PROTOCOL_OFFSET]);
    }

    let mut decompressed = Vec::new();
    GzDecoder::new(data)
        .take(MAX_PACKET_SIZE as u64 + 1)
        .read_to_end(&mut decompressed)?;
    if decompressed.len() > MAX_PACKET_SIZE {
        warn!("inbound packet exceeds the maximum packet size - clamping to {}", MAX_PACKET_SIZE);
        decompressed.truncate(MAX_PACKET_SIZE);
    }

    Packet::from_buf(decompressed)
}
