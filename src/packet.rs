use anyhow::bail;
use bytes::{BufMut, BytesMut};
use std::fmt::{Debug, Formatter};

/// Advertised maximum size of an outbound packet, header included.
pub const STREAMING_MTU: usize = 1730;
/// Hard upper bound for an inbound packet after decompression.
pub const MAX_PACKET_SIZE: usize = 4096;
/// DSA signatures on the wire are raw `r || s`, 20 bytes each.
pub const SIGNATURE_LEN: usize = 40;
/// Fixed part of the packet header, without NACK entries.
pub const PACKET_HEADER_LEN: usize = 22;

pub const FLAG_SYNCHRONIZE: u16 = 0x0001;
pub const FLAG_CLOSE: u16 = 0x0002;
pub const FLAG_SIGNATURE_INCLUDED: u16 = 0x0004;
pub const FLAG_FROM_INCLUDED: u16 = 0x0008;
pub const FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x0080;
pub const FLAG_NO_ACK: u16 = 0x4000;

const KNOWN_FLAGS: u16 = FLAG_SYNCHRONIZE
    | FLAG_CLOSE
    | FLAG_SIGNATURE_INCLUDED
    | FLAG_FROM_INCLUDED
    | FLAG_MAX_PACKET_SIZE_INCLUDED
    | FLAG_NO_ACK;

/// View over one on-wire streaming packet.
///
/// The packet owns its buffer; all field accessors read directly from it. A mutable
///  `cursor` tracks how much of the payload has been consumed by the application, so
///  partially read packets can stay at the head of a receive queue without the buffer
///  being shifted around.
pub struct Packet {
    buf: Vec<u8>,
    option_offset: usize,
    option_size: usize,
    payload_offset: usize,
    cursor: usize,
}

impl Packet {
    /// Validates the structural invariants once so the accessors can index unchecked:
    ///  the fixed header and all NACK entries must be present, the option block must lie
    ///  within the buffer, and no unknown flag may be set - an unknown flag could carry
    ///  options of unknown size, making the rest of the packet unparseable.
    pub fn from_buf(buf: Vec<u8>) -> anyhow::Result<Packet> {
        if buf.len() < PACKET_HEADER_LEN {
            bail!("packet of {} bytes is shorter than the fixed header", buf.len());
        }
        let nack_area = 4 * buf[16] as usize;
        if buf.len() < PACKET_HEADER_LEN + nack_area {
            bail!("packet of {} bytes truncates its {} NACK entries", buf.len(), buf[16]);
        }

        let flags = read_u16(&buf, 18 + nack_area);
        if flags & !KNOWN_FLAGS != 0 {
            bail!("packet carries unknown flags {:#06x}", flags & !KNOWN_FLAGS);
        }

        let option_offset = PACKET_HEADER_LEN + nack_area;
        let option_size = read_u16(&buf, 20 + nack_area) as usize;
        if buf.len() < option_offset + option_size {
            bail!("packet of {} bytes truncates its {}-byte option block", buf.len(), option_size);
        }

        let payload_offset = option_offset + option_size;
        Ok(Packet {
            buf,
            option_offset,
            option_size,
            payload_offset,
            cursor: 0,
        })
    }

    /// The recipient's stream id, i.e. the `recv_stream_id` of the stream this packet is for.
    pub fn send_stream_id(&self) -> u32 {
        read_u32(&self.buf, 0)
    }

    /// The sender's stream id; the recipient echoes it back as its `send_stream_id`.
    pub fn recv_stream_id(&self) -> u32 {
        read_u32(&self.buf, 4)
    }

    pub fn seqn(&self) -> u32 {
        read_u32(&self.buf, 8)
    }

    pub fn ack_through(&self) -> u32 {
        read_u32(&self.buf, 12)
    }

    pub fn nack_count(&self) -> u8 {
        self.buf[16]
    }

    pub fn resend_delay(&self) -> u8 {
        self.buf[17 + 4 * self.nack_count() as usize]
    }

    pub fn flags(&self) -> u16 {
        read_u16(&self.buf, 18 + 4 * self.nack_count() as usize)
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYNCHRONIZE != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags() & FLAG_CLOSE != 0
    }

    pub fn is_signature_included(&self) -> bool {
        self.flags() & FLAG_SIGNATURE_INCLUDED != 0
    }

    pub fn is_from_included(&self) -> bool {
        self.flags() & FLAG_FROM_INCLUDED != 0
    }

    pub fn is_max_packet_size_included(&self) -> bool {
        self.flags() & FLAG_MAX_PACKET_SIZE_INCLUDED != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags() & FLAG_NO_ACK != 0
    }

    /// Offset of the option block inside the raw buffer.
    pub fn option_offset(&self) -> usize {
        self.option_offset
    }

    pub fn options(&self) -> &[u8] {
        &self.buf[self.option_offset..self.option_offset + self.option_size]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset..]
    }

    /// The part of the payload not yet consumed through `advance`.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.payload_offset + self.cursor..]
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.cursor + n <= self.buf.len() - self.payload_offset);
        self.cursor += n;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("send_stream_id", &self.send_stream_id())
            .field("recv_stream_id", &self.recv_stream_id())
            .field("seqn", &self.seqn())
            .field("ack_through", &self.ack_through())
            .field("flags", &format_args!("{:#06x}", self.flags()))
            .field("option_size", &self.option_size)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Fixed header of an outbound packet. NACK entries are never emitted, so the NACK count
///  and resend delay bytes are always written as zero.
pub struct PacketHeader {
    pub send_stream_id: u32,
    pub recv_stream_id: u32,
    pub seqn: u32,
    pub ack_through: u32,
    pub flags: u16,
    pub option_size: u16,
}

impl PacketHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.send_stream_id);
        buf.put_u32(self.recv_stream_id);
        buf.put_u32(self.seqn);
        buf.put_u32(self.ack_through);
        buf.put_u8(0); // NACK count
        buf.put_u8(0); // resend delay
        buf.put_u16(self.flags);
        buf.put_u16(self.option_size);
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(
        buf[offset..offset + 4]
            .try_into()
            .expect("offset validated at construction"),
    )
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(
        buf[offset..offset + 2]
            .try_into()
            .expect("offset validated at construction"),
    )
}
