use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::seq::SeqNum;

pub const FLAG_ALL: u16 = 0x00ff;
pub const FLAG_RLB: u16 = 0x0001; // reliable
pub const FLAG_ACK: u16 = 0x0002; // acknowledgement
pub const FLAG_SYN: u16 = 0x0004; // synchronization
pub const FLAG_RST: u16 = 0x0008; // reset
pub const FLAG_PIN: u16 = 0x0010; // ping
pub const FLAG_PON: u16 = 0x0020; // pong
pub const FLAG_BWP: u16 = 0x0040; // bandwidth poll
pub const FLAG_BWR: u16 = 0x0080; // bandwidth report

/// Sub-opcodes of the bandwidth probe, carried in the high byte of `pflags`.
pub const BW_SUB_FIRST: u16 = 0x0000;
pub const BW_SUB_SECOND: u16 = 0x0100;

/// The fixed 8-byte packet header, little-endian on the wire.
///
/// Control packets (PIN/PON/BWP/BWR) reinterpret the first four bytes - i.e. the
///  space of `seqnum` and `acknum` - as an IEEE-754 f32: a millisecond timestamp
///  for PIN/PON/BWP, the measured bytes-per-second for BWR.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacketHeader {
    pub seqnum: SeqNum,
    pub acknum: SeqNum,
    pub pflags: u16,
    pub length: u16,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 8;

    /// Header for a control packet carrying an f32 value instead of sequence numbers.
    pub fn control(pflags: u16, value: f32, length: u16) -> PacketHeader {
        let bytes = value.to_le_bytes();
        PacketHeader {
            seqnum: SeqNum(u16::from_le_bytes([bytes[0], bytes[1]])),
            acknum: SeqNum(u16::from_le_bytes([bytes[2], bytes[3]])),
            pflags,
            length,
        }
    }

    /// The f32 a control packet carries in its first four bytes.
    pub fn control_value(&self) -> f32 {
        let s = self.seqnum.0.to_le_bytes();
        let a = self.acknum.0.to_le_bytes();
        f32::from_le_bytes([s[0], s[1], a[0], a[1]])
    }

    /// The flag bits (low byte of `pflags`).
    pub fn flags(&self) -> u16 {
        self.pflags & FLAG_ALL
    }

    /// The bandwidth-probe sub-opcode (high byte of `pflags`).
    pub fn bw_sub(&self) -> u16 {
        self.pflags & !FLAG_ALL
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.seqnum.0);
        buf.put_u16_le(self.acknum.0);
        buf.put_u16_le(self.pflags);
        buf.put_u16_le(self.length);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet shorter than header");
        }
        Ok(PacketHeader {
            seqnum: SeqNum(buf.get_u16_le()),
            acknum: SeqNum(buf.get_u16_le()),
            pflags: buf.get_u16_le(),
            length: buf.get_u16_le(),
        })
    }
}
