//! Wire format serialization and deserialization.
//!
//! Every frame is broadcast and starts with the connection channel and a
//! frame kind. Multi-byte integers are big-endian.
//!
//! ## Frame Header
//!
//! ```text
//! channel (2) || kind (1) || body
//! ```
//!
//! ## Announce (kind 0x01)
//!
//! ```text
//! sender (2) || rtmetric (2) || flags (1) || [parent (2)]
//! || control_seqno (1) || function (1)
//!
//! Flags byte:
//! - bit 0: has_parent (determines if parent present)
//! - bit 1: solicit (receivers answer with a proactive announce)
//! - bits 2-7: reserved, must be zero
//! ```
//!
//! ## Unicast (kind 0x02)
//!
//! ```text
//! sender (2) || receiver (2) || attributes (bit-packed, zero padded to a byte)
//! || data body | ack body
//!
//! Attributes, MSB first:
//!   esender (16) | epacket_id (P) | packet_id (P) | ttl (T) | hops (H)
//!   | max_rexmit (R) | packet_type (1, 0 = data, 1 = ack)
//!
//! Data body:  tree_epoch (1) || aggregate_epoch (1) || tag (1) || [partial]
//!   tag 0xFF = keepalive, otherwise the function id of the partial:
//!   sum/min/max: value (4, two's complement)
//!   count:       count (varint)
//!   avg:         sum (8, two's complement) || count (varint)
//!
//! Ack body:   rtmetric (2) || control_seqno (1) || function (1) || flags (1)
//!   bit 0: stale (record belonged to an outdated function epoch)
//! ```
//!
//! ## Flood (kind 0x03)
//!
//! ```text
//! originator (2) || seqno (1) || function (1) || hops (1)
//! ```

use alloc::vec::Vec;

use thiserror::Error;

use crate::aggregate::Partial;
use crate::config::{field_max, NodeConfig};
use crate::types::{Addr, AggregateFunction, KEEPALIVE_TAG};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    #[error("invalid varint")]
    InvalidVarint,
    /// Varints must use the minimal number of bytes.
    #[error("non-canonical varint")]
    NonCanonicalVarint,
    #[error("invalid length or trailing bytes")]
    InvalidLength,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("unknown aggregate function")]
    InvalidFunction,
    #[error("invalid flags")]
    InvalidFlags,
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32_be(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64_be(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read a varint (1-5 bytes for u32) with canonical encoding validation.
    /// Rejects non-minimal encodings (e.g., 0x80 0x00 for 0).
    pub fn read_varint(&mut self) -> Result<u32, DecodeError> {
        let start_pos = self.pos;
        let mut result: u32 = 0;
        let mut shift = 0;
        let mut byte_count = 0;

        loop {
            let byte = self.read_u8()?;
            byte_count += 1;

            if shift == 28 && (byte & 0xF0) != 0 {
                return Err(DecodeError::InvalidVarint);
            }

            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                let minimal_bytes = if result == 0 {
                    1
                } else {
                    let bits_needed = 32 - result.leading_zeros();
                    (bits_needed as usize).div_ceil(7)
                };

                if byte_count > minimal_bytes {
                    self.pos = start_pos;
                    return Err(DecodeError::NonCanonicalVarint);
                }

                return Ok(result);
            }
            shift += 7;
            if shift > 28 {
                return Err(DecodeError::InvalidVarint);
            }
        }
    }

    fn read_function(&mut self) -> Result<AggregateFunction, DecodeError> {
        AggregateFunction::from_id(self.read_u8()?).ok_or(DecodeError::InvalidFunction)
    }
}

/// Writer for encoding frames.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i32_be(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i64_be(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Write a varint (1-5 bytes for u32).
    pub fn write_varint(&mut self, mut v: u32) {
        while v >= 0x80 {
            self.buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// MSB-first bit packer on top of a `Writer`.
struct BitWriter<'w> {
    w: &'w mut Writer,
    acc: u32,
    bits: u32,
}

impl<'w> BitWriter<'w> {
    fn new(w: &'w mut Writer) -> Self {
        Self { w, acc: 0, bits: 0 }
    }

    /// Append the low `width` bits of `value` (width <= 16).
    fn put(&mut self, value: u16, width: u8) {
        let width = u32::from(width);
        let mask = (1u32 << width) - 1;
        self.acc = (self.acc << width) | (u32::from(value) & mask);
        self.bits += width;
        while self.bits >= 8 {
            self.bits -= 8;
            self.w.write_u8((self.acc >> self.bits) as u8);
        }
        self.acc &= (1u32 << self.bits) - 1;
    }

    /// Flush a partial byte, zero padded.
    fn finish(self) {
        if self.bits > 0 {
            self.w.write_u8((self.acc << (8 - self.bits)) as u8);
        }
    }
}

/// MSB-first bit reader on top of a `Reader`.
struct BitReader<'r, 'a> {
    r: &'r mut Reader<'a>,
    acc: u32,
    bits: u32,
}

impl<'r, 'a> BitReader<'r, 'a> {
    fn new(r: &'r mut Reader<'a>) -> Self {
        Self { r, acc: 0, bits: 0 }
    }

    fn take(&mut self, width: u8) -> Result<u16, DecodeError> {
        let width = u32::from(width);
        while self.bits < width {
            self.acc = (self.acc << 8) | u32::from(self.r.read_u8()?);
            self.bits += 8;
        }
        self.bits -= width;
        let value = (self.acc >> self.bits) & ((1u32 << width) - 1);
        self.acc &= (1u32 << self.bits) - 1;
        Ok(value as u16)
    }

    /// Padding bits must be zero.
    fn finish(self) -> Result<(), DecodeError> {
        if self.acc != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(())
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice (strict: rejects trailing bytes).
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let result = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(result)
    }
}

// Frame kind discriminators
const FRAME_ANNOUNCE: u8 = 0x01;
const FRAME_UNICAST: u8 = 0x02;
const FRAME_FLOOD: u8 = 0x03;

const ANNOUNCE_FLAG_HAS_PARENT: u8 = 0x01;
const ANNOUNCE_FLAG_SOLICIT: u8 = 0x02;
const ACK_FLAG_STALE: u8 = 0x01;

/// Bit widths of the packet attributes, fixed per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrWidths {
    pub packet_id: u8,
    pub ttl: u8,
    pub hops: u8,
    pub max_rexmit: u8,
}

impl AttrWidths {
    pub const fn of<Cfg: NodeConfig>() -> Self {
        Self {
            packet_id: Cfg::PACKET_ID_BITS,
            ttl: Cfg::TTL_BITS,
            hops: Cfg::HOPS_BITS,
            max_rexmit: Cfg::MAX_REXMIT_BITS,
        }
    }

    /// Encoded size of the attribute block in bytes.
    pub const fn header_len(&self) -> usize {
        let bits = 16
            + 2 * self.packet_id as usize
            + self.ttl as usize
            + self.hops as usize
            + self.max_rexmit as usize
            + 1;
        bits.div_ceil(8)
    }
}

impl Default for AttrWidths {
    fn default() -> Self {
        Self {
            packet_id: 8,
            ttl: 4,
            hops: 4,
            max_rexmit: 5,
        }
    }
}

/// Periodic cost advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    pub sender: Addr,
    pub rtmetric: u16,
    /// Committed parent of the sender.
    pub parent: Option<Addr>,
    pub solicit: bool,
    pub control_seqno: u8,
    pub function: AggregateFunction,
}

impl Encode for Announce {
    fn encode(&self, w: &mut Writer) {
        w.write_u16_be(self.sender);
        w.write_u16_be(self.rtmetric);
        let mut flags = 0;
        if self.parent.is_some() {
            flags |= ANNOUNCE_FLAG_HAS_PARENT;
        }
        if self.solicit {
            flags |= ANNOUNCE_FLAG_SOLICIT;
        }
        w.write_u8(flags);
        if let Some(parent) = self.parent {
            w.write_u16_be(parent);
        }
        w.write_u8(self.control_seqno);
        w.write_u8(self.function.id());
    }
}

impl Decode for Announce {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let sender = r.read_u16_be()?;
        let rtmetric = r.read_u16_be()?;
        let flags = r.read_u8()?;
        if flags & !(ANNOUNCE_FLAG_HAS_PARENT | ANNOUNCE_FLAG_SOLICIT) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let parent = if flags & ANNOUNCE_FLAG_HAS_PARENT != 0 {
            Some(r.read_u16_be()?)
        } else {
            None
        };
        let control_seqno = r.read_u8()?;
        let function = r.read_function()?;
        Ok(Announce {
            sender,
            rtmetric,
            parent,
            solicit: flags & ANNOUNCE_FLAG_SOLICIT != 0,
            control_seqno,
            function,
        })
    }
}

/// Per-packet attributes of a unicast frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    /// Node that produced the packet.
    pub esender: Addr,
    /// Round counter of the producing node.
    pub epacket_id: u8,
    /// Per-hop packet id matched by acks.
    pub packet_id: u8,
    /// Remaining merge hops for the record.
    pub ttl: u8,
    /// Hops the record has traversed.
    pub hops: u8,
    /// Transmissions left before the sender gives up.
    pub max_rexmit: u8,
}

/// Body of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBody {
    /// Sender's tree epoch (disconnect counter).
    pub tree_epoch: u8,
    /// Aggregate function epoch the record belongs to.
    pub aggregate_epoch: u8,
    /// `None` for keepalives.
    pub contribution: Option<Partial>,
}

impl Encode for DataBody {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.tree_epoch);
        w.write_u8(self.aggregate_epoch);
        match self.contribution {
            None => w.write_u8(KEEPALIVE_TAG),
            Some(partial) => {
                w.write_u8(partial.function().id());
                match partial {
                    Partial::Sum(v) | Partial::Min(v) | Partial::Max(v) => w.write_i32_be(v),
                    Partial::Count(n) => w.write_varint(n),
                    Partial::Avg { sum, count } => {
                        w.write_i64_be(sum);
                        w.write_varint(count);
                    }
                }
            }
        }
    }
}

impl Decode for DataBody {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let tree_epoch = r.read_u8()?;
        let aggregate_epoch = r.read_u8()?;
        let tag = r.read_u8()?;
        let contribution = if tag == KEEPALIVE_TAG {
            None
        } else {
            let function = AggregateFunction::from_id(tag).ok_or(DecodeError::InvalidFunction)?;
            Some(match function {
                AggregateFunction::Sum => Partial::Sum(r.read_i32_be()?),
                AggregateFunction::Min => Partial::Min(r.read_i32_be()?),
                AggregateFunction::Max => Partial::Max(r.read_i32_be()?),
                AggregateFunction::Count => Partial::Count(r.read_varint()?),
                AggregateFunction::Avg => Partial::Avg {
                    sum: r.read_i64_be()?,
                    count: r.read_varint()?,
                },
            })
        };
        Ok(DataBody {
            tree_epoch,
            aggregate_epoch,
            contribution,
        })
    }
}

/// Body of a hop-by-hop acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    /// Acknowledging node's current rtmetric.
    pub rtmetric: u16,
    pub control_seqno: u8,
    pub function: AggregateFunction,
    pub stale: bool,
}

impl Encode for AckBody {
    fn encode(&self, w: &mut Writer) {
        w.write_u16_be(self.rtmetric);
        w.write_u8(self.control_seqno);
        w.write_u8(self.function.id());
        w.write_u8(if self.stale { ACK_FLAG_STALE } else { 0 });
    }
}

impl Decode for AckBody {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let rtmetric = r.read_u16_be()?;
        let control_seqno = r.read_u8()?;
        let function = r.read_function()?;
        let flags = r.read_u8()?;
        if flags & !ACK_FLAG_STALE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(AckBody {
            rtmetric,
            control_seqno,
            function,
            stale: flags & ACK_FLAG_STALE != 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastBody {
    Data(DataBody),
    Ack(AckBody),
}

/// Frame addressed to a single neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unicast {
    pub sender: Addr,
    pub receiver: Addr,
    pub attrs: Attributes,
    pub body: UnicastBody,
}

impl Unicast {
    fn encode(&self, widths: &AttrWidths, w: &mut Writer) {
        w.write_u16_be(self.sender);
        w.write_u16_be(self.receiver);

        let a = &self.attrs;
        let mut bits = BitWriter::new(w);
        bits.put(a.esender, 16);
        bits.put(u16::from(a.epacket_id & field_max(widths.packet_id)), widths.packet_id);
        bits.put(u16::from(a.packet_id & field_max(widths.packet_id)), widths.packet_id);
        bits.put(u16::from(a.ttl & field_max(widths.ttl)), widths.ttl);
        bits.put(u16::from(a.hops & field_max(widths.hops)), widths.hops);
        bits.put(u16::from(a.max_rexmit & field_max(widths.max_rexmit)), widths.max_rexmit);
        bits.put(u16::from(matches!(self.body, UnicastBody::Ack(_))), 1);
        bits.finish();

        match &self.body {
            UnicastBody::Data(data) => data.encode(w),
            UnicastBody::Ack(ack) => ack.encode(w),
        }
    }

    fn decode(widths: &AttrWidths, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let sender = r.read_u16_be()?;
        let receiver = r.read_u16_be()?;

        let mut bits = BitReader::new(r);
        let esender = bits.take(16)?;
        let epacket_id = bits.take(widths.packet_id)? as u8;
        let packet_id = bits.take(widths.packet_id)? as u8;
        let ttl = bits.take(widths.ttl)? as u8;
        let hops = bits.take(widths.hops)? as u8;
        let max_rexmit = bits.take(widths.max_rexmit)? as u8;
        let is_ack = bits.take(1)? == 1;
        bits.finish()?;

        let attrs = Attributes {
            esender,
            epacket_id,
            packet_id,
            ttl,
            hops,
            max_rexmit,
        };
        let body = if is_ack {
            UnicastBody::Ack(AckBody::decode(r)?)
        } else {
            UnicastBody::Data(DataBody::decode(r)?)
        };
        Ok(Unicast {
            sender,
            receiver,
            attrs,
            body,
        })
    }
}

/// Network-wide control flood carrying the aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flood {
    pub originator: Addr,
    pub seqno: u8,
    pub function: AggregateFunction,
    pub hops: u8,
}

impl Encode for Flood {
    fn encode(&self, w: &mut Writer) {
        w.write_u16_be(self.originator);
        w.write_u8(self.seqno);
        w.write_u8(self.function.id());
        w.write_u8(self.hops);
    }
}

impl Decode for Flood {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Flood {
            originator: r.read_u16_be()?,
            seqno: r.read_u8()?,
            function: r.read_function()?,
            hops: r.read_u8()?,
        })
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Announce(Announce),
    Unicast(Unicast),
    Flood(Flood),
}

/// A message stamped with its connection channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub message: Message,
}

impl Frame {
    pub fn encode(&self, widths: &AttrWidths) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u16_be(self.channel);
        match &self.message {
            Message::Announce(a) => {
                w.write_u8(FRAME_ANNOUNCE);
                a.encode(&mut w);
            }
            Message::Unicast(u) => {
                w.write_u8(FRAME_UNICAST);
                u.encode(widths, &mut w);
            }
            Message::Flood(f) => {
                w.write_u8(FRAME_FLOOD);
                f.encode(&mut w);
            }
        }
        w.finish()
    }

    /// Decode a frame (strict: rejects trailing bytes).
    pub fn decode(data: &[u8], widths: &AttrWidths) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let channel = r.read_u16_be()?;
        let message = match r.read_u8()? {
            FRAME_ANNOUNCE => Message::Announce(Announce::decode(&mut r)?),
            FRAME_UNICAST => Message::Unicast(Unicast::decode(widths, &mut r)?),
            FRAME_FLOOD => Message::Flood(Flood::decode(&mut r)?),
            _ => return Err(DecodeError::InvalidMessageType),
        };
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Frame { channel, message })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn data_frame(attrs: Attributes, contribution: Option<Partial>) -> Frame {
        Frame {
            channel: 130,
            message: Message::Unicast(Unicast {
                sender: 4,
                receiver: 1,
                attrs,
                body: UnicastBody::Data(DataBody {
                    tree_epoch: 2,
                    aggregate_epoch: 9,
                    contribution,
                }),
            }),
        }
    }

    #[test]
    fn test_varint_canonical() {
        for &val in &[0u32, 1, 127, 128, 16384, u32::MAX] {
            let mut w = Writer::new();
            w.write_varint(val);
            let encoded = w.finish();
            let mut r = Reader::new(&encoded);
            assert_eq!(r.read_varint(), Ok(val));
            assert!(r.is_empty());
        }

        // 0x80 0x00 is a two-byte encoding of zero
        let mut r = Reader::new(&[0x80, 0x00]);
        assert_eq!(r.read_varint(), Err(DecodeError::NonCanonicalVarint));
    }

    #[test]
    fn test_announce_layout() {
        let frame = Frame {
            channel: 0x0102,
            message: Message::Announce(Announce {
                sender: 7,
                rtmetric: 2,
                parent: Some(3),
                solicit: true,
                control_seqno: 5,
                function: AggregateFunction::Max,
            }),
        };
        let bytes = frame.encode(&AttrWidths::default());
        assert_eq!(bytes, vec![0x01, 0x02, 0x01, 0, 7, 0, 2, 0x03, 0, 3, 5, 4]);
        assert_eq!(Frame::decode(&bytes, &AttrWidths::default()), Ok(frame));
    }

    #[test]
    fn test_attribute_bit_packing() {
        // 16 + 8 + 8 + 4 + 4 + 5 + 1 = 46 bits -> 6 bytes
        let widths = AttrWidths::default();
        assert_eq!(widths.header_len(), 6);

        let attrs = Attributes {
            esender: 0xABCD,
            epacket_id: 0x12,
            packet_id: 0x34,
            ttl: 0xF,
            hops: 0x1,
            max_rexmit: 0b10101,
        };
        let bytes = data_frame(attrs, Some(Partial::Sum(-1))).encode(&widths);
        // channel(2) kind(1) sender(2) receiver(2)
        let header = &bytes[7..13];
        assert_eq!(header, &[0xAB, 0xCD, 0x12, 0x34, 0xF1, 0b1010_1000]);

        let decoded = Frame::decode(&bytes, &widths).unwrap();
        assert_eq!(decoded, data_frame(attrs, Some(Partial::Sum(-1))));
    }

    #[test]
    fn test_narrow_widths_mask_values() {
        let widths = AttrWidths {
            packet_id: 6,
            ttl: 3,
            hops: 3,
            max_rexmit: 4,
        };
        let attrs = Attributes {
            esender: 9,
            epacket_id: 0xFF,
            packet_id: 0x41,
            ttl: 5,
            hops: 2,
            max_rexmit: 3,
        };
        let bytes = data_frame(attrs, None).encode(&widths);
        let Message::Unicast(u) = Frame::decode(&bytes, &widths).unwrap().message else {
            panic!("expected unicast");
        };
        assert_eq!(u.attrs.epacket_id, 0x3F);
        assert_eq!(u.attrs.packet_id, 0x01);
        assert_eq!(u.attrs.ttl, 5);
        assert_eq!(u.attrs.max_rexmit, 3);
    }

    #[test]
    fn test_partial_payloads() {
        let widths = AttrWidths::default();
        for partial in [
            Partial::Sum(i32::MIN),
            Partial::Count(300),
            Partial::Avg {
                sum: -5_000_000_000,
                count: 3,
            },
            Partial::Min(-7),
            Partial::Max(9),
        ] {
            let frame = data_frame(Attributes::default(), Some(partial));
            assert_eq!(Frame::decode(&frame.encode(&widths), &widths), Ok(frame));
        }

        let keepalive = data_frame(Attributes::default(), None);
        let bytes = keepalive.encode(&widths);
        assert_eq!(bytes[bytes.len() - 1], KEEPALIVE_TAG);
        assert_eq!(Frame::decode(&bytes, &widths), Ok(keepalive));
    }

    #[test]
    fn test_ack_stale_flag() {
        let widths = AttrWidths::default();
        let frame = Frame {
            channel: 130,
            message: Message::Unicast(Unicast {
                sender: 1,
                receiver: 4,
                attrs: Attributes {
                    esender: 1,
                    packet_id: 17,
                    ..Attributes::default()
                },
                body: UnicastBody::Ack(AckBody {
                    rtmetric: 0,
                    control_seqno: 3,
                    function: AggregateFunction::Avg,
                    stale: true,
                }),
            }),
        };
        let bytes = frame.encode(&widths);
        assert_eq!(bytes[bytes.len() - 1], ACK_FLAG_STALE);
        assert_eq!(Frame::decode(&bytes, &widths), Ok(frame));
    }

    #[test]
    fn test_reject_malformed() {
        let widths = AttrWidths::default();
        assert_eq!(Frame::decode(&[], &widths), Err(DecodeError::UnexpectedEof));
        assert_eq!(
            Frame::decode(&[0, 1, 0x09], &widths),
            Err(DecodeError::InvalidMessageType)
        );

        let flood = Frame {
            channel: 1,
            message: Message::Flood(Flood {
                originator: 1,
                seqno: 4,
                function: AggregateFunction::Count,
                hops: 0,
            }),
        };
        let mut bytes = flood.encode(&widths);
        assert_eq!(Frame::decode(&bytes, &widths), Ok(flood));

        bytes.push(0);
        assert_eq!(Frame::decode(&bytes, &widths), Err(DecodeError::InvalidLength));

        // function id 7 does not exist
        let bad = [0, 1, FRAME_FLOOD, 0, 1, 4, 7, 0];
        assert_eq!(Frame::decode(&bad, &widths), Err(DecodeError::InvalidFunction));

        // reserved announce flag bits
        let bad = [0, 1, FRAME_ANNOUNCE, 0, 1, 0, 0, 0x80, 0, 0];
        assert_eq!(Frame::decode(&bad, &widths), Err(DecodeError::InvalidFlags));
    }
}
