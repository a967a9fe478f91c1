//! Wire format of the four packet kinds. All numbers are in network byte order (BE).
//!
//! Every packet starts with the same header:
//!
//! ```ascii
//!  0: signature (u8) - identifies the packet kind, see below
//!  1: sender id (1 byte length + 20 bytes, see [PeerId])
//! 22: receiver id (1 byte length + 20 bytes)
//! 43: message id (u64)
//! 51: kind specific fields
//! ```
//!
//! *DATA* (signature 0x01) - 67 bytes + payload, at most 1200 bytes
//! ```ascii
//! 51: chunk index (u32)
//! 55: total chunks (u32)
//! 59: payload length (u32)
//! 63: CRC32 of the payload (u32, CRC-32/ISO-HDLC)
//! 67: payload (0..=1133 bytes)
//! ```
//!
//! *ACK* (signature 0x02) - 61 bytes
//! ```ascii
//! 51: highest consecutive chunk index (u16) - all chunks up to and including this index were
//!      received. 0xFFFF means that chunk 0 was not received yet.
//! 53: selective ACK bitmap (u64) - bit i (LSB = bit 0) reports receipt of chunk
//!      `highest consecutive + 1 + i`
//! ```
//!
//! *NACK* (signature 0x03) - 55 + 4 * n bytes
//! ```ascii
//! 51: number of missing chunk indices (u32)
//! 55: (repeated) missing chunk index (u32)
//! ```
//!
//! *FIN* (signature 0x04) - 51 bytes, no kind specific fields

use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use crate::message_id::MessageId;
use crate::peer_id::PeerId;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const MAX_PACKET_LEN: usize = 1200;
pub const MAX_CHUNK_PAYLOAD: usize = MAX_PACKET_LEN - DataPacket::HEADER_LEN;
/// The ACK's cumulative field is 16 bits wide, and its all-ones value is reserved for 'nothing
///  received yet', so chunk indices must stay below 0xFFFF
pub const MAX_TOTAL_CHUNKS: u32 = AckPacket::NONE_RECEIVED as u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("unknown packet signature 0x{0:02x}")]
    UnknownSignature(u8),
    /// The packet is syntactically valid, but its payload does not match the checksum. The
    ///  decoded packet is provided so callers can still use the header fields.
    #[error("checksum mismatch for chunk #{} of message {:?}", .0.chunk_index, .0.header.message_id)]
    ChecksumMismatch(Box<DataPacket>),
    #[error("chunk payload of {0} bytes exceeds the maximum of {max} bytes", max = MAX_CHUNK_PAYLOAD)]
    PayloadTooLarge(usize),
}
impl From<TryGetError> for PacketError {
    fn from(value: TryGetError) -> Self {
        PacketError::Malformed(format!("packet too short: {}", value))
    }
}


impl From<TryFromPrimitiveError<PacketKind>> for PacketError {
    fn from(value: TryFromPrimitiveError<PacketKind>) -> Self {
        PacketError::UnknownSignature(value.number)
    }
}


/// the signature byte at the start of every packet
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    Data = 0x01,
    Ack = 0x02,
    Nack = 0x03,
    Fin = 0x04,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub sender: PeerId,
    pub receiver: PeerId,
    pub message_id: MessageId,
}
impl PacketHeader {
    /// including the signature byte
    pub const SERIALIZED_LEN: usize = 1 + 2*PeerId::SERIALIZED_LEN + size_of::<u64>();

    pub fn new(sender: PeerId, receiver: PeerId, message_id: MessageId) -> PacketHeader {
        PacketHeader { sender, receiver, message_id }
    }

    /// The header for packets flowing in the opposite direction of the same transfer
    pub fn reversed(&self) -> PacketHeader {
        PacketHeader {
            sender: self.receiver,
            receiver: self.sender,
            message_id: self.message_id,
        }
    }

    fn ser(&self, kind: PacketKind, buf: &mut BytesMut) {
        buf.put_u8(kind.into());
        self.sender.ser(buf);
        self.receiver.ser(buf);
        buf.put_u64(self.message_id.0);
    }

    /// NB: the signature was consumed by the caller
    fn deser(buf: &mut impl Buf) -> Result<PacketHeader, PacketError> {
        let sender = PeerId::deser(buf)?;
        let receiver = PeerId::deser(buf)?;
        let message_id = MessageId(buf.try_get_u64()?);
        Ok(PacketHeader { sender, receiver, message_id })
    }
}


#[derive(Clone, Eq, PartialEq)]
pub struct DataPacket {
    pub header: PacketHeader,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub crc32: u32,
    pub payload: Bytes,
}
impl Debug for DataPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DATA{{{:?}->{:?} {:?} #{}/{} len={} crc={:08x}}}",
               self.header.sender, self.header.receiver, self.header.message_id,
               self.chunk_index, self.total_chunks, self.payload.len(), self.crc32)
    }
}
impl DataPacket {
    pub const HEADER_LEN: usize = PacketHeader::SERIALIZED_LEN + 4*size_of::<u32>();

    pub fn is_intact(&self) -> bool {
        checksum(&self.payload) == self.crc32
    }

    pub fn is_last(&self) -> bool {
        self.total_chunks.checked_sub(1) == Some(self.chunk_index)
    }

    fn deser(header: PacketHeader, buf: &mut impl Buf) -> Result<DataPacket, PacketError> {
        let chunk_index = buf.try_get_u32()?;
        let total_chunks = buf.try_get_u32()?;
        let payload_len = buf.try_get_u32()?;
        let crc32 = buf.try_get_u32()?;

        if total_chunks == 0 || total_chunks > MAX_TOTAL_CHUNKS {
            return Err(PacketError::Malformed(format!("total chunks {} outside of 1..={}", total_chunks, MAX_TOTAL_CHUNKS)));
        }
        // NB: we compare against the actual buffer rather than trusting the length field
        if payload_len.safe_cast() != buf.remaining() {
            return Err(PacketError::Malformed(format!("declared payload length {} does not match the remaining {} bytes", payload_len, buf.remaining())));
        }
        if buf.remaining() > MAX_CHUNK_PAYLOAD {
            return Err(PacketError::Malformed(format!("payload length {} exceeds the maximum of {}", buf.remaining(), MAX_CHUNK_PAYLOAD)));
        }

        let payload = buf.copy_to_bytes(buf.remaining());
        let packet = DataPacket { header, chunk_index, total_chunks, crc32, payload };
        if !packet.is_intact() {
            return Err(PacketError::ChecksumMismatch(Box::new(packet)));
        }
        Ok(packet)
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckPacket {
    pub header: PacketHeader,
    /// `None` if chunk 0 was not received yet
    pub highest_consecutive: Option<u16>,
    pub bitmap: u64,
}
impl AckPacket {
    pub const SERIALIZED_LEN: usize = PacketHeader::SERIALIZED_LEN + size_of::<u16>() + size_of::<u64>();
    pub const NONE_RECEIVED: u16 = u16::MAX;
    pub const WINDOW_LEN: u32 = u64::BITS;

    /// the chunk index that corresponds to bit 0 of the bitmap
    pub fn window_start(&self) -> u32 {
        self.highest_consecutive
            .map(|h| h.safe_cast() + 1)
            .unwrap_or(0)
    }

    pub fn is_selectively_acked(&self, bit: u32) -> bool {
        bit < Self::WINDOW_LEN && self.bitmap & (1 << bit) != 0
    }

    /// The chunk indices acknowledged through the bitmap, ascending
    pub fn selectively_acked(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::WINDOW_LEN)
            .filter(|&bit| self.is_selectively_acked(bit))
            .map(|bit| self.window_start() + bit)
    }

    /// The highest chunk index this ACK reports as received, either cumulatively or through
    ///  the bitmap
    pub fn highest_covered(&self) -> Option<u32> {
        if self.bitmap != 0 {
            Some(self.window_start() + (Self::WINDOW_LEN - 1 - self.bitmap.leading_zeros()))
        }
        else {
            self.highest_consecutive.map(|h| h.safe_cast())
        }
    }

    fn deser(header: PacketHeader, buf: &mut impl Buf) -> Result<AckPacket, PacketError> {
        let raw_highest_consecutive = buf.try_get_u16()?;
        let bitmap = buf.try_get_u64()?;
        let highest_consecutive = if raw_highest_consecutive == Self::NONE_RECEIVED {
            None
        }
        else {
            Some(raw_highest_consecutive)
        };
        Ok(AckPacket { header, highest_consecutive, bitmap })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NackPacket {
    pub header: PacketHeader,
    pub missing: Vec<u32>,
}
impl NackPacket {
    pub const fn serialized_len(num_missing: usize) -> usize {
        PacketHeader::SERIALIZED_LEN + size_of::<u32>() + num_missing * size_of::<u32>()
    }

    /// the largest number of indices that fit into a single NACK packet
    pub const MAX_ENTRIES: usize = (MAX_PACKET_LEN - Self::serialized_len(0)) / size_of::<u32>();

    fn deser(header: PacketHeader, buf: &mut impl Buf) -> Result<NackPacket, PacketError> {
        let num_missing = buf.try_get_u32()?.safe_cast();
        // the count is checked against the actual data before allocating
        if num_missing.checked_mul(size_of::<u32>()) != Some(buf.remaining()) {
            return Err(PacketError::Malformed(format!("NACK announces {} indices, but {} bytes remain", num_missing, buf.remaining())));
        }

        let mut missing = Vec::with_capacity(num_missing);
        for _ in 0..num_missing {
            missing.push(buf.try_get_u32()?);
        }
        Ok(NackPacket { header, missing })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FinPacket {
    pub header: PacketHeader,
}
impl FinPacket {
    pub const SERIALIZED_LEN: usize = PacketHeader::SERIALIZED_LEN;
}


/// A decoded packet - one variant per packet kind
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Data(DataPacket),
    Ack(AckPacket),
    Nack(NackPacket),
    Fin(FinPacket),
}
impl Packet {
    pub fn header(&self) -> &PacketHeader {
        match self {
            Packet::Data(p) => &p.header,
            Packet::Ack(p) => &p.header,
            Packet::Nack(p) => &p.header,
            Packet::Fin(p) => &p.header,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Data(_) => PacketKind::Data,
            Packet::Ack(_) => PacketKind::Ack,
            Packet::Nack(_) => PacketKind::Nack,
            Packet::Fin(_) => PacketKind::Fin,
        }
    }
}


pub fn encode_data_chunk(header: &PacketHeader, chunk_index: u32, total_chunks: u32, payload: &[u8]) -> Result<Bytes, PacketError> {
    if payload.len() > MAX_CHUNK_PAYLOAD {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(DataPacket::HEADER_LEN + payload.len());
    header.ser(PacketKind::Data, &mut buf);
    buf.put_u32(chunk_index);
    buf.put_u32(total_chunks);
    buf.put_u32(payload.len().prechecked_cast());
    buf.put_u32(checksum(payload));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

pub fn encode_ack(header: &PacketHeader, highest_consecutive: Option<u16>, bitmap: u64) -> Bytes {
    debug_assert_ne!(highest_consecutive, Some(AckPacket::NONE_RECEIVED));

    let mut buf = BytesMut::with_capacity(AckPacket::SERIALIZED_LEN);
    header.ser(PacketKind::Ack, &mut buf);
    buf.put_u16(highest_consecutive.unwrap_or(AckPacket::NONE_RECEIVED));
    buf.put_u64(bitmap);
    buf.freeze()
}

pub fn encode_nack(header: &PacketHeader, missing: &[u32]) -> Bytes {
    debug_assert!(missing.len() <= NackPacket::MAX_ENTRIES);

    let mut buf = BytesMut::with_capacity(NackPacket::serialized_len(missing.len()));
    header.ser(PacketKind::Nack, &mut buf);
    buf.put_u32(missing.len().prechecked_cast());
    for &index in missing {
        buf.put_u32(index);
    }
    buf.freeze()
}

pub fn encode_fin(header: &PacketHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(FinPacket::SERIALIZED_LEN);
    header.ser(PacketKind::Fin, &mut buf);
    buf.freeze()
}

/// Decodes a datagram. The signature is inspected before anything else, and no length field is
///  trusted beyond the actual size of the buffer.
pub fn decode(mut buf: &[u8]) -> Result<Packet, PacketError> {
    let signature = buf.try_get_u8()
        .map_err(|_| PacketError::Malformed("empty datagram".to_string()))?;
    let kind = PacketKind::try_from_primitive(signature)?;

    if buf.remaining() > MAX_PACKET_LEN - 1 {
        return Err(PacketError::Malformed(format!("packet length {} exceeds the maximum of {}", buf.remaining() + 1, MAX_PACKET_LEN)));
    }

    let header = PacketHeader::deser(&mut buf)?;
    let packet = match kind {
        PacketKind::Data => Packet::Data(DataPacket::deser(header, &mut buf)?),
        PacketKind::Ack => Packet::Ack(AckPacket::deser(header, &mut buf)?),
        PacketKind::Nack => Packet::Nack(NackPacket::deser(header, &mut buf)?),
        PacketKind::Fin => Packet::Fin(FinPacket { header }),
    };

    if buf.has_remaining() {
        return Err(PacketError::Malformed(format!("{} trailing bytes after {:?} packet", buf.remaining(), kind)));
    }
    Ok(packet)
}
