//! Wire-level messages, the payload units carried inside packets.

use bytes::{Bytes, BytesMut};

use crate::{
    bits::{BitReader, BitWriter, BitsError},
    lane::LaneIndex,
    seq::Seq,
};

/// Bits taken by a message header on the wire, before its payload.
pub const MSG_HEADER_BITS: usize = 16 + 8 + 8 + 16;

/// What a message's payload means to the engine.
///
/// The wire field is a full byte for forward compatibility; values outside
/// the known set are rejected at decode time and the datagram is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Opaque application payload, handed to the host as-is.
    ByteArray = 0,
    /// One slice of an application payload too large for a single packet.
    ///
    /// Chunks ride the reliable ordered lane, so they arrive in order; the
    /// receiver accumulates them and delivers the rebuilt payload as a single
    /// [`MessageKind::ByteArray`]. Payload layout: chunk index, chunk count,
    /// then the slice.
    Chunk = 1,
    /// The server accepted this connection. Empty payload.
    Accepted = 2,
    /// The peer closed the connection on purpose. Payload is a close code.
    Close = 3,
}

impl MessageKind {
    /// Maps a wire byte back to a kind.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ByteArray),
            1 => Some(Self::Chunk),
            2 => Some(Self::Accepted),
            3 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Error when decoding a [`Message`] out of a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Packet payload ended in the middle of a message.
    #[error("message truncated")]
    Truncated,
    /// Wire kind byte is not a known [`MessageKind`].
    #[error("unknown message kind `{0}`")]
    UnknownKind(u8),
    /// Declared payload length exceeds what this endpoint accepts.
    #[error("message length {len} over limit {max}")]
    TooLong {
        /// Length declared on the wire.
        len: usize,
        /// Most this endpoint accepts.
        max: usize,
    },
}

impl From<BitsError> for MessageError {
    fn from(_: BitsError) -> Self {
        Self::Truncated
    }
}

/// One message as it travels inside a packet: a sequence number and lane for
/// delivery bookkeeping, a kind tag, and the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sequence number within the sending lane.
    pub seq: Seq,
    /// Lane this message belongs to.
    pub lane: LaneIndex,
    /// Payload interpretation.
    pub kind: MessageKind,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Bits this message occupies on the wire.
    #[must_use]
    pub const fn encode_bits(&self) -> usize {
        MSG_HEADER_BITS + self.payload.len() * 8
    }

    /// Writes this message through the bit cursor.
    pub fn encode(&self, w: &mut BitWriter) {
        w.write_bits(u32::from(self.seq.0), 16);
        w.write_bits(u32::from(self.lane.into_raw()), 8);
        w.write_bits(u32::from(self.kind as u8), 8);
        #[expect(clippy::cast_possible_truncation, reason = "length is validated at send")]
        w.write_bits(self.payload.len() as u32, 16);
        w.write_bytes(&self.payload);
    }

    /// Reads one message off the bit cursor, accepting payloads up to
    /// `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Errors if the input ends mid-message, declares an over-long payload,
    /// or carries an unknown kind byte.
    pub fn decode(r: &mut BitReader, max_len: usize) -> Result<Self, MessageError> {
        #[expect(clippy::cast_possible_truncation, reason = "16-bit read")]
        let seq = Seq(r.read_bits(16)? as u16);
        #[expect(clippy::cast_possible_truncation, reason = "8-bit read")]
        let lane = LaneIndex::new(r.read_bits(8)? as u8);
        #[expect(clippy::cast_possible_truncation, reason = "8-bit read")]
        let raw_kind = r.read_bits(8)? as u8;
        let kind = MessageKind::from_u8(raw_kind).ok_or(MessageError::UnknownKind(raw_kind))?;
        let len = r.read_bits(16)? as usize;
        if len > max_len {
            return Err(MessageError::TooLong { len, max: max_len });
        }
        let mut payload = Vec::new();
        r.read_bytes(len, &mut payload)?;
        Ok(Self {
            seq,
            lane,
            kind,
            payload: Bytes::from(payload),
        })
    }
}

/// Builds the payload of one [`MessageKind::Chunk`] message.
pub(crate) fn chunk_payload(index: u8, total: u8, slice: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + slice.len());
    buf.extend_from_slice(&[index, total]);
    buf.extend_from_slice(slice);
    buf.freeze()
}

/// Splits a [`MessageKind::Chunk`] payload into its header and slice.
pub(crate) fn split_chunk(payload: &Bytes) -> Option<(u8, u8, Bytes)> {
    if payload.len() < 2 {
        return None;
    }
    Some((payload[0], payload[1], payload.slice(2..)))
}
