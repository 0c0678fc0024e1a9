//! Packet framing: the on-the-wire unit, one per datagram.
//!
//! Layout, bit by bit:
//!
//! ```text
//! offset  bits  field
//! 0       32    protocol id
//! 32      16    packet sequence
//! 48      16    newest peer packet sequence received (ack)
//! 64      32    ack history bitfield
//! 96      1     keepalive flag; if set, nothing follows
//! 97      8     message count
//! ...           messages
//! ...     0..7  zero padding to the next byte boundary
//! ```

use std::borrow::Cow;

use crate::{
    ack::Acknowledge,
    bits::{BitReader, BitWriter},
    msg::{Message, MessageError},
    protocol::ProtocolId,
    seq::Seq,
};

/// Bits of a packet header up to and including the keepalive flag.
pub const HEADER_BITS: usize = 32 + 16 + 16 + 32 + 1;

/// Bits of a packet header that carries messages, including the count field.
pub const DATA_HEADER_BITS: usize = HEADER_BITS + 8;

/// Most messages one packet can carry, as bounded by the count field.
pub const MAX_MESSAGES_PER_PACKET: usize = 255;

/// Error when parsing a datagram as a packet.
///
/// Safe to ignore: the datagram is dropped and the connection carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Datagram is too short to hold a packet header.
    #[error("malformed header")]
    Malformed,
    /// Datagram belongs to a different protocol.
    #[error("protocol id mismatch: expected {expected:?}, got {got:?}")]
    ProtocolMismatch {
        /// Our protocol id.
        expected: ProtocolId,
        /// The id the datagram carried.
        got: ProtocolId,
    },
    /// A message inside the payload could not be decoded.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Reads the protocol id off the front of a datagram without any further
/// parsing, so foreign datagrams are cheap to reject.
#[must_use]
pub fn read_protocol_id(datagram: &[u8]) -> Option<ProtocolId> {
    BitReader::new(datagram)
        .read_bits(32)
        .ok()
        .map(ProtocolId)
}

/// Header fields of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol this packet belongs to.
    pub protocol: ProtocolId,
    /// Per-connection sequence number of this packet.
    pub seq: Seq,
    /// Receipt history piggybacked for the peer.
    pub acks: Acknowledge,
}

/// Assembles one outgoing packet: header first, then messages until full.
#[derive(Debug)]
pub struct PacketWriter {
    header: PacketHeader,
    mtu_bits: usize,
    used_bits: usize,
    msgs: Vec<Message>,
}

impl PacketWriter {
    /// Starts a packet with the given header, bounded by `mtu` bytes.
    #[must_use]
    pub const fn new(header: PacketHeader, mtu: usize) -> Self {
        Self {
            header,
            mtu_bits: mtu * 8,
            used_bits: DATA_HEADER_BITS,
            msgs: Vec::new(),
        }
    }

    /// Appends a message if it fits; a message that would push the sealed
    /// packet over the MTU is refused and left for the next packet.
    pub fn push(&mut self, message: &Message) -> bool {
        let bits = message.encode_bits();
        if self.used_bits + bits > self.mtu_bits || self.msgs.len() >= MAX_MESSAGES_PER_PACKET {
            return false;
        }
        self.used_bits += bits;
        self.msgs.push(message.clone());
        true
    }

    /// Whether no messages have been accepted yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Serializes the packet. A packet with no messages becomes a keepalive.
    #[must_use]
    pub fn seal(self) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(self.used_bits.div_ceil(8));
        w.write_bits(self.header.protocol.0, 32);
        w.write_bits(u32::from(self.header.seq.0), 16);
        w.write_bits(u32::from(self.header.acks.last_recv.0), 16);
        w.write_bits(self.header.acks.bits, 32);
        let keepalive = self.msgs.is_empty();
        w.write_bits(u32::from(keepalive), 1);
        if !keepalive {
            #[expect(clippy::cast_possible_truncation, reason = "bounded by the count field")]
            w.write_bits(self.msgs.len() as u32, 8);
            for message in &self.msgs {
                message.encode(&mut w);
            }
        }
        w.into_bytes()
    }
}

/// Parses one incoming datagram: header eagerly, messages on demand.
#[derive(Debug)]
pub struct PacketReader<'a> {
    reader: BitReader<'a>,
    header: PacketHeader,
    remaining: u8,
    max_msg_len: usize,
}

impl<'a> PacketReader<'a> {
    /// Parses the packet header, verifying the protocol id.
    ///
    /// # Errors
    ///
    /// Errors if the datagram is shorter than a header or belongs to a
    /// different protocol.
    pub fn new(
        datagram: &'a [u8],
        expected: ProtocolId,
        max_msg_len: usize,
    ) -> Result<Self, PacketError> {
        let mut reader = BitReader::new(datagram);
        let mut read =
            |bits| -> Result<u32, PacketError> { reader.read_bits(bits).map_err(|_| PacketError::Malformed) };

        let protocol = ProtocolId(read(32)?);
        if protocol != expected {
            return Err(PacketError::ProtocolMismatch {
                expected,
                got: protocol,
            });
        }
        #[expect(clippy::cast_possible_truncation, reason = "16-bit read")]
        let seq = Seq(read(16)? as u16);
        #[expect(clippy::cast_possible_truncation, reason = "16-bit read")]
        let last_recv = Seq(read(16)? as u16);
        let bits = read(32)?;
        let keepalive = read(1)? == 1;
        #[expect(clippy::cast_possible_truncation, reason = "8-bit read")]
        let remaining = if keepalive { 0 } else { read(8)? as u8 };

        Ok(Self {
            reader,
            header: PacketHeader {
                protocol,
                seq,
                acks: Acknowledge { last_recv, bits },
            },
            remaining,
            max_msg_len,
        })
    }

    /// Parsed header.
    #[must_use]
    pub const fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Pulls the next message, or `None` once the declared count is
    /// exhausted.
    pub fn next_message(&mut self) -> Option<Result<Message, PacketError>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Message::decode(&mut self.reader, self.max_msg_len).map_err(PacketError::from))
    }
}

/// Symmetric transform applied to every sealed packet before it reaches the
/// driver, and to every datagram before it is parsed.
///
/// Only the identity transform ships; a keyed stream cipher slots in here
/// once a key-exchange scheme exists to feed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cipher {
    /// Packets travel as-is.
    #[default]
    Off,
}

impl Cipher {
    /// Transforms an outgoing sealed packet.
    #[must_use]
    pub fn seal(self, packet: Vec<u8>) -> Vec<u8> {
        match self {
            Self::Off => packet,
        }
    }

    /// Reverses [`Cipher::seal`] on an incoming datagram.
    #[must_use]
    pub fn open(self, datagram: &[u8]) -> Cow<'_, [u8]> {
        match self {
            Self::Off => Cow::Borrowed(datagram),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use crate::{lane::LaneIndex, msg::MessageKind};

    use super::*;

    const PROTOCOL: ProtocolId = ProtocolId::of("packet tests");

    fn header(seq: u16) -> PacketHeader {
        PacketHeader {
            protocol: PROTOCOL,
            seq: Seq(seq),
            acks: Acknowledge {
                last_recv: Seq(7),
                bits: 0b101,
            },
        }
    }

    fn message(seq: u16, payload: &'static [u8]) -> Message {
        Message {
            seq: Seq(seq),
            lane: LaneIndex::new(1),
            kind: MessageKind::ByteArray,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn round_trip_with_messages() {
        let mut writer = PacketWriter::new(header(3), 1024);
        assert!(writer.push(&message(0, b"first")));
        assert!(writer.push(&message(1, b"second")));
        let datagram = writer.seal();
        assert!(datagram.len() <= 1024);

        let mut reader = PacketReader::new(&datagram, PROTOCOL, 4096).unwrap();
        assert_eq!(&header(3), reader.header());
        assert_eq!(message(0, b"first"), reader.next_message().unwrap().unwrap());
        assert_eq!(message(1, b"second"), reader.next_message().unwrap().unwrap());
        assert!(reader.next_message().is_none());
    }

    #[test]
    fn keepalive_round_trip() {
        let writer = PacketWriter::new(header(9), 1024);
        let datagram = writer.seal();
        assert_eq!(HEADER_BITS.div_ceil(8), datagram.len());

        let mut reader = PacketReader::new(&datagram, PROTOCOL, 4096).unwrap();
        assert_eq!(Seq(9), reader.header().seq);
        assert!(reader.next_message().is_none());
    }

    #[test]
    fn refuses_overflowing_message() {
        let mtu = 64;
        let mut writer = PacketWriter::new(header(0), mtu);
        assert!(writer.push(&message(0, &[0; 32])));
        assert!(!writer.push(&message(1, &[0; 32])), "would exceed the mtu");
        // a smaller message still fits
        assert!(writer.push(&message(1, &[0; 4])));
        assert!(writer.seal().len() <= mtu);
    }

    #[test]
    fn peek_protocol_id() {
        let datagram = PacketWriter::new(header(0), 1024).seal();
        assert_eq!(Some(PROTOCOL), read_protocol_id(&datagram));
        assert_eq!(None, read_protocol_id(&datagram[..3]));
    }

    #[test]
    fn rejects_foreign_protocol() {
        let datagram = PacketWriter::new(header(0), 1024).seal();
        let other = ProtocolId::of("other protocol");
        assert_matches!(
            PacketReader::new(&datagram, other, 4096),
            Err(PacketError::ProtocolMismatch { .. })
        );
    }

    #[test]
    fn rejects_short_datagram() {
        let datagram = PacketWriter::new(header(0), 1024).seal();
        assert_matches!(
            PacketReader::new(&datagram[..10], PROTOCOL, 4096),
            Err(PacketError::Malformed)
        );
    }

    #[test]
    fn truncated_payload_fails_lazily() {
        let mut writer = PacketWriter::new(header(0), 1024);
        assert!(writer.push(&message(0, b"some payload here")));
        let mut datagram = writer.seal();
        datagram.truncate(datagram.len() - 4);

        let mut reader = PacketReader::new(&datagram, PROTOCOL, 4096).unwrap();
        assert_matches!(
            reader.next_message(),
            Some(Err(PacketError::Message(MessageError::Truncated)))
        );
    }

    #[test]
    fn cipher_off_is_identity() {
        let datagram = PacketWriter::new(header(0), 1024).seal();
        let sealed = Cipher::Off.seal(datagram.clone());
        assert_eq!(datagram, sealed);
        assert_eq!(&datagram[..], &*Cipher::Off.open(&sealed));
    }
}
