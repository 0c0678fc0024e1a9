//! See [`Connection`].

use std::{collections::VecDeque, num::Saturating};

use bytes::{Bytes, BytesMut};
use tracing::{trace, trace_span};
use web_time::{Duration, Instant};

use crate::{
    ack::Acknowledge,
    lane::{LaneIndex, LaneKind, RecvLane, SendLane},
    msg::{self, Message, MessageKind, MSG_HEADER_BITS},
    packet::{
        Cipher, PacketError, PacketHeader, PacketReader, PacketWriter, DATA_HEADER_BITS,
    },
    protocol::ProtocolId,
    rtt::{RttEstimator, DEFAULT_INITIAL_RTT},
    seq::Seq,
    seq_buf::SeqBuf,
};

/// Lane carrying unreliable sequenced traffic.
pub const LANE_UNRELIABLE: LaneIndex = LaneIndex::new(0);
/// Lane carrying reliable ordered traffic.
pub const LANE_RELIABLE: LaneIndex = LaneIndex::new(1);

const LANES: [LaneKind; 2] = [LaneKind::UnreliableSequenced, LaneKind::ReliableOrdered];

/// Packets we remember having sent while waiting for their acknowledgement.
/// Far more than can realistically be in flight at once.
const SENT_PACKET_HISTORY: usize = 1024;

/// Configuration of a [`Connection`], fixed at creation.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol identity; see [`ProtocolId`].
    pub protocol: ProtocolId,
    /// Largest datagram this connection will produce or accept.
    pub max_packet_bytes: usize,
    /// Largest application payload accepted by [`Connection::send`].
    pub max_message_bytes: usize,
    /// Slots in each lane's send and receive windows.
    pub channel_window: usize,
    /// How long the connection may sit idle before an empty packet is sent
    /// just to keep acknowledgements and timeout clocks moving.
    pub keepalive_interval: Duration,
    /// Drop the connection after this long without a valid packet from the
    /// peer. `None` disables timeout detection, for tests that pause time.
    pub timeout: Option<Duration>,
    /// RTT assumed before the first acknowledgement arrives.
    pub initial_rtt: Duration,
    /// Transform applied at the packet boundary.
    pub cipher: Cipher,
}

impl ConnectionConfig {
    /// Creates the default configuration for a protocol.
    #[must_use]
    pub const fn new(protocol: ProtocolId) -> Self {
        Self {
            protocol,
            max_packet_bytes: 1024,
            max_message_bytes: 4096,
            channel_window: 512,
            keepalive_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(5)),
            initial_rtt: DEFAULT_INITIAL_RTT,
            cipher: Cipher::Off,
        }
    }

    /// Largest message payload that fits a single packet on the wire.
    #[must_use]
    pub const fn max_wire_payload(&self) -> usize {
        (self.max_packet_bytes * 8 - DATA_HEADER_BITS - MSG_HEADER_BITS) / 8
    }

    /// Largest slice of application payload per chunk message.
    const fn max_chunk_slice(&self) -> usize {
        self.max_wire_payload() - 2
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the first sign of life from the peer.
    Connecting,
    /// Traffic is flowing.
    Connected,
    /// Dead; all operations are ignored.
    Closed,
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No valid packet arrived within the configured timeout while
    /// connected.
    TimedOut,
    /// No valid packet ever arrived within the configured timeout; the
    /// connection attempt failed.
    FailedToConnect,
    /// The local host closed the connection.
    Local,
    /// The peer announced it was closing.
    Remote {
        /// Close code the peer sent.
        code: i32,
    },
}

/// Lifecycle event raised by a [`Connection`], drained via
/// [`Connection::poll_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is now live in both directions.
    Connected,
    /// The connection closed and will raise nothing further.
    Disconnected(DisconnectReason),
}

/// Error when queueing a message for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Payload exceeds what this connection can carry.
    #[error("message of {len} bytes over limit {max}")]
    TooLarge {
        /// Payload length.
        len: usize,
        /// Largest accepted payload.
        max: usize,
    },
    /// Reliable send window has no room; the peer is not acknowledging fast
    /// enough. Back off and retry after a flush.
    #[error("send window full")]
    WindowFull,
    /// No such lane on this connection.
    #[error("invalid lane")]
    InvalidLane,
    /// Connection is closed.
    #[error("connection closed")]
    Closed,
}

/// Error when processing an incoming datagram.
///
/// Safe to ignore: the datagram is dropped, counted, and the connection
/// carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Could not parse the datagram.
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// A message named a lane this connection does not have.
    #[error("invalid lane `{0}`")]
    InvalidLane(u8),
}

/// Running totals for a connection. All counters saturate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    /// Packets emitted, keepalives included.
    pub packets_sent: Saturating<usize>,
    /// Valid packets processed.
    pub packets_recv: Saturating<usize>,
    /// Our packets the peer has acknowledged.
    pub packets_acked: Saturating<usize>,
    /// Application messages queued for sending.
    pub msgs_sent: Saturating<usize>,
    /// Application messages delivered to the host.
    pub msgs_recv: Saturating<usize>,
    /// Reliable messages confirmed received by the peer.
    pub msg_acks: Saturating<usize>,
    /// Reliable messages sent again after their resend delay lapsed.
    pub retransmissions: Saturating<usize>,
    /// Datagrams dropped as malformed, truncated, or foreign.
    pub packets_dropped: Saturating<usize>,
    /// Duplicate packets whose payload was ignored.
    pub duplicate_packets: Saturating<usize>,
    /// Messages dropped by lane delivery policy (stale or duplicate).
    pub msgs_discarded: Saturating<usize>,
    /// Queued unreliable messages dropped to stay within budget.
    pub outbox_dropped: Saturating<usize>,
}

#[derive(Debug)]
struct SentPacket {
    sent_at: Instant,
    msgs: Box<[(LaneIndex, Seq)]>,
}

/// Reliability engine for one peer: packs lane traffic into packets, tracks
/// packet and message acknowledgements, schedules retransmissions, and runs
/// the connection lifecycle.
///
/// Sans-IO: the host feeds incoming datagrams to [`Connection::recv`], sends
/// whatever [`Connection::flush`] returns, ticks [`Connection::update`], and
/// drains [`Connection::poll_event`] and [`Connection::drain_msgs`]. Every
/// operation takes `now` from the host; the connection never reads a clock.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    state: ConnectionState,
    events: VecDeque<ConnectionEvent>,

    // send
    next_packet_seq: Seq,
    sent_packets: SeqBuf<SentPacket>,
    send_lanes: Box<[SendLane]>,
    rtt: RttEstimator,
    last_send_at: Option<Instant>,
    rr_cursor: usize,

    // recv
    peer_acks: Acknowledge,
    recv_lanes: Box<[RecvLane]>,
    last_recv_at: Option<Instant>,
    created_at: Instant,
    recv_msgs: Vec<(LaneIndex, Bytes)>,
    lane_scratch: Vec<(MessageKind, Bytes)>,

    stats: ConnectionStats,
}

impl Connection {
    /// Creates a connection in [`ConnectionState::Connecting`].
    ///
    /// # Panics
    ///
    /// Panics if the configuration cannot carry at least one byte of payload
    /// per packet, or if `max_message_bytes` does not fit the wire length
    /// field.
    #[must_use]
    pub fn new(config: ConnectionConfig, now: Instant) -> Self {
        assert!(config.max_wire_payload() > 2);
        assert!(config.max_message_bytes <= usize::from(u16::MAX));
        Self {
            state: ConnectionState::Connecting,
            events: VecDeque::new(),
            next_packet_seq: Seq(0),
            sent_packets: SeqBuf::new(SENT_PACKET_HISTORY),
            send_lanes: LANES
                .iter()
                .map(|&kind| SendLane::new(kind, config.channel_window))
                .collect(),
            rtt: RttEstimator::new(config.initial_rtt),
            last_send_at: None,
            rr_cursor: 0,
            peer_acks: Acknowledge::new(),
            recv_lanes: LANES
                .iter()
                .map(|&kind| RecvLane::new(kind, config.channel_window))
                .collect(),
            last_recv_at: None,
            created_at: now,
            recv_msgs: Vec::new(),
            lane_scratch: Vec::new(),
            stats: ConnectionStats::default(),
            config,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Round-trip estimate for this connection.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Running totals.
    #[must_use]
    pub const fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Takes the next pending lifecycle event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Drains messages delivered to the application since the last drain.
    pub fn drain_msgs(&mut self) -> std::vec::Drain<'_, (LaneIndex, Bytes)> {
        self.recv_msgs.drain(..)
    }

    /// Marks the connection live, raising [`ConnectionEvent::Connected`].
    ///
    /// Called by the client endpoint when the first valid packet arrives,
    /// and by the server endpoint when the host accepts the peer.
    pub fn promote(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.events.push_back(ConnectionEvent::Connected);
        }
    }

    /// Queues the internal connection-accepted notification for the peer, so
    /// it learns of the acceptance before the next keepalive would tell it.
    pub fn queue_accepted(&mut self) {
        let lane = usize::from(LANE_RELIABLE.into_raw());
        if self.send_lanes[lane]
            .push(MessageKind::Accepted, Bytes::new())
            .is_err()
        {
            trace!("reliable window full, peer will learn of acceptance by keepalive");
        }
    }

    /// Queues an application payload on a lane.
    ///
    /// The message is not put on the wire until the next
    /// [`Connection::flush`]. Returns the message sequence assigned within
    /// the lane.
    ///
    /// # Errors
    ///
    /// * [`SendError::TooLarge`] if the payload is over
    ///   [`ConnectionConfig::max_message_bytes`], or over what one packet
    ///   fits for unreliable lanes.
    /// * [`SendError::WindowFull`] if the reliable send window cannot take
    ///   the message; nothing is queued.
    /// * [`SendError::Closed`] on a closed connection.
    pub fn send(&mut self, lane: LaneIndex, payload: Bytes) -> Result<Seq, SendError> {
        if self.state == ConnectionState::Closed {
            return Err(SendError::Closed);
        }
        let max = self.config.max_message_bytes;
        if payload.len() > max {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max,
            });
        }
        let lane_i = usize::from(lane.into_raw());
        if lane_i >= self.send_lanes.len() {
            return Err(SendError::InvalidLane);
        }

        let seq = if payload.len() <= self.config.max_wire_payload() {
            let (seq, dropped) = self.send_lanes[lane_i]
                .push(MessageKind::ByteArray, payload)
                .map_err(|_| SendError::WindowFull)?;
            self.stats.outbox_dropped += Saturating(dropped);
            seq
        } else if lane == LANE_RELIABLE {
            self.send_chunked(lane_i, &payload)?
        } else {
            // unreliable messages cannot span packets
            return Err(SendError::TooLarge {
                len: payload.len(),
                max: self.config.max_wire_payload(),
            });
        };

        self.stats.msgs_sent += Saturating(1);
        Ok(seq)
    }

    /// Splits an oversized reliable payload into chunk messages.
    fn send_chunked(&mut self, lane_i: usize, payload: &Bytes) -> Result<Seq, SendError> {
        let slice_len = self.config.max_chunk_slice();
        let total = payload.len().div_ceil(slice_len);
        let Ok(total_u8) = u8::try_from(total) else {
            return Err(SendError::TooLarge {
                len: payload.len(),
                max: slice_len * usize::from(u8::MAX),
            });
        };
        let lane = &mut self.send_lanes[lane_i];
        if !lane.can_push(total) {
            return Err(SendError::WindowFull);
        }

        let mut first_seq = Seq(0);
        for (index, start) in (0..payload.len()).step_by(slice_len).enumerate() {
            let end = (start + slice_len).min(payload.len());
            #[expect(clippy::cast_possible_truncation, reason = "total fits in u8")]
            let chunk = msg::chunk_payload(index as u8, total_u8, &payload[start..end]);
            let (seq, _) = lane
                .push(MessageKind::Chunk, chunk)
                .map_err(|_| SendError::WindowFull)?;
            if index == 0 {
                first_seq = seq;
            }
        }
        Ok(first_seq)
    }

    /// Packs pending lane traffic into packets ready for the driver.
    ///
    /// Messages are pulled from lanes in round-robin order. When the
    /// connection has nothing to say but has been idle for the keepalive
    /// interval, a single header-only packet is produced so acknowledgements
    /// keep flowing.
    pub fn flush(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        let resend_delay = self.rtt.resend_delay();
        let reliable = usize::from(LANE_RELIABLE.into_raw());
        let unreliable = usize::from(LANE_UNRELIABLE.into_raw());

        let mut due_reliable = Vec::new();
        self.send_lanes[reliable].due_seqs(now, resend_delay, &mut due_reliable);
        let mut rel_next = 0;

        let mut packets = Vec::new();
        let mut carry: Option<Message> = None;

        loop {
            let unreliable_pending = !self.send_lanes[unreliable].is_drained();
            if carry.is_none() && !unreliable_pending && rel_next >= due_reliable.len() {
                break;
            }

            let pkt_seq = self.next_packet_seq;
            let span = trace_span!("flush", packet = pkt_seq.0);
            let _span = span.enter();

            let mut writer = PacketWriter::new(self.header(pkt_seq), self.config.max_packet_bytes);
            let mut packed: Vec<(LaneIndex, Seq)> = Vec::new();

            if let Some(message) = carry.take() {
                // the carried message was refused by the previous, fuller
                // packet; it always fits a fresh one
                debug_assert!(message.encode_bits() + DATA_HEADER_BITS <= self.config.max_packet_bytes * 8);
                if writer.push(&message) {
                    self.note_packed(&message, now, &mut packed);
                }
            }

            let mut idle_lanes = 0;
            while idle_lanes < self.send_lanes.len() {
                let lane_i = self.rr_cursor % self.send_lanes.len();
                let candidate = if lane_i == unreliable {
                    self.send_lanes[unreliable].front_unreliable(LANE_UNRELIABLE)
                } else {
                    due_reliable.get(rel_next).and_then(|&seq| {
                        self.send_lanes[reliable].window_message(LANE_RELIABLE, seq)
                    })
                };
                let Some(message) = candidate else {
                    idle_lanes += 1;
                    self.rr_cursor += 1;
                    continue;
                };
                idle_lanes = 0;

                if writer.push(&message) {
                    if lane_i == unreliable {
                        self.send_lanes[unreliable].pop_unreliable();
                    } else {
                        rel_next += 1;
                    }
                    self.note_packed(&message, now, &mut packed);
                    self.rr_cursor += 1;
                } else {
                    // seal this packet and carry the message into the next
                    if lane_i == unreliable {
                        self.send_lanes[unreliable].pop_unreliable();
                    } else {
                        rel_next += 1;
                    }
                    carry = Some(message);
                    break;
                }
            }

            if packed.is_empty() {
                break;
            }
            trace!(num_msgs = packed.len(), "flushed packet");
            self.seal(writer, pkt_seq, packed, now, &mut packets);
        }

        let keepalive_due = self
            .last_send_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.keepalive_interval);
        if packets.is_empty() && keepalive_due {
            let pkt_seq = self.next_packet_seq;
            let writer = PacketWriter::new(self.header(pkt_seq), self.config.max_packet_bytes);
            self.seal(writer, pkt_seq, Vec::new(), now, &mut packets);
        }

        packets
    }

    const fn header(&self, seq: Seq) -> PacketHeader {
        PacketHeader {
            protocol: self.config.protocol,
            seq,
            acks: self.peer_acks,
        }
    }

    /// Bookkeeping for a message that made it into the current packet.
    fn note_packed(&mut self, message: &Message, now: Instant, packed: &mut Vec<(LaneIndex, Seq)>) {
        let lane_i = usize::from(message.lane.into_raw());
        // stamping an unreliable lane is a no-op
        if self.send_lanes[lane_i].mark_sent(message.seq, now) {
            self.stats.retransmissions += Saturating(1);
        }
        packed.push((message.lane, message.seq));
    }

    fn seal(
        &mut self,
        writer: PacketWriter,
        pkt_seq: Seq,
        packed: Vec<(LaneIndex, Seq)>,
        now: Instant,
        packets: &mut Vec<Vec<u8>>,
    ) {
        self.next_packet_seq += 1;
        self.sent_packets.insert(
            pkt_seq,
            SentPacket {
                sent_at: now,
                msgs: packed.into_boxed_slice(),
            },
        );
        self.stats.packets_sent += Saturating(1);
        self.last_send_at = Some(now);
        packets.push(self.config.cipher.seal(writer.seal()));
    }

    /// Processes one incoming datagram.
    ///
    /// Delivered application messages land in [`Connection::drain_msgs`];
    /// lifecycle changes land in [`Connection::poll_event`].
    ///
    /// # Errors
    ///
    /// Errors describe why the datagram was dropped; the connection state
    /// stays consistent and the caller may ignore them beyond counting.
    pub fn recv(&mut self, now: Instant, datagram: &[u8]) -> Result<(), RecvError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let opened = self.config.cipher.open(datagram);
        let mut reader = match PacketReader::new(
            &opened,
            self.config.protocol,
            self.config.max_message_bytes,
        ) {
            Ok(reader) => reader,
            Err(err) => {
                self.stats.packets_dropped += Saturating(1);
                return Err(err.into());
            }
        };
        let header = *reader.header();

        let span = trace_span!("recv", packet = header.seq.0);
        let _span = span.enter();

        self.stats.packets_recv += Saturating(1);
        self.last_recv_at = Some(now);

        // resolve the peer's packet acks into message acks; removal from the
        // history makes a repeated ack a no-op
        for acked in header.acks.seqs() {
            let Some(sent) = self.sent_packets.remove(acked) else {
                continue;
            };
            self.rtt.update(now.saturating_duration_since(sent.sent_at));
            self.stats.packets_acked += Saturating(1);
            for &(lane, msg_seq) in &sent.msgs {
                if self.send_lanes[usize::from(lane.into_raw())].ack(msg_seq) {
                    self.stats.msg_acks += Saturating(1);
                }
            }
        }

        if self.peer_acks.is_acked(header.seq) {
            // seen before; it will be acked again in the next header, but its
            // payload must not be processed twice
            self.stats.duplicate_packets += Saturating(1);
            return Ok(());
        }
        self.peer_acks.ack(header.seq);

        while let Some(result) = reader.next_message() {
            let message = match result {
                Ok(message) => message,
                Err(err) => {
                    self.stats.packets_dropped += Saturating(1);
                    return Err(err.into());
                }
            };
            let lane_i = usize::from(message.lane.into_raw());
            if lane_i >= self.recv_lanes.len() {
                self.stats.packets_dropped += Saturating(1);
                return Err(RecvError::InvalidLane(message.lane.into_raw()));
            }
            let lane = message.lane;

            self.lane_scratch.clear();
            let summary = self.recv_lanes[lane_i].recv(message, &mut self.lane_scratch);
            self.stats.msgs_discarded += Saturating(summary.discarded);

            for (kind, payload) in self.lane_scratch.drain(..) {
                match kind {
                    MessageKind::ByteArray => {
                        self.stats.msgs_recv += Saturating(1);
                        self.recv_msgs.push((lane, payload));
                    }
                    MessageKind::Accepted => {
                        // the packet carrying it is itself the sign of life
                        // the endpoint promotes on
                        trace!("peer accepted connection");
                    }
                    MessageKind::Close => {
                        let code = close_code(&payload);
                        self.state = ConnectionState::Closed;
                        self.events
                            .push_back(ConnectionEvent::Disconnected(DisconnectReason::Remote {
                                code,
                            }));
                        return Ok(());
                    }
                    // lanes rebuild chunks before delivery
                    MessageKind::Chunk => {}
                }
            }
        }
        Ok(())
    }

    /// Runs timeout detection against the configured deadline.
    pub fn update(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let Some(timeout) = self.config.timeout else {
            return;
        };
        let last_seen = self.last_recv_at.unwrap_or(self.created_at);
        if now.saturating_duration_since(last_seen) >= timeout {
            let reason = match self.state {
                ConnectionState::Connecting => DisconnectReason::FailedToConnect,
                _ => DisconnectReason::TimedOut,
            };
            self.state = ConnectionState::Closed;
            self.events
                .push_back(ConnectionEvent::Disconnected(reason));
        }
    }

    /// Closes the connection on purpose, returning the final packets to put
    /// on the wire (best effort; the peer also finds out by timeout).
    pub fn close(&mut self, now: Instant, code: i32) -> Vec<Vec<u8>> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        let lane = usize::from(LANE_RELIABLE.into_raw());
        let _ = self.send_lanes[lane].push(MessageKind::Close, close_payload(code));
        let packets = self.flush(now);
        self.state = ConnectionState::Closed;
        self.events
            .push_back(ConnectionEvent::Disconnected(DisconnectReason::Local));
        packets
    }
}

fn close_payload(code: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.extend_from_slice(&code.to_le_bytes());
    buf.freeze()
}

fn close_code(payload: &Bytes) -> i32 {
    payload
        .first_chunk::<4>()
        .map_or(0, |raw| i32::from_le_bytes(*raw))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const PROTOCOL: ProtocolId = ProtocolId::of("conn tests");

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(PROTOCOL)
    }

    fn pair(now: Instant) -> (Connection, Connection) {
        let mut a = Connection::new(config(), now);
        let mut b = Connection::new(config(), now);
        a.promote();
        b.promote();
        let _ = a.poll_event();
        let _ = b.poll_event();
        (a, b)
    }

    /// Ferries every packet `from` has pending into `to`.
    fn ferry(now: Instant, from: &mut Connection, to: &mut Connection) {
        for packet in from.flush(now) {
            to.recv(now, &packet).unwrap();
        }
    }

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn reliable_round_trip_in_order() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        for payload in ["a", "bb", "ccc"] {
            a.send(LANE_RELIABLE, bytes(payload)).unwrap();
        }
        ferry(now, &mut a, &mut b);

        let got: Vec<_> = b.drain_msgs().map(|(_, payload)| payload).collect();
        assert_eq!(vec![bytes("a"), bytes("bb"), bytes("ccc")], got);
    }

    #[test]
    fn acks_clear_reliable_window() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        a.send(LANE_RELIABLE, bytes("hello")).unwrap();
        ferry(now, &mut a, &mut b);
        // b acks by flushing anything back; force a keepalive
        ferry(now + Duration::from_secs(2), &mut b, &mut a);

        assert_eq!(1, a.stats().msg_acks.0);
        assert_eq!(1, a.stats().packets_acked.0);

        // nothing left to resend, far past any resend delay
        let later = now + Duration::from_secs(60);
        assert!(a.flush(later).len() <= 1, "only a keepalive may remain");
    }

    #[test]
    fn lost_packet_is_resent_and_delivered_once() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        a.send(LANE_RELIABLE, bytes("important")).unwrap();
        let lost = a.flush(now);
        assert_eq!(1, lost.len());
        drop(lost);

        // resend due after the resend delay
        let later = now + a.rtt().resend_delay();
        ferry(later, &mut a, &mut b);
        assert_eq!(1, a.stats().retransmissions.0);

        let got: Vec<_> = b.drain_msgs().collect();
        assert_eq!(1, got.len());
    }

    #[test]
    fn duplicate_datagram_is_ignored() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        a.send(LANE_RELIABLE, bytes("once")).unwrap();
        let packets = a.flush(now);
        for packet in &packets {
            b.recv(now, packet).unwrap();
            b.recv(now, packet).unwrap();
        }

        assert_eq!(1, b.drain_msgs().count());
        assert_eq!(1, b.stats().duplicate_packets.0);
    }

    #[test]
    fn ack_processing_is_idempotent() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        a.send(LANE_RELIABLE, bytes("hello")).unwrap();
        ferry(now, &mut a, &mut b);
        let acks = b.flush(now + Duration::from_secs(2));
        for packet in &acks {
            a.recv(now, packet).unwrap();
        }
        let once = (a.stats().packets_acked.0, a.stats().msg_acks.0);

        // the same ack header arriving again changes nothing
        for packet in &acks {
            let _ = a.recv(now, packet);
        }
        assert_eq!(once, (a.stats().packets_acked.0, a.stats().msg_acks.0));
    }

    #[test]
    fn too_large_message_is_rejected_without_sending() {
        let now = Instant::now();
        let (mut a, _) = pair(now);

        let oversized = Bytes::from(vec![0u8; 4097]);
        assert_matches!(
            a.send(LANE_RELIABLE, oversized),
            Err(SendError::TooLarge { len: 4097, max: 4096 })
        );
        assert!(a.flush(now).len() <= 1, "only a keepalive may be emitted");
        assert_eq!(0, a.stats().msgs_sent.0);
    }

    #[test]
    fn chunked_message_is_rebuilt() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        let big: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        a.send(LANE_RELIABLE, Bytes::from(big.clone())).unwrap();
        ferry(now, &mut a, &mut b);

        let got: Vec<_> = b.drain_msgs().collect();
        assert_eq!(1, got.len());
        assert_eq!(&big[..], &got[0].1[..]);
    }

    #[test]
    fn unreliable_oversized_is_rejected() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let payload = Bytes::from(vec![0u8; config().max_wire_payload() + 1]);
        assert_matches!(
            a.send(LANE_UNRELIABLE, payload),
            Err(SendError::TooLarge { .. })
        );
    }

    #[test]
    fn window_full_backpressure() {
        let now = Instant::now();
        let (mut a, _) = pair(now);

        for _ in 0..config().channel_window {
            a.send(LANE_RELIABLE, bytes("x")).unwrap();
        }
        assert_matches!(
            a.send(LANE_RELIABLE, bytes("one too many")),
            Err(SendError::WindowFull)
        );
    }

    #[test]
    fn keepalive_when_idle() {
        let now = Instant::now();
        let (mut a, _) = pair(now);

        // first flush sends one immediately
        assert_eq!(1, a.flush(now).len());
        // nothing new within the interval
        assert!(a.flush(now + Duration::from_millis(500)).is_empty());
        // due again after the interval
        assert_eq!(1, a.flush(now + Duration::from_millis(1500)).len());
    }

    #[test]
    fn times_out_without_traffic() {
        let now = Instant::now();
        let mut conn = Connection::new(config(), now);
        conn.promote();
        assert_matches!(conn.poll_event(), Some(ConnectionEvent::Connected));

        conn.update(now + Duration::from_secs(4));
        assert!(conn.poll_event().is_none());

        conn.update(now + Duration::from_secs(6));
        assert_matches!(
            conn.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::TimedOut))
        );
        assert_eq!(ConnectionState::Closed, conn.state());

        // only once
        conn.update(now + Duration::from_secs(10));
        assert!(conn.poll_event().is_none());
    }

    #[test]
    fn connect_timeout_fails_connection() {
        let now = Instant::now();
        let mut conn = Connection::new(config(), now);
        conn.update(now + Duration::from_secs(6));
        assert_matches!(
            conn.poll_event(),
            Some(ConnectionEvent::Disconnected(
                DisconnectReason::FailedToConnect
            ))
        );
    }

    #[test]
    fn explicit_close_notifies_peer() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        for packet in a.close(now, 7) {
            b.recv(now, &packet).unwrap();
        }
        assert_matches!(
            a.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Local))
        );
        assert_matches!(
            b.poll_event(),
            Some(ConnectionEvent::Disconnected(DisconnectReason::Remote { code: 7 }))
        );
        assert_eq!(ConnectionState::Closed, b.state());

        // closed connections drop everything silently
        assert_matches!(a.send(LANE_RELIABLE, bytes("x")), Err(SendError::Closed));
        assert!(a.flush(now).is_empty());
    }

    #[test]
    fn foreign_datagrams_are_dropped() {
        let now = Instant::now();
        let (mut a, _) = pair(now);

        assert_matches!(
            a.recv(now, b"not a packet at all"),
            Err(RecvError::Packet(_))
        );
        assert_matches!(a.recv(now, &[]), Err(RecvError::Packet(_)));
        assert_eq!(2, a.stats().packets_dropped.0);
        assert_eq!(ConnectionState::Connected, a.state());
    }

    #[test]
    fn unreliable_messages_interleave_with_reliable() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        a.send(LANE_RELIABLE, bytes("r0")).unwrap();
        a.send(LANE_UNRELIABLE, bytes("u0")).unwrap();
        a.send(LANE_RELIABLE, bytes("r1")).unwrap();
        ferry(now, &mut a, &mut b);

        let mut unreliable = Vec::new();
        let mut reliable = Vec::new();
        for (lane, payload) in b.drain_msgs() {
            if lane == LANE_UNRELIABLE {
                unreliable.push(payload);
            } else {
                reliable.push(payload);
            }
        }
        assert_eq!(vec![bytes("u0")], unreliable);
        assert_eq!(vec![bytes("r0"), bytes("r1")], reliable);
    }
}
