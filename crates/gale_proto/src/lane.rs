//! Delivery lanes: per-connection logical substreams, each with its own
//! delivery guarantees.
//!
//! Lanes are what other protocols call channels or streams; the name avoids
//! both the MPSC and the TCP connotations. Each lane owns its own sequence
//! space and windows, so a stalled reliable lane never holds up unreliable
//! traffic.

use std::collections::VecDeque;

use bytes::Bytes;
use web_time::{Duration, Instant};

use crate::{
    msg::{self, Message, MessageKind},
    seq::Seq,
    seq_buf::SeqBuf,
};

/// Delivery guarantees of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    /// No delivery guarantee, but stale data is never delivered: a message
    /// older than one already delivered on this lane is dropped.
    ///
    /// Messages are never resent and never reordered; under loss the
    /// receiver simply sees gaps. Suited to state that is continuously
    /// refreshed anyway, like position updates.
    UnreliableSequenced,
    /// Every message arrives, in send order, with no gaps or duplicates.
    ///
    /// Lost messages are resent until acknowledged, and delivery stalls
    /// until the next expected message arrives (head-of-line blocking).
    /// Suited to events that must not be lost, like chat or game state
    /// transitions.
    ReliableOrdered,
}

/// Index of a lane within a connection's lane set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneIndex(u8);

impl LaneIndex {
    /// Creates an index from a raw value.
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw value of this index.
    #[must_use]
    pub const fn into_raw(self) -> u8 {
        self.0
    }
}

/// Reliable send window has no free slot for the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaneFull;

/// Sending half of a lane.
#[derive(Debug)]
pub(crate) struct SendLane {
    next_seq: Seq,
    state: SendState,
}

#[derive(Debug)]
enum SendState {
    /// Outbox is drained in full on every flush; it only grows past the
    /// budget if the host queues faster than it flushes, in which case the
    /// oldest queued messages give way.
    Unreliable {
        outbox: VecDeque<Queued>,
        budget: usize,
    },
    /// Window entries stay resident until a packet that carried them is
    /// acknowledged.
    Reliable { window: SeqBuf<SentMessage> },
}

#[derive(Debug)]
struct Queued {
    seq: Seq,
    kind: MessageKind,
    payload: Bytes,
}

#[derive(Debug, Clone)]
struct SentMessage {
    kind: MessageKind,
    payload: Bytes,
    last_sent_at: Option<Instant>,
}

impl SendLane {
    pub fn new(kind: LaneKind, window: usize) -> Self {
        Self {
            next_seq: Seq(0),
            state: match kind {
                LaneKind::UnreliableSequenced => SendState::Unreliable {
                    outbox: VecDeque::new(),
                    budget: window,
                },
                LaneKind::ReliableOrdered => SendState::Reliable {
                    window: SeqBuf::new(window),
                },
            },
        }
    }

    /// Whether `count` more messages can be queued without overwriting an
    /// unacknowledged reliable window entry.
    pub fn can_push(&self, count: usize) -> bool {
        match &self.state {
            SendState::Unreliable { .. } => true,
            SendState::Reliable { window } => {
                if count > window.capacity() {
                    return false;
                }
                #[expect(clippy::cast_possible_truncation, reason = "count fits the window")]
                (0..count as u16).all(|i| window.occupant(self.next_seq + i).is_none())
            }
        }
    }

    /// Queues a message, assigning it the next sequence number.
    ///
    /// Returns the assigned sequence and how many queued unreliable messages
    /// were dropped to stay within budget.
    pub fn push(&mut self, kind: MessageKind, payload: Bytes) -> Result<(Seq, usize), LaneFull> {
        let seq = self.next_seq;
        let dropped = match &mut self.state {
            SendState::Unreliable { outbox, budget } => {
                outbox.push_back(Queued { seq, kind, payload });
                if outbox.len() > *budget {
                    outbox.pop_front();
                    1
                } else {
                    0
                }
            }
            SendState::Reliable { window } => {
                if window.occupant(seq).is_some() {
                    return Err(LaneFull);
                }
                window.insert(
                    seq,
                    SentMessage {
                        kind,
                        payload,
                        last_sent_at: None,
                    },
                );
                0
            }
        };
        self.next_seq += 1;
        Ok((seq, dropped))
    }

    /// Sequences of reliable window entries due for (re)transmission, oldest
    /// sequence first.
    pub fn due_seqs(&self, now: Instant, resend_delay: Duration, out: &mut Vec<Seq>) {
        if let SendState::Reliable { window } = &self.state {
            out.extend(window.iter().filter_map(|(seq, sent)| {
                let due = sent
                    .last_sent_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= resend_delay);
                due.then_some(seq)
            }));
            out.sort_unstable();
        }
    }

    /// Next queued unreliable message, without consuming it.
    pub fn front_unreliable(&self, lane: LaneIndex) -> Option<Message> {
        match &self.state {
            SendState::Unreliable { outbox, .. } => outbox.front().map(|queued| Message {
                seq: queued.seq,
                lane,
                kind: queued.kind,
                payload: queued.payload.clone(),
            }),
            SendState::Reliable { .. } => None,
        }
    }

    /// Consumes the front of the unreliable outbox.
    pub fn pop_unreliable(&mut self) {
        if let SendState::Unreliable { outbox, .. } = &mut self.state {
            outbox.pop_front();
        }
    }

    /// Reliable window entry at `seq` as a wire message.
    pub fn window_message(&self, lane: LaneIndex, seq: Seq) -> Option<Message> {
        match &self.state {
            SendState::Reliable { window } => window.get(seq).map(|sent| Message {
                seq,
                lane,
                kind: sent.kind,
                payload: sent.payload.clone(),
            }),
            SendState::Unreliable { .. } => None,
        }
    }

    /// Stamps a reliable window entry as sent now. Returns whether this was a
    /// retransmission.
    pub fn mark_sent(&mut self, seq: Seq, now: Instant) -> bool {
        match &mut self.state {
            SendState::Reliable { window } => window.get_mut(seq).is_some_and(|sent| {
                let resend = sent.last_sent_at.is_some();
                sent.last_sent_at = Some(now);
                resend
            }),
            SendState::Unreliable { .. } => false,
        }
    }

    /// Releases the reliable window entry for an acknowledged message.
    /// Returns whether the entry was still pending.
    pub fn ack(&mut self, seq: Seq) -> bool {
        match &mut self.state {
            SendState::Reliable { window } => window.remove(seq).is_some(),
            SendState::Unreliable { .. } => false,
        }
    }

    /// Whether nothing is waiting to be sent right now.
    pub fn is_drained(&self) -> bool {
        match &self.state {
            SendState::Unreliable { outbox, .. } => outbox.is_empty(),
            SendState::Reliable { window } => window.is_empty(),
        }
    }
}

/// What a [`RecvLane`] did with incoming messages.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RecvSummary {
    /// Messages appended to the delivery buffer.
    pub delivered: usize,
    /// Messages dropped as stale, duplicate, or invalid.
    pub discarded: usize,
}

/// Receiving half of a lane.
#[derive(Debug)]
pub(crate) struct RecvLane {
    state: RecvState,
}

#[derive(Debug)]
enum RecvState {
    UnreliableSequenced {
        last_delivered: Option<Seq>,
    },
    ReliableOrdered {
        /// Next sequence to deliver.
        pending: Seq,
        window: SeqBuf<RecvEntry>,
        chunks: ChunkBuf,
    },
}

#[derive(Debug)]
struct RecvEntry {
    kind: MessageKind,
    payload: Bytes,
}

/// Reassembly state for a chunked message in flight on a reliable ordered
/// lane. Chunks arrive in order, so a plain accumulator suffices.
#[derive(Debug, Default)]
struct ChunkBuf {
    slices: Vec<Bytes>,
    total: usize,
}

impl ChunkBuf {
    /// Feeds one chunk; returns the rebuilt payload once complete, `Err` on a
    /// malformed chunk stream.
    fn feed(&mut self, payload: &Bytes) -> Result<Option<Bytes>, ()> {
        let Some((index, total, slice)) = msg::split_chunk(payload) else {
            self.reset();
            return Err(());
        };
        if total == 0 || usize::from(index) != self.slices.len() {
            self.reset();
            return Err(());
        }
        if self.slices.is_empty() {
            self.total = usize::from(total);
        } else if usize::from(total) != self.total {
            self.reset();
            return Err(());
        }
        self.slices.push(slice);
        if self.slices.len() == self.total {
            let len = self.slices.iter().map(Bytes::len).sum();
            let mut rebuilt = Vec::with_capacity(len);
            for slice in self.slices.drain(..) {
                rebuilt.extend_from_slice(&slice);
            }
            self.total = 0;
            Ok(Some(Bytes::from(rebuilt)))
        } else {
            Ok(None)
        }
    }

    fn reset(&mut self) {
        self.slices.clear();
        self.total = 0;
    }
}

impl RecvLane {
    pub fn new(kind: LaneKind, window: usize) -> Self {
        Self {
            state: match kind {
                LaneKind::UnreliableSequenced => RecvState::UnreliableSequenced {
                    last_delivered: None,
                },
                LaneKind::ReliableOrdered => RecvState::ReliableOrdered {
                    pending: Seq(0),
                    window: SeqBuf::new(window),
                    chunks: ChunkBuf::default(),
                },
            },
        }
    }

    /// Runs one incoming message through this lane's delivery policy,
    /// appending anything deliverable to `out`.
    pub fn recv(&mut self, message: Message, out: &mut Vec<(MessageKind, Bytes)>) -> RecvSummary {
        let mut summary = RecvSummary::default();
        match &mut self.state {
            RecvState::UnreliableSequenced { last_delivered } => {
                if message.kind == MessageKind::Chunk {
                    // chunks only make sense under reliable ordering
                    summary.discarded += 1;
                } else if last_delivered.is_none_or(|last| message.seq > last) {
                    *last_delivered = Some(message.seq);
                    out.push((message.kind, message.payload));
                    summary.delivered += 1;
                } else {
                    summary.discarded += 1;
                }
            }
            RecvState::ReliableOrdered {
                pending,
                window,
                chunks,
            } => {
                if message.seq < *pending {
                    // already delivered
                    summary.discarded += 1;
                    return summary;
                }
                if window.occupant(message.seq).is_some() {
                    // already buffered, or the slot is held by another
                    // pending sequence
                    summary.discarded += 1;
                    return summary;
                }
                window.insert(
                    message.seq,
                    RecvEntry {
                        kind: message.kind,
                        payload: message.payload,
                    },
                );
                // deliver as far as the buffered run allows
                while let Some(entry) = window.remove(*pending) {
                    *pending += 1;
                    if entry.kind == MessageKind::Chunk {
                        match chunks.feed(&entry.payload) {
                            Ok(Some(rebuilt)) => {
                                out.push((MessageKind::ByteArray, rebuilt));
                                summary.delivered += 1;
                            }
                            Ok(None) => {}
                            Err(()) => summary.discarded += 1,
                        }
                    } else {
                        out.push((entry.kind, entry.payload));
                        summary.delivered += 1;
                    }
                }
            }
        }
        summary
    }
}
