//! Server endpoint: a driver and a table of client connections.

use std::{collections::VecDeque, num::Saturating};

use bytes::Bytes;
use gale_proto::{
    conn::{
        Connection, ConnectionConfig, ConnectionEvent, ConnectionState, ConnectionStats,
        DisconnectReason, SendError, LANE_RELIABLE, LANE_UNRELIABLE,
    },
    lane::LaneIndex,
    seq::Seq,
};
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::{driver::Driver, peers::PeerTable};

/// Event raised by a [`Server`], drained via [`Server::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent<P> {
    /// A new peer sent its first valid packet. The host decides its fate
    /// with [`Server::accept`] or [`Server::reject`].
    ConnectionRequest(P),
    /// A peer's connection ended.
    Disconnected {
        /// The peer.
        peer: P,
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// A peer sent a message.
    Recv {
        /// The peer.
        peer: P,
        /// Lane the message arrived on.
        lane: LaneIndex,
        /// Message payload.
        msg: Bytes,
    },
}

/// Error from a [`Server`] operation.
#[derive(Debug, thiserror::Error)]
pub enum ServerError<E> {
    /// The underlying transport failed; the server is unusable.
    #[error("driver failure")]
    Driver(#[source] E),
    /// Could not queue a message.
    #[error(transparent)]
    Send(#[from] SendError),
    /// No such peer.
    #[error("unknown peer")]
    UnknownPeer,
}

/// Configuration of a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-connection configuration applied to every client.
    pub conn: ConnectionConfig,
    /// Most peers served at once. Packets from new addresses beyond this are
    /// dropped silently, with a counter bump; existing peers are unaffected.
    pub max_peers: usize,
}

impl ServerConfig {
    /// Creates the default configuration for a protocol.
    #[must_use]
    pub const fn new(protocol: gale_proto::protocol::ProtocolId) -> Self {
        Self {
            conn: ConnectionConfig::new(protocol),
            max_peers: 32,
        }
    }
}

#[derive(Debug)]
struct Peer {
    conn: Connection,
    /// Set by [`Server::accept`]; until then no packets are sent to the
    /// peer and its messages stay buffered.
    accepted: bool,
}

/// Server endpoint: listens on a [`Driver`] and serves a bounded table of
/// client connections.
///
/// Same tick discipline as the client: [`Server::update`], then
/// [`Server::poll`] until empty, then [`Server::flush`].
#[derive(Debug)]
pub struct Server<D: Driver> {
    driver: D,
    config: ServerConfig,
    peers: PeerTable<D::Peer, Peer>,
    events: VecDeque<ServerEvent<D::Peer>>,
    recv_buf: Box<[u8]>,
    new_peers_dropped: Saturating<usize>,
}

impl<D: Driver> Server<D> {
    /// Starts the driver and begins listening.
    ///
    /// # Errors
    ///
    /// Errors if the driver cannot start.
    pub fn open(mut driver: D, config: ServerConfig) -> Result<Self, ServerError<D::Error>> {
        driver.start().map_err(ServerError::Driver)?;
        let recv_buf = vec![0; config.conn.max_packet_bytes].into_boxed_slice();
        Ok(Self {
            driver,
            config,
            peers: PeerTable::new(),
            events: VecDeque::new(),
            recv_buf,
            new_peers_dropped: Saturating(0),
        })
    }

    /// Ingests pending datagrams, runs per-connection timeout detection, and
    /// turns connection activity into events. Call once per tick before
    /// [`Server::poll`].
    ///
    /// # Errors
    ///
    /// Errors only on driver failure, which is fatal for the endpoint.
    pub fn update(&mut self, now: Instant) -> Result<(), ServerError<D::Error>> {
        loop {
            match self.driver.poll_recv(&mut self.recv_buf) {
                Ok(Some((len, peer))) => {
                    if let Some(entry) = self.peers.get_mut(peer) {
                        if let Err(err) = entry.conn.recv(now, &self.recv_buf[..len]) {
                            trace!(?peer, "dropped datagram: {err}");
                        }
                    } else {
                        self.new_peer(now, peer, len);
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(ServerError::Driver(err)),
            }
        }

        let peers: Vec<_> = self.peers.keys().collect();
        for peer in peers {
            let Some(entry) = self.peers.get_mut(peer) else {
                continue;
            };
            entry.conn.update(now);
            while let Some(event) = entry.conn.poll_event() {
                match event {
                    // raised by accept(); the host initiated it, no event
                    ConnectionEvent::Connected => {}
                    ConnectionEvent::Disconnected(reason) => {
                        self.events
                            .push_back(ServerEvent::Disconnected { peer, reason });
                    }
                }
            }
            if entry.accepted {
                for (lane, msg) in entry.conn.drain_msgs() {
                    self.events.push_back(ServerEvent::Recv { peer, lane, msg });
                }
            }
            if entry.conn.state() == ConnectionState::Closed {
                self.peers.remove(peer);
            }
        }
        Ok(())
    }

    /// Handles the first datagram from an unknown address.
    fn new_peer(&mut self, now: Instant, peer: D::Peer, len: usize) {
        if self.peers.len() >= self.config.max_peers {
            // no RST, nothing: the stranger is not worth a datagram
            self.new_peers_dropped += Saturating(1);
            return;
        }
        let mut conn = Connection::new(self.config.conn.clone(), now);
        match conn.recv(now, &self.recv_buf[..len]) {
            Ok(()) if conn.state() != ConnectionState::Closed => {
                debug!(?peer, "connection request");
                self.peers.insert(
                    peer,
                    Peer {
                        conn,
                        accepted: false,
                    },
                );
                self.events.push_back(ServerEvent::ConnectionRequest(peer));
            }
            Ok(()) => {}
            Err(err) => trace!(?peer, "ignored datagram from unknown peer: {err}"),
        }
    }

    /// Accepts a peer that raised [`ServerEvent::ConnectionRequest`],
    /// marking its connection live and notifying it.
    ///
    /// # Errors
    ///
    /// Errors if the peer is not in the table (it may have timed out since
    /// the request).
    pub fn accept(&mut self, peer: D::Peer) -> Result<(), ServerError<D::Error>> {
        let entry = self.peers.get_mut(peer).ok_or(ServerError::UnknownPeer)?;
        if !entry.accepted {
            entry.accepted = true;
            entry.conn.promote();
            entry.conn.queue_accepted();
        }
        Ok(())
    }

    /// Rejects a peer that raised [`ServerEvent::ConnectionRequest`],
    /// dropping it silently. The peer finds out by timing out.
    ///
    /// # Errors
    ///
    /// Errors if the peer is not in the table.
    pub fn reject(&mut self, peer: D::Peer) -> Result<(), ServerError<D::Error>> {
        self.peers
            .remove(peer)
            .map(|_| ())
            .ok_or(ServerError::UnknownPeer)
    }

    /// Disconnects a peer on purpose, notifying it best-effort.
    ///
    /// # Errors
    ///
    /// Errors if the peer is not in the table.
    pub fn disconnect(&mut self, now: Instant, peer: D::Peer) -> Result<(), ServerError<D::Error>> {
        let mut entry = self.peers.remove(peer).ok_or(ServerError::UnknownPeer)?;
        for packet in entry.conn.close(now, 0) {
            if self.driver.send_to(peer, &packet).is_err() {
                break;
            }
        }
        self.events.push_back(ServerEvent::Disconnected {
            peer,
            reason: DisconnectReason::Local,
        });
        Ok(())
    }

    /// Queues a message for one peer on the unreliable sequenced lane.
    ///
    /// # Errors
    ///
    /// Errors if the peer is unknown or the message cannot be queued.
    pub fn send_unreliable_to(
        &mut self,
        peer: D::Peer,
        msg: impl Into<Bytes>,
    ) -> Result<Seq, ServerError<D::Error>> {
        self.send_to(peer, LANE_UNRELIABLE, msg.into())
    }

    /// Queues a message for one peer on the reliable ordered lane.
    ///
    /// # Errors
    ///
    /// Errors if the peer is unknown or the message cannot be queued.
    pub fn send_reliable_to(
        &mut self,
        peer: D::Peer,
        msg: impl Into<Bytes>,
    ) -> Result<Seq, ServerError<D::Error>> {
        self.send_to(peer, LANE_RELIABLE, msg.into())
    }

    fn send_to(
        &mut self,
        peer: D::Peer,
        lane: LaneIndex,
        msg: Bytes,
    ) -> Result<Seq, ServerError<D::Error>> {
        let entry = self.peers.get_mut(peer).ok_or(ServerError::UnknownPeer)?;
        Ok(entry.conn.send(lane, msg)?)
    }

    /// Queues a message for every accepted peer on the unreliable sequenced
    /// lane. Best-effort per peer; a full window on one peer does not stop
    /// the others.
    pub fn broadcast_unreliable(&mut self, msg: impl Into<Bytes>) {
        self.broadcast(LANE_UNRELIABLE, msg.into());
    }

    /// Queues a message for every accepted peer on the reliable ordered
    /// lane. Best-effort per peer.
    pub fn broadcast_reliable(&mut self, msg: impl Into<Bytes>) {
        self.broadcast(LANE_RELIABLE, msg.into());
    }

    fn broadcast(&mut self, lane: LaneIndex, msg: Bytes) {
        for (peer, entry) in self.peers.iter_mut() {
            if !entry.accepted {
                continue;
            }
            if let Err(err) = entry.conn.send(lane, msg.clone()) {
                trace!(?peer, "broadcast skipped peer: {err}");
            }
        }
    }

    /// Takes the next pending event.
    pub fn poll(&mut self) -> Option<ServerEvent<D::Peer>> {
        self.events.pop_front()
    }

    /// Emits pending packets for every accepted peer. Peers whose
    /// connection request has not been answered receive nothing.
    ///
    /// # Errors
    ///
    /// Errors only on driver failure.
    pub fn flush(&mut self, now: Instant) -> Result<(), ServerError<D::Error>> {
        let peers: Vec<_> = self.peers.keys().collect();
        for peer in peers {
            let Some(entry) = self.peers.get_mut(peer) else {
                continue;
            };
            if !entry.accepted {
                continue;
            }
            for packet in entry.conn.flush(now) {
                self.driver
                    .send_to(peer, &packet)
                    .map_err(ServerError::Driver)?;
            }
        }
        Ok(())
    }

    /// Closes every connection and stops the driver.
    pub fn stop(&mut self, now: Instant) {
        let peers: Vec<_> = self.peers.keys().collect();
        for peer in peers {
            let _ = self.disconnect(now, peer);
        }
        self.driver.stop();
    }

    /// Number of peers in the table, accepted or pending.
    #[must_use]
    pub const fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Iterates over accepted peers.
    pub fn clients(&self) -> impl Iterator<Item = D::Peer> + '_ {
        self.peers
            .iter()
            .filter_map(|(peer, entry)| entry.accepted.then_some(peer))
    }

    /// Round-trip estimate to a peer, if known.
    #[must_use]
    pub fn client_rtt(&self, peer: D::Peer) -> Option<Duration> {
        self.peers.get(peer).map(|entry| entry.conn.rtt().get())
    }

    /// Connection counters for a peer, if known.
    #[must_use]
    pub fn client_stats(&self, peer: D::Peer) -> Option<ConnectionStats> {
        self.peers.get(peer).map(|entry| entry.conn.stats())
    }

    /// Datagrams from new addresses dropped because the peer table was at
    /// [`ServerConfig::max_peers`].
    #[must_use]
    pub const fn new_peers_dropped(&self) -> usize {
        self.new_peers_dropped.0
    }

    /// The driver this server runs on.
    pub const fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
