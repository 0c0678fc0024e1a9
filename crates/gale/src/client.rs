//! Client endpoint: one driver, one connection to a server.

use std::collections::VecDeque;

use bytes::Bytes;
use gale_proto::{
    conn::{
        Connection, ConnectionConfig, ConnectionEvent, ConnectionState, ConnectionStats,
        DisconnectReason, SendError, LANE_RELIABLE, LANE_UNRELIABLE,
    },
    lane::LaneIndex,
    rtt::RttEstimator,
    seq::Seq,
};
use tracing::trace;
use web_time::Instant;

use crate::driver::Driver;

/// Event raised by a [`Client`], drained via [`Client::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection to the server is live.
    Connected,
    /// The connection ended; no further events will be raised.
    Disconnected(DisconnectReason),
    /// The server sent a message.
    Recv {
        /// Lane the message arrived on.
        lane: LaneIndex,
        /// Message payload.
        msg: Bytes,
    },
}

/// Error from a [`Client`] operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError<E> {
    /// The underlying transport failed; the client is unusable.
    #[error("driver failure")]
    Driver(#[source] E),
    /// Could not queue a message.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Client endpoint: connects to one server over a [`Driver`] and runs the
/// connection on the host's game loop.
///
/// Drive it each tick with [`Client::update`] (ingest + timeouts), then
/// [`Client::poll`] until empty, then [`Client::flush`] (emit). Time comes
/// from the host; pass the same `now` within one tick.
#[derive(Debug)]
pub struct Client<D: Driver> {
    driver: D,
    server: D::Peer,
    conn: Connection,
    events: VecDeque<ClientEvent>,
    recv_buf: Box<[u8]>,
}

impl<D: Driver> Client<D> {
    /// Starts the driver and begins connecting to `server`.
    ///
    /// The connection is live once [`ClientEvent::Connected`] is raised; if
    /// the server never answers, [`ClientEvent::Disconnected`] with
    /// [`DisconnectReason::FailedToConnect`] follows instead.
    ///
    /// # Errors
    ///
    /// Errors if the driver cannot start.
    pub fn connect(
        mut driver: D,
        server: D::Peer,
        config: ConnectionConfig,
        now: Instant,
    ) -> Result<Self, ClientError<D::Error>> {
        driver.start().map_err(ClientError::Driver)?;
        let recv_buf = vec![0; config.max_packet_bytes].into_boxed_slice();
        Ok(Self {
            driver,
            server,
            conn: Connection::new(config, now),
            events: VecDeque::new(),
            recv_buf,
        })
    }

    /// Queues a message on the unreliable sequenced lane.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub fn send_unreliable(&mut self, msg: impl Into<Bytes>) -> Result<Seq, ClientError<D::Error>> {
        Ok(self.conn.send(LANE_UNRELIABLE, msg.into())?)
    }

    /// Queues a message on the reliable ordered lane.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub fn send_reliable(&mut self, msg: impl Into<Bytes>) -> Result<Seq, ClientError<D::Error>> {
        Ok(self.conn.send(LANE_RELIABLE, msg.into())?)
    }

    /// Ingests pending datagrams and runs timeout detection. Call once per
    /// tick before [`Client::poll`].
    ///
    /// # Errors
    ///
    /// Errors only on driver failure, which is fatal for the endpoint.
    pub fn update(&mut self, now: Instant) -> Result<(), ClientError<D::Error>> {
        loop {
            match self.driver.poll_recv(&mut self.recv_buf) {
                Ok(Some((len, peer))) => {
                    if peer != self.server {
                        // not our server; a stray or spoofed datagram
                        continue;
                    }
                    match self.conn.recv(now, &self.recv_buf[..len]) {
                        // the first valid packet from the server completes
                        // the connect
                        Ok(()) => self.conn.promote(),
                        Err(err) => trace!("dropped datagram: {err}"),
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(ClientError::Driver(err)),
            }
        }
        self.conn.update(now);

        while let Some(event) = self.conn.poll_event() {
            self.events.push_back(match event {
                ConnectionEvent::Connected => ClientEvent::Connected,
                ConnectionEvent::Disconnected(reason) => ClientEvent::Disconnected(reason),
            });
        }
        for (lane, msg) in self.conn.drain_msgs() {
            self.events.push_back(ClientEvent::Recv { lane, msg });
        }
        Ok(())
    }

    /// Takes the next pending event.
    pub fn poll(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// Emits pending packets through the driver. Call once per tick, after
    /// queueing sends.
    ///
    /// # Errors
    ///
    /// Errors only on driver failure.
    pub fn flush(&mut self, now: Instant) -> Result<(), ClientError<D::Error>> {
        for packet in self.conn.flush(now) {
            self.driver
                .send_to(self.server, &packet)
                .map_err(ClientError::Driver)?;
        }
        Ok(())
    }

    /// Closes the connection, notifying the server best-effort, and stops
    /// the driver. [`ClientEvent::Disconnected`] is raised for the host.
    pub fn close(&mut self, now: Instant) {
        for packet in self.conn.close(now, 0) {
            if self.driver.send_to(self.server, &packet).is_err() {
                break;
            }
        }
        self.driver.stop();
        while let Some(event) = self.conn.poll_event() {
            if let ConnectionEvent::Disconnected(reason) = event {
                self.events.push_back(ClientEvent::Disconnected(reason));
            }
        }
    }

    /// Lifecycle state of the connection to the server.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Round-trip estimate to the server.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        self.conn.rtt()
    }

    /// Connection counters.
    #[must_use]
    pub const fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    /// The driver this client runs on.
    pub const fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
