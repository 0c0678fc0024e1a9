//! See [`Driver`].

use std::net::SocketAddr;

/// Identity of a remote peer as seen by a [`Driver`].
///
/// For the UDP driver this is a socket address; other transports may use an
/// opaque peer id. The hash feeds the server's peer table.
pub trait DriverPeer: Copy + Eq + core::fmt::Debug {
    /// Hash of this identity, used to place peers in the server's table.
    ///
    /// This does not need to resist adversarial inputs, but servers exposed
    /// to untrusted networks should prefer a keyed hash here.
    fn peer_hash(&self) -> u64;
}

impl DriverPeer for SocketAddr {
    fn peer_hash(&self) -> u64 {
        match self {
            Self::V4(addr) => u64::from(u32::from(*addr.ip())) ^ u64::from(addr.port()),
            Self::V6(addr) => {
                let folded = addr
                    .ip()
                    .segments()
                    .iter()
                    .fold(0u64, |acc, &seg| (acc << 7) ^ u64::from(seg));
                folded ^ u64::from(addr.port())
            }
        }
    }
}

/// Abstract byte-datagram transport the endpoints drive.
///
/// A driver moves opaque datagrams to and from peers, nothing more; all
/// protocol logic lives above it. Implementations must be non-blocking:
/// [`Driver::poll_recv`] returns what the transport currently holds and
/// [`Driver::send_to`] either hands the datagram off or fails immediately.
///
/// Implementors are a small closed set: the UDP driver in `gale_udp`, the
/// [packet simulator](crate::sim::Simulator) wrapping another driver, and
/// in-memory drivers for tests.
pub trait Driver {
    /// How this transport identifies a remote peer.
    type Peer: DriverPeer;
    /// Transport-level failure, surfaced as a fatal endpoint error.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Acquires transport resources (binds sockets). Called once by the
    /// endpoint taking ownership.
    ///
    /// # Errors
    ///
    /// Errors if the transport cannot be brought up.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Releases transport resources. Packets still in flight are abandoned.
    fn stop(&mut self);

    /// Receives one pending datagram into `buf`, returning its length and
    /// sender, or `None` when the transport holds nothing right now.
    ///
    /// A datagram longer than `buf` may be truncated; the packet layer
    /// rejects it downstream.
    ///
    /// # Errors
    ///
    /// Errors only on transport failure, not on an empty queue.
    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Self::Peer)>, Self::Error>;

    /// Sends one datagram to a peer.
    ///
    /// # Errors
    ///
    /// Errors only on transport failure; an unreliable link silently losing
    /// the datagram is not a failure.
    fn send_to(&mut self, peer: Self::Peer, datagram: &[u8]) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_hash_is_host_xor_port() {
        let addr: SocketAddr = "192.168.1.9:7777".parse().unwrap();
        let host = u64::from(u32::from_be_bytes([192, 168, 1, 9]));
        assert_eq!(host ^ 7777, addr.peer_hash());
    }

    #[test]
    fn distinct_ports_hash_differently() {
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1001".parse().unwrap();
        assert_ne!(a.peer_hash(), b.peer_hash());
    }
}
