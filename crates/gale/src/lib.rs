//! Real-time game networking over unreliable datagram transports.
//!
//! gale gives games two delivery guarantees over one UDP-shaped link:
//! a reliable ordered lane for traffic that must arrive (chat, game events)
//! and an unreliable sequenced lane for traffic that gets refreshed anyway
//! (position updates). The engine is single-threaded and driven from the
//! host's game loop; there are no background threads and no locks.
//!
//! A minimal client tick:
//!
//! ```ignore
//! client.update(now)?;
//! while let Some(event) = client.poll() {
//!     match event {
//!         ClientEvent::Connected => { /* ... */ }
//!         ClientEvent::Recv { msg, .. } => { /* ... */ }
//!         ClientEvent::Disconnected(reason) => { /* ... */ }
//!     }
//! }
//! client.send_reliable(payload)?;
//! client.flush(now)?;
//! ```
//!
//! The protocol internals live in [`gale_proto`], re-exported as [`proto`].
//! Concrete transports live in their own crates (`gale_udp`); the
//! [`sim::Simulator`] wraps any of them with deterministic loss and latency
//! for tests.

pub use gale_proto as proto;

pub mod client;
pub mod driver;
pub mod peers;
pub mod server;
pub mod sim;

pub use {
    client::{Client, ClientError, ClientEvent},
    driver::{Driver, DriverPeer},
    proto::{
        conn::{
            ConnectionConfig, ConnectionState, ConnectionStats, DisconnectReason, SendError,
        },
        lane::{LaneIndex, LaneKind},
        protocol::ProtocolId,
    },
    server::{Server, ServerConfig, ServerError, ServerEvent},
};
