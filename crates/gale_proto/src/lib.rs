//! Sans-IO protocol core for gale, a real-time game networking library.
//!
//! This crate implements the wire protocol and reliability engine without
//! touching a socket or a clock: the host (usually the `gale` endpoints)
//! feeds in datagrams and timestamps, and takes out datagrams, delivered
//! messages and lifecycle events. That keeps the whole engine synchronous,
//! single-threaded, and deterministic under test.
//!
//! The interesting pieces:
//! * [`bits`]: the bit-granularity codec every packet goes through
//! * [`lane`]: per-lane delivery policy (unreliable sequenced, reliable
//!   ordered)
//! * [`conn`]: the connection engine tying lanes, acknowledgements, RTT and
//!   lifecycle together

pub mod ack;
pub mod bits;
pub mod conn;
pub mod lane;
pub mod msg;
pub mod packet;
pub mod protocol;
pub mod rtt;
pub mod seq;
pub mod seq_buf;
