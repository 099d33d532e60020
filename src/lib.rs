//! Reliable datagram transport over UDP.
//!
//! Messages are fragmented into packets of at most `MAX_PACKET_SIZE` bytes,
//! small packets to the same peer are merged into one datagram, and HIGH
//! priority messages are acknowledged and retransmitted until they are.
//! `layer::OrderedReceiver` restores per-type order above the transport.

pub mod config;
pub mod error;
pub mod layer;
pub mod protocol;
pub mod utils;
