//! # Packet header
//!
//! All multi-byte fields are little-endian.
//!
//! ```text
//! 0               4               8               12      14  15          20 (BYTE)
//! +---------------+---------------+---------------+-------+---+-----------+
//! |    pkt_id     |    offset     |   msg_size    |pkt_sz |flg| reserved  |
//! +---------------+---------------+---------------+-------+---+-----------+
//! |                                                                       |
//! |                        Payload (pkt_sz bytes)                         |
//! |                                                                       |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! # Flags
//!
//! ```text
//!  7               2   1   0 (BIT)
//! +-------------------+---+---+
//! |   sequence tag    | M | P |
//! +-------------------+---+---+
//! ```
//!
//! - `P`: priority, `0` low, `1` high (acknowledged)
//! - `M`: multi-packet container
//!
//! # Multi-packet container
//!
//! ```text
//! (Packet header: pkt_id = 0, M = 1)
//! ((Packet header) (Payload))*
//! ```
//!
//! # Invariants
//!
//! - `pkt_sz == 0` encodes an ACK of message `pkt_id`
//! - `PACKET_HDR_LEN + pkt_sz <= MAX_PACKET_SIZE`
//! - `offset + pkt_sz <= msg_size` for data packets

pub mod message;
pub mod packet;
pub mod packet_hdr;

use thiserror::Error;

pub const MAX_PACKET_SIZE: usize = 1400;
pub const PACKET_HDR_LEN: usize = 20;
/// Largest fragment body; leaves room for a container header so any single
/// packet can still travel inside a multi-packet.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_SIZE - 2 * PACKET_HDR_LEN;

pub const FLAG_PRIORITY: u8 = 0x01;
pub const FLAG_MULTIPACKET: u8 = 0x02;
pub const SEQ_TAG_SHIFT: u8 = 2;
pub const SEQ_TAG_MASK: u8 = 0x3f;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodingError {
    #[error("truncated field `{field}`")]
    Decoding { field: &'static str },
    #[error("declared payload of {declared} bytes but only {available} available")]
    Truncated { declared: usize, available: usize },
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    Oversized(usize),
    #[error("fragment [{offset}, {end}) overruns message of {msg_size} bytes")]
    OutOfRange { offset: u32, end: u64, msg_size: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("payload of {0} bytes does not fit in one packet")]
    PayloadTooLarge(usize),
}
