use std::{
    io::Cursor,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::warn;

use crate::protocol::{
    packet::{Packet, PacketBuilder},
    packet_hdr::{PacketHeaderBuilder, Priority},
    DecodingError, EncodingError, MAX_PACKET_SIZE, PACKET_HDR_LEN,
};

use super::rtt::DEFAULT_RTO;

/// A packet on its way in or out, plus the bookkeeping the transport needs.
#[derive(Debug, Clone)]
pub struct PacketEntry {
    client_id: u32,
    packet: Packet,
    timestamp: Instant,
    retransmitted: bool,
    rto: Duration,
}

pub struct PacketEntryBuilder {
    pub priority: Priority,
    pub client_id: u32,
    pub pkt_id: u32,
    pub offset: u32,
    pub msg_size: u32,
    pub seq_tag: u8,
    pub payload: Bytes,
}

impl PacketEntryBuilder {
    pub fn build(self, now: Instant) -> Result<PacketEntry, EncodingError> {
        let packet = PacketBuilder {
            hdr: PacketHeaderBuilder {
                pkt_id: self.pkt_id,
                offset: self.offset,
                msg_size: self.msg_size,
                pkt_size: 0,
                priority: self.priority,
                multi_packet: false,
                seq_tag: self.seq_tag,
            },
            payload: self.payload,
        }
        .build()?;
        Ok(PacketEntry::from_packet(self.client_id, packet, now))
    }
}

impl PacketEntry {
    #[must_use]
    pub fn from_packet(client_id: u32, packet: Packet, now: Instant) -> Self {
        PacketEntry {
            client_id,
            packet,
            timestamp: now,
            retransmitted: false,
            rto: DEFAULT_RTO,
        }
    }

    pub fn from_datagram(client_id: u32, buf: &[u8], now: Instant) -> Result<Self, DecodingError> {
        let packet = Packet::from_datagram(buf)?;
        Ok(Self::from_packet(client_id, packet, now))
    }

    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        !self.retransmitted && !self.packet.hdr().is_multi_packet()
    }

    /// Whether `other` can be absorbed without exceeding `MAX_PACKET_SIZE`.
    #[must_use]
    pub fn can_merge(&self, other: &PacketEntry) -> bool {
        if self.client_id != other.client_id {
            return false;
        }
        if self.retransmitted || !other.is_mergeable() {
            return false;
        }
        let merged_len = if self.packet.hdr().is_multi_packet() {
            self.packet.len() + other.packet.len()
        } else {
            PACKET_HDR_LEN + self.packet.len() + other.packet.len()
        };
        merged_len <= MAX_PACKET_SIZE
    }

    /// Absorbs `other`, turning `self` into a multi-packet container if it is
    /// not one yet. Hands `other` back if the two cannot be merged.
    pub fn merge(&mut self, other: PacketEntry) -> Result<(), PacketEntry> {
        if !self.can_merge(&other) {
            return Err(other);
        }
        let priority = Priority::max(self.priority(), other.priority());
        let mut payload = Vec::with_capacity(MAX_PACKET_SIZE);
        if self.packet.hdr().is_multi_packet() {
            payload.extend_from_slice(self.packet.payload());
        } else {
            self.packet.append_to(&mut payload);
        }
        other.packet.append_to(&mut payload);

        let payload_len = payload.len() as u32;
        // both lengths were checked by `can_merge`
        let container = PacketBuilder {
            hdr: PacketHeaderBuilder {
                pkt_id: 0,
                offset: 0,
                msg_size: payload_len,
                pkt_size: 0,
                priority,
                multi_packet: true,
                seq_tag: 0,
            },
            payload: Bytes::from(payload),
        }
        .build()
        .map_err(|_e| other.clone())?;
        self.packet = container;
        self.timestamp = Instant::min(self.timestamp, other.timestamp);
        Ok(())
    }

    /// Splits a multi-packet container into its inner packets.
    ///
    /// Stops at the first malformed inner packet; everything after it is
    /// dropped.
    #[must_use]
    pub fn split(&self) -> Vec<PacketEntry> {
        let mut entries = Vec::new();
        if !self.packet.hdr().is_multi_packet() {
            return entries;
        }
        let src = self.packet.payload();
        let mut rdr = Cursor::new(&src[..]);
        while (rdr.position() as usize) < src.len() {
            let inner = match Packet::from_cursor(&mut rdr, src) {
                Ok(x) => x,
                Err(e) => {
                    warn!(client_id = self.client_id, error = %e, "malformed packet inside container");
                    break;
                }
            };
            if inner.hdr().is_multi_packet() {
                warn!(client_id = self.client_id, "nested container");
                break;
            }
            entries.push(PacketEntry::from_packet(
                self.client_id,
                inner,
                self.timestamp,
            ));
        }
        entries
    }

    pub fn to_retransmit(&mut self, now: Instant, max_rto: Duration) {
        self.timestamp = now;
        self.retransmitted = true;
        self.rto = Duration::min(self.rto * 2, max_rto);
    }

    /// Restarts the clock when the entry actually leaves the socket.
    pub fn touch(&mut self, now: Instant) {
        self.timestamp = now;
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.timestamp + self.rto
    }

    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = rto;
    }

    pub fn set_client_id(&mut self, client_id: u32) {
        self.client_id = client_id;
    }

    #[must_use]
    #[inline]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    #[must_use]
    #[inline]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    #[must_use]
    #[inline]
    pub fn priority(&self) -> Priority {
        self.packet.hdr().priority()
    }

    #[must_use]
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    #[must_use]
    #[inline]
    pub fn is_retransmitted(&self) -> bool {
        self.retransmitted
    }

    #[must_use]
    #[inline]
    pub fn rto(&self) -> Duration {
        self.rto
    }

    #[must_use]
    pub fn since_sent(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}
