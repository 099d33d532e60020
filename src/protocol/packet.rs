use std::io::Cursor;

use bytes::Bytes;

use super::{
    packet_hdr::{PacketHeader, PacketHeaderBuilder, Priority},
    DecodingError, EncodingError, MAX_PACKET_SIZE, PACKET_HDR_LEN,
};

/// One datagram as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    hdr: PacketHeader,
    payload: Bytes,
}

pub struct PacketBuilder {
    pub hdr: PacketHeaderBuilder,
    pub payload: Bytes,
}

impl PacketBuilder {
    pub fn build(mut self) -> Result<Packet, EncodingError> {
        if !(PACKET_HDR_LEN + self.payload.len() <= MAX_PACKET_SIZE) {
            return Err(EncodingError::PayloadTooLarge(self.payload.len()));
        }
        self.hdr.pkt_size = self.payload.len() as u16;
        let hdr = self
            .hdr
            .build()
            .map_err(|_e| EncodingError::PayloadTooLarge(self.payload.len()))?;
        let this = Packet {
            hdr,
            payload: self.payload,
        };
        this.check_rep();
        Ok(this)
    }
}

impl Packet {
    fn check_rep(&self) {
        assert_eq!(self.hdr.pkt_size() as usize, self.payload.len());
        assert!(self.len() <= MAX_PACKET_SIZE);
    }

    /// An ACK for message `pkt_id`.
    #[must_use]
    pub fn ack(pkt_id: u32, msg_size: u32, priority: Priority) -> Self {
        let hdr = PacketHeaderBuilder {
            pkt_id,
            offset: 0,
            msg_size,
            pkt_size: 0,
            priority,
            multi_packet: false,
            seq_tag: 0,
        }
        .build()
        .expect("an empty payload always fits");
        Packet {
            hdr,
            payload: Bytes::new(),
        }
    }

    /// Validates and parses one whole datagram.
    pub fn from_datagram(buf: &[u8]) -> Result<Self, DecodingError> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(DecodingError::Oversized(buf.len()));
        }
        let mut rdr = Cursor::new(buf);
        Self::from_cursor(&mut rdr, &Bytes::copy_from_slice(buf))
    }

    /// Parses the packet starting at the cursor position of `src`.
    ///
    /// `src` must hold the same bytes the cursor reads; payloads are sliced
    /// out of it without copying.
    pub fn from_cursor(rdr: &mut Cursor<&[u8]>, src: &Bytes) -> Result<Self, DecodingError> {
        let hdr = PacketHeader::from_bytes(rdr)?;
        let start = rdr.position() as usize;
        let available = src.len().saturating_sub(start);
        let declared = hdr.pkt_size() as usize;
        if declared > available {
            return Err(DecodingError::Truncated {
                declared,
                available,
            });
        }
        if !hdr.is_multi_packet() && !hdr.is_ack() {
            let end = hdr.offset() as u64 + declared as u64;
            if end > hdr.msg_size() as u64 {
                return Err(DecodingError::OutOfRange {
                    offset: hdr.offset(),
                    end,
                    msg_size: hdr.msg_size(),
                });
            }
        }
        let payload = src.slice(start..start + declared);
        rdr.set_position((start + declared) as u64);

        let this = Packet { hdr, payload };
        this.check_rep();
        Ok(this)
    }

    pub fn append_to(&self, buf: &mut Vec<u8>) {
        self.hdr.append_to(buf);
        buf.extend_from_slice(&self.payload);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        self.append_to(&mut buf);
        buf
    }

    #[must_use]
    #[inline]
    pub fn hdr(&self) -> &PacketHeader {
        &self.hdr
    }

    #[must_use]
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encoded length, header included.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        PACKET_HDR_LEN + self.payload.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
