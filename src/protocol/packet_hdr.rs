use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{
    DecodingError, FLAG_MULTIPACKET, FLAG_PRIORITY, MAX_PACKET_SIZE, PACKET_HDR_LEN, SEQ_TAG_MASK,
    SEQ_TAG_SHIFT,
};

const RESERVED_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    High = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pkt_id: u32,
    offset: u32,
    msg_size: u32,
    pkt_size: u16,
    flags: u8,
}

pub struct PacketHeaderBuilder {
    pub pkt_id: u32,
    pub offset: u32,
    pub msg_size: u32,
    pub pkt_size: u16,
    pub priority: Priority,
    pub multi_packet: bool,
    pub seq_tag: u8,
}

impl PacketHeaderBuilder {
    pub fn build(self) -> Result<PacketHeader, Error> {
        if !(PACKET_HDR_LEN + self.pkt_size as usize <= MAX_PACKET_SIZE) {
            return Err(Error::PacketTooLarge);
        }
        if self.pkt_size != 0
            && !self.multi_packet
            && !(self.offset as u64 + self.pkt_size as u64 <= self.msg_size as u64)
        {
            return Err(Error::OutOfRange);
        }
        let mut flags = (self.seq_tag & SEQ_TAG_MASK) << SEQ_TAG_SHIFT;
        flags |= u8::from(self.priority) & FLAG_PRIORITY;
        if self.multi_packet {
            flags |= FLAG_MULTIPACKET;
        }
        let this = PacketHeader {
            pkt_id: self.pkt_id,
            offset: self.offset,
            msg_size: self.msg_size,
            pkt_size: self.pkt_size,
            flags,
        };
        this.check_rep();
        Ok(this)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    PacketTooLarge,
    OutOfRange,
}

impl PacketHeader {
    #[inline]
    fn check_rep(&self) {
        assert!(PACKET_HDR_LEN + self.pkt_size as usize <= MAX_PACKET_SIZE);
    }

    /// Reads one header; the payload is left in the cursor.
    pub fn from_bytes(rdr: &mut Cursor<&[u8]>) -> Result<Self, DecodingError> {
        let pkt_id = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "pkt_id" })?;
        let offset = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "offset" })?;
        let msg_size = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "msg_size" })?;
        let pkt_size = rdr
            .read_u16::<LittleEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "pkt_size" })?;
        let flags = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "flags" })?;
        let mut reserved = [0; RESERVED_LEN];
        io::Read::read_exact(rdr, &mut reserved)
            .map_err(|_e| DecodingError::Decoding { field: "reserved" })?;

        if !(PACKET_HDR_LEN + pkt_size as usize <= MAX_PACKET_SIZE) {
            return Err(DecodingError::Oversized(PACKET_HDR_LEN + pkt_size as usize));
        }

        let this = PacketHeader {
            pkt_id,
            offset,
            msg_size,
            pkt_size,
            flags,
        };
        this.check_rep();
        Ok(this)
    }

    pub fn append_to(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        // writes into a `Vec` cannot fail
        buf.write_u32::<LittleEndian>(self.pkt_id).unwrap();
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u32::<LittleEndian>(self.msg_size).unwrap();
        buf.write_u16::<LittleEndian>(self.pkt_size).unwrap();
        buf.write_u8(self.flags).unwrap();
        buf.extend_from_slice(&[0; RESERVED_LEN]);
        assert_eq!(buf.len() - start, PACKET_HDR_LEN);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut hdr = Vec::with_capacity(PACKET_HDR_LEN);
        self.append_to(&mut hdr);
        hdr
    }

    #[must_use]
    #[inline]
    pub fn pkt_id(&self) -> u32 {
        self.pkt_id
    }

    #[must_use]
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    #[inline]
    pub fn msg_size(&self) -> u32 {
        self.msg_size
    }

    #[must_use]
    #[inline]
    pub fn pkt_size(&self) -> u16 {
        self.pkt_size
    }

    #[must_use]
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[must_use]
    #[inline]
    pub fn priority(&self) -> Priority {
        // a single bit always maps onto a variant
        Priority::try_from(self.flags & FLAG_PRIORITY).unwrap_or(Priority::Low)
    }

    #[must_use]
    #[inline]
    pub fn is_multi_packet(&self) -> bool {
        self.flags & FLAG_MULTIPACKET != 0
    }

    #[must_use]
    #[inline]
    pub fn is_ack(&self) -> bool {
        self.pkt_size == 0
    }

    #[must_use]
    #[inline]
    pub fn seq_tag(&self) -> u8 {
        (self.flags >> SEQ_TAG_SHIFT) & SEQ_TAG_MASK
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_layout() {
        let hdr = PacketHeaderBuilder {
            pkt_id: 0x0403_0201,
            offset: 1360,
            msg_size: 3000,
            pkt_size: 1360,
            priority: Priority::High,
            multi_packet: false,
            seq_tag: 5,
        }
        .build()
        .unwrap();
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), PACKET_HDR_LEN);
        assert_eq!(
            bytes,
            vec![
                1, 2, 3, 4, // pkt_id
                0x50, 0x05, 0, 0, // offset
                0xb8, 0x0b, 0, 0, // msg_size
                0x50, 0x05, // pkt_size
                (5 << 2) | 1, // flags
                0, 0, 0, 0, 0, // reserved
            ]
        );
        let hdr2 = PacketHeader::from_bytes(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(hdr, hdr2);
        assert_eq!(hdr2.priority(), Priority::High);
        assert_eq!(hdr2.seq_tag(), 5);
        assert!(!hdr2.is_multi_packet());
        assert!(!hdr2.is_ack());
    }

    #[test]
    fn test_truncated() {
        let bytes = vec![0; PACKET_HDR_LEN - 1];
        let err = PacketHeader::from_bytes(&mut Cursor::new(&bytes[..])).unwrap_err();
        assert_eq!(err, DecodingError::Decoding { field: "reserved" });
    }

    #[test]
    fn test_oversized() {
        let mut bytes = PacketHeaderBuilder {
            pkt_id: 1,
            offset: 0,
            msg_size: 10,
            pkt_size: 10,
            priority: Priority::Low,
            multi_packet: false,
            seq_tag: 0,
        }
        .build()
        .unwrap()
        .to_bytes();
        bytes[12] = 0xff;
        bytes[13] = 0xff;
        assert!(matches!(
            PacketHeader::from_bytes(&mut Cursor::new(&bytes[..])),
            Err(DecodingError::Oversized(_))
        ));
    }

    #[test]
    fn test_builder_rejects_out_of_range() {
        let result = PacketHeaderBuilder {
            pkt_id: 1,
            offset: 8,
            msg_size: 10,
            pkt_size: 4,
            priority: Priority::Low,
            multi_packet: false,
            seq_tag: 0,
        }
        .build();
        assert_eq!(result.unwrap_err(), Error::OutOfRange);
    }
}
