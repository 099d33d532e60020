use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use super::DecodingError;

pub const MESSAGE_HDR_LEN: usize = 5;
/// Reserved for liveness probes; consumed by the transport.
pub const MSG_HEARTBEAT: u8 = 0;
/// Sequence number of messages that bypass ordering channels.
pub const UNSEQUENCED: u32 = 0;

/// Application message carried by the transport.
///
/// ```text
/// 0   1               5 (BYTE)
/// +---+---------------+
/// |typ|   sequence    |
/// +---+---------------+
/// |       body        |
/// +-------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub sequence: u32,
    pub body: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(msg_type: u8, body: impl Into<Bytes>) -> Self {
        Message {
            msg_type,
            sequence: UNSEQUENCED,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn sequenced(msg_type: u8, sequence: u32, body: impl Into<Bytes>) -> Self {
        Message {
            msg_type,
            sequence,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Message::new(MSG_HEARTBEAT, Bytes::new())
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == MSG_HEARTBEAT
    }

    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        self.sequence != UNSEQUENCED
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HDR_LEN + self.body.len()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u8(self.msg_type).unwrap();
        buf.write_u32::<LittleEndian>(self.sequence).unwrap();
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }

    pub fn from_bytes(buf: Bytes) -> Result<Self, DecodingError> {
        let mut rdr = Cursor::new(&buf[..]);
        let msg_type = rdr
            .read_u8()
            .map_err(|_e| DecodingError::Decoding { field: "msg_type" })?;
        let sequence = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| DecodingError::Decoding { field: "sequence" })?;
        let body = buf.slice(MESSAGE_HDR_LEN..);
        Ok(Message {
            msg_type,
            sequence,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_encode() {
        let msg = Message::sequenced(3, 0x0102, vec![9, 8]);
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..], &[3, 2, 1, 0, 0, 9, 8]);
        assert_eq!(Message::from_bytes(bytes).unwrap(), msg);
    }

    #[test]
    fn test_short() {
        let err = Message::from_bytes(Bytes::from_static(&[1, 2])).unwrap_err();
        assert_eq!(err, DecodingError::Decoding { field: "sequence" });
    }

    #[test]
    fn test_heartbeat() {
        let msg = Message::heartbeat();
        assert!(msg.is_heartbeat());
        assert!(!msg.is_sequenced());
        assert_eq!(msg.to_bytes().len(), MESSAGE_HDR_LEN);
    }
}
