use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::packet_hdr::Priority;

pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MessageKey {
    client_id: u32,
    msg_id: u32,
}

struct Partial {
    buf: Vec<u8>,
    // start -> end, merged and non-overlapping
    received: BTreeMap<u32, u32>,
    seq_tag: u8,
    priority: Priority,
    first_seen: Instant,
}

impl Partial {
    fn is_complete(&self) -> bool {
        match self.received.iter().next() {
            Some((&start, &end)) => {
                self.received.len() == 1 && start == 0 && end as usize == self.buf.len()
            }
            None => self.buf.is_empty(),
        }
    }

    fn insert_range(&mut self, mut start: u32, mut end: u32) {
        if let Some((&s, &e)) = self.received.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = u32::max(end, e);
                self.received.remove(&s);
            }
        }
        loop {
            let next = self.received.range(start..).next().map(|(&s, &e)| (s, e));
            match next {
                Some((s, e)) if s <= end => {
                    end = u32::max(end, e);
                    self.received.remove(&s);
                }
                _ => break,
            }
        }
        self.received.insert(start, end);
    }
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub client_id: u32,
    pub msg_id: u32,
    pub priority: Priority,
    pub bytes: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment [{offset}, {end}) overruns message of {total_size} bytes")]
    OutOfRange {
        offset: u32,
        end: u64,
        total_size: u32,
    },
    #[error("message of {total_size} bytes exceeds the {max} byte limit")]
    TooLarge { total_size: u32, max: u32 },
    #[error("fragment declares {got} bytes but the message has {expected}")]
    SizeMismatch { expected: u32, got: u32 },
    #[error("fragment sequence tag {got} differs from {expected}")]
    TagMismatch { expected: u8, got: u8 },
}

pub struct Fragment {
    pub client_id: u32,
    pub msg_id: u32,
    pub offset: u32,
    pub total_size: u32,
    pub seq_tag: u8,
    pub priority: Priority,
    pub bytes: Bytes,
}

/// Accumulates fragments per `(client_id, msg_id)` until a message is whole.
pub struct Reassembler {
    partials: HashMap<MessageKey, Partial>,
    max_message_size: u32,
}

impl Reassembler {
    #[must_use]
    pub fn new(max_message_size: u32) -> Self {
        Reassembler {
            partials: HashMap::new(),
            max_message_size,
        }
    }

    /// Stores a fragment. Returns the whole message once every byte of
    /// `[0, total_size)` has arrived. On error the partial message is dropped.
    pub fn add_fragment(
        &mut self,
        frag: Fragment,
        now: Instant,
    ) -> Result<Option<Completed>, ReassemblyError> {
        let key = MessageKey {
            client_id: frag.client_id,
            msg_id: frag.msg_id,
        };
        let end = frag.offset as u64 + frag.bytes.len() as u64;
        if end > frag.total_size as u64 {
            self.drop_partial(&key);
            return Err(ReassemblyError::OutOfRange {
                offset: frag.offset,
                end,
                total_size: frag.total_size,
            });
        }
        if frag.total_size > self.max_message_size {
            self.drop_partial(&key);
            return Err(ReassemblyError::TooLarge {
                total_size: frag.total_size,
                max: self.max_message_size,
            });
        }

        // hot path: unfragmented message
        if frag.offset == 0
            && frag.bytes.len() == frag.total_size as usize
            && !self.partials.contains_key(&key)
        {
            return Ok(Some(Completed {
                client_id: frag.client_id,
                msg_id: frag.msg_id,
                priority: frag.priority,
                bytes: frag.bytes,
            }));
        }

        let partial = self.partials.entry(key).or_insert_with(|| Partial {
            buf: vec![0; frag.total_size as usize],
            received: BTreeMap::new(),
            seq_tag: frag.seq_tag,
            priority: frag.priority,
            first_seen: now,
        });
        if partial.buf.len() != frag.total_size as usize {
            let expected = partial.buf.len() as u32;
            self.drop_partial(&key);
            return Err(ReassemblyError::SizeMismatch {
                expected,
                got: frag.total_size,
            });
        }
        if partial.seq_tag != frag.seq_tag {
            let expected = partial.seq_tag;
            self.drop_partial(&key);
            return Err(ReassemblyError::TagMismatch {
                expected,
                got: frag.seq_tag,
            });
        }

        let start = frag.offset as usize;
        partial.buf[start..start + frag.bytes.len()].copy_from_slice(&frag.bytes);
        if !frag.bytes.is_empty() {
            partial.insert_range(frag.offset, end as u32);
        }
        partial.priority = Priority::max(partial.priority, frag.priority);

        if !partial.is_complete() {
            return Ok(None);
        }
        match self.partials.remove(&key) {
            Some(partial) => Ok(Some(Completed {
                client_id: key.client_id,
                msg_id: key.msg_id,
                priority: partial.priority,
                bytes: Bytes::from(partial.buf),
            })),
            None => Ok(None),
        }
    }

    fn drop_partial(&mut self, key: &MessageKey) {
        if self.partials.remove(key).is_some() {
            debug!(
                client_id = key.client_id,
                msg_id = key.msg_id,
                "dropped partial message"
            );
        }
    }

    /// Whether some fragments of the message are waiting for the rest.
    #[must_use]
    pub fn is_pending(&self, client_id: u32, msg_id: u32) -> bool {
        self.partials
            .contains_key(&MessageKey { client_id, msg_id })
    }

    /// Purges messages whose first fragment arrived `timeout` or longer ago.
    pub fn purge_stale(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.partials.len();
        self.partials.retain(|key, partial| {
            let stale = now.saturating_duration_since(partial.first_seen) >= timeout;
            if stale {
                warn!(
                    client_id = key.client_id,
                    msg_id = key.msg_id,
                    "fragment timeout"
                );
            }
            !stale
        });
        before - self.partials.len()
    }

    pub fn remove_client(&mut self, client_id: u32) {
        self.partials.retain(|key, _| key.client_id != client_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use crate::protocol::packet_hdr::Priority;

    use super::{Fragment, ReassemblyError, Reassembler};

    fn frag(msg_id: u32, offset: u32, total_size: u32, bytes: &[u8]) -> Fragment {
        Fragment {
            client_id: 1,
            msg_id,
            offset,
            total_size,
            seq_tag: 0,
            priority: Priority::Low,
            bytes: Bytes::copy_from_slice(bytes),
        }
    }

    #[test]
    fn test_single() {
        let mut re = Reassembler::new(1 << 20);
        let done = re
            .add_fragment(frag(1, 0, 3, &[1, 2, 3]), Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(&done.bytes[..], &[1, 2, 3]);
        assert!(re.is_empty());
    }

    #[test]
    fn test_reverse_with_duplicate() {
        let now = Instant::now();
        let msg: Vec<u8> = (0..3000u32).map(|x| x as u8).collect();
        let mut re = Reassembler::new(1 << 20);
        assert!(re
            .add_fragment(frag(5, 2720, 3000, &msg[2720..]), now)
            .unwrap()
            .is_none());
        assert!(re
            .add_fragment(frag(5, 1360, 3000, &msg[1360..2720]), now)
            .unwrap()
            .is_none());
        assert!(re
            .add_fragment(frag(5, 1360, 3000, &msg[1360..2720]), now)
            .unwrap()
            .is_none());
        assert!(re.is_pending(1, 5));
        let done = re
            .add_fragment(frag(5, 0, 3000, &msg[..1360]), now)
            .unwrap()
            .unwrap();
        assert_eq!(&done.bytes[..], &msg[..]);
        assert!(!re.is_pending(1, 5));
    }

    #[test]
    fn test_overlap() {
        let now = Instant::now();
        let mut re = Reassembler::new(1 << 20);
        assert!(re
            .add_fragment(frag(1, 2, 10, &[2, 3, 4, 5]), now)
            .unwrap()
            .is_none());
        assert!(re
            .add_fragment(frag(1, 6, 10, &[6, 7, 8, 9]), now)
            .unwrap()
            .is_none());
        let done = re
            .add_fragment(frag(1, 0, 10, &[0, 1, 2]), now)
            .unwrap()
            .unwrap();
        assert_eq!(&done.bytes[..], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_out_of_range_drops() {
        let now = Instant::now();
        let mut re = Reassembler::new(1 << 20);
        re.add_fragment(frag(1, 0, 10, &[0; 4]), now).unwrap();
        let err = re
            .add_fragment(frag(1, 8, 10, &[0; 4]), now)
            .unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::OutOfRange {
                offset: 8,
                end: 12,
                total_size: 10
            }
        );
        assert!(!re.is_pending(1, 1));
    }

    #[test]
    fn test_limits() {
        let now = Instant::now();
        let mut re = Reassembler::new(16);
        assert!(matches!(
            re.add_fragment(frag(1, 0, 17, &[0; 4]), now),
            Err(ReassemblyError::TooLarge { .. })
        ));
        re.add_fragment(frag(2, 0, 8, &[0; 4]), now).unwrap();
        assert!(matches!(
            re.add_fragment(frag(2, 4, 9, &[0; 4]), now),
            Err(ReassemblyError::SizeMismatch { .. })
        ));
        re.add_fragment(frag(3, 0, 8, &[0; 4]), now).unwrap();
        let mut other_tag = frag(3, 4, 8, &[0; 4]);
        other_tag.seq_tag = 9;
        assert!(matches!(
            re.add_fragment(other_tag, now),
            Err(ReassemblyError::TagMismatch { .. })
        ));
        assert!(re.is_empty());
    }

    #[test]
    fn test_purge() {
        let now = Instant::now();
        let mut re = Reassembler::new(1 << 20);
        re.add_fragment(frag(1, 0, 10, &[0; 4]), now).unwrap();
        re.add_fragment(frag(2, 0, 10, &[0; 4]), now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            re.purge_stale(now + Duration::from_secs(10), Duration::from_secs(10)),
            1
        );
        assert!(!re.is_pending(1, 1));
        assert!(re.is_pending(1, 2));
        re.remove_client(1);
        assert!(re.is_empty());
    }
}
