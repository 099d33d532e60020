use std::collections::HashSet;

/// Length of the duplicate-suppression ring; a prime spreads ids evenly.
pub const DEFAULT_HISTORY_LEN: usize = 1009;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub pkt_id: u32,
    pub offset: u32,
}

/// Fixed-size ring of recently received `(pkt_id, offset)` pairs.
///
/// Suppression is best-effort: once a pair is overwritten by newer traffic a
/// late duplicate of it is accepted again.
pub struct PacketHistory {
    ring: Vec<Option<HistoryKey>>,
    pos: usize,
    index: HashSet<HistoryKey>,
}

impl PacketHistory {
    fn check_rep(&self) {
        assert!(self.pos < self.ring.len());
        assert!(self.index.len() <= self.ring.len());
    }

    #[must_use]
    pub fn new(len: usize) -> Self {
        let this = PacketHistory {
            ring: vec![None; usize::max(len, 1)],
            pos: 0,
            index: HashSet::new(),
        };
        this.check_rep();
        this
    }

    #[must_use]
    pub fn contains(&self, key: &HistoryKey) -> bool {
        self.index.contains(key)
    }

    /// Records `key`, returning `false` if it was already present.
    pub fn insert(&mut self, key: HistoryKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        // keys are unique in the ring, so evicting one frees it
        if let Some(evicted) = self.ring[self.pos].take() {
            self.index.remove(&evicted);
        }
        self.ring[self.pos] = Some(key);
        self.index.insert(key);
        self.pos = (self.pos + 1) % self.ring.len();
        self.check_rep();
        true
    }

    pub fn clear(&mut self) {
        self.ring.iter_mut().for_each(|k| *k = None);
        self.index.clear();
        self.pos = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{HistoryKey, PacketHistory};

    fn key(pkt_id: u32, offset: u32) -> HistoryKey {
        HistoryKey { pkt_id, offset }
    }

    #[test]
    fn test_duplicate() {
        let mut history = PacketHistory::new(7);
        assert!(history.insert(key(1, 0)));
        assert!(history.insert(key(1, 1360)));
        assert!(!history.insert(key(1, 0)));
        assert!(history.contains(&key(1, 1360)));
        assert!(!history.contains(&key(2, 0)));
    }

    #[test]
    fn test_overwrite() {
        let mut history = PacketHistory::new(3);
        for id in 1..=4 {
            assert!(history.insert(key(id, 0)));
        }
        // the oldest entry has been overwritten
        assert!(!history.contains(&key(1, 0)));
        assert_eq!(history.len(), 3);
        assert!(history.insert(key(1, 0)));
        assert!(!history.contains(&key(2, 0)));
    }

    #[test]
    fn test_many_laps() {
        let mut history = PacketHistory::new(5);
        for id in 0..100 {
            assert!(history.insert(key(id, 0)));
        }
        assert_eq!(history.len(), 5);
        assert!((95..100).all(|id| history.contains(&key(id, 0))));
        assert!(!history.contains(&key(94, 0)));
    }

    #[test]
    fn test_clear() {
        let mut history = PacketHistory::new(3);
        history.insert(key(9, 9));
        history.clear();
        assert!(history.is_empty());
        assert!(history.insert(key(9, 9)));
    }
}
