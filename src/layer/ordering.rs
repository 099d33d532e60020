use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::{
    protocol::{message::Message, packet_hdr::Priority},
    utils::Seq,
};

use super::transport::Delivery;

/// First sequence number of every channel ("priming the pump").
pub const FIRST_SEQUENCE: u32 = 1;
/// Out-of-order messages a channel holds before it gives up on the gap.
pub const DEFAULT_MAX_BUFFERED: usize = 1024;

/// Releases messages of one type strictly in sequence order.
pub struct OrderedChannel<T> {
    next_expected: Seq,
    next_outgoing: Seq,
    buffered: BTreeMap<Seq, T>,
    max_buffered: usize,
}

impl<T> Default for OrderedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedChannel<T> {
    fn check_rep(&self) {
        if let Some((&first, _)) = self.buffered.iter().next() {
            assert!(self.next_expected < first);
        }
        assert!(self.buffered.len() <= self.max_buffered);
    }

    #[must_use]
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Once more than `max_buffered` messages wait behind a gap, the gap is
    /// skipped and the buffered run released.
    #[must_use]
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        let this = OrderedChannel {
            next_expected: Seq::from_u32(FIRST_SEQUENCE),
            next_outgoing: Seq::from_u32(FIRST_SEQUENCE),
            buffered: BTreeMap::new(),
            max_buffered: usize::max(max_buffered, 1),
        };
        this.check_rep();
        this
    }

    /// Buffers `msg` at `sequence` and returns the run now releasable.
    pub fn on_receive(&mut self, sequence: u32, msg: T) -> Vec<T> {
        let mut seq = Seq::from_u32(sequence);
        if seq < self.next_expected {
            warn!(
                sequence,
                expected = self.next_expected.to_u32(),
                "sequence behind the channel"
            );
            seq = self.next_expected;
        }

        let mut released = Vec::new();
        if seq == self.next_expected {
            released.push(msg);
            self.next_expected.increment();
        } else {
            self.buffered.insert(seq, msg);
            if self.buffered.len() > self.max_buffered {
                if let Some((&first, _)) = self.buffered.iter().next() {
                    warn!(
                        expected = self.next_expected.to_u32(),
                        resume = first.to_u32(),
                        buffered = self.buffered.len(),
                        "sequence gap skipped"
                    );
                    self.next_expected = first;
                }
            }
        }
        while let Some(msg) = self.buffered.remove(&self.next_expected) {
            released.push(msg);
            self.next_expected.increment();
        }
        self.check_rep();
        released
    }

    /// Mints the next sequence number for an outgoing message.
    pub fn next_sequence(&mut self) -> u32 {
        self.next_outgoing.next_nonzero().to_u32()
    }

    #[must_use]
    pub fn next_expected(&self) -> u32 {
        self.next_expected.to_u32()
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

/// Ordering channels keyed by message type.
pub struct OrderedChannels<T> {
    channels: HashMap<u8, OrderedChannel<T>>,
}

impl<T> Default for OrderedChannels<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedChannels<T> {
    #[must_use]
    pub fn new() -> Self {
        OrderedChannels {
            channels: HashMap::new(),
        }
    }

    pub fn register(&mut self, msg_type: u8) {
        self.channels.entry(msg_type).or_default();
    }

    #[must_use]
    pub fn is_registered(&self, msg_type: u8) -> bool {
        self.channels.contains_key(&msg_type)
    }

    /// Messages of unregistered types pass straight through.
    pub fn on_receive(&mut self, msg_type: u8, sequence: u32, msg: T) -> Vec<T> {
        match self.channels.get_mut(&msg_type) {
            Some(channel) => channel.on_receive(sequence, msg),
            None => vec![msg],
        }
    }

    pub fn next_sequence(&mut self, msg_type: u8) -> u32 {
        self.channels.entry(msg_type).or_default().next_sequence()
    }

    #[must_use]
    pub fn channel(&self, msg_type: u8) -> Option<&OrderedChannel<T>> {
        self.channels.get(&msg_type)
    }
}

/// Restores per-peer, per-type order on top of the transport's deliveries.
///
/// Also mints the sequence numbers for messages going out to each peer, so
/// both directions of a session can share one instance.
pub struct OrderedReceiver {
    ordered_types: HashSet<u8>,
    incoming: HashMap<u32, OrderedChannels<(Priority, Message)>>,
    outgoing: HashMap<u32, OrderedChannels<()>>,
    ready: VecDeque<Delivery>,
}

impl OrderedReceiver {
    #[must_use]
    pub fn new(ordered_types: impl IntoIterator<Item = u8>) -> Self {
        OrderedReceiver {
            ordered_types: ordered_types.into_iter().collect(),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Feeds one delivery in; whatever became releasable is returned by
    /// `next_ready`.
    pub fn on_delivery(&mut self, delivery: Delivery) {
        let (client_id, priority, message) = match delivery {
            Delivery::Message {
                client_id,
                priority,
                message,
            } => (client_id, priority, message),
            Delivery::Disconnected { client_id, reason } => {
                self.incoming.remove(&client_id);
                self.outgoing.remove(&client_id);
                self.ready
                    .push_back(Delivery::Disconnected { client_id, reason });
                return;
            }
        };
        if !message.is_sequenced() || !self.ordered_types.contains(&message.msg_type) {
            self.ready.push_back(Delivery::Message {
                client_id,
                priority,
                message,
            });
            return;
        }

        let ordered_types = &self.ordered_types;
        let channels = self.incoming.entry(client_id).or_insert_with(|| {
            let mut channels = OrderedChannels::new();
            for &msg_type in ordered_types {
                channels.register(msg_type);
            }
            channels
        });
        let released = channels.on_receive(message.msg_type, message.sequence, (priority, message));
        self.ready
            .extend(released.into_iter().map(|(priority, message)| Delivery::Message {
                client_id,
                priority,
                message,
            }));
    }

    #[must_use]
    pub fn next_ready(&mut self) -> Option<Delivery> {
        self.ready.pop_front()
    }

    /// Sequence number for the next `msg_type` message sent to `client_id`.
    pub fn next_sequence(&mut self, client_id: u32, msg_type: u8) -> u32 {
        self.outgoing
            .entry(client_id)
            .or_default()
            .next_sequence(msg_type)
    }

    #[must_use]
    pub fn buffered_len(&self, client_id: u32, msg_type: u8) -> usize {
        self.incoming
            .get(&client_id)
            .and_then(|channels| channels.channel(msg_type))
            .map_or(0, |channel| channel.buffered_len())
    }
}
