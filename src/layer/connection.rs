use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::utils::{HistoryKey, PacketHistory, Seq};

use super::{
    rtt::RttEstimator,
    window::{ReliableWindow, WindowFull},
};

pub const DEFAULT_LINK_CHECK: Duration = Duration::from_millis(3_000);
pub const DEFAULT_LINKDEAD_ATTEMPTS: u32 = 6;

/// Liveness of a peer, derived from its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Fresh,
    Active,
    LinkSuspect,
    LinkDead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Nothing was ever received from the peer.
    NeverConnected,
    StoppedResponding,
    Local,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::NeverConnected => write!(f, "could not connect to the peer"),
            DisconnectReason::StoppedResponding => write!(f, "peer stopped responding"),
            DisconnectReason::Local => write!(f, "disconnected locally"),
        }
    }
}

/// Per-peer reliability state.
pub struct Connection {
    client_id: u32,
    addr: SocketAddr,
    next_outgoing_id: Seq,
    last_incoming_id: u32,
    last_incoming_offset: u32,
    rtt: RttEstimator,
    window: ReliableWindow,
    history: PacketHistory,
    completed: PacketHistory,
    heartbeat: u32,
    created_at: Instant,
    last_recv: Option<Instant>,
    last_link_tick: Instant,
}

pub struct ConnectionBuilder {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub window_max: u32,
    pub history_len: usize,
}

impl ConnectionBuilder {
    #[must_use]
    pub fn build(self, now: Instant) -> Connection {
        Connection {
            client_id: self.client_id,
            addr: self.addr,
            next_outgoing_id: Seq::from_u32(1),
            last_incoming_id: 0,
            last_incoming_offset: 0,
            rtt: RttEstimator::new(),
            window: ReliableWindow::new(self.window_max),
            history: PacketHistory::new(self.history_len),
            completed: PacketHistory::new(self.history_len),
            heartbeat: 0,
            created_at: now,
            last_recv: None,
            last_link_tick: now,
        }
    }
}

impl Connection {
    /// Mints the id shared by every fragment of the next outgoing message.
    pub fn next_message_id(&mut self) -> u32 {
        self.next_outgoing_id.next_nonzero().to_u32()
    }

    /// Records a received packet. Returns `false` if the pair was seen
    /// recently and the packet is a duplicate.
    pub fn on_packet(&mut self, pkt_id: u32, offset: u32, now: Instant) -> bool {
        self.last_recv = Some(now);
        self.heartbeat = 0;
        if !self.history.insert(HistoryKey { pkt_id, offset }) {
            return false;
        }
        self.last_incoming_id = pkt_id;
        self.last_incoming_offset = offset;
        true
    }

    /// Remembers that message `pkt_id` was delivered whole.
    pub fn on_message_complete(&mut self, pkt_id: u32) {
        self.completed.insert(HistoryKey { pkt_id, offset: 0 });
    }

    #[must_use]
    pub fn is_completed(&self, pkt_id: u32) -> bool {
        self.completed.contains(&HistoryKey { pkt_id, offset: 0 })
    }

    /// Marks traffic that does not take part in duplicate suppression, such
    /// as ACKs and containers.
    pub fn on_activity(&mut self, now: Instant) {
        self.last_recv = Some(now);
        self.heartbeat = 0;
    }

    /// Advances the liveness clock. Returns `true` if a whole `interval`
    /// passed without traffic, in which case the heartbeat counter grows.
    pub fn tick_link(&mut self, now: Instant, interval: Duration) -> bool {
        if now.saturating_duration_since(self.last_link_tick) < interval {
            return false;
        }
        self.last_link_tick = now;
        let last_activity = self.last_recv.unwrap_or(self.created_at);
        if now.saturating_duration_since(last_activity) < interval {
            return false;
        }
        self.heartbeat += 1;
        true
    }

    #[must_use]
    pub fn link_state(&self, linkdead_attempts: u32) -> LinkState {
        if self.heartbeat >= linkdead_attempts {
            LinkState::LinkDead
        } else if self.heartbeat > 0 {
            LinkState::LinkSuspect
        } else if self.last_recv.is_some() {
            LinkState::Active
        } else {
            LinkState::Fresh
        }
    }

    #[must_use]
    pub fn dead_reason(&self) -> DisconnectReason {
        match self.last_recv {
            Some(_) => DisconnectReason::StoppedResponding,
            None => DisconnectReason::NeverConnected,
        }
    }

    pub fn try_reserve(&mut self, len: u32) -> Result<(), WindowFull> {
        self.window.try_reserve(len)
    }

    pub fn release(&mut self, len: u32) {
        self.window.release(len);
    }

    pub fn on_rtt_sample(&mut self, sample: Duration) {
        self.rtt.update(sample);
    }

    /// Drops everything in flight; used on disconnect and shutdown.
    pub fn purge(&mut self) {
        self.window.reset();
        self.history.clear();
        self.completed.clear();
    }

    #[must_use]
    #[inline]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    #[must_use]
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    #[inline]
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    #[must_use]
    #[inline]
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    #[must_use]
    #[inline]
    pub fn window(&self) -> &ReliableWindow {
        &self.window
    }

    #[must_use]
    #[inline]
    pub fn heartbeat(&self) -> u32 {
        self.heartbeat
    }

    #[must_use]
    #[inline]
    pub fn last_incoming(&self) -> (u32, u32) {
        (self.last_incoming_id, self.last_incoming_offset)
    }

    #[must_use]
    #[inline]
    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }
}
