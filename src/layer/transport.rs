use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    io, mem,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use keyed_priority_queue::KeyedPriorityQueue;
use tracing::{debug, info, trace, warn};

use crate::{
    config::TransportConfig,
    error::{Result, TransportError},
    protocol::{
        message::Message, packet::Packet, packet_hdr::Priority, MAX_PACKET_SIZE,
        MAX_PAYLOAD_LEN, SEQ_TAG_MASK,
    },
};

use super::{
    connection::{Connection, ConnectionBuilder, DisconnectReason, LinkState},
    packet_entry::{PacketEntry, PacketEntryBuilder},
    reassembly::{Completed, Fragment, Reassembler},
    rtt::MAX_RTO,
    socket::{bind_udp, is_transient, send_with_retry, DatagramSocket},
};

/// What the transport hands to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message {
        client_id: u32,
        priority: Priority,
        message: Message,
    },
    /// Emitted exactly once per connection, whatever ended it.
    Disconnected {
        client_id: u32,
        reason: DisconnectReason,
    },
}

impl Delivery {
    #[must_use]
    pub fn client_id(&self) -> u32 {
        match self {
            Delivery::Message { client_id, .. } => *client_id,
            Delivery::Disconnected { client_id, .. } => *client_id,
        }
    }
}

/// Identifies one outstanding reliable fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub client_id: u32,
    pub pkt_id: u32,
    pub offset: u32,
}

impl AckKey {
    /// `None` for ACKs and containers, which are never outstanding.
    fn of(entry: &PacketEntry) -> Option<Self> {
        let hdr = entry.packet().hdr();
        if hdr.is_ack() || hdr.is_multi_packet() {
            return None;
        }
        Some(AckKey {
            client_id: entry.client_id(),
            pkt_id: hdr.pkt_id(),
            offset: hdr.offset(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_recv: u64,
    pub bytes_recv: u64,
    pub messages_sent: u64,
    pub messages_recv: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub acks_recv: u64,
    pub duplicates: u64,
    pub decoding_errors: u64,
    pub containers_sent: u64,
    pub containers_recv: u64,
    pub dropped_messages: u64,
    pub send_failures: u64,
    pub connections: usize,
    pub outstanding: usize,
}

/// Offsets of the fragments a message of `msg_size` bytes is cut into.
fn fragment_offsets(msg_size: u32) -> impl Iterator<Item = u32> {
    let step = MAX_PAYLOAD_LEN as u32;
    let count = msg_size / step + u32::from(msg_size % step != 0);
    (0..u32::max(count, 1)).map(move |i| i * step)
}

/// One socket, every peer talking through it, and the queues between them.
///
/// The core never blocks and never spawns; a driver (see `TransportWorker`)
/// calls `process_network` and the periodic checks.
pub struct TransportCore {
    socket: Box<dyn DatagramSocket>,
    config: TransportConfig,

    connections: HashMap<u32, Connection>,
    peers: HashMap<SocketAddr, u32>,
    next_client_id: u32,

    outbound: VecDeque<PacketEntry>,
    inbound: VecDeque<Delivery>,

    // outstanding reliable fragments and their retransmission deadlines
    acks: HashMap<AckKey, PacketEntry>,
    resend: KeyedPriorityQueue<AckKey, Reverse<Instant>>,

    reassembler: Reassembler,
    stat: Stat,
    recv_buf: Vec<u8>,
}

impl TransportCore {
    #[inline]
    fn check_rep(&self) {
        assert_eq!(self.acks.len(), self.resend.len());
        assert_eq!(self.connections.len(), self.peers.len());
    }

    #[must_use]
    pub fn new(socket: Box<dyn DatagramSocket>, config: TransportConfig) -> Self {
        let this = TransportCore {
            socket,
            connections: HashMap::new(),
            peers: HashMap::new(),
            next_client_id: 1,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            acks: HashMap::new(),
            resend: KeyedPriorityQueue::new(),
            reassembler: Reassembler::new(config.max_message_size),
            stat: Stat::default(),
            // one spare byte so oversized datagrams are detected, not truncated
            recv_buf: vec![0; MAX_PACKET_SIZE + 1],
            config,
        };
        this.check_rep();
        this
    }

    /// Binds a UDP socket at `config.bind_addr`.
    pub fn bind(config: TransportConfig) -> Result<Self> {
        config.validate_strict()?;
        let socket = bind_udp(config.bind_addr)?;
        info!(addr = %socket.local_addr()?, "transport bound");
        Ok(Self::new(Box::new(socket), config))
    }

    /// Returns the connection to `addr`, creating it if needed.
    pub fn connect(&mut self, addr: SocketAddr) -> u32 {
        if let Some(&client_id) = self.peers.get(&addr) {
            return client_id;
        }
        self.add_connection(addr, Instant::now())
    }

    fn add_connection(&mut self, addr: SocketAddr, now: Instant) -> u32 {
        let mut client_id = self.next_client_id;
        while client_id == 0 || self.connections.contains_key(&client_id) {
            client_id = client_id.wrapping_add(1);
        }
        self.next_client_id = client_id.wrapping_add(1);

        let conn = ConnectionBuilder {
            client_id,
            addr,
            window_max: self.config.window_max,
            history_len: self.config.history_len,
        }
        .build(now);
        self.connections.insert(client_id, conn);
        self.peers.insert(addr, client_id);
        info!(client_id, %addr, "connection created");
        self.check_rep();
        client_id
    }

    pub fn disconnect(&mut self, client_id: u32) -> Result<()> {
        if !self.connections.contains_key(&client_id) {
            return Err(TransportError::UnknownPeer(client_id));
        }
        self.drop_connection(client_id, DisconnectReason::Local);
        Ok(())
    }

    fn drop_connection(&mut self, client_id: u32, reason: DisconnectReason) {
        let mut conn = match self.connections.remove(&client_id) {
            Some(x) => x,
            None => return,
        };
        self.peers.remove(&conn.addr());
        conn.purge();

        let keys: Vec<AckKey> = self
            .acks
            .keys()
            .filter(|key| key.client_id == client_id)
            .copied()
            .collect();
        for key in &keys {
            self.acks.remove(key);
            self.resend.remove(key);
        }
        self.outbound.retain(|entry| entry.client_id() != client_id);
        self.reassembler.remove_client(client_id);

        info!(client_id, addr = %conn.addr(), %reason, "connection dropped");
        self.inbound
            .push_back(Delivery::Disconnected { client_id, reason });
        self.check_rep();
    }

    /// Fragments `message` and queues it for `client_id`.
    ///
    /// Reliable messages always travel as HIGH priority, since that is what
    /// makes the peer ACK them, and stay in the ACK table until acknowledged.
    pub fn send(
        &mut self,
        message: &Message,
        client_id: u32,
        priority: Priority,
        reliable: bool,
    ) -> Result<()> {
        let bytes = message.to_bytes();
        if bytes.len() > self.config.max_message_size as usize {
            return Err(TransportError::MessageTooLarge {
                len: bytes.len(),
                max: self.config.max_message_size as usize,
            });
        }
        let seq_tag = (message.sequence & u32::from(SEQ_TAG_MASK)) as u8;
        self.enqueue(bytes, seq_tag, client_id, priority, reliable, Instant::now())?;
        self.stat.messages_sent += 1;
        Ok(())
    }

    /// Sends to every connected peer; one peer failing does not stop the rest.
    pub fn broadcast(
        &mut self,
        message: &Message,
        priority: Priority,
        reliable: bool,
    ) -> Vec<(u32, TransportError)> {
        let client_ids: Vec<u32> = self.connections.keys().copied().collect();
        self.multicast(message, &client_ids, priority, reliable)
    }

    pub fn multicast(
        &mut self,
        message: &Message,
        client_ids: &[u32],
        priority: Priority,
        reliable: bool,
    ) -> Vec<(u32, TransportError)> {
        let mut failures = Vec::new();
        for &client_id in client_ids {
            if let Err(e) = self.send(message, client_id, priority, reliable) {
                debug!(client_id, error = %e, "multicast send failed");
                failures.push((client_id, e));
            }
        }
        failures
    }

    fn enqueue(
        &mut self,
        bytes: Bytes,
        seq_tag: u8,
        client_id: u32,
        priority: Priority,
        reliable: bool,
        now: Instant,
    ) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&client_id)
            .ok_or(TransportError::UnknownPeer(client_id))?;
        let len = bytes.len();
        let frag_count = fragment_offsets(len as u32).count();
        if self.outbound.len() + frag_count > self.config.outbound_queue_cap {
            return Err(TransportError::QueueFull);
        }

        let priority = if reliable { Priority::High } else { priority };
        if reliable {
            let max = conn.window().max();
            if len > max as usize {
                return Err(TransportError::MessageTooLarge {
                    len,
                    max: max as usize,
                });
            }
            conn.try_reserve(len as u32)?;
        }
        let pkt_id = conn.next_message_id();
        let rto = conn.rto();

        for offset in fragment_offsets(len as u32) {
            let start = offset as usize;
            let end = usize::min(start + MAX_PAYLOAD_LEN, len);
            let mut entry = PacketEntryBuilder {
                priority,
                client_id,
                pkt_id,
                offset,
                msg_size: len as u32,
                seq_tag,
                payload: bytes.slice(start..end),
            }
            .build(now)?;
            if reliable {
                entry.set_rto(rto);
                let key = AckKey {
                    client_id,
                    pkt_id,
                    offset,
                };
                self.resend.push(key, Reverse(entry.deadline()));
                self.acks.insert(key, entry.clone());
            }
            self.outbound.push_back(entry);
        }
        trace!(client_id, pkt_id, len, frag_count, reliable, "message queued");
        self.check_rep();
        Ok(())
    }

    /// Alternates between flushing one outbound entry and handling one
    /// inbound datagram until both are idle or `deadline` passes.
    ///
    /// Returns how many datagrams moved in either direction.
    pub fn process_network(&mut self, deadline: Instant) -> Result<usize> {
        let mut moved = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let sent = match self.flush_one(now) {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(error = %e, "datagram not sent");
                    true
                }
            };
            let received = self.recv_one(now)?;
            if !sent && !received {
                break;
            }
            moved += usize::from(sent) + usize::from(received);
        }
        Ok(moved)
    }

    /// Sends the entry at the head of the outbound queue, merged with the
    /// entries behind it that go to the same peer and still fit.
    ///
    /// Returns `false` if there was nothing to send.
    pub fn flush_one(&mut self, now: Instant) -> Result<bool> {
        let mut entry = match self.outbound.pop_front() {
            Some(x) => x,
            None => return Ok(false),
        };
        self.mark_sent(AckKey::of(&entry), now);

        let mut merged = false;
        while let Some(next) = self.outbound.front() {
            if !entry.can_merge(next) {
                break;
            }
            let next = match self.outbound.pop_front() {
                Some(x) => x,
                None => break,
            };
            let key = AckKey::of(&next);
            match entry.merge(next) {
                Ok(()) => {
                    self.mark_sent(key, now);
                    merged = true;
                }
                Err(next) => {
                    self.outbound.push_front(next);
                    break;
                }
            }
        }
        if merged {
            self.stat.containers_sent += 1;
        }

        let client_id = entry.client_id();
        let addr = match self.connections.get(&client_id) {
            Some(conn) => conn.addr(),
            None => {
                debug!(client_id, "entry for a dropped connection");
                return Ok(true);
            }
        };
        let bytes = entry.packet().to_bytes();
        match send_with_retry(self.socket.as_ref(), &bytes, addr, self.config.send_retries) {
            Ok(_) => {
                self.stat.packets_sent += 1;
                self.stat.bytes_sent += bytes.len() as u64;
                Ok(true)
            }
            Err(source) => {
                self.stat.send_failures += 1;
                Err(TransportError::SendFailed { addr, source })
            }
        }
    }

    // the RTT sample of a first transmission counts from when it left the socket
    fn mark_sent(&mut self, key: Option<AckKey>, now: Instant) {
        let key = match key {
            Some(x) => x,
            None => return,
        };
        if let Some(outstanding) = self.acks.get_mut(&key) {
            if !outstanding.is_retransmitted() {
                outstanding.touch(now);
                self.resend.push(key, Reverse(outstanding.deadline()));
            }
        }
    }

    /// Handles at most one datagram waiting on the socket.
    pub fn recv_one(&mut self, now: Instant) -> Result<bool> {
        let mut buf = mem::take(&mut self.recv_buf);
        let handled = match self.socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                self.handle_datagram(&buf[..len], addr, now);
                Ok(true)
            }
            Err(e) if is_transient(&e) => Ok(false),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!(error = %e, "peer unreachable");
                Ok(true)
            }
            Err(e) => Err(TransportError::Io(e)),
        };
        self.recv_buf = buf;
        handled
    }

    /// Runs one received datagram through validation, splitting, duplicate
    /// suppression and reassembly.
    pub fn handle_datagram(&mut self, buf: &[u8], addr: SocketAddr, now: Instant) {
        if buf.is_empty() {
            trace!(%addr, "wake-up datagram");
            return;
        }
        self.stat.packets_recv += 1;
        self.stat.bytes_recv += buf.len() as u64;

        let mut entry = match PacketEntry::from_datagram(0, buf, now) {
            Ok(x) => x,
            Err(e) => {
                warn!(%addr, error = %e, "malformed datagram");
                self.stat.decoding_errors += 1;
                return;
            }
        };
        let client_id = match self.peers.get(&addr) {
            Some(&x) => x,
            None if self.config.accept_peers => self.add_connection(addr, now),
            None => {
                debug!(%addr, "datagram from an unknown peer");
                return;
            }
        };
        entry.set_client_id(client_id);
        if let Some(conn) = self.connections.get_mut(&client_id) {
            conn.on_activity(now);
        }

        if entry.packet().hdr().is_multi_packet() {
            self.stat.containers_recv += 1;
            for inner in entry.split() {
                self.handle_packet(inner, now);
            }
        } else {
            self.handle_packet(entry, now);
        }
        self.check_rep();
    }

    fn handle_packet(&mut self, entry: PacketEntry, now: Instant) {
        let client_id = entry.client_id();
        let hdr = *entry.packet().hdr();
        if hdr.is_ack() {
            self.handle_ack(client_id, entry.packet(), now);
            return;
        }
        let conn = match self.connections.get_mut(&client_id) {
            Some(x) => x,
            None => return,
        };

        let seen = !conn.on_packet(hdr.pkt_id(), hdr.offset(), now);
        if seen && conn.is_completed(hdr.pkt_id()) {
            self.stat.duplicates += 1;
            trace!(client_id, pkt_id = hdr.pkt_id(), offset = hdr.offset(), "duplicate of a delivered message");
            // our ACK may have been lost
            if hdr.priority() == Priority::High {
                self.queue_ack(client_id, hdr.pkt_id(), hdr.msg_size(), now);
            }
            return;
        }
        if seen && self.reassembler.is_pending(client_id, hdr.pkt_id()) {
            self.stat.duplicates += 1;
            trace!(client_id, pkt_id = hdr.pkt_id(), offset = hdr.offset(), "duplicate fragment");
            return;
        }
        // seen but neither pending nor delivered: the partial message was
        // dropped, so the fragment starts it over

        let fragment = Fragment {
            client_id,
            msg_id: hdr.pkt_id(),
            offset: hdr.offset(),
            total_size: hdr.msg_size(),
            seq_tag: hdr.seq_tag(),
            priority: hdr.priority(),
            bytes: entry.packet().payload().clone(),
        };
        match self.reassembler.add_fragment(fragment, now) {
            Ok(Some(done)) => self.on_message(done, now),
            Ok(None) => {}
            Err(e) => {
                warn!(client_id, pkt_id = hdr.pkt_id(), error = %e, "message dropped");
                self.stat.dropped_messages += 1;
            }
        }
    }

    fn on_message(&mut self, done: Completed, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&done.client_id) {
            conn.on_message_complete(done.msg_id);
        }
        if done.priority == Priority::High {
            self.queue_ack(done.client_id, done.msg_id, done.bytes.len() as u32, now);
        }
        let client_id = done.client_id;
        let message = match Message::from_bytes(done.bytes) {
            Ok(x) => x,
            Err(e) => {
                warn!(client_id, msg_id = done.msg_id, error = %e, "malformed message");
                self.stat.decoding_errors += 1;
                return;
            }
        };
        if message.is_heartbeat() {
            trace!(client_id, "heartbeat");
            return;
        }
        self.stat.messages_recv += 1;
        self.inbound.push_back(Delivery::Message {
            client_id,
            priority: done.priority,
            message,
        });
    }

    // ACKs jump the queue and are exempt from its cap
    fn queue_ack(&mut self, client_id: u32, pkt_id: u32, msg_size: u32, now: Instant) {
        let ack = PacketEntry::from_packet(client_id, Packet::ack(pkt_id, msg_size, Priority::Low), now);
        self.outbound.push_front(ack);
        self.stat.acks_sent += 1;
    }

    /// Releases every outstanding fragment of the acknowledged message.
    ///
    /// Returns `false` for ACKs matching nothing, which are ignored.
    pub fn handle_ack(&mut self, client_id: u32, ack: &Packet, now: Instant) -> bool {
        let hdr = ack.hdr();
        if hdr.msg_size() > self.config.max_message_size {
            debug!(client_id, msg_size = hdr.msg_size(), "ack for an impossible message");
            return false;
        }

        let mut found = false;
        let mut released: u32 = 0;
        // Karn: a retransmitted fragment makes the sample ambiguous
        let mut ambiguous = false;
        let mut sample = Duration::ZERO;
        for offset in fragment_offsets(hdr.msg_size()) {
            let key = AckKey {
                client_id,
                pkt_id: hdr.pkt_id(),
                offset,
            };
            let entry = match self.acks.remove(&key) {
                Some(x) => x,
                None => continue,
            };
            self.resend.remove(&key);
            found = true;
            released += entry.packet().payload().len() as u32;
            ambiguous |= entry.is_retransmitted();
            sample = Duration::max(sample, entry.since_sent(now));
        }
        if !found {
            trace!(client_id, pkt_id = hdr.pkt_id(), "unknown ack");
            return false;
        }

        self.stat.acks_recv += 1;
        if let Some(conn) = self.connections.get_mut(&client_id) {
            conn.release(released);
            if !ambiguous {
                conn.on_rtt_sample(sample);
            }
        }
        self.check_rep();
        true
    }

    /// Requeues every outstanding fragment whose deadline passed, doubling
    /// its RTO. Returns the number of retransmissions.
    pub fn check_resend(&mut self, now: Instant) -> usize {
        let mut count = 0;
        while let Some((_, &Reverse(deadline))) = self.resend.peek() {
            if deadline > now {
                break;
            }
            let key = match self.resend.pop() {
                Some((key, _)) => key,
                None => break,
            };
            let entry = match self.acks.get_mut(&key) {
                Some(x) => x,
                None => continue,
            };
            entry.to_retransmit(now, MAX_RTO);
            self.resend.push(key, Reverse(entry.deadline()));
            debug!(
                client_id = key.client_id,
                pkt_id = key.pkt_id,
                offset = key.offset,
                rto = ?entry.rto(),
                "retransmit"
            );
            let copy = entry.clone();
            self.outbound.push_back(copy);
            self.stat.retransmissions += 1;
            count += 1;
        }
        self.check_rep();
        count
    }

    /// Drops partial messages whose first fragment is too old.
    pub fn check_fragment_timeouts(&mut self, now: Instant) -> usize {
        let purged = self
            .reassembler
            .purge_stale(now, self.config.fragment_timeout);
        self.stat.dropped_messages += purged as u64;
        purged
    }

    /// Probes quiet peers and drops the ones that missed too many checks.
    /// Returns how many connections were dropped.
    pub fn check_links(&mut self, now: Instant) -> usize {
        let mut probes = Vec::new();
        let mut dead = Vec::new();
        for (&client_id, conn) in self.connections.iter_mut() {
            if !conn.tick_link(now, self.config.link_check) {
                continue;
            }
            match conn.link_state(self.config.linkdead_attempts) {
                LinkState::LinkDead => dead.push((client_id, conn.dead_reason())),
                _ => probes.push((client_id, conn.heartbeat())),
            }
        }

        for (client_id, heartbeat) in probes {
            debug!(client_id, heartbeat, "link check missed");
            let probe = Message::heartbeat().to_bytes();
            if let Err(e) = self.enqueue(probe, 0, client_id, Priority::High, true, now) {
                debug!(client_id, error = %e, "heartbeat not queued");
            }
        }
        for &(client_id, reason) in &dead {
            self.drop_connection(client_id, reason);
        }
        dead.len()
    }

    #[must_use]
    pub fn poll_delivery(&mut self) -> Option<Delivery> {
        self.inbound.pop_front()
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.inbound.drain(..).collect()
    }

    /// Forgets everything in flight: outstanding ACKs, queued entries,
    /// partial messages and peer history. Connections stay registered.
    pub fn shutdown(&mut self) {
        let outstanding = self.acks.len();
        self.acks.clear();
        self.resend = KeyedPriorityQueue::new();
        self.outbound.clear();
        for conn in self.connections.values_mut() {
            conn.purge();
        }
        self.reassembler = Reassembler::new(self.config.max_message_size);
        info!(outstanding, "transport shut down");
        self.check_rep();
    }

    #[must_use]
    pub fn stat(&self) -> Stat {
        Stat {
            connections: self.connections.len(),
            outstanding: self.acks.len(),
            ..self.stat.clone()
        }
    }

    #[must_use]
    pub fn connection(&self, client_id: u32) -> Option<&Connection> {
        self.connections.get(&client_id)
    }

    pub fn client_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.connections.keys().copied()
    }

    #[must_use]
    pub fn client_id_of(&self, addr: &SocketAddr) -> Option<u32> {
        self.peers.get(addr).copied()
    }

    #[must_use]
    pub fn link_state(&self, client_id: u32) -> Option<LinkState> {
        self.connections
            .get(&client_id)
            .map(|conn| conn.link_state(self.config.linkdead_attempts))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Blocks until a datagram arrives or `timeout` passes.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        self.socket.wait_readable(timeout)
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[must_use]
    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    #[must_use]
    #[inline]
    pub fn outstanding_len(&self) -> usize {
        self.acks.len()
    }

    #[must_use]
    #[inline]
    pub fn has_deliveries(&self) -> bool {
        !self.inbound.is_empty()
    }
}
