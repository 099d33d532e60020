//! Property-based tests using proptest
//!
//! Reassembly, merging and ordering must hold for every arrival order and
//! every payload, and hostile datagrams must never panic the receiver.

#![allow(clippy::unwrap_used)]

use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use proptest::prelude::*;
use relnet::{
    config::TransportConfig,
    layer::{
        packet_entry::{PacketEntry, PacketEntryBuilder},
        socket::DatagramSocket,
        window::ReliableWindow,
        Delivery, OrderedChannel, TransportCore,
    },
    protocol::{message::Message, packet::Packet, packet_hdr::Priority, MAX_PAYLOAD_LEN},
};

/// Swallows everything it is asked to send.
struct NullSocket;

impl DatagramSocket for NullSocket {
    fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }
    fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::ErrorKind::WouldBlock.into())
    }
    fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(false)
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 2)))
    }
}

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1))
}

fn fragments(bytes: &Bytes, pkt_id: u32, priority: Priority) -> Vec<Vec<u8>> {
    let now = Instant::now();
    (0..bytes.len())
        .step_by(MAX_PAYLOAD_LEN)
        .map(|start| {
            let end = usize::min(start + MAX_PAYLOAD_LEN, bytes.len());
            PacketEntryBuilder {
                priority,
                client_id: 0,
                pkt_id,
                offset: start as u32,
                msg_size: bytes.len() as u32,
                seq_tag: 0,
                payload: bytes.slice(start..end),
            }
            .build(now)
            .unwrap()
            .packet()
            .to_bytes()
        })
        .collect()
}

fn message_and_order() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    (0usize..6000).prop_flat_map(|len| {
        let count = (len + 5 + MAX_PAYLOAD_LEN - 1) / MAX_PAYLOAD_LEN;
        (
            prop::collection::vec(any::<u8>(), len),
            Just((0..count).collect::<Vec<_>>()).prop_shuffle(),
            prop::collection::vec(0..count, 0..4),
        )
            .prop_map(|(body, mut order, dups)| {
                // duplicates land anywhere, also after completion
                for (i, dup) in dups.into_iter().enumerate() {
                    let at = (i * 7) % (order.len() + 1);
                    order.insert(at, dup);
                }
                (body, order)
            })
    })
}

// Property: any arrival order with duplicates delivers the message exactly once
proptest! {
    #[test]
    fn prop_reassembly_any_order((body, order) in message_and_order()) {
        let mut core = TransportCore::new(Box::new(NullSocket), TransportConfig::default());
        let message = Message::new(3, body);
        let frags = fragments(&message.to_bytes(), 11, Priority::High);
        let now = Instant::now();
        for i in order {
            core.handle_datagram(&frags[i], peer(), now);
        }
        let delivered: Vec<Delivery> = core.take_deliveries();
        prop_assert_eq!(delivered.len(), 1);
        match &delivered[0] {
            Delivery::Message { message: got, .. } => prop_assert_eq!(got, &message),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}

// Property: splitting a merged entry yields the originals, at max priority
proptest! {
    #[test]
    fn prop_merge_split_inverse(
        a in prop::collection::vec(any::<u8>(), 1..660),
        b in prop::collection::vec(any::<u8>(), 1..660),
        a_high in any::<bool>(),
        b_high in any::<bool>(),
    ) {
        let now = Instant::now();
        let entry = |pkt_id: u32, payload: Vec<u8>, high: bool| {
            let len = payload.len() as u32;
            PacketEntryBuilder {
                priority: if high { Priority::High } else { Priority::Low },
                client_id: 4,
                pkt_id,
                offset: 0,
                msg_size: len,
                seq_tag: 0,
                payload: Bytes::from(payload),
            }
            .build(now)
            .unwrap()
        };
        let a = entry(1, a, a_high);
        let b = entry(2, b, b_high);
        let mut merged = a.clone();
        prop_assert!(merged.merge(b.clone()).is_ok());
        prop_assert_eq!(merged.priority(), Priority::max(a.priority(), b.priority()));

        // through the wire and back
        let wire = merged.packet().to_bytes();
        let parts = PacketEntry::from_datagram(4, &wire, now).unwrap().split();
        prop_assert_eq!(parts.len(), 2);
        prop_assert_eq!(parts[0].packet(), a.packet());
        prop_assert_eq!(parts[1].packet(), b.packet());
        prop_assert!(parts.iter().all(|p| p.client_id() == 4));
    }
}

// Property: every permutation of sequences is released in order, once each
proptest! {
    #[test]
    fn prop_ordering_any_permutation(
        order in (1u32..64).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let mut channel = OrderedChannel::new();
        let mut released = Vec::new();
        for &seq in &order {
            released.extend(channel.on_receive(seq, seq));
        }
        let expected: Vec<u32> = (1..=order.len() as u32).collect();
        prop_assert_eq!(released, expected);
        prop_assert_eq!(channel.buffered_len(), 0);
    }
}

// Property: hostile datagrams are rejected or split, never a panic
proptest! {
    #[test]
    fn prop_malformed_never_panics(data in prop::collection::vec(any::<u8>(), 0..1500)) {
        if let Ok(entry) = PacketEntry::from_datagram(1, &data, Instant::now()) {
            let _ = entry.split();
        }
        let _ = Packet::from_datagram(&data);
        let mut core = TransportCore::new(Box::new(NullSocket), TransportConfig::default());
        core.handle_datagram(&data, peer(), Instant::now());
    }
}

// Property: the window never exceeds its cap and always equals what is held
proptest! {
    #[test]
    fn prop_window_invariant(ops in prop::collection::vec((any::<bool>(), 1u32..40_000), 0..64)) {
        let mut window = ReliableWindow::new(65_536);
        let mut held: Vec<u32> = Vec::new();
        for (reserve, len) in ops {
            if reserve || held.is_empty() {
                if window.try_reserve(len).is_ok() {
                    held.push(len);
                }
            } else {
                let len = held.remove(0);
                window.release(len);
            }
            prop_assert!(window.in_flight() <= window.max());
            prop_assert_eq!(window.in_flight(), held.iter().sum::<u32>());
        }
    }
}
