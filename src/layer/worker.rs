use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::TransportConfig,
    error::{Result, TransportError},
    protocol::{message::Message, packet_hdr::Priority},
    utils::{BoundedQueue, Pending, PushError, QueueItem},
};

use super::transport::{Delivery, Stat, TransportCore};

impl QueueItem for Delivery {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(u32),
    Multicast(Vec<u32>),
    Broadcast,
}

/// A message handed to the worker thread.
///
/// Shared messages can be resubmitted once the worker has taken them; a
/// second submission while the first is still queued is refused.
#[derive(Debug)]
pub struct OutboundMessage {
    pub destination: Destination,
    pub message: Message,
    pub priority: Priority,
    pub reliable: bool,
    pending: AtomicBool,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(
        destination: Destination,
        message: Message,
        priority: Priority,
        reliable: bool,
    ) -> Self {
        OutboundMessage {
            destination,
            message,
            priority,
            reliable,
            pending: AtomicBool::new(false),
        }
    }
}

impl Pending for OutboundMessage {
    fn pending_flag(&self) -> &AtomicBool {
        &self.pending
    }
}

/// Owns the transport core on a dedicated thread.
pub struct TransportWorker {
    core: TransportCore,
    app: Arc<BoundedQueue<Arc<OutboundMessage>>>,
    inbound: Arc<BoundedQueue<Delivery>>,
    should_run: Arc<AtomicBool>,
    // per peer: messages refused by backpressure, retried in order
    held: HashMap<u32, VecDeque<Arc<OutboundMessage>>>,
    held_cap: usize,

    resend_check: Duration,
    stat_display: Duration,
    idle_wait: Duration,
}

impl TransportWorker {
    /// Moves `core` onto a new thread and returns the application's side.
    pub fn spawn(core: TransportCore, config: &TransportConfig) -> Result<TransportHandle> {
        config.validate_strict()?;
        let local_addr = core.local_addr()?;
        let app = Arc::new(BoundedQueue::new(config.app_queue_cap));
        let inbound = Arc::new(BoundedQueue::new(config.inbound_queue_cap));
        let should_run = Arc::new(AtomicBool::new(true));

        let worker = TransportWorker {
            core,
            app: Arc::clone(&app),
            inbound: Arc::clone(&inbound),
            should_run: Arc::clone(&should_run),
            held: HashMap::new(),
            held_cap: config.app_queue_cap,
            resend_check: config.resend_check,
            stat_display: config.stat_display,
            idle_wait: config.idle_wait,
        };
        let thread = thread::Builder::new()
            .name("transport".to_string())
            .spawn(move || worker.run())?;
        info!(%local_addr, "transport worker started");

        Ok(TransportHandle {
            app,
            inbound,
            should_run,
            local_addr,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> Stat {
        let mut next_check = Instant::now() + self.resend_check;
        let mut next_stat = Instant::now() + self.stat_display;
        let mut old_stat: Option<Stat> = None;

        while self.should_run.load(Ordering::Acquire) {
            let submitted = self.drain_app_queue();

            let deadline = Instant::now() + self.idle_wait;
            let moved = match self.core.process_network(deadline) {
                Ok(x) => x,
                Err(e) => {
                    error!(error = %e, "socket error");
                    thread::sleep(self.idle_wait);
                    0
                }
            };
            let delivered = self.push_deliveries();

            let now = Instant::now();
            if now >= next_check {
                self.core.check_resend(now);
                self.core.check_fragment_timeouts(now);
                self.core.check_links(now);
                next_check = now + self.resend_check;
            }
            if now >= next_stat {
                let stat = self.core.stat();
                if old_stat.as_ref() != Some(&stat) {
                    info!(?stat, "transport stat");
                }
                old_stat = Some(stat);
                next_stat = now + self.stat_display;
            }

            if submitted == 0 && moved == 0 && delivered == 0 && self.core.outbound_len() == 0 {
                let wait = Duration::min(self.idle_wait, next_check.saturating_duration_since(now));
                if let Err(e) = self.core.wait_readable(wait) {
                    warn!(error = %e, "wait on socket failed");
                    thread::sleep(wait);
                }
            }
        }

        self.core.shutdown();
        self.inbound.notify_all();
        let stat = self.core.stat();
        info!(?stat, "transport worker stopped");
        stat
    }

    /// Hands queued application messages to the core. Returns how many
    /// sends went through.
    ///
    /// A peer under backpressure only holds back its own messages. Once the
    /// held backlog reaches the application queue's capacity, draining stops
    /// and callers see `QueueFull`.
    fn drain_app_queue(&mut self) -> usize {
        let mut count = self.retry_held();
        while self.held_len() < self.held_cap {
            let out = match self.app.try_pop() {
                Some(x) => x,
                None => break,
            };
            count += self.dispatch(&out);
        }
        count
    }

    fn retry_held(&mut self) -> usize {
        let mut count = 0;
        let core = &mut self.core;
        for (&client_id, backlog) in self.held.iter_mut() {
            loop {
                let out = match backlog.front() {
                    Some(x) => x,
                    None => break,
                };
                match core.send(&out.message, client_id, out.priority, out.reliable) {
                    Ok(()) => {
                        backlog.pop_front();
                        count += 1;
                    }
                    Err(e) if e.is_backpressure() => break,
                    Err(e) => {
                        warn!(client_id, dropped = backlog.len(), error = %e, "held messages dropped");
                        backlog.clear();
                    }
                }
            }
        }
        self.held.retain(|_, backlog| !backlog.is_empty());
        count
    }

    fn dispatch(&mut self, out: &Arc<OutboundMessage>) -> usize {
        let client_ids: Vec<u32> = match &out.destination {
            Destination::Peer(client_id) => vec![*client_id],
            Destination::Multicast(client_ids) => client_ids.clone(),
            Destination::Broadcast => self.core.client_ids().collect(),
        };
        let mut count = 0;
        for client_id in client_ids {
            // behind whatever this peer already has waiting
            if let Some(backlog) = self.held.get_mut(&client_id) {
                backlog.push_back(Arc::clone(out));
                continue;
            }
            match self
                .core
                .send(&out.message, client_id, out.priority, out.reliable)
            {
                Ok(()) => count += 1,
                Err(e) if e.is_backpressure() => {
                    debug!(client_id, error = %e, "message held");
                    self.held
                        .entry(client_id)
                        .or_default()
                        .push_back(Arc::clone(out));
                }
                Err(e) => {
                    warn!(client_id, msg_type = out.message.msg_type, error = %e, "message dropped");
                }
            }
        }
        count
    }

    fn held_len(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }

    fn push_deliveries(&mut self) -> usize {
        let mut count = 0;
        while !self.inbound.is_full() {
            let delivery = match self.core.poll_delivery() {
                Some(x) => x,
                None => break,
            };
            if let Err(e) = self.inbound.try_push(delivery) {
                warn!(delivery = ?e.into_inner(), "inbound queue overflow");
                break;
            }
            count += 1;
        }
        count
    }
}

/// The application's end of a running `TransportWorker`.
pub struct TransportHandle {
    app: Arc<BoundedQueue<Arc<OutboundMessage>>>,
    inbound: Arc<BoundedQueue<Delivery>>,
    should_run: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<Stat>>,
}

impl TransportHandle {
    pub fn send(
        &self,
        message: Message,
        client_id: u32,
        priority: Priority,
        reliable: bool,
    ) -> Result<()> {
        let out = OutboundMessage::new(Destination::Peer(client_id), message, priority, reliable);
        self.submit(Arc::new(out))
    }

    pub fn broadcast(&self, message: Message, priority: Priority, reliable: bool) -> Result<()> {
        let out = OutboundMessage::new(Destination::Broadcast, message, priority, reliable);
        self.submit(Arc::new(out))
    }

    /// Queues a message the caller keeps a reference to.
    pub fn submit(&self, out: Arc<OutboundMessage>) -> Result<()> {
        if !self.is_running() {
            return Err(TransportError::ShutDown);
        }
        match self.app.try_push(out) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(TransportError::QueueFull),
            Err(PushError::AlreadyPending(_)) => Err(TransportError::AlreadyQueued),
        }
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<Delivery> {
        self.inbound.try_pop()
    }

    /// Blocks for at most `timeout`.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.inbound.pop_wait(timeout)
    }

    /// Blocks until a delivery arrives or the worker stops.
    #[must_use]
    pub fn recv(&self) -> Option<Delivery> {
        const POLL: Duration = Duration::from_millis(100);
        loop {
            if let Some(delivery) = self.inbound.pop_wait(POLL) {
                return Some(delivery);
            }
            if !self.is_running() {
                return self.inbound.try_pop();
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the worker and waits for it. Returns its final statistics.
    pub fn shutdown(mut self) -> Result<Stat> {
        self.stop()
    }

    fn stop(&mut self) -> Result<Stat> {
        self.should_run.store(false, Ordering::Release);
        wake(self.local_addr);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_e| TransportError::ShutDown),
            None => Err(TransportError::ShutDown),
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

// An empty datagram gets the worker out of `wait_readable` early.
fn wake(addr: SocketAddr) {
    let target = match addr {
        SocketAddr::V4(a) if a.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, a.port()))
        }
        SocketAddr::V6(a) if a.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, a.port()))
        }
        a => a,
    };
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let result = UdpSocket::bind(bind).and_then(|socket| socket.send_to(&[], target));
    if let Err(e) = result {
        debug!(%target, error = %e, "wake-up datagram not sent");
    }
}
