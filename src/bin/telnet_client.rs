use std::{
    env,
    io::{self, BufRead},
    net::SocketAddr,
    sync::Arc,
    thread,
    time::Duration,
};

use relnet::{
    config::TransportConfig,
    error::TransportError,
    layer::{Delivery, OrderedReceiver, TransportCore, TransportHandle, TransportWorker},
    protocol::{message::Message, packet_hdr::Priority},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const SERVER_ADDR: &str = "127.0.0.1:19479";
const MSG_TEXT: u8 = 1;
const BLOCKED_RETRY: Duration = Duration::from_millis(30);

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let server: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| SERVER_ADDR.to_string())
        .parse()
        .unwrap();
    let config = TransportConfig::default_with_overrides(|c| {
        c.bind_addr = "0.0.0.0:0".parse().unwrap();
        c.accept_peers = false;
    });

    let mut core = TransportCore::bind(config.clone()).unwrap();
    let server_id = core.connect(server);
    let handle = Arc::new(TransportWorker::spawn(core, &config).unwrap());
    info!(addr = %handle.local_addr(), %server, "binding");

    {
        let handle = Arc::clone(&handle);
        thread::spawn(move || printing(&handle));
    }

    // every line travels on one ordered channel
    let mut sequencer = OrderedReceiver::new([MSG_TEXT]);
    for line in io::stdin().lock().lines() {
        let line = line.unwrap();
        let sequence = sequencer.next_sequence(server_id, MSG_TEXT);
        let message = Message::sequenced(MSG_TEXT, sequence, line.into_bytes());
        if !block_sending(&handle, message, server_id) {
            break;
        }
    }
}

fn printing(handle: &TransportHandle) {
    let mut ordered = OrderedReceiver::new([MSG_TEXT]);
    while let Some(delivery) = handle.recv() {
        ordered.on_delivery(delivery);
        while let Some(delivery) = ordered.next_ready() {
            match delivery {
                Delivery::Message { message, .. } => {
                    println!(
                        "{}, {:X?}",
                        String::from_utf8_lossy(&message.body),
                        &message.body[..]
                    );
                }
                Delivery::Disconnected { reason, .. } => {
                    warn!(%reason, "server gone");
                    return;
                }
            }
        }
    }
}

// Retries through backpressure; `false` once the transport is gone.
fn block_sending(handle: &TransportHandle, message: Message, server_id: u32) -> bool {
    loop {
        match handle.send(message.clone(), server_id, Priority::High, true) {
            Ok(()) => return true,
            Err(e) if e.is_backpressure() => thread::sleep(BLOCKED_RETRY),
            Err(TransportError::ShutDown) => return false,
            Err(e) => {
                warn!(error = %e, "send failed");
                return false;
            }
        }
    }
}
