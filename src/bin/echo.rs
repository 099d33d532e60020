use std::env;

use relnet::{
    config::TransportConfig,
    layer::{Delivery, TransportCore, TransportWorker},
    protocol::packet_hdr::Priority,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // optional path to a TOML config
    let config = match env::args().nth(1) {
        Some(path) => TransportConfig::from_file(path).unwrap(),
        None => TransportConfig::default(),
    };
    config.validate_strict().unwrap();

    let core = TransportCore::bind(config.clone()).unwrap();
    let handle = TransportWorker::spawn(core, &config).unwrap();
    info!(addr = %handle.local_addr(), "echo server listening");

    while let Some(delivery) = handle.recv() {
        match delivery {
            Delivery::Message {
                client_id,
                priority,
                message,
            } => {
                info!(
                    client_id,
                    msg_type = message.msg_type,
                    "{}, {:X?}",
                    String::from_utf8_lossy(&message.body),
                    &message.body[..]
                );
                let reliable = priority == Priority::High;
                if let Err(e) = handle.send(message, client_id, priority, reliable) {
                    warn!(client_id, error = %e, "echo dropped");
                }
            }
            Delivery::Disconnected { client_id, reason } => {
                info!(client_id, %reason, "peer gone");
            }
        }
    }
}
