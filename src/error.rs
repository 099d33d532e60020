//! Errors surfaced by the public transport operations.
//!
//! Protocol violations coming off the wire never reach this type: they are
//! logged and the offending packet is dropped where it was found.

use std::io;

use thiserror::Error;

use crate::{layer::window::WindowFull, protocol::EncodingError};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket kept reporting `WouldBlock` through every retry.
    #[error("send to {addr} failed after retries: {source}")]
    SendFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("outbound queue is full")]
    QueueFull,

    #[error("reliable window full: {in_flight} bytes in flight, {requested} requested, {max} allowed")]
    WindowFull {
        in_flight: u32,
        requested: u32,
        max: u32,
    },

    #[error("unknown peer {0}")]
    UnknownPeer(u32),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("message is already queued")]
    AlreadyQueued,

    #[error("transport is shut down")]
    ShutDown,

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<WindowFull> for TransportError {
    fn from(e: WindowFull) -> Self {
        TransportError::WindowFull {
            in_flight: e.in_flight,
            requested: e.requested,
            max: e.max,
        }
    }
}

impl TransportError {
    /// Backpressure: the caller may retry the same operation later.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            TransportError::QueueFull | TransportError::WindowFull { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
