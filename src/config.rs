//! Transport configuration.
//!
//! Every field has a default equal to the protocol constants, so an empty
//! TOML document is a valid configuration. Durations are written as
//! milliseconds.

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TransportError},
    layer::{
        connection::{DEFAULT_LINKDEAD_ATTEMPTS, DEFAULT_LINK_CHECK},
        reassembly::DEFAULT_FRAGMENT_TIMEOUT,
        socket::DEFAULT_SEND_RETRIES,
        window::DEFAULT_WINDOW_MAX,
    },
    utils::DEFAULT_HISTORY_LEN,
};

pub const DEFAULT_PORT: u16 = 19479;
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 1024;
pub const DEFAULT_INBOUND_QUEUE_CAP: usize = 1024;
pub const DEFAULT_APP_QUEUE_CAP: usize = 256;
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_RESEND_CHECK: Duration = Duration::from_millis(100);
pub const DEFAULT_STAT_DISPLAY: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address of the transport socket
    pub bind_addr: SocketAddr,

    /// Packet entries waiting for the socket
    pub outbound_queue_cap: usize,

    /// Deliveries waiting for the application
    pub inbound_queue_cap: usize,

    /// Messages handed over by the application, not yet fragmented
    pub app_queue_cap: usize,

    /// Reliable bytes in flight per peer
    pub window_max: u32,

    /// Largest message accepted for sending or reassembly
    pub max_message_size: u32,

    #[serde(with = "duration_serde")]
    pub link_check: Duration,

    /// Missed link checks before a peer is declared dead
    pub linkdead_attempts: u32,

    #[serde(with = "duration_serde")]
    pub resend_check: Duration,

    /// How often the worker logs changed statistics
    #[serde(with = "duration_serde")]
    pub stat_display: Duration,

    #[serde(with = "duration_serde")]
    pub fragment_timeout: Duration,

    /// Longest the worker blocks on an idle socket
    #[serde(with = "duration_serde")]
    pub idle_wait: Duration,

    pub send_retries: u32,

    /// Recently received `(pkt_id, offset)` pairs kept for duplicate detection
    pub history_len: usize,

    /// Create a connection for datagrams from unknown addresses
    pub accept_peers: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            inbound_queue_cap: DEFAULT_INBOUND_QUEUE_CAP,
            app_queue_cap: DEFAULT_APP_QUEUE_CAP,
            window_max: DEFAULT_WINDOW_MAX,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            link_check: DEFAULT_LINK_CHECK,
            linkdead_attempts: DEFAULT_LINKDEAD_ATTEMPTS,
            resend_check: DEFAULT_RESEND_CHECK,
            stat_display: DEFAULT_STAT_DISPLAY,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            idle_wait: DEFAULT_IDLE_WAIT,
            send_retries: DEFAULT_SEND_RETRIES,
            history_len: DEFAULT_HISTORY_LEN,
            accept_peers: true,
        }
    }
}

impl TransportConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| TransportError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::Config(format!("Failed to parse TOML: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TransportError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Returns every problem found; empty means valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, cap) in [
            ("Outbound queue", self.outbound_queue_cap),
            ("Inbound queue", self.inbound_queue_cap),
            ("Application queue", self.app_queue_cap),
        ] {
            if cap == 0 {
                errors.push(format!("{name} capacity must be greater than 0"));
            }
        }

        if self.window_max == 0 {
            errors.push("Window max must be greater than 0".to_string());
        }
        if self.max_message_size == 0 {
            errors.push("Max message size must be greater than 0".to_string());
        }

        if self.link_check.as_millis() < 100 {
            errors.push("Link check interval too short (minimum: 100ms)".to_string());
        }
        if self.linkdead_attempts == 0 {
            errors.push("Linkdead attempts must be greater than 0".to_string());
        }
        if self.resend_check.is_zero() {
            errors.push("Resend check interval must be greater than 0".to_string());
        }
        if self.fragment_timeout < self.resend_check {
            errors.push(format!(
                "Fragment timeout ({:?}) shorter than the resend check ({:?})",
                self.fragment_timeout, self.resend_check
            ));
        }
        if self.idle_wait.is_zero() {
            errors.push("Idle wait must be greater than 0".to_string());
        } else if self.idle_wait > self.resend_check {
            errors.push(format!(
                "Idle wait ({:?}) longer than the resend check ({:?})",
                self.idle_wait, self.resend_check
            ));
        }
        if self.history_len == 0 {
            errors.push("History length must be greater than 0".to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
