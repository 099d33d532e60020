pub mod connection;
pub mod ordering;
pub mod packet_entry;
pub mod reassembly;
pub mod rtt;
pub mod socket;
pub mod transport;
pub mod window;
pub mod worker;

pub use connection::{DisconnectReason, LinkState};
pub use ordering::{OrderedChannel, OrderedChannels, OrderedReceiver};
pub use transport::{Delivery, Stat, TransportCore};
pub use worker::{Destination, OutboundMessage, TransportHandle, TransportWorker};
