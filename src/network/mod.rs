//! Network subsystem for UDP datagram intake

pub mod udp;

pub use udp::{create_socket, DatagramReceiver, ReceiveError};
