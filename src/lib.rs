//! # Icecast Relay
//!
//! Relays a local UDP audio stream into an external transcoding chain that
//! publishes it to an Icecast mount.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              RELAY ADAPTER                                │
//! │                                                                           │
//! │  UDP 127.0.0.1:<port>                                                     │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │  ┌─────────────────┐   forwarding thread   ┌───────────────────────────┐  │
//! │  │ DatagramReceiver│ ────────────────────▶ │ decoder stdin (persistent)│  │
//! │  │ (network::udp)  │   (relay::forward)    └─────────────┬─────────────┘  │
//! │  └─────────────────┘                                     │                │
//! └──────────────────────────────────────────────────────────┼────────────────┘
//!                                                            │
//!        ┌───────────────────────────────────────────────────┘
//!        ▼
//! ┌─────────────┐  pipe  ┌─────────────┐  pipe  ┌──────────────────────────┐
//! │  decoder    │ ─────▶ │  encoder    │ ─────▶ │ streamer -c <tmp config> │ ──▶ Icecast
//! │ (mpg123)    │        │ (lame)      │        │ (ezstream)               │
//! └─────────────┘        └─────────────┘        └──────────────────────────┘
//! ```
//!
//! The [`relay::Adapter`] owns every piece above and tears all of it down
//! exactly once: close socket, SIGTERM stages in order, wait, SIGKILL
//! stragglers, delete the rendered config.

pub mod chain;
pub mod config;
pub mod error;
pub mod network;
pub mod relay;
pub mod teardown;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Address the receiver binds to
    pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

    /// Default UDP port for the incoming stream
    pub const DEFAULT_UDP_PORT: u16 = 2720;

    /// Default Icecast mount
    pub const DEFAULT_MOUNT: &str = "testing";

    /// Receive timeout in milliseconds
    pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;

    /// Receive buffer size per datagram
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    /// Time stages get between SIGTERM and SIGKILL
    pub const DEFAULT_GRACE_PERIOD_MS: u64 = 500;

    /// Streamer configuration template
    pub const DEFAULT_TEMPLATE_PATH: &str = "ezstream.xml.template";

    /// Suffix of the rendered streamer configuration
    pub const DEFAULT_ARTIFACT_SUFFIX: &str = ".ezstream.xml";

    /// How long the relay binary runs without an interrupt
    pub const DEFAULT_RUN_SECONDS: u64 = 60;

    /// Interval between stats log lines in the binary
    pub const STATS_INTERVAL_SECS: u64 = 5;
}
