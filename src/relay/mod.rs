//! Relay lifecycle and forwarding

pub mod adapter;
pub mod forward;

pub use adapter::{Adapter, AdapterState};
pub use forward::{LoopExit, RelayStats};
