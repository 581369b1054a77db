//! External process chain
//!
//! Decoder, encoder and streamer run as separate processes connected by
//! OS pipes. The relay only feeds the head of the chain.

pub mod builder;
pub mod stage;
pub mod template;

pub use builder::{ChainBuilder, ProcessChain};
pub use stage::{StageKind, StageProcess};
pub use template::{render, RemoveOutcome, TempArtifact, MOUNT_PLACEHOLDER};
