//! Error types for the relay

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket setup errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket option failed: {0}")]
    SocketOption(#[source] std::io::Error),
}

/// Process chain construction errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Failed to spawn {stage} ({program}): {source}")]
    SpawnFailed {
        stage: &'static str,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} has no piped {stream}")]
    MissingPipe {
        stage: &'static str,
        stream: &'static str,
    },

    #[error("Failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write temporary file {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle errors
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::relay::AdapterState,
    },

    #[error("Failed to spawn forwarding thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
