//! Relay configuration
//!
//! Loaded from TOML. Every section has defaults matching the stock
//! `mpg123 | lame | ezstream` pipeline, so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub chain: ChainConfig,
    pub teardown: TeardownConfig,
}

/// Datagram receiver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the UDP socket binds to
    pub bind_address: String,

    /// Receive timeout in milliseconds
    pub receive_timeout_ms: u64,

    /// Largest datagram accepted, in bytes
    pub buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// One external process in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Process chain settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Stage 1: compressed stream in, raw audio out
    pub decoder: StageCommand,

    /// Stage 2: raw audio in, compressed stream out
    pub encoder: StageCommand,

    /// Stage 3: publishes the stream; the rendered config path is appended
    pub streamer: StageCommand,

    /// Streamer configuration template containing `{mountpoint}`
    pub template_path: PathBuf,

    /// Directory for the rendered configuration (system temp dir if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    /// File name suffix of the rendered configuration
    pub artifact_suffix: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            decoder: StageCommand::new("mpg123", ["-w", "-", "-"]),
            encoder: StageCommand::new("lame", ["-", "-"]),
            streamer: StageCommand::new("ezstream", ["-c"]),
            template_path: PathBuf::from(DEFAULT_TEMPLATE_PATH),
            temp_dir: None,
            artifact_suffix: DEFAULT_ARTIFACT_SUFFIX.to_string(),
        }
    }
}

impl ChainConfig {
    /// Directory the rendered configuration is written to
    pub fn artifact_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Shutdown settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Time stages get to exit after SIGTERM before they are killed
    pub grace_period_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
        }
    }
}

impl TeardownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "ebulabs", "icecast-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the per-user configuration, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.receive_timeout_ms == 0 {
            // A zero read timeout is rejected by the OS
            return Err(ConfigError::Invalid("receive_timeout_ms must be > 0".into()));
        }
        if self.network.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be > 0".into()));
        }
        for (name, stage) in [
            ("decoder", &self.chain.decoder),
            ("encoder", &self.chain.encoder),
            ("streamer", &self.chain.streamer),
        ] {
            if stage.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} program is empty", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stock_pipeline() {
        let config = AppConfig::default();
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.receive_timeout(), Duration::from_secs(2));
        assert_eq!(config.network.buffer_size, 4096);
        assert_eq!(config.teardown.grace_period(), Duration::from_millis(500));
        assert_eq!(config.chain.decoder.program, "mpg123");
        assert_eq!(config.chain.streamer.args, vec!["-c".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
            [network]
            receive_timeout_ms = 250

            [chain]
            decoder = { program = "cat" }
        "#;
        let config = AppConfig::from_toml(text, Path::new("inline.toml")).unwrap();
        assert_eq!(config.network.receive_timeout_ms, 250);
        assert_eq!(config.network.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.chain.decoder, StageCommand::new("cat", Vec::<String>::new()));
        assert_eq!(config.chain.encoder.program, "lame");
        assert_eq!(config.teardown.grace_period_ms, DEFAULT_GRACE_PERIOD_MS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let path = Path::new("x.toml");
        let err = AppConfig::from_toml("[network]\nreceive_timeout_ms = 0\n", path);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = AppConfig::from_toml("[chain]\nencoder = { program = \"  \" }\n", path);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = AppConfig::from_toml("[network\n", path);
        assert!(matches!(err, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.chain.temp_dir = Some(dir.clone());
        config.teardown.grace_period_ms = 100;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = AppConfig::load(Path::new("/nonexistent/relay/config.toml"));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }
}
