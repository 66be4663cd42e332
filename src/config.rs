//! Process configuration using Figment.
//!
//! Values are layered, later sources winning:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `AS_`, nested keys separated by `__`
//!
//! ```toml
//! [application]
//! log_level = "debug"
//!
//! [stream]
//! zmq_address = "tcp://0.0.0.0:5555"
//! hdf5_master_file = "/data/lysozyme_master.h5"
//! delay_between_frames_ms = 10
//! ```
//!
//! `AS_STREAM__DELAY_BETWEEN_FRAMES_MS=0` overrides the delay from the
//! environment.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::Compression;
use crate::logging::{parse_log_level, LogFormat};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AS_";

/// Process configuration.
///
/// Layered as defaults, then an optional TOML file, then `AS_` environment
/// variables with `__` between section and key (`AS_STREAM__ZMQ_ADDRESS`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Process name and logging.
    pub application: ApplicationConfig,
    /// Data stream settings.
    pub stream: StreamSettings,
}

/// Process identity and logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name reported in logs.
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// pretty, compact or json
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "simplon-sim".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Data stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Endpoint the PUSH socket binds to
    pub zmq_address: String,
    /// Master file loaded at startup
    pub hdf5_master_file: Option<PathBuf>,
    /// Pause before each image message, in milliseconds
    pub delay_between_frames_ms: u64,
    /// Data files to load; unset loads all of them
    pub number_of_data_files: Option<usize>,
    /// bslz4 or none
    pub compression: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            zmq_address: "tcp://0.0.0.0:5555".to_string(),
            hdf5_master_file: None,
            delay_between_frames_ms: 10,
            number_of_data_files: Some(1),
            compression: "bslz4".to_string(),
        }
    }
}

impl StreamSettings {
    /// Frame delay as a [`Duration`].
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_frames_ms)
    }
}

impl SimulatorConfig {
    /// Loads defaults, the optional file and the `AS_` environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path, ENV_PREFIX).extract()
    }

    fn figment(path: Option<&Path>, env_prefix: &str) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(SimulatorConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;
        self.application.log_format.parse::<LogFormat>()?;
        self.compression()?;
        if self.stream.number_of_data_files == Some(0) {
            return Err("number_of_data_files must be at least 1".to_string());
        }
        if self.stream.zmq_address.trim().is_empty() {
            return Err("zmq_address must not be empty".to_string());
        }
        Ok(())
    }

    /// Parsed stream compression.
    pub fn compression(&self) -> Result<Compression, String> {
        self.stream
            .compression
            .parse::<Compression>()
            .map_err(|e| e.to_string())
    }
}
