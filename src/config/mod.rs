//! Configuration for the ingestion service
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no
//! file at all) yields a working configuration. The removable-media root
//! list is deliberately configuration rather than hard-coded: platforms
//! and distros disagree about where removable volumes land.
//!
//! # Example
//! ```toml
//! [media]
//! roots = ["/media", "/run/media"]
//!
//! [readers]
//! external_drive = true
//! barcode_port = "/dev/ttyUSB0"
//!
//! [mqtt]
//! host = "localhost"
//! topic = "zaparoo/events"
//! filter = ["tokens.added", "tokens.removed"]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::publisher::PublisherOptions;
use crate::reader::external_drive;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub readers: ReadersConfig,

    /// MQTT relay; notifications are not exported when absent
    pub mqtt: Option<MqttConfig>,
}

/// Removable-media configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaConfig {
    /// Roots searched for sibling mounts; empty means platform defaults
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

/// Which readers the service brings up
#[derive(Debug, Clone, Deserialize)]
pub struct ReadersConfig {
    /// Enable the external-drive reader
    #[serde(default = "default_true")]
    pub external_drive: bool,

    /// Serial device of a barcode scanner (e.g. `/dev/ttyUSB0`)
    #[serde(default)]
    pub barcode_port: Option<String>,
}

impl Default for ReadersConfig {
    fn default() -> Self {
        Self {
            external_drive: true,
            barcode_port: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// MQTT relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_topic")]
    pub topic: String,

    /// Exact-match method filter; empty forwards everything
    #[serde(default)]
    pub filter: Vec<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "zaparoo/events".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// External-drive reader options derived from this configuration
    pub fn external_drive_options(&self) -> external_drive::Options {
        let mut options = external_drive::Options::default();
        if !self.media.roots.is_empty() {
            options.media_roots = self.media.roots.clone();
        }
        options
    }

    /// Publisher options, when an MQTT section is present
    pub fn publisher_options(&self) -> Option<PublisherOptions> {
        self.mqtt.as_ref().map(|mqtt| PublisherOptions {
            host: mqtt.host.clone(),
            port: mqtt.port,
            topic: mqtt.topic.clone(),
            filter: mqtt.filter.clone(),
        })
    }
}
