//! Settings and secrets, read from a TOML file.
//!
//! ```toml
//! client_id = "..."
//! client_secret = "..."
//! secret_key = "..."
//! server_origin = "https://example.net"
//! output_dir = "/srv/recordings"
//!
//! [[subscriptions]]
//! login = "somechannel"
//!
//! [[subscriptions]]
//! id = 12826
//! handler = "log"
//!
//! [capture]
//! qualities = ["best", "1080p", "720p"]
//! mode = "pipe"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::ffmpeg::Container;
use crate::handlers::HandlerKind;
use crate::worker::CaptureMode;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub secret_key: String,
    pub server_origin: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub stitch: StitchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntry {
    pub id: Option<u64>,
    pub login: Option<String>,
    #[serde(default)]
    pub handler: HandlerKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub qualities: Vec<String>,
    pub mode: CaptureMode,
    pub container: Container,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub resolve_attempts: usize,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub streamlink: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            qualities: vec!["best".into(), "1080p".into(), "720p".into()],
            mode: CaptureMode::Direct,
            container: Container::MpegTs,
            max_retries: 5,
            retry_base_ms: 500,
            resolve_attempts: 5,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            streamlink: "streamlink".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    pub overlap_secs: f64,
    pub probe_timeout_secs: u64,
    pub offset_timeout_secs: u64,
    pub offset_finder: String,
    pub suffix: String,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            overlap_secs: 60.0,
            probe_timeout_secs: 30,
            offset_timeout_secs: 300,
            offset_finder: "audio-offset-finder".into(),
            suffix: ".mts".into(),
        }
    }
}

impl StitchConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn offset_timeout(&self) -> Duration {
        Duration::from_secs(self.offset_timeout_secs)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8081".into()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_lease_seconds() -> u64 {
    86400
}

impl Config {
    pub fn default_path() -> &'static str {
        "telescope.toml"
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("secret_key", &self.secret_key),
            ("server_origin", &self.server_origin),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", key)));
            }
        }
        if let Some(entry) = self
            .subscriptions
            .iter()
            .find(|s| s.id.is_none() && s.login.is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "subscription entry {:?} has neither an id nor a login",
                entry
            )));
        }
        if self.capture.qualities.is_empty() {
            return Err(ConfigError::Invalid("capture.qualities is empty".into()));
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = Config::from_toml(&text)?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}
