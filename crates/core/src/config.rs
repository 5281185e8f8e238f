//! File configuration (`camrelay.toml`).
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:50051"
//!
//! [sessions]
//! max_sessions = 32
//! stop_grace = 5
//!
//! [camera]
//! profile_token = "Profile_1"
//! request_timeout = 10
//!
//! [media]
//! mapping = "per_stream"
//! io_timeout = 10
//! rtsp_transport = "tcp"
//!
//! [logging]
//! level = "info"
//! json = false
//! sink_path = "/var/log/camrelay/events.jsonl"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::camera::OnvifConfig;
use crate::logging::LogConfig;
use crate::relay::StreamMapping;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub camera: OnvifConfig,
    pub media: MediaConfig,
    pub logging: LogConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Control endpoint listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:50051".to_string(),
        }
    }
}

/// Media transport behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub mapping: StreamMapping,
    /// Bound on each blocking socket read of the source.
    #[serde(with = "serde_secs")]
    pub io_timeout: Duration,
    /// RTSP lower transport (`tcp` or `udp`); `None` uses the library default.
    pub rtsp_transport: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            mapping: StreamMapping::default(),
            io_timeout: Duration::from_secs(10),
            rtsp_transport: Some("tcp".to_string()),
        }
    }
}

/// Durations written as (possibly fractional) seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom(format!(
                "expected a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
