//! Tunnel configuration.
//!
//! Mirrors the `[CnCNet4]` section the game reads at startup. On disk it is
//! stored as JSON:
//!
//! ```json
//! { "CnCNet4": { "Enabled": true, "Host": "server.cncnet.org", "Port": 9001 } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "server.cncnet.org";
pub const DEFAULT_PORT: u16 = 9001;
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65534;
/// Longest relay host name the game's config buffer can hold.
pub const MAX_HOST_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Relay tunnel settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    #[serde(rename = "Enabled")]
    pub enabled: bool,
    /// Relay server host name or dotted IPv4 address.
    #[serde(rename = "Host")]
    pub host: String,
    /// Relay server port. Kept as read; see [`TunnelConfig::effective_port`].
    #[serde(rename = "Port")]
    pub port: i64,
    /// Ask for direct peer-to-peer traffic when the relay confirms it works.
    #[serde(rename = "P2P")]
    pub peer_to_peer: bool,
    #[serde(rename = "UDP")]
    pub use_udp: bool,
    /// Directory searched for conflicting legacy socket shims.
    #[serde(skip)]
    pub work_dir: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT as i64,
            peer_to_peer: false,
            use_udp: true,
            work_dir: PathBuf::from("."),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(rename = "CnCNet4", default)]
    cncnet4: TunnelConfig,
}

impl TunnelConfig {
    /// Load the `CnCNet4` section from a JSON file. A file without the
    /// section yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let mut config = serde_json::from_str::<ConfigFile>(content)?.cncnet4;
        config.truncate_host();
        Ok(config)
    }

    fn truncate_host(&mut self) {
        if self.host.len() > MAX_HOST_LEN {
            let mut end = MAX_HOST_LEN;
            while !self.host.is_char_boundary(end) {
                end -= 1;
            }
            self.host.truncate(end);
        }
    }

    /// Relay port actually used: the configured one if it lies within
    /// `[1024, 65534]`, otherwise 9001.
    pub fn effective_port(&self) -> u16 {
        if (MIN_PORT as i64..=MAX_PORT as i64).contains(&self.port) {
            self.port as u16
        } else {
            DEFAULT_PORT
        }
    }
}
